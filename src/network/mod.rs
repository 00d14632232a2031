pub mod client;
pub mod connection_state;
pub mod peer_connection;
pub mod peer_connection_registry;
pub mod server;
pub mod tls;
pub mod transport;
pub mod wire;

pub use client::{ConnectError, ConnectionTestReport, DialerSettings, OutboundDialer};
pub use peer_connection::{PeerConnection, SessionHooks, SessionInfo, SessionOutcome};
pub use server::{AcceptedSession, InboundHandler, InboundListener};
