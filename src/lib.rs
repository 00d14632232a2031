//! Tactical-data federation engine: mutually authenticated peer sessions over stream and
//! datagram transports, mission-change routing with loop prevention, and the daemon
//! plumbing around it.

pub mod config;
pub mod delivery;
pub mod error;
pub mod federation;
pub mod health;
pub mod mission_filter;
pub mod network;
pub mod shutdown;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{AppError, FederationError, StoreError};
pub use federation::{FederationService, FederationSettings, ListenerCredentials};
pub use health::FederationHealth;
pub use types::{ChangeRecord, MissionChange, PeerDefinition, PeerId};
