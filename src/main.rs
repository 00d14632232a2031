use clap::{Parser, Subcommand};
use federd::config::{self, Config};
use federd::error::AppError;
use federd::federation::{FederationService, FederationSettings};
use federd::network::tls::CertificateAuthority;
use federd::shutdown::ShutdownManager;
use federd::store::{InMemoryMissionStore, LoggingFanout, PeerConfigStore, TomlPeerStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "federd")]
#[command(about = "Tactical data federation daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the federation service (default)
    Run,
    /// Dial one configured peer, wait briefly, disconnect and print a JSON report
    TestPeer { name: String },
    /// Validate the configuration and peer definitions, then exit
    CheckConfig,
    /// Generate a local CA plus a listener certificate for this node
    GenCerts {
        #[arg(long, default_value = "certs")]
        out_dir: PathBuf,
        /// Extra subject alternative names (DNS names or IP addresses)
        #[arg(long = "san")]
        sans: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, args.verbose).await,
        Command::TestPeer { name } => test_peer(config, &name).await,
        Command::CheckConfig => check_config(config).await,
        Command::GenCerts { out_dir, sans } => gen_certs(&config, &out_dir, &sans),
    };

    if let Err(e) = result {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> Result<Config, AppError> {
    let config = if Path::new(path).exists() {
        let cfg = Config::load_from_file(path)?;
        println!("✓ Loaded configuration from {}", path);
        cfg
    } else {
        println!("⚠ {} not found, using defaults (create one with --generate-config)", path);
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

fn build_service(config: &Config) -> (FederationService, Arc<TomlPeerStore>) {
    let peer_store = Arc::new(TomlPeerStore::new(&config.federation.peers_file));
    let service = FederationService::new(
        FederationSettings::from_config(config),
        peer_store.clone(),
        Arc::new(InMemoryMissionStore::new()),
        Arc::new(LoggingFanout),
    );
    (service, peer_store)
}

async fn run(config: Config, verbose: bool) -> Result<(), AppError> {
    let _log_guard = setup_logging(&config.logging, verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let fed = &config.federation;

    println!("\n🚀 federd v{} ({})", version, git_hash);
    println!("═══════════════════════════════════════════════════════");
    println!("🖥️  Node:      {}", config.node.node_id);
    println!("📡 Listeners: {}:{} (legacy), {}:{} (current)", fed.bind_address, fed.legacy_port, fed.bind_address, fed.current_port);
    println!("📒 Peers:     {}", fed.peers_file);
    println!("\nPress Ctrl+C to stop\n");

    let mut shutdown_manager = ShutdownManager::new();
    let (service, _) = build_service(&config);
    service.start().await?;

    // Periodic status line, as operators expect from the daemon log
    let reporter = service.clone();
    let token = shutdown_manager.token();
    shutdown_manager.register_task(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let health = reporter.health();
                    tracing::info!(
                        "📊 Federation: {}/{} peers connected ({} enabled), deliveries {} pending / {} sent / {} failed, {} rejected handshakes",
                        health.connected_peers,
                        health.total_peers,
                        health.enabled_peers,
                        health.deliveries.pending,
                        health.deliveries.sent,
                        health.deliveries.failed,
                        health.rejected_handshakes
                    );
                }
            }
        }
    }));

    shutdown_manager.wait_for_signal().await;
    service.shutdown().await;
    shutdown_manager.shutdown().await;
    Ok(())
}

async fn test_peer(config: Config, name: &str) -> Result<(), AppError> {
    let _log_guard = setup_logging(&config.logging, false);
    let (service, peer_store) = build_service(&config);

    let definitions = peer_store.list_peer_definitions().await?;
    let def = definitions
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| federd::StoreError::PeerNotFound(name.to_string()))?;

    let report = service.test_connection(&def).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        std::process::exit(2);
    }
    Ok(())
}

async fn check_config(config: Config) -> Result<(), AppError> {
    let fed = &config.federation;
    println!("✓ Configuration valid");
    println!("  └─ Node: {}", config.node.node_id);
    println!(
        "  └─ Listeners: {}",
        if fed.has_listener_credentials() {
            "mutual TLS on legacy and current ports"
        } else {
            "none (outbound only)"
        }
    );

    let peers = TomlPeerStore::new(&fed.peers_file)
        .list_peer_definitions()
        .await?;
    println!("✓ {} usable peer definitions in {}", peers.len(), fed.peers_file);
    for def in peers {
        println!(
            "  └─ {} {:?}/{} {} {}{}",
            def.name,
            def.transport,
            def.direction,
            def.socket_addr_string(),
            def.protocol_variant,
            if def.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

fn gen_certs(config: &Config, out_dir: &Path, extra_sans: &[String]) -> Result<(), AppError> {
    let node_id = &config.node.node_id;
    let mut sans = vec![node_id.clone(), "localhost".to_string(), "127.0.0.1".to_string()];
    sans.extend(extra_sans.iter().cloned());

    let ca = CertificateAuthority::generate(&format!("{} Federation CA", node_id))
        .map_err(federd::FederationError::from)?;
    let leaf = ca
        .issue(node_id, &sans)
        .map_err(federd::FederationError::from)?;

    std::fs::create_dir_all(out_dir)?;
    let ca_path = out_dir.join("ca.pem");
    let cert_path = out_dir.join(format!("{}.pem", node_id));
    let key_path = out_dir.join(format!("{}.key", node_id));

    std::fs::write(&ca_path, ca.ca_pem())?;
    std::fs::write(&cert_path, &leaf.cert_pem)?;
    write_private(&key_path, &leaf.key_pem)?;

    println!("✅ Generated federation certificates in {}", out_dir.display());
    println!("\n[federation]");
    println!("ca_cert_file = {:?}", ca_path.display().to_string());
    println!("server_cert_file = {:?}", cert_path.display().to_string());
    println!("server_key_file = {:?}", key_path.display().to_string());
    Ok(())
}

/// Owner-only permissions for key material
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(contents.as_bytes())
}

fn setup_logging(
    config: &config::LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard, ansi) = if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "federd.log".to_string());
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
        (BoxMakeWriter::new(non_blocking), Some(guard), false)
    } else {
        (BoxMakeWriter::new(std::io::stdout), None, true)
    };

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let result = match config.format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_thread_ids(false)
            .try_init(),
        _ if is_systemd && guard.is_none() => {
            // journald already adds timestamp and hostname
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .try_init()
        }
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_timer(CustomTimer {
                hostname: short_hostname,
            })
            .compact()
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("⚠ Logging already initialised: {}", e);
    }
    guard
}

// Custom timer that shows UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // Format: "YYYY-MM-DD HH:MM:SS.mmm [hostname]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
