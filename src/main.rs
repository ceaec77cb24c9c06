//! FileTalk server - Entry Point
//!
//! Loads configuration, opens storage, and runs the server until Ctrl-C.

use std::env;
use std::path::PathBuf;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use filetalk::{ChatServer, Config, Storage};

/// Config file used when neither an argument nor FILETALK_CONFIG is given
const DEFAULT_CONFIG_FILE: &str = "filetalk.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // Use RUST_LOG to control log level, e.g. RUST_LOG=filetalk=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("filetalk=info")),
        )
        .init();

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("FILETALK_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let config = Config::load_or_default(&config_path)?.apply_env()?;
    info!(
        "Configuration loaded (file: {}, files dir: {})",
        config_path.display(),
        config.files_dir.display()
    );

    if let Err(e) = tokio::fs::create_dir_all(&config.files_dir).await {
        error!(
            "Cannot create files directory {}: {}",
            config.files_dir.display(),
            e
        );
    }

    let storage = Storage::open(&config);
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;

    let server = ChatServer::new(config, storage);

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run(listener).await?;
    Ok(())
}
