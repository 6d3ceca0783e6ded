use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use hoard::store::{BlobStore, ContentStore};
use hoard::web::WebServer;
use hoard::{ChangeNotifier, Config, Database, MutationGovernor, Vault};

/// How often expired rate-limit windows are dropped.
const GOVERNOR_CLEANUP_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = hoard::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        hoard::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(config).await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> hoard::Result<()> {
    config.validate()?;
    info!("Hoard - deduplicating file store");

    let db = Database::open(&config.database.path, config.database.max_connections).await?;
    info!(
        path = %config.database.path,
        schema_version = db.schema_version().await?,
        "Database opened"
    );

    let blobs = BlobStore::new(&config.storage.blob_path, config.storage.max_upload_bytes())?;
    let store = ContentStore::new(db.clone(), blobs);
    let notifier = ChangeNotifier::new(&config.notifier);
    let governor = Arc::new(MutationGovernor::new(&config.rate_limit));
    let vault = Vault::new(
        db.clone(),
        store,
        notifier.clone(),
        Arc::clone(&governor),
        config.quota.default_quota_bytes(),
    );

    vault.reconcile().await?;

    start_governor_cleanup_task(governor);

    let server = WebServer::new(&config.server, vault)?;
    server.run(shutdown_signal()).await?;

    info!("Shutting down");
    notifier.shutdown().await;
    db.close().await;
    Ok(())
}

/// Periodically drop expired rate-limit windows.
fn start_governor_cleanup_task(governor: Arc<MutationGovernor>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(GOVERNOR_CLEANUP_INTERVAL_SECS));

        // Skip the first immediate tick
        interval.tick().await;

        loop {
            interval.tick().await;
            governor.cleanup();
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, keep serving
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
