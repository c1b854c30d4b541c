//! Courier scheduler entry point.

use std::sync::Arc;
use std::time::Duration;

use courier_common::Config;
use courier_db::repositories::CredentialRepository;
use courier_queue::{
    CommandListener, DbCredentialPool, HttpTransport, RedisNotifier, RedisQueueStore, Scheduler,
};
use fred::clients::{Client, SubscriberClient};
use fred::interfaces::ClientLike;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interval of the scheduler's housekeeping task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing() {
    let json = std::env::var("COURIER_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting courier scheduler...");

    // Load configuration
    let config = Config::load()?;

    // Connect to database
    let db = courier_db::init(&config).await?;
    info!("Connected to database");

    // Run migrations
    info!("Running database migrations...");
    courier_db::migrate(&db).await?;
    info!("Migrations completed");

    // Connect to Redis
    info!("Connecting to Redis...");
    let redis_config = fred::types::config::Config::from_url(&config.redis.url)?;
    let redis = Client::new(redis_config.clone(), None, None, None);
    redis.connect();
    redis.wait_for_connect().await?;

    let subscriber = SubscriberClient::new(redis_config, None, None, None);
    subscriber.init().await?;
    info!("Connected to Redis");

    // Wire the scheduler
    let credentials = DbCredentialPool::new(CredentialRepository::new(Arc::new(db)));
    let transport = HttpTransport::new(
        &config.transport.endpoint,
        Duration::from_secs(config.transport.timeout_secs),
    )?;
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(RedisQueueStore::new(redis.clone(), config.redis.prefix.clone())),
        Arc::new(credentials),
        Arc::new(transport),
        Arc::new(RedisNotifier::new(redis.clone(), config.redis.prefix.clone())),
        config.dispatch.clone(),
    ));
    scheduler.start_maintenance(MAINTENANCE_INTERVAL);

    let listener = CommandListener::new(subscriber.clone(), &config.redis.prefix);
    let commands = listener.start(scheduler.clone()).await?;

    info!(
        default_pool = %config.dispatch.default_pool,
        batch_size = config.dispatch.batch_size,
        "Courier scheduler ready"
    );

    shutdown_signal().await;

    commands.abort();
    scheduler.shutdown().await;
    subscriber.quit().await?;
    redis.quit().await?;

    info!("Scheduler shutdown complete");
    Ok(())
}
