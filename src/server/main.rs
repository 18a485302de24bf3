use studylink::server::{config::ServerConfig, database::Database, connection::Server, admin, auth};
use studylink::server::changes::ChangeFeed;
use studylink::server::websocket::SyncServer;
use studylink::utils::performance;
use std::sync::Arc;
use log::{info, error};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env();

    let database = Arc::new(Database::connect(&config.database_url).await?);

    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("Database migrations completed successfully");

    admin::ensure_admin_account(database.clone(), &config).await.map_err(|e| {
        error!("Admin account seeding failed: {}", e);
        e
    })?;

    let feed = ChangeFeed::new();
    let server = Server {
        db: database.clone(),
        config: config.clone(),
        feed: feed.clone(),
    };

    // Expired sessions get swept hourly
    let cleanup_db = database.clone();
    tokio::spawn(async move {
        loop {
            auth::cleanup_expired_sessions(cleanup_db.clone()).await;
            tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        }
    });

    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/studylink_performance.log".to_string());
    let perf_db = database.clone();
    tokio::spawn(async move {
        info!("Starting performance logger - logging every 120 seconds to: {}", perf_log_path);
        performance::start_performance_logger(perf_db, &perf_log_path).await;
    });

    // Live sync pushes snapshots over WebSocket on port + 1
    let ws_port = config.port + 1;
    let ws_host = config.host.clone();
    let sync_server = Arc::new(SyncServer::new(database.clone(), feed.clone()));
    tokio::spawn(async move {
        if let Err(e) = sync_server.run(&ws_host, ws_port).await {
            error!("Sync server error: {}", e);
        }
    });
    info!("Sync server started on {}:{}", config.host, ws_port);

    server.run(&format!("{}:{}", config.host, config.port)).await?;
    Ok(())
}
