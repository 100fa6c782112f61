mod ncf;
mod orders;
mod problem;
mod router;
mod telemetry;

use std::net::SocketAddr;

use tracing::info;

use lavapos_core::ncf::NcfAllocator;
use lavapos_storage::Database;
use lavapos_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let allocator = NcfAllocator::new(config.ncf_max_attempts);
    let state = router::AppState::new(metrics, database, allocator);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        ncf_max_attempts = allocator.max_attempts(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
