//! Conversational product search server.

use std::sync::Arc;

use dotenvy::dotenv;
use mimalloc::MiMalloc;
use tracing::{error, info};

use convo_search::{config::AppConfig, server, telemetry};

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    telemetry::init();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    info!(
        name: "config.loaded",
        port = config.server.port,
        rate_limit = config.rate_limit.enabled,
        persistence = config.persistence.database_url.is_some(),
        "Configuration loaded"
    );

    server::start_server(Arc::new(config)).await
}
