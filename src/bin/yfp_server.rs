use std::sync::Arc;

use tracing::{info, Level};
use yfp_server::pipeline::detector::NullDetector;
use yfp_server::pipeline::display_sink::LoggingDisplaySink;
use yfp_server::server::server::YfpServer;
use yfp_server::server::server_config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let server = YfpServer::start(ServerConfig::new(), Arc::new(NullDetector {}), Arc::new(LoggingDisplaySink {})).await?;

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    server.stop().await;
    Ok(())
}
