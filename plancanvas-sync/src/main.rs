use plancanvas_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!("starting plancanvas sync server on {}", config.bind_addr);
    SyncServer::new(config).run().await
}
