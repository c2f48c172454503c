use sipchan::config::Config;
use sipchan::infrastructure::bus::LocalBus;
use sipchan::SipDriver;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting sipchan");

    let path = std::env::var("SIPCHAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("sipchan.toml"));
    let config = Config::load(Some(&path))?;
    info!("Configuration loaded: {:?}", config);

    let bus = Arc::new(LocalBus::new(config.routes.clone()));
    let driver = SipDriver::initialize(&config, bus).await?;
    info!("SIP channel ready on {}", driver.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    driver.shutdown().await;
    info!("sipchan stopped");
    Ok(())
}
