use clickgreet::{broker, config::Config, logger};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    logger::setup_logger();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    log::info!("{name} broker has started v{version}...");

    let config = Config::load().map_err(std::io::Error::other)?;
    broker::run_broker(&config.broker).await
}
