mod app;
mod bus;
mod capture;
mod config;
mod context;
mod messages;
mod recording;
mod storage;
mod store;

use app::App;
use config::Config;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting tabcast recorder");

    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    App::new(config).await?.run().await
}
