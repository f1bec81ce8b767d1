use clap::Parser;

use podnet_monitor::config::Config;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = Config::parse();
    podnet_monitor::run(config).await
}
