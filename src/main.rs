use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fate_server::config::ServerConfig;
use fate_server::server::Server;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fate_server=debug,info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse();
    init_logging();

    tracing::info!(?config, "starting");

    let mut server = Server::new(&config)?;
    server.run();
    Ok(())
}
