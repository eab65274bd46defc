use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shoreline_relay::{build_directory, cli::Cli, config::Config, relay::RelayState, serve};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().apply(Config::from_env());
    if let Err(err) = run(config).await {
        error!("relay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let directory = build_directory(&config).await?;
    let state = RelayState::new(directory);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Shoreline relay listening on {}", addr);

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;
    Ok(())
}
