//! git-gateway - serve a directory of git repositories over smart HTTP and SSH.

use std::path::PathBuf;

use clap::Parser;
use git_gateway::{
    Gateway, GatewayError,
    config::GatewayConfig,
    protocol::{http, ssh},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "git-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), GatewayError> {
    let config = GatewayConfig::load(&args.config)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        scan_path = %config.repo.scan_path.display(),
        allow_push = config.access.allow_push,
        "starting git-gateway"
    );

    let gateway = Gateway::from_config(&config);
    let listener = tokio::net::TcpListener::bind(config.http_addr()?).await?;
    let http = http::serve(listener, http::router(gateway.clone()));
    let ssh = ssh::serve(gateway, config.ssh_addr()?);

    tokio::select! {
        result = http => result?,
        result = ssh => result?,
    }
    Ok(())
}
