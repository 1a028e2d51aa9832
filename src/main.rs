//! Gateway binary: parse flags, load configuration, run the server loop.

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use routegate::config::{loader, ReloadHandle};
use routegate::Server;

#[derive(Debug, Parser)]
#[command(name = "routegate", version, about = "Configurable HTTP reverse-proxy gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routegate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(config = %args.config.display(), "loading configuration");
    let config = match loader::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if !config.otel.endpoint.is_empty() {
        info!(
            endpoint = %config.otel.endpoint,
            service_name = %config.otel.service_name,
            "trace propagation enabled; spans export via the external collector"
        );
    }

    let reload = ReloadHandle::new(args.config.clone(), config);
    let reload_rx = match reload.watch() {
        Ok(rx) => rx,
        Err(error) => {
            warn!(%error, "config watcher unavailable, hot reload disabled");
            // Keep the server loop's channel shape; it never fires.
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    };

    let server = match Server::new(reload) {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "failed to initialize server");
            std::process::exit(1);
        }
    };

    if let Err(error) = server.run(reload_rx).await {
        error!(%error, "server failed");
        std::process::exit(1);
    }
}
