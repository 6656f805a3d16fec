//! The Paxoi master binary.
//!
//! ```bash
//! paxoi-master --port 7087 -N 3
//! ```

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paxoi_master::Master;

/// Cluster orchestration master for Paxoi.
#[derive(Parser)]
#[command(name = "paxoi-master", version, about)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 7087)]
    port: u16,

    /// Number of replicas.
    #[arg(short = 'N', long = "replicas", default_value_t = 3)]
    n: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    info!(port = cli.port, n = cli.n, "master starting, waiting for replicas");

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("cannot listen on port {}", cli.port))?;

    let master = Master::new(cli.n);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(Master::serve(
        master.clone(),
        listener,
        shutdown_rx.clone(),
    ));
    let liveness = tokio::spawn(Master::run(master, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        }
        result = liveness => {
            result.context("liveness loop panicked")??;
        }
    }

    server.abort();
    Ok(())
}
