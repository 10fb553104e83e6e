//! Ordo daemon - leaderless event ordering node
//!
//! Usage:
//!   # Standalone mode (one sync and one entry node in this process)
//!   ordod
//!
//!   # Cluster mode - a sync node
//!   ordod --mode cluster --node-id sync-1 --role sync \
//!     --cluster-bind 10.0.0.1:7450 \
//!     --peers sync-2=sync@10.0.0.2:7450,sync-3=sync@10.0.0.3:7450,entry-1=entry@10.0.0.4:7450
//!
//!   # Cluster mode - an entry node
//!   ordod --mode cluster --node-id entry-1 --role entry \
//!     --cluster-bind 10.0.0.4:7450 \
//!     --data-dir /var/lib/ordo \
//!     --peers sync-1=sync@10.0.0.1:7450,sync-2=sync@10.0.0.2:7450,sync-3=sync@10.0.0.3:7450

use clap::Parser;
use ordod::{Cli, OrdoServer};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner(&cli);

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let server = OrdoServer::new(&cli)?;
    let server_shutdown = server.shutdown_handle();

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received, stopping nodes...");
        let _ = shutdown_tx_signal.send(());
    });

    let server_handle = tokio::spawn(server.run());

    let mut shutdown_rx = shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;

    server_shutdown.shutdown();

    let shutdown_timeout = tokio::time::Duration::from_secs(30);
    match tokio::time::timeout(shutdown_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Nodes stopped");
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Server error: {:#}", e);
        }
        Ok(Err(e)) => {
            tracing::error!("Server task panicked: {}", e);
        }
        Err(_) => {
            tracing::warn!(
                "Shutdown timed out after {:?}, forcing exit",
                shutdown_timeout
            );
        }
    }

    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(cli: &Cli) {
    let mode = if cli.is_cluster_mode() {
        "cluster"
    } else {
        "standalone"
    };
    let node_id = cli.node_id.as_deref().unwrap_or("sync-1");
    let role = if cli.is_cluster_mode() {
        cli.role.as_str()
    } else {
        "sync+entry"
    };

    eprintln!("ordod {}", env!("CARGO_PKG_VERSION"));
    eprintln!("  mode:      {}", mode);
    eprintln!("  node:      {} ({})", node_id, role);
    eprintln!("  cluster:   {}", cli.cluster_bind);
    eprintln!("  peers:     {}", cli.peers.len());
    eprintln!("  policy:    {:?}", cli.election_policy);
    eprintln!("  data dir:  {}", cli.data_dir.display());
    if cli.metrics {
        eprintln!("  metrics:   http://{}/metrics", cli.metrics_bind);
    }
    eprintln!();
}
