//! centi-microservice binary.

mod cli;

use anyhow::Context;
use centi_api::serve;
use centi_relay::backend::StreamTransport;
use centi_relay::{Dispatcher, Relay};
use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!("Cannot listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let transport =
        StreamTransport::new(cli.bind.clone(), cli.link_port).with_neighbors(cli.neighbors);
    let relay = Arc::new(Relay::new(Arc::new(transport)));
    let dispatcher = Dispatcher::new(relay.clone());

    let listener = TcpListener::bind((cli.bind.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.bind, cli.port))?;
    info!(
        "Centi microservice listening on http://{}",
        listener.local_addr()?
    );

    serve(listener, dispatcher, shutdown_signal())
        .await
        .context("HTTP server error")?;

    relay.shutdown().await;
    info!("Centi microservice stopped");
    Ok(())
}
