//! Consume event streams from Redis and index them into OpenSearch.
use std::future::ready;

use anyhow::Context;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use event_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use event_worker::config::Config;
use event_worker::supervisor::{readiness, LiveConnector, Supervisor, WorkerSettings};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

pub async fn index() -> &'static str {
    "event indexer worker"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!(
        worker = config.worker_name.as_str(),
        group = config.group(),
        streams = ?config.streams.0,
        "starting up"
    );

    let supervisor = Supervisor::new(
        LiveConnector::from_config(&config),
        WorkerSettings::from_config(&config),
        config.cycle_policy(),
        config.connect_policy(),
    );

    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let state = supervisor.state();
    let board = supervisor.board();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness(&state))))
        .route("/_liveness", get(move || ready(board.report())));
    let router = setup_metrics_routes(router, recorder);

    // The HTTP server outlives the worker so readiness reports the shutdown.
    let server_shutdown = CancellationToken::new();
    let server = {
        let bind = config.bind();
        let token = server_shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = serve(router, &bind, token).await {
                error!(bind = %bind, "failed to serve health and metrics: {}", error);
            }
        })
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => shutdown.cancel(),
                Err(error) => error!("failed to listen for shutdown signals: {}", error),
            }
        });
    }

    let result = supervisor.run(shutdown).await;

    server_shutdown.cancel();
    if let Err(error) = server.await {
        error!("health and metrics server task failed: {}", error);
    }

    result?;
    info!("worker stopped");
    Ok(())
}
