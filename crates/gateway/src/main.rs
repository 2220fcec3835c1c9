//! Gateway service entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{decode_signing_key, Signer, Verifier};
use gateway::{
    create_router, join_event_router, spawn_event_router, AppState, Downstream, GatewayConfig,
    LogFormat, NatsBus, RedisLocator,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// How long open connections get to finish teardown after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    let span = info_span!("gateway", instance_id = %config.instance_id);
    run(config).instrument(span).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(config: GatewayConfig) -> Result<()> {
    info!("Starting Gateway service");
    info!("Configuration: {:?}", config);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let signing_key = decode_signing_key(&config.private_key).context("invalid PRIVATE_KEY")?;
    let downstream = Downstream::new(
        &config.downstream_url,
        Signer::new(signing_key),
        config.lifecycle.downstream_timeout,
    )?;
    let downstream_key = downstream
        .fetch_public_key()
        .await
        .context("failed to fetch downstream public key")?;
    let verifier = Verifier::with_window(downstream_key, config.lifecycle.replay_window);

    info!("Connecting to Redis at {}", config.redis_url);
    let locator = RedisLocator::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis")?;

    let nats_client = NatsClient::connect(&config.nats_url)
        .await
        .context("failed to connect to NATS")?;
    info!("Connected to NATS");

    let state = Arc::new(
        AppState::new(
            config.instance_id.clone(),
            Arc::new(locator),
            Arc::new(NatsBus::new(nats_client)),
            downstream,
            verifier,
            config.lifecycle.clone(),
        )
        .with_service_domain(config.service_domain.clone()),
    );

    let router_handle = spawn_event_router(&state)
        .await
        .context("failed to subscribe to instance channel")?;

    let app = create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    // The signal already cancelled every connection; let their teardown finish.
    state.shutdown.cancel();
    if !state.drain(DRAIN_TIMEOUT).await {
        warn!(
            remaining = state.registry.len().await,
            "Connections still open after drain timeout"
        );
    }
    join_event_router(router_handle).await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }

    shutdown.cancel();
}
