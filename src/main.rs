//! Tidepool binary entry point

use std::future::IntoFuture;
use std::sync::Arc;

use tidepool::federation::HttpTransport;
use tidepool::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize AppState and background tasks
/// 4. Serve HTTP until SIGINT/SIGTERM
/// 5. Drain connections and requests, then stop background tasks, all within
///    the grace period that starts at the signal
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::AppConfig::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("tidepool={},tower_http=info", config.logging.level).into()
    });
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Starting Tidepool..."
    );

    tidepool::metrics::init_metrics();

    let transport = Arc::new(HttpTransport::new(&config.federation)?);
    let (state, tracker) = AppState::new(config.clone(), transport).await?;
    let supervisor = state.spawn_background(tracker);
    tracing::info!(tasks = ?supervisor.names(), "Background tasks started");

    {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = state.ensure_follows().await {
                tracing::warn!(%error, "Configured follows not ensured");
            }
        });
    }

    let app = tidepool::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        stop_tx.send_replace(true);
    });

    let server = {
        let mut stop_rx = stop_rx.clone();
        axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = stop_rx.wait_for(|stopped| *stopped).await;
        })
    };
    let mut server = std::pin::pin!(server.into_future());

    let stopped_serving = tokio::select! {
        result = &mut server => {
            result?;
            true
        }
        _ = stop_rx.wait_for(|stopped| *stopped) => false,
    };

    // The grace period runs from the signal, covering connection drain too.
    let grace = config.shutdown.grace();
    let deadline = tokio::time::Instant::now() + grace;
    let drained = tidepool::tasks::drain(
        async {
            if stopped_serving {
                Ok(())
            } else {
                server.await
            }
        },
        &state.inflight,
        deadline,
    )
    .await?;
    if !drained {
        tracing::warn!(inflight = state.inflight.current(), "Requests still running at shutdown");
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let overran = supervisor.shutdown(remaining).await;
    if !drained || !overran.is_empty() {
        tracing::error!(?overran, "Shutdown grace period exceeded");
        std::process::exit(1);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
