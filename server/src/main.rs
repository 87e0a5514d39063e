mod app;
mod config;
mod routes;
mod services;
mod state;

use fusemap_shared::{Channel, Session};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let registry = config::metric_registry();
    tracing::info!(
        metrics = ?registry.kinds().map(|k| k.as_str()).collect::<Vec<_>>(),
        "metric scales configured"
    );

    let (state, session_rx) = AppState::new(registry.clone());
    tokio::spawn(services::session_worker::run(
        state.clone(),
        session_rx,
        Session::new(registry),
    ));

    // Spawn background services
    let geometry_source = config::geometry_source();
    tracing::info!(source = %geometry_source, "loading grid geometry");
    tokio::spawn(services::geometry_loader::run(state.clone(), geometry_source));

    let interval = config::feed_poll_interval();
    for channel in [Channel::Live, Channel::Forecast, Channel::DeviceStatus] {
        match config::feed_url(channel) {
            Some(url) => {
                tracing::info!(channel = channel.as_str(), %url, "subscribing to upstream feed");
                tokio::spawn(services::channel_feed::run(
                    state.clone(),
                    channel,
                    url,
                    interval,
                ));
            }
            None => {
                tracing::info!(
                    channel = channel.as_str(),
                    "no upstream feed configured; accepting pushes only"
                );
            }
        }
    }

    let app = app::build_app(state);

    let addr = format!("0.0.0.0:{}", config::server_port());
    tracing::info!("Fusemap server listening on {addr}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind TCP listener");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server failed");
    }

    tracing::info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
