//! HTTPS listener and lifecycle of the webhook.
use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{extract::DefaultBodyLimit, routing::post, Router};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use mcluster_core::PolicyEngine;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    handler::{review, AppState},
    tls::ServingIdentity,
    Error, Result,
};

/// Routes every POST, whatever its path, to the review handler.
///
/// The API server calls the path configured in the webhook registration; a single
/// webhook serves any of them.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes();
    Router::new()
        .route("/", post(review))
        .route("/{*path}", post(review))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve admission reviews until a termination signal arrives.
///
/// Startup failures (unreadable certificates, an address in use) are returned.
/// After SIGINT or SIGTERM the listener closes and in-flight reviews get the
/// configured grace period to finish.
pub async fn run(config: Config, engine: PolicyEngine) -> Result<()> {
    run_until(config, engine, Handle::new(), shutdown_signal()).await
}

/// Serve admission reviews until `shutdown` completes.
///
/// `handle` reports the bound address through [`Handle::listening`].
pub async fn run_until<F>(
    config: Config,
    engine: PolicyEngine,
    handle: Handle<SocketAddr>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let identity = ServingIdentity::load(&config.tls)?;
    let tls = RustlsConfig::from_config(Arc::new(identity.server_config(config.tls_min_version)?));
    let state = AppState::new(engine, config.request_timeout)
        .with_max_concurrent_reviews(config.max_concurrent_reviews)
        .with_max_body_bytes(config.max_request_body_bytes);
    let app = router(state);

    let grace = config.shutdown_grace_period;
    let draining = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!(?grace, "shutting down, draining in-flight reviews");
        draining.graceful_shutdown(Some(grace));
    });
    let listening = handle.clone();
    tokio::spawn(async move {
        if let Some(addr) = listening.listening().await {
            info!(%addr, "webhook listening");
        }
    });

    axum_server::bind_rustls(config.listen, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(Error::Serve)?;
    info!("webhook stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
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
}
