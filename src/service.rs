//! HTTP service assembly: builds the axum [`Router`] wiring every endpoint
//! the [`Provider`](crate::oidc::provider::Provider) computed at startup,
//! starts the periodic authorization-code/refresh-token cleanup tasks, and
//! serves the bound listener. Grounded on
//! `examples/vpopescu-ark-mcp/src/server/service.rs`'s `start`/`run_server`/
//! `create_health_router` shape, trimmed to the single HTTP listener this
//! provider needs (no TLS termination or multi-server fan-out — SPEC_FULL's
//! Non-goals leave that to a fronting reverse proxy).

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::oidc::handlers;
use crate::oidc::provider::Provider;
use crate::state::LifecycleState;

/// Records one [`crate::metrics::record_http`] sample per request, the way
/// the teacher's `log_requests` middleware wraps every response with
/// request/response logging.
async fn record_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    crate::metrics::record_http(&endpoint, &method, response.status().as_u16(), start.elapsed().as_secs_f64() * 1000.0);
    response
}

/// Assembles the full router: discovery/JWKS/authorize/token/userinfo/
/// session/end-session/(optional) registration endpoints at the paths the
/// `Provider` computed, plus `/livez`, `/readyz` and (feature `prometheus`)
/// `/metrics`.
pub fn build_router(provider: Arc<Provider>, lifecycle: Arc<LifecycleState>) -> Router {
    let mut oidc_routes = Router::new()
        .route("/.well-known/openid-configuration", get(handlers::discovery))
        .route(provider.jwks_uri.path(), get(handlers::jwks))
        .route(provider.token_endpoint.path(), post(handlers::token))
        .route(provider.userinfo_endpoint.path(), get(handlers::userinfo).post(handlers::userinfo))
        .route(provider.check_session_iframe.path(), get(handlers::check_session))
        .route(provider.authorization_endpoint.path(), get(handlers::authorize_get).post(handlers::authorize_post))
        .route(provider.end_session_endpoint.path(), get(handlers::end_session_get).post(handlers::end_session_post));

    if let Some(registration_endpoint) = &provider.registration_endpoint {
        oidc_routes = oidc_routes.route(registration_endpoint.path(), post(handlers::register));
    }

    let oidc_routes = oidc_routes.with_state(provider);

    let health_routes = Router::new().route("/livez", get(handlers::livez)).route("/readyz", get(handlers::readyz)).with_state(lifecycle);

    let router = oidc_routes.merge(health_routes);

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(handlers::metrics));

    router.layer(middleware::from_fn(record_metrics)).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

/// Spawns the periodic housekeeping the bootstrap's `konnectd` runs as part
/// of its own maintenance loop: expired authorization codes and refresh
/// tokens are deleted every 5 minutes so the SQLite tables don't grow
/// unbounded, mirroring the teacher's `start_auth_cleanup_tasks`.
fn start_cleanup_tasks(provider: Arc<Provider>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            match provider.db.cleanup_expired_codes_async().await {
                Ok(count) if count > 0 => tracing::debug!(count, "cleaned up expired authorization codes"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "authorization code cleanup failed"),
            }
            match provider.db.cleanup_expired_refresh_tokens_async().await {
                Ok(count) if count > 0 => tracing::debug!(count, "cleaned up expired refresh tokens"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "refresh token cleanup failed"),
            }
        }
    });
}

/// Binds `cfg.listen`, starts housekeeping, and serves until ctrl-c or a
/// terminate signal is received.
pub async fn start(cfg: &Config, provider: Arc<Provider>, lifecycle: Arc<LifecycleState>) -> anyhow::Result<()> {
    start_cleanup_tasks(provider.clone());

    let app = build_router(provider, lifecycle.clone());

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    tracing::info!(addr = %cfg.listen, "listening");
    lifecycle.set(crate::state::ApplicationState::Ready);

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    lifecycle.set(crate::state::ApplicationState::Terminating);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            std::future::pending::<()>().await;
            return;
        };
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
