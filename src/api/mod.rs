//! Control API (spec.md §6, C16): axum router over [`AppState`], grounded on
//! the teacher's `web::server::start_dashboard_server` assembly (permissive
//! CORS, one `Router::new().route(...)` chain, `with_state`), with a
//! per-IP rate limiter layered on the mutating routes only.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use auth::rate_limit_middleware;

/// Assembles the full control-API router. `state.rate_limiter` is threaded
/// through `route_layer` on the mutating routes so read-only endpoints never
/// pay the per-IP bookkeeping cost.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mutating = Router::new()
        .route("/signal", post(handlers::post_signal))
        .route("/webhook", post(handlers::post_webhook_untoked))
        .route("/webhook/:token", post(handlers::post_webhook_toked))
        .route("/close-position", post(handlers::post_close_position))
        .route("/auto-trading", post(handlers::post_auto_trading))
        .route("/quick-signal", post(handlers::post_quick_signal))
        .route("/open-order/:oid", delete(handlers::delete_open_order))
        .route_layer(middleware::from_fn_with_state(state.rate_limiter.clone(), rate_limit_middleware));

    let read_only = Router::new()
        .route("/health", get(handlers::get_health))
        .route("/positions", get(handlers::get_positions))
        .route("/orders", get(handlers::get_orders))
        .route("/equity", get(handlers::get_equity))
        .route("/open-orders", get(handlers::get_open_orders))
        .route("/candles", get(handlers::get_candles))
        .route("/signals", get(handlers::get_signals))
        .route("/strategy-signals", get(handlers::get_strategy_signals))
        .route("/account", get(handlers::get_account))
        .route("/config", get(handlers::get_config));

    Router::new().merge(read_only).merge(mutating).layer(cors).with_state(state)
}

/// Binds and serves the control API until the process is asked to shut
/// down, mirroring the teacher's `axum::serve` startup idiom.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "control api: listening");
    axum::serve(listener, app).await?;
    Ok(())
}
