//! # Injapan Affiliate Core
//!
//! Backend service for the storefront's referral/affiliate program: click
//! tracking, registration and order attribution, commission computation, and
//! the commission/payout state machines.
//!
//! # General Infrastructure
//! - The storefront and admin dashboard talk to this service through the
//!   reverse proxy; the proxy verifies the identity-provider session and
//!   forwards the identity as `X-User-*` headers
//! - Admin endpoints additionally require the `X-Admin-Token` secret
//! - All state lives in Redis: JSON documents per record, one counter hash
//!   per affiliate (atomic increments only), sets as membership indexes
//!
//! # Attribution flow
//! - Landing with `?ref=CODE` captures the code against a visitor id
//!   (last-touch, 30-day window) and records a best-effort click
//! - Sign-up binds the user to the captured code once, idempotently
//! - Checkout attaches the affiliate to the order and opens a `pending`
//!   commission at the rate in effect at that instant
//! - Admins approve or reject commissions; approved ones fund payouts, which
//!   move pending -> processing -> completed

use std::time::Duration;

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod affiliate;
pub mod auth;
pub mod commission;
pub mod config;
pub mod error;
pub mod models;
pub mod payout;
pub mod referral;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;

use routes::{
    admin_stats_handler, approve_commission_handler, archive_affiliate_handler,
    complete_payout_handler, create_order_handler, get_settings_handler, join_handler,
    list_commissions_handler, list_payouts_handler, process_payout_handler, register_handler,
    reject_commission_handler, reject_payout_handler, request_payout_handler, stats_handler,
    update_settings_handler, visit_handler,
};
use state::State;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = State::new().await;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/referral/visit", get(visit_handler))
        .route("/referral/register", post(register_handler))
        .route("/orders", post(create_order_handler))
        .route("/affiliate/join", post(join_handler))
        .route("/affiliate/stats", get(stats_handler))
        .route("/affiliate/commissions", get(list_commissions_handler))
        .route("/affiliate/payouts", get(list_payouts_handler))
        .route("/payouts", post(request_payout_handler))
        .route(
            "/admin/commissions/{id}/approve",
            post(approve_commission_handler),
        )
        .route(
            "/admin/commissions/{id}/reject",
            post(reject_commission_handler),
        )
        .route("/admin/payouts/{id}/process", post(process_payout_handler))
        .route("/admin/payouts/{id}/complete", post(complete_payout_handler))
        .route("/admin/payouts/{id}/reject", post(reject_payout_handler))
        .route(
            "/admin/settings",
            get(get_settings_handler).put(update_settings_handler),
        )
        .route(
            "/admin/affiliates/{id}/archive",
            post(archive_affiliate_handler),
        )
        .route("/admin/affiliates/{id}/stats", get(admin_stats_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
