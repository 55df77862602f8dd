//! Fashion Store API library
//!
//! Storefront backend: carts, saved addresses, coupons, checkout and Sepay
//! QR bank-transfer payments, plus the CMS sync job.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{http::HeaderValue, routing::get, Router};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};

use crate::{
    auth::{AuthConfig, AuthService, AuthState},
    errors::ServiceError,
    services::{
        checkout::FlatShippingFee,
        payments::{PaymentGateway, PaymentSettings, SepayGateway},
    },
};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub auth: Arc<AuthService>,
    pub services: handlers::AppServices,
}

impl AppState {
    /// Wire services around an explicit payment gateway.
    pub fn new(
        config: config::AppConfig,
        db: Arc<DatabaseConnection>,
        event_sender: Arc<events::EventSender>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(AuthConfig::from(&config)));
        let payment_settings = PaymentSettings {
            window: config.payment_window(),
            poll_interval: config.payment_poll_interval(),
            webhook_api_key: config.sepay.webhook_api_key.clone(),
        };
        let services = handlers::AppServices::new(
            db.clone(),
            event_sender.clone(),
            gateway,
            Arc::new(FlatShippingFee(config.shipping_flat_fee)),
            payment_settings,
        );
        Self {
            db,
            config,
            event_sender,
            auth,
            services,
        }
    }

    /// Production wiring with the Sepay gateway from configuration.
    pub fn from_config(
        config: config::AppConfig,
        db: Arc<DatabaseConnection>,
        event_sender: Arc<events::EventSender>,
    ) -> Result<Self, ServiceError> {
        let gateway = Arc::new(SepayGateway::new(config.sepay.clone())?);
        Ok(Self::new(config, db, event_sender, gateway))
    }
}

impl AuthState for AppState {
    fn auth_service(&self) -> &AuthService {
        &self.auth
    }
}

/// Every `/api/v1` route
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/coupons", handlers::coupons::coupon_routes())
        .nest("/cart", handlers::carts::cart_routes())
        .nest("/addresses", handlers::addresses::address_routes())
        .nest("/checkout", handlers::checkout::checkout_routes())
        .nest("/orders", handlers::orders::order_routes())
        .nest("/payments", handlers::payments::payment_routes())
}

/// CORS from configuration: explicit origins, or permissive where allowed.
pub fn cors_layer(cfg: &config::AppConfig) -> Result<CorsLayer, ServiceError> {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.should_allow_permissive_cors() {
        ::tracing::info!(
            development = cfg.is_development(),
            "using permissive CORS because no explicit origins are configured"
        );
        Ok(CorsLayer::permissive())
    } else {
        Err(ServiceError::InternalError(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
                .to_string(),
        ))
    }
}

/// Full application router: API, Swagger UI and the shared middleware stack.
pub fn build_router(state: Arc<AppState>) -> Result<Router, ServiceError> {
    let cors = cors_layer(&state.config)?;
    Ok(Router::new()
        .route("/", get(|| async { "fashion-store-api up" }))
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
        .merge(openapi::swagger_ui())
        .layer(crate::tracing::configure_http_tracing())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        )))
}
