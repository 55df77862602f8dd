#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use fashion_store_api::{
    auth::AuthUser,
    build_router,
    config::{AppConfig, SepayConfig},
    db::{self, DbConfig},
    entities::{
        category,
        coupon::{ApplyType, CouponType, CouponVisibility, DiscountType},
        product,
    },
    events::{self, EventSender},
    services::{coupons::CouponInput, payments::SepayGateway},
    AppState,
};

pub const WEBHOOK_API_KEY: &str = "test-webhook-key";

/// Application booted on a private in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_sepay_api("http://127.0.0.1:9").await
    }

    /// Point the Sepay transaction API at `api_base_url` (a wiremock server).
    pub async fn with_sepay_api(api_base_url: &str) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.cors_allow_any_origin = true;
        cfg.payment_poll_interval_secs = 1;
        cfg.sepay = SepayConfig {
            account_number: "0123456789".to_string(),
            bank_code: "MBBank".to_string(),
            account_name: "FASHION STORE".to_string(),
            api_token: Some("sepay-token".to_string()),
            api_base_url: api_base_url.to_string(),
            webhook_api_key: Some(WEBHOOK_API_KEY.to_string()),
            ..SepayConfig::default()
        };

        // one connection so every query sees the same in-memory database
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            sqlx_logging: false,
            ..DbConfig::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let gateway = Arc::new(SepayGateway::new(cfg.sepay.clone()).expect("sepay gateway"));

        let state = Arc::new(AppState::new(
            cfg,
            Arc::new(pool),
            Arc::new(EventSender::new(event_tx)),
            gateway,
        ));
        let router = build_router(state.clone()).expect("router builds");

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user: &AuthUser) -> String {
        self.state.auth.issue_token(user).expect("issue token")
    }

    pub fn shopper(&self) -> (AuthUser, String) {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            name: Some("Nguyen Van A".to_string()),
            email: Some("shopper@example.com".to_string()),
            roles: vec!["customer".to_string()],
        };
        let token = self.token_for(&user);
        (user, token)
    }

    pub fn admin_token(&self) -> String {
        let admin = AuthUser {
            user_id: Uuid::new_v4(),
            name: Some("Admin".to_string()),
            email: Some("admin@example.com".to_string()),
            roles: vec!["admin".to_string()],
        };
        self.token_for(&admin)
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        self.request_with_headers(method, uri, body, token, &[]).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_category(&self, name: &str) -> category::Model {
        let now = Utc::now();
        category::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            slug: Set(format!("{}-{}", name.to_lowercase(), Uuid::new_v4().simple())),
            description: Set(None),
            image_url: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed category")
    }

    pub async fn seed_product(
        &self,
        category_id: Uuid,
        name: &str,
        price: Decimal,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            category_id: Set(category_id),
            name: Set(name.to_string()),
            slug: Set(format!("{}-{}", name.to_lowercase().replace(' ', "-"), Uuid::new_v4().simple())),
            price: Set(price),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    /// Store a coupon through the admin service.
    pub async fn seed_coupon(&self, input: CouponInput) -> Uuid {
        self.state
            .services
            .coupons
            .create(input)
            .await
            .expect("seed coupon")
            .id
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Public fixed-amount coupon valid for a day either side of now.
pub fn coupon_input(code: &str, discount_value: Decimal) -> CouponInput {
    let now = Utc::now();
    CouponInput {
        code: code.to_string(),
        name: format!("Coupon {code}"),
        description: None,
        coupon_type: CouponType::Public,
        visibility: CouponVisibility::Featured,
        discount_type: DiscountType::Fixed,
        discount_value,
        max_discount: None,
        min_order_value: Decimal::ZERO,
        usage_limit: None,
        usage_limit_per_user: 1,
        apply_type: ApplyType::All,
        applicable_categories: Vec::new(),
        applicable_products: Vec::new(),
        assigned_users: Vec::new(),
        start_date: now - Duration::days(1),
        end_date: now + Duration::days(1),
        is_active: true,
    }
}

pub fn address_json() -> Value {
    serde_json::json!({
        "recipient_name": "Nguyen Van A",
        "phone": "0912345678",
        "province": "Ha Noi",
        "ward": "Phuong Dich Vong",
        "street": "12 Tran Thai Tong",
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// JSON decimals may come back as strings; compare numerically.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
