//! Coupon endpoints end to end: admin management, validation, the
//! availability probe and redemption bookkeeping.

mod common;

use axum::{
    extract::FromRequestParts,
    http::{Method, Request, StatusCode},
};
use common::{address_json, coupon_input, decimal, response_json, TestApp};
use fashion_store_api::auth::{AdminUser, AuthUser};
use fashion_store_api::entities::coupon::{ApplyType, CouponType, CouponVisibility, DiscountType};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn admin_creates_coupon_and_shoppers_cannot() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    let (_, shopper) = app.shopper();

    let payload = json!({
        "code": "  summer20 ",
        "name": "Summer sale",
        "coupon_type": "public",
        "visibility": "featured",
        "discount_type": "percentage",
        "discount_value": 20,
        "max_discount": 100000,
        "min_order_value": 200000,
        "usage_limit": 100,
        "apply_type": "all",
        "start_date": "2020-01-01T00:00:00Z",
        "end_date": "2099-01-01T00:00:00Z"
    });

    let forbidden = app
        .request(Method::POST, "/api/v1/coupons", Some(payload.clone()), Some(&shopper))
        .await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let created = app
        .request(Method::POST, "/api/v1/coupons", Some(payload.clone()), Some(&admin))
        .await;
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = response_json(created).await;
    assert_eq!(body["code"], "SUMMER20");
    assert_eq!(body["used_count"], 0);
    assert_eq!(body["usage_limit_per_user"], 1);

    // same code after normalisation
    let duplicate = app
        .request(Method::POST, "/api/v1/coupons", Some(payload), Some(&admin))
        .await;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let listed = app
        .request(
            Method::GET,
            "/api/v1/coupons?is_active=true&per_page=10",
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(listed.status(), StatusCode::OK);
    let body = response_json(listed).await;
    assert_eq!(body["pagination"]["total"], 1);
    assert_eq!(body["data"][0]["code"], "SUMMER20");
}

#[tokio::test]
async fn invalid_coupon_definition_is_rejected() {
    let app = TestApp::new().await;
    let admin = app.admin_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons",
            Some(json!({
                "code": "BAD",
                "name": "Broken",
                "coupon_type": "public",
                "visibility": "hidden",
                "discount_type": "percentage",
                "discount_value": 150,
                "apply_type": "category",
                "start_date": "2024-02-01T00:00:00Z",
                "end_date": "2024-01-01T00:00:00Z"
            })),
            Some(&admin),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn percentage_coupon_is_capped_by_max_discount() {
    let app = TestApp::new().await;
    let mut input = coupon_input("PCT20", dec!(20));
    input.discount_type = DiscountType::Percentage;
    input.max_discount = Some(dec!(100000));
    app.seed_coupon(input).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({ "code": "pct20", "order_value": 1000000 })),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["eligible"], true);
    assert_eq!(decimal(&body["discount_amount"]), dec!(100000));
    assert_eq!(body["coupon"]["code"], "PCT20");
}

#[tokio::test]
async fn rule_failures_come_back_as_ineligible_with_a_code() {
    let app = TestApp::new().await;
    let mut input = coupon_input("MIN500", dec!(50000));
    input.min_order_value = dec!(500000);
    app.seed_coupon(input).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({ "code": "MIN500", "order_value": 400000 })),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["eligible"], false);
    assert_eq!(body["reason"]["code"], "MIN_ORDER_NOT_MET");
    let message = body["reason"]["message"].as_str().unwrap();
    assert!(message.contains("500000"), "{message}");
    assert!(message.contains("100000"), "{message}");
    assert!(body.get("coupon").is_none());
}

#[tokio::test]
async fn category_coupon_needs_a_matching_line() {
    let app = TestApp::new().await;
    let shirts = app.seed_category("Shirts").await;
    let jeans = app.seed_category("Jeans").await;

    let mut input = coupon_input("SHIRTS", dec!(30000));
    input.apply_type = ApplyType::Category;
    input.applicable_categories = vec![shirts.id];
    app.seed_coupon(input).await;

    let mismatch = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({
                "code": "SHIRTS",
                "order_value": 300000,
                "category_ids": [jeans.id]
            })),
            None,
        )
        .await;
    let body = response_json(mismatch).await;
    assert_eq!(body["eligible"], false);
    assert_eq!(body["reason"]["code"], "COUPON_SCOPE_MISMATCH");

    let matched = app
        .request(
            Method::POST,
            "/api/v1/coupons/validate",
            Some(json!({
                "code": "SHIRTS",
                "order_value": 300000,
                "category_ids": [jeans.id, shirts.id]
            })),
            None,
        )
        .await;
    let body = response_json(matched).await;
    assert_eq!(body["eligible"], true);
    assert_eq!(decimal(&body["discount_amount"]), dec!(30000));
}

#[tokio::test]
async fn check_probe_reports_stable_error_codes() {
    let app = TestApp::new().await;
    let (shopper, token) = app.shopper();
    let (_, other_token) = app.shopper();

    let mut private = coupon_input("VIPONLY", dec!(20000));
    private.coupon_type = CouponType::Private;
    private.assigned_users = vec![shopper.user_id];
    app.seed_coupon(private).await;

    let unknown = app
        .request(Method::GET, "/api/v1/coupons/check/NOPE", None, None)
        .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(response_json(unknown).await["code"], "COUPON_NOT_FOUND");

    let anonymous = app
        .request(Method::GET, "/api/v1/coupons/check/viponly", None, None)
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response_json(anonymous).await["code"],
        "AUTH_REQUIRED_FOR_PRIVATE_COUPON"
    );

    let stranger = app
        .request(Method::GET, "/api/v1/coupons/check/VIPONLY", None, Some(&other_token))
        .await;
    assert_eq!(stranger.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response_json(stranger).await["code"],
        "COUPON_NOT_AVAILABLE_FOR_USER"
    );

    let assigned = app
        .request(Method::GET, "/api/v1/coupons/check/VIPONLY", None, Some(&token))
        .await;
    assert_eq!(assigned.status(), StatusCode::OK);
    assert_eq!(response_json(assigned).await["code"], "VIPONLY");
}

#[tokio::test]
async fn invalid_token_is_rejected_even_where_anonymous_is_allowed() {
    let app = TestApp::new().await;
    app.seed_coupon(coupon_input("OPEN", dec!(10000))).await;

    let response = app
        .request(Method::GET, "/api/v1/coupons/check/OPEN", None, Some("not-a-jwt"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn extractors_resolve_users_from_shared_app_state() {
    let app = TestApp::new().await;
    let (shopper, token) = app.shopper();
    let parts = |token: &str| {
        Request::builder()
            .uri("/api/v1/cart")
            .header("authorization", format!("Bearer {token}"))
            .body(())
            .unwrap()
            .into_parts()
            .0
    };

    let mut p = parts(&token);
    let found = AuthUser::from_request_parts(&mut p, &app.state).await.unwrap();
    assert_eq!(found.user_id, shopper.user_id);

    let mut p = parts(&token);
    assert!(AdminUser::from_request_parts(&mut p, &app.state).await.is_err());

    let mut p = parts(&app.admin_token());
    assert!(AdminUser::from_request_parts(&mut p, &app.state).await.is_ok());
}

#[tokio::test]
async fn available_lists_visible_usable_coupons_only() {
    let app = TestApp::new().await;
    let (_, token) = app.shopper();

    app.seed_coupon(coupon_input("FEATURED", dec!(10000))).await;

    let mut landing = coupon_input("LANDING", dec!(15000));
    landing.visibility = CouponVisibility::LandingPage;
    app.seed_coupon(landing).await;

    let mut hidden = coupon_input("HIDDEN", dec!(10000));
    hidden.visibility = CouponVisibility::Hidden;
    app.seed_coupon(hidden).await;

    let mut inactive = coupon_input("PAUSED", dec!(10000));
    inactive.is_active = false;
    app.seed_coupon(inactive).await;

    let mut someone_elses = coupon_input("NOTYOURS", dec!(10000));
    someone_elses.coupon_type = CouponType::Private;
    someone_elses.assigned_users = vec![uuid::Uuid::new_v4()];
    app.seed_coupon(someone_elses).await;

    let response = app
        .request(Method::GET, "/api/v1/coupons/available", None, Some(&token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let mut codes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    codes.sort_unstable();
    assert_eq!(codes, vec!["FEATURED", "LANDING"]);
}

#[tokio::test]
async fn redeemed_coupon_is_spent_and_cannot_be_deleted() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    let (_, token) = app.shopper();

    let category = app.seed_category("Dresses").await;
    let dress = app.seed_product(category.id, "Linen dress", dec!(450000)).await;
    let coupon_id = app.seed_coupon(coupon_input("ONCE", dec!(50000))).await;

    let added = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": dress.id, "quantity": 1 })),
            Some(&token),
        )
        .await;
    assert_eq!(added.status(), StatusCode::OK);

    let placed = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "coupon_code": "once", "address": address_json() })),
            Some(&token),
        )
        .await;
    assert_eq!(placed.status(), StatusCode::CREATED);
    let order = response_json(placed).await;
    let order_id = order["id"].as_str().unwrap().to_string();
    assert_eq!(decimal(&order["discount_amount"]), dec!(50000));

    // checkout already wrote the ledger row, so apply is a no-op
    let applied = app
        .request(
            Method::POST,
            "/api/v1/coupons/apply",
            Some(json!({
                "coupon_id": coupon_id,
                "order_id": order_id,
                "discount_amount": 50000
            })),
            Some(&token),
        )
        .await;
    assert_eq!(applied.status(), StatusCode::OK);
    let body = response_json(applied).await;
    assert_eq!(body["newly_recorded"], false);
    assert_eq!(body["coupon_code"], "ONCE");

    let coupon = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/coupons/{coupon_id}"),
            None,
            Some(&admin),
        )
        .await,
    )
    .await;
    assert_eq!(coupon["used_count"], 1);

    // the per-user limit of one is now spent
    let again = app
        .request(Method::GET, "/api/v1/coupons/check/ONCE", None, Some(&token))
        .await;
    assert_eq!(again.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response_json(again).await["code"], "USER_USAGE_LIMIT_REACHED");

    // cancelling the order does not give the coupon back
    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{order_id}/cancel"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    let still_spent = app
        .request(Method::GET, "/api/v1/coupons/check/ONCE", None, Some(&token))
        .await;
    assert_eq!(still_spent.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let delete = app
        .request(
            Method::DELETE,
            &format!("/api/v1/coupons/{coupon_id}"),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(delete.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unused_coupon_can_be_deleted() {
    let app = TestApp::new().await;
    let admin = app.admin_token();
    let coupon_id = app.seed_coupon(coupon_input("TEMP", dec!(10000))).await;

    let delete = app
        .request(
            Method::DELETE,
            &format!("/api/v1/coupons/{coupon_id}"),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(delete.status(), StatusCode::NO_CONTENT);

    let gone = app
        .request(
            Method::GET,
            &format!("/api/v1/coupons/{coupon_id}"),
            None,
            Some(&admin),
        )
        .await;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}
