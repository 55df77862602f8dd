//! The global usage cap holds when many checkouts race for the last uses of
//! a coupon.

mod common;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use common::{address_json, coupon_input, response_json, TestApp};
use fashion_store_api::entities::coupon;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_exceed_usage_limit() {
    let app = Arc::new(TestApp::new().await);
    let tees = app.seed_category("Tees").await;
    let tee = app.seed_product(tees.id, "Graphic tee", dec!(250000)).await;

    let mut input = coupon_input("FLASH3", dec!(20000));
    input.usage_limit = Some(3);
    let coupon_id = app.seed_coupon(input).await;

    let mut shoppers = Vec::new();
    for _ in 0..8 {
        let (_, token) = app.shopper();
        let added = app
            .request(
                Method::POST,
                "/api/v1/cart/items",
                Some(json!({ "product_id": tee.id, "quantity": 1 })),
                Some(&token),
            )
            .await;
        assert_eq!(added.status(), StatusCode::OK);
        shoppers.push(token);
    }

    let mut tasks = Vec::new();
    for token in shoppers {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let response = app
                .request(
                    Method::POST,
                    "/api/v1/checkout",
                    Some(json!({ "coupon_code": "FLASH3", "address": address_json() })),
                    Some(&token),
                )
                .await;
            let status = response.status();
            (status, response_json(response).await)
        }));
    }

    let mut placed = 0;
    for task in tasks {
        let (status, body) = task.await.expect("checkout task");
        match status {
            StatusCode::CREATED => placed += 1,
            StatusCode::CONFLICT => assert_eq!(body["code"], "COUPON_USAGE_LIMIT_REACHED"),
            other => panic!("unexpected status {other}: {body}"),
        }
    }
    assert_eq!(placed, 3, "exactly the capped number of orders should get the coupon");

    let stored = coupon::Entity::find_by_id(coupon_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.used_count, 3);

    let (_, latecomer) = app.shopper();
    let probe = app
        .request(Method::GET, "/api/v1/coupons/check/FLASH3", None, Some(&latecomer))
        .await;
    assert_eq!(probe.status(), StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_shopper_cannot_double_spend_a_single_use_coupon() {
    let app = Arc::new(TestApp::new().await);
    let (_, token) = app.shopper();
    let socks = app.seed_category("Socks").await;
    let pair = app.seed_product(socks.id, "Ankle socks", dec!(40000)).await;
    app.seed_coupon(coupon_input("ONEPER", dec!(10000))).await;

    // two carts' worth of attempts from the same account, back to back
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let app = app.clone();
        let token = token.clone();
        let product_id = pair.id;
        tasks.push(tokio::spawn(async move {
            app.request(
                Method::POST,
                "/api/v1/cart/items",
                Some(json!({ "product_id": product_id, "quantity": 1 })),
                Some(&token),
            )
            .await;
            app.request(
                Method::POST,
                "/api/v1/checkout",
                Some(json!({ "coupon_code": "ONEPER", "address": address_json() })),
                Some(&token),
            )
            .await
            .status()
        }));
    }

    let mut with_coupon = 0;
    for task in tasks {
        if task.await.expect("checkout task") == StatusCode::CREATED {
            with_coupon += 1;
        }
    }
    assert!(with_coupon <= 1, "coupon redeemed {with_coupon} times");

    let orders = response_json(app.request(Method::GET, "/api/v1/orders", None, Some(&token)).await).await;
    let discounted = orders["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|o| o["coupon_code"] == "ONEPER")
        .count();
    assert!(discounted <= 1);
}
