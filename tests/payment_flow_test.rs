//! Sepay QR payments over HTTP with the Sepay transaction API mocked.

mod common;

use axum::{
    body,
    http::{Method, StatusCode},
};
use common::{address_json, decimal, response_json, TestApp, WEBHOOK_API_KEY};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Place a Sepay order for one product and return the order body.
async fn sepay_order(app: &TestApp, token: &str, price: Decimal) -> Value {
    let category = app.seed_category("Jackets").await;
    let jacket = app.seed_product(category.id, "Denim jacket", price).await;
    let added = app
        .request(
            Method::POST,
            "/api/v1/cart/items",
            Some(json!({ "product_id": jacket.id, "quantity": 1 })),
            Some(token),
        )
        .await;
    assert_eq!(added.status(), StatusCode::OK);

    let placed = app
        .request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "payment_method": "sepay", "address": address_json() })),
            Some(token),
        )
        .await;
    assert_eq!(placed.status(), StatusCode::CREATED);
    response_json(placed).await
}

async fn mount_transactions(server: &MockServer, transactions: Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/transactions/list"))
        .and(header("authorization", "Bearer sepay-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": 200, "transactions": transactions })),
        )
        .mount(server)
        .await;
}

fn webhook_body(id: u64, content: &str, amount: u64) -> Value {
    json!({
        "id": id,
        "gateway": "MBBank",
        "transactionDate": "2024-03-09 10:05:00",
        "accountNumber": "0123456789",
        "code": null,
        "content": content,
        "transferType": "in",
        "transferAmount": amount,
        "referenceCode": "FT24069000001"
    })
}

#[tokio::test]
async fn polling_status_settles_the_order() {
    let server = MockServer::start().await;
    mount_transactions(&server, json!([])).await;
    let app = TestApp::with_sepay_api(&server.uri()).await;
    let (_, token) = app.shopper();

    let order = sepay_order(&app, &token, dec!(259000)).await;
    let order_id = order["id"].as_str().unwrap();

    let started = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(started.status(), StatusCode::CREATED);
    let session = response_json(started).await;
    assert_eq!(session["status"], "pending");
    assert_eq!(decimal(&session["amount"]), dec!(259000));
    assert_eq!(session["bank"]["bank_code"], "MBBank");
    let content = session["transfer_content"].as_str().unwrap().to_string();
    assert!(content.starts_with("ORD") && !content.contains('-'));
    assert!(session["qr_url"].as_str().unwrap().contains("amount=259000"));
    assert!(session["remaining_secs"].as_u64().unwrap() <= 900);

    // starting again returns the live session
    let again = response_json(
        app.request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(again["payment_id"], session["payment_id"]);

    let pending = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/status"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(pending["status"], "pending");
    assert_eq!(pending["payment_status"], "unpaid");

    mount_transactions(
        &server,
        json!([{
            "id": "5001",
            "transaction_date": "2024-03-09 10:05:00",
            "amount_in": "259000.00",
            "transaction_content": format!("MBVCB.1 {content} chuyen tien")
        }]),
    )
    .await;

    let paid = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/status"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(paid["status"], "completed");
    assert_eq!(paid["payment_status"], "paid");
    assert_eq!(paid["transaction_id"], "5001");

    let order = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None, Some(&token))
            .await,
    )
    .await;
    assert_eq!(order["status"], "confirmed");

    // a paid order can be neither re-started nor cancelled
    let restart = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(restart.status(), StatusCode::CONFLICT);
    let cancel = app
        .request(Method::POST, &format!("/api/v1/orders/{order_id}/cancel"), None, Some(&token))
        .await;
    assert_eq!(cancel.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cash_on_delivery_orders_have_no_qr() {
    let app = TestApp::new().await;
    let (_, token) = app.shopper();
    let category = app.seed_category("Belts").await;
    let belt = app.seed_product(category.id, "Leather belt", dec!(120000)).await;
    app.request(
        Method::POST,
        "/api/v1/cart/items",
        Some(json!({ "product_id": belt.id, "quantity": 1 })),
        Some(&token),
    )
    .await;
    let order = response_json(
        app.request(
            Method::POST,
            "/api/v1/checkout",
            Some(json!({ "address": address_json() })),
            Some(&token),
        )
        .await,
    )
    .await;
    let order_id = order["id"].as_str().unwrap();

    let started = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(started.status(), StatusCode::BAD_REQUEST);

    let status = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/status"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(status.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_settles_once_and_checks_the_api_key() {
    let app = TestApp::new().await;
    let (_, token) = app.shopper();
    let order = sepay_order(&app, &token, dec!(499000)).await;
    let order_id = order["id"].as_str().unwrap();
    let session = response_json(
        app.request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    let content = session["transfer_content"].as_str().unwrap();
    let apikey = format!("Apikey {WEBHOOK_API_KEY}");

    let no_key = app
        .request(
            Method::POST,
            "/api/v1/payments/sepay/webhook",
            Some(webhook_body(9001, content, 499000)),
            None,
        )
        .await;
    assert_eq!(no_key.status(), StatusCode::UNAUTHORIZED);

    let short = response_json(
        app.request_with_headers(
            Method::POST,
            "/api/v1/payments/sepay/webhook",
            Some(webhook_body(9000, content, 400000)),
            None,
            &[("authorization", apikey.as_str())],
        )
        .await,
    )
    .await;
    assert_eq!(short["success"], true);
    assert_eq!(short["matched"], false);

    let settled = app
        .request_with_headers(
            Method::POST,
            "/api/v1/payments/sepay/webhook",
            Some(webhook_body(9001, &format!("IB {content} thanh toan"), 499000)),
            None,
            &[("authorization", apikey.as_str())],
        )
        .await;
    assert_eq!(settled.status(), StatusCode::OK);
    let body = response_json(settled).await;
    assert_eq!(body["matched"], true);

    let replay = response_json(
        app.request_with_headers(
            Method::POST,
            "/api/v1/payments/sepay/webhook",
            Some(webhook_body(9001, content, 499000)),
            None,
            &[("authorization", apikey.as_str())],
        )
        .await,
    )
    .await;
    assert_eq!(replay["matched"], true);
    assert_eq!(replay["message"], "transaction already processed");

    let status = response_json(
        app.request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/status"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["transaction_id"], "9001");

    let unknown = response_json(
        app.request_with_headers(
            Method::POST,
            "/api/v1/payments/sepay/webhook",
            Some(webhook_body(9002, "ORD20990101ZZZZZZ", 1000)),
            None,
            &[("authorization", apikey.as_str())],
        )
        .await,
    )
    .await;
    assert_eq!(unknown["success"], true);
    assert_eq!(unknown["matched"], false);
}

#[tokio::test]
async fn cancelled_session_can_be_restarted() {
    let app = TestApp::new().await;
    let (_, token) = app.shopper();
    let order = sepay_order(&app, &token, dec!(150000)).await;
    let order_id = order["id"].as_str().unwrap();

    let first = response_json(
        app.request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;

    let cancelled = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/cancel"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(cancelled.status(), StatusCode::OK);
    let body = response_json(cancelled).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["payment_status"], "unpaid");

    let twice = app
        .request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/cancel"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(twice.status(), StatusCode::BAD_REQUEST);

    let second = response_json(
        app.request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    assert_eq!(second["status"], "pending");
    assert_ne!(second["payment_id"], first["payment_id"]);
}

#[tokio::test]
async fn watch_streams_until_the_transfer_arrives() {
    let server = MockServer::start().await;
    mount_transactions(&server, json!([])).await;
    let app = TestApp::with_sepay_api(&server.uri()).await;
    let (_, token) = app.shopper();

    let order = sepay_order(&app, &token, dec!(320000)).await;
    let order_id = order["id"].as_str().unwrap();
    let session = response_json(
        app.request(
            Method::POST,
            &format!("/api/v1/payments/{order_id}/sepay"),
            None,
            Some(&token),
        )
        .await,
    )
    .await;
    let content = session["transfer_content"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/watch"),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));

    // the transfer lands after the monitor has started ticking
    mount_transactions(
        &server,
        json!([{
            "id": 7001,
            "transaction_date": "2024-03-09 10:05:00",
            "amount_in": 320000,
            "transaction_content": content
        }]),
    )
    .await;

    // the stream ends once the monitor reaches a terminal state
    let bytes = tokio::time::timeout(
        std::time::Duration::from_secs(15),
        body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream should finish")
    .expect("stream body");
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: tick"), "{text}");
    assert!(text.contains("event: completed"), "{text}");

    // watching a settled session answers immediately
    let settled = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/{order_id}/watch"),
            None,
            Some(&token),
        )
        .await;
    let text = String::from_utf8(
        body::to_bytes(settled.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("event: completed"));
    assert!(!text.contains("event: tick"));
}
