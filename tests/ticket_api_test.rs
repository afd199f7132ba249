//! HTTP surface: completion hook, order redirect, ticket page, cross-device
//! recovery and customer listing.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use common::{ticket_order, Harness, NOW};
use transit_tickets::database::TicketStore;
use transit_tickets::services::recovery::RECOVERY_TTL_SECS;
use transit_tickets::services::{ClientTokenList, LogMailer};
use transit_tickets::tickets::TicketId;

fn app(h: &Harness) -> Router {
    h.router(Arc::new(LogMailer))
}

async fn send(app: &Router, method: &str, uri: &str, cookie: Option<&str>) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// The `name=value` part of a `Set-Cookie` header.
fn cookie_pair(response: &Response) -> String {
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("Set-Cookie missing")
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("; Path=/; Max-Age=604800; SameSite=Lax"));
    set_cookie.split(';').next().unwrap().to_string()
}

async fn issue(h: &Harness, app: &Router, order_id: i64) -> i64 {
    h.add_order(ticket_order(order_id, "30m")).await;
    let response = send(
        app,
        "POST",
        &format!("/api/orders/{}/completed", order_id),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "issued");
    assert_eq!(json["sync"], "stub");
    json["ticket_id"].as_i64().unwrap()
}

#[tokio::test]
async fn completion_hook_is_idempotent() {
    let h = Harness::offline();
    let app = app(&h);
    let ticket_id = issue(&h, &app, 40).await;

    let json = json_body(send(&app, "POST", "/api/orders/40/completed", None).await).await;
    assert_eq!(json["status"], "already_issued");
    assert_eq!(json["ticket_id"], ticket_id);

    let response = send(&app, "POST", "/api/orders/999/completed", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["message"], "Order 999 not found.");

    let mut plain = ticket_order(41, "30m");
    plain.ticket_type_tag = None;
    h.add_order(plain).await;
    let json = json_body(send(&app, "POST", "/api/orders/41/completed", None).await).await;
    assert_eq!(json["status"], "not_ticket_order");
    assert!(json.get("ticket_id").is_none());
}

#[tokio::test]
async fn order_page_redirects_to_ticket() {
    let h = Harness::offline();
    let app = app(&h);
    h.add_order(ticket_order(42, "30m")).await;

    let response = send(&app, "GET", "/api/orders/42/ticket", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let ticket_id = issue(&h, &app, 43).await;
    let response = send(&app, "GET", "/api/orders/43/ticket", None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()[header::LOCATION],
        format!("https://tickets.example.sk/tickets/{}", ticket_id).as_str()
    );
}

#[tokio::test]
async fn ticket_page_sets_recovery_cookie() {
    let h = Harness::offline();
    let app = app(&h);
    let ticket_id = issue(&h, &app, 44).await;

    let response = send(&app, "GET", &format!("/tickets/{}", ticket_id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = cookie_pair(&response);
    let view = json_body(response).await;
    assert_eq!(view["ticket_id"], ticket_id);
    assert_eq!(view["type"], "30m");
    assert_eq!(view["display_state"], "active");
    assert_eq!(view["valid_to"].as_i64(), Some(NOW + 1800));

    let list = ClientTokenList::from_cookie_header(Some(&cookie));
    assert_eq!(list.entries().len(), 1);
    let entry = &list.entries()[0];
    assert_eq!(entry.ticket, ticket_id);
    assert_eq!(entry.updated, NOW);

    let stored = h.tickets.get(TicketId(ticket_id)).await.unwrap().unwrap();
    assert_eq!(stored.recovery_token.as_deref(), Some(entry.token.as_str()));
    assert_eq!(stored.recovery_expires_at, Some(NOW + RECOVERY_TTL_SECS));

    // A second view keeps both the token and its expiry.
    h.clock.advance(60);
    let response = send(&app, "GET", &format!("/tickets/{}", ticket_id), Some(&cookie)).await;
    let list = ClientTokenList::from_cookie_header(Some(&cookie_pair(&response)));
    assert_eq!(list.entries().len(), 1);
    assert_eq!(list.entries()[0].token, entry.token);
    assert_eq!(list.entries()[0].updated, NOW + 60);
    let stored = h.tickets.get(TicketId(ticket_id)).await.unwrap().unwrap();
    assert_eq!(stored.recovery_expires_at, Some(NOW + RECOVERY_TTL_SECS));
}

#[tokio::test]
async fn cookie_keeps_five_most_recent_tickets() {
    let h = Harness::offline();
    let app = app(&h);

    let mut cookie: Option<String> = None;
    let mut ids = Vec::new();
    for order_id in 50..57 {
        let ticket_id = issue(&h, &app, order_id).await;
        ids.push(ticket_id);
        h.clock.advance(1);
        let response = send(
            &app,
            "GET",
            &format!("/tickets/{}", ticket_id),
            cookie.as_deref(),
        )
        .await;
        cookie = Some(cookie_pair(&response));
    }

    let list = ClientTokenList::from_cookie_header(cookie.as_deref());
    let kept: Vec<i64> = list.entries().iter().map(|e| e.ticket).collect();
    let newest_first: Vec<i64> = ids.iter().rev().take(5).copied().collect();
    assert_eq!(kept, newest_first);
}

#[tokio::test]
async fn unknown_ticket_page_is_not_found() {
    let h = Harness::offline();
    let response = send(&app(&h), "GET", "/tickets/404", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(json_body(response).await["message"], "Invalid ticket.");
}

#[tokio::test]
async fn recovery_token_finds_ticket_on_another_device() {
    let h = Harness::offline();
    let app = app(&h);
    let ticket_id = issue(&h, &app, 45).await;

    let response = send(&app, "GET", &format!("/tickets/{}", ticket_id), None).await;
    let cookie = cookie_pair(&response);
    let token = ClientTokenList::from_cookie_header(Some(&cookie)).entries()[0]
        .token
        .clone();

    let response = send(&app, "GET", &format!("/recover?token={}", token), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["ticket_id"], ticket_id);
    assert_eq!(summary["token"], token.as_str());
    assert_eq!(summary["status"], "active");
    assert_eq!(
        summary["permalink"],
        format!("https://tickets.example.sk/tickets/{}", ticket_id).as_str()
    );
    assert_eq!(summary["expires_at"].as_i64(), Some(NOW + RECOVERY_TTL_SECS));
}

#[tokio::test]
async fn recovery_rejects_missing_unknown_and_lapsed_tokens() {
    let h = Harness::offline();
    let app = app(&h);
    let ticket_id = issue(&h, &app, 46).await;
    let grant = h.recovery().touch(TicketId(ticket_id)).await.unwrap();

    let response = send(&app, "GET", "/recover", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["message"], "Token missing.");

    let response = send(&app, "GET", "/recover?token=nope", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["message"], "Ticket not found.");

    h.clock.set(grant.expires_at);
    let uri = format!("/recover?token={}", grant.token);
    let response = send(&app, "GET", &uri, None).await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(json_body(response).await["message"], "Ticket token expired.");

    // Viewing the ticket again revives the same token for another week.
    let renewed = h.recovery().touch(TicketId(ticket_id)).await.unwrap();
    assert_eq!(renewed.token, grant.token);
    assert_eq!(renewed.expires_at, grant.expires_at + RECOVERY_TTL_SECS);
    let response = send(&app, "GET", &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    // The stored status is reported until the sweeper flips it.
    assert_eq!(json_body(response).await["status"], "active");

    h.tickets.expire_overdue(grant.expires_at, 50).await.unwrap();
    let response = send(&app, "GET", &uri, None).await;
    assert_eq!(json_body(response).await["status"], "expired");
}

#[tokio::test]
async fn customer_listing_reports_effective_status() {
    let h = Harness::offline();
    let app = app(&h);

    for order_id in [60, 61] {
        let mut order = ticket_order(order_id, "30m");
        order.customer_id = Some(7);
        h.add_order(order).await;
        send(&app, "POST", &format!("/api/orders/{}/completed", order_id), None).await;
        h.clock.advance(1200);
    }

    // The first ticket's window has passed; the sweeper has not run yet.
    let json = json_body(send(&app, "GET", "/api/customers/7/tickets", None).await).await;
    let items = json.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["valid_to"].as_i64(), Some(NOW + 1200 + 1800));
    assert_eq!(items[0]["status"], "active");
    assert_eq!(items[1]["valid_to"].as_i64(), Some(NOW + 1800));
    assert_eq!(items[1]["status"], "expired");

    let json = json_body(send(&app, "GET", "/api/customers/8/tickets", None).await).await;
    assert_eq!(json, Value::Array(Vec::new()));
}

#[tokio::test]
async fn health_reports_provider_state() {
    let h = Harness::offline();
    let response = send(&app(&h), "GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert!(json["checks"]["provider"].is_object());
}
