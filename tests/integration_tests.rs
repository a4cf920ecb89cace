use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use phlebo_booking::config::AppConfig;
use phlebo_booking::db;
use phlebo_booking::handlers;
use phlebo_booking::services::gateway::webhook::sign_payload;
use phlebo_booking::services::gateway::{
    ChargeDetails, CreateIntentRequest, CreatedIntent, IntentSnapshot, IntentStatus,
    PaymentGateway,
};
use phlebo_booking::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_integration";

// ── Mock Gateway ──

#[derive(Clone, Default)]
struct MockGateway {
    intents: Arc<Mutex<HashMap<String, IntentSnapshot>>>,
    counter: Arc<AtomicUsize>,
}

impl MockGateway {
    fn set_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_id) {
            intent.status = status;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(&self, request: &CreateIntentRequest) -> anyhow::Result<CreatedIntent> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let intent_id = format!("pi_it_{n}");
        self.intents.lock().unwrap().insert(
            intent_id.clone(),
            IntentSnapshot {
                intent_id: intent_id.clone(),
                status: IntentStatus::RequiresPaymentMethod,
                amount_minor: request.amount_minor,
                currency: request.currency.clone(),
                payment_method_type: Some("card".to_string()),
                charge: ChargeDetails::default(),
                last_error: None,
            },
        );
        Ok(CreatedIntent {
            client_secret: format!("{intent_id}_secret_abc"),
            intent_id,
        })
    }

    async fn get_intent(&self, intent_id: &str) -> anyhow::Result<IntentSnapshot> {
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such intent"))
    }
}

// ── Helpers ──

fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        currency: "usd".to_string(),
        stripe_secret_key: "".to_string(),
        stripe_api_base: "http://localhost".to_string(),
        stripe_webhook_secret: WEBHOOK_SECRET.to_string(),
        webhook_tolerance_secs: 300,
        gateway_timeout: Duration::from_secs(2),
    }
}

fn test_state() -> (Arc<AppState>, MockGateway) {
    let conn = db::init_db(":memory:").unwrap();
    conn.execute_batch(
        "INSERT INTO providers (id, name) VALUES ('prov-1', 'Northside Draws');
         INSERT INTO provider_services (id, provider_id, service_id, name, cost, commission_percent, start_date) VALUES
           ('ps-cbc', 'prov-1', 'cbc', 'Complete blood count', '35.00', '12.5', '2020-01-01'),
           ('ps-lipid', 'prov-1', 'lipid', 'Lipid panel', '45.00', '15', '2020-01-01');",
    )
    .unwrap();

    let gateway = MockGateway::default();
    let state = Arc::new(AppState {
        db: Arc::new(Mutex::new(conn)),
        config: test_config(),
        gateway: Box::new(gateway.clone()),
    });
    (state, gateway)
}

fn test_app(state: Arc<AppState>) -> Router {
    handlers::router(state)
}

async fn send(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let res = test_app(state.clone()).oneshot(req).await.unwrap();
    let status = res.status();
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn post_json(uri: &str, patient: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("X-Patient-Id", patient)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_as(uri: &str, patient: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-Patient-Id", patient)
        .body(Body::empty())
        .unwrap()
}

fn draft_body(service_ids: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "providerId": "prov-1",
        "serviceIds": service_ids,
        "collectionType": "home_visit",
        "scheduledDate": "2099-01-15",
        "timeSlot": "09:00-10:00",
        "address": {
            "line1": "12 Elm St",
            "city": "Springfield",
            "region": "IL",
            "postalCode": "62701"
        }
    })
}

fn webhook_request(event_type: &str, event_id: &str, intent_id: &str, amount: i64) -> Request<Body> {
    let payload = serde_json::json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": {
            "id": intent_id,
            "amount": amount,
            "currency": "usd",
            "status": if event_type == "payment_intent.succeeded" { "succeeded" } else { "requires_payment_method" },
            "latest_charge": {
                "id": format!("ch_{intent_id}"),
                "payment_method_details": {
                    "type": "card",
                    "card": { "brand": "visa", "last4": "4242" }
                }
            },
            "last_payment_error": null
        }}
    })
    .to_string();
    let signature =
        sign_payload(WEBHOOK_SECRET, chrono::Utc::now().timestamp(), payload.as_bytes()).unwrap();

    Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("Content-Type", "application/json")
        .header("Stripe-Signature", signature)
        .body(Body::from(payload))
        .unwrap()
}

fn count(state: &Arc<AppState>, sql: &str) -> i64 {
    let db = state.db.lock().unwrap();
    db.query_row(sql, [], |row| row.get(0)).unwrap()
}

/// Draft + intent for cbc and lipid (80.00). Returns (booking_id, draft_token, intent_id).
async fn draft_with_intent(state: &Arc<AppState>) -> (String, String, String) {
    let (status, draft) = send(state, post_json("/bookings/draft", "patient-1", draft_body(&["cbc", "lipid"]))).await;
    assert_eq!(status, StatusCode::CREATED);
    let booking_id = draft["bookingId"].as_str().unwrap().to_string();
    let token = draft["draftToken"].as_str().unwrap().to_string();

    let (status, intent) = send(
        state,
        post_json(
            "/bookings/payment-intent",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "draftToken": token}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let intent_id = intent["paymentIntentId"].as_str().unwrap().to_string();

    (booking_id, token, intent_id)
}

// ── Health Check ──

#[tokio::test]
async fn test_health() {
    let (state, _) = test_state();
    let (status, json) = send(
        &state,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

// ── Draft Tests ──

#[tokio::test]
async fn test_draft_created_with_frozen_total() {
    let (state, _) = test_state();
    let (status, json) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc", "lipid"])),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["totalCost"], "80.00");
    assert_eq!(json["draftToken"].as_str().unwrap().len(), 64);
    assert!(json["expiresAt"].is_string());
    assert_eq!(json["items"].as_array().unwrap().len(), 2);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM booking_items"), 2);
}

#[tokio::test]
async fn test_draft_with_unavailable_service_writes_nothing() {
    let (state, _) = test_state();
    let (status, json) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc", "ferritin"])),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "service_unavailable");
    assert_eq!(count(&state, "SELECT COUNT(*) FROM bookings"), 0);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM booking_items"), 0);
}

#[tokio::test]
async fn test_draft_requires_patient_identity() {
    let (state, _) = test_state();
    let req = Request::builder()
        .method("POST")
        .uri("/bookings/draft")
        .header("Content-Type", "application/json")
        .body(Body::from(draft_body(&["cbc"]).to_string()))
        .unwrap();

    let (status, json) = send(&state, req).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"], "validation_error");
}

#[tokio::test]
async fn test_draft_unknown_provider() {
    let (state, _) = test_state();
    let mut body = draft_body(&["cbc"]);
    body["providerId"] = serde_json::json!("prov-404");

    let (status, json) = send(&state, post_json("/bookings/draft", "patient-1", body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "provider_not_found");
}

// ── Booking Read Tests ──

#[tokio::test]
async fn test_draft_hidden_without_token() {
    let (state, _) = test_state();
    let (_, draft) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc"])),
    )
    .await;
    let booking_id = draft["bookingId"].as_str().unwrap();
    let token = draft["draftToken"].as_str().unwrap();

    let (status, _) = send(&state, get_as(&format!("/bookings/{booking_id}"), "patient-1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send(
        &state,
        get_as(&format!("/bookings/{booking_id}?draft_token={token}"), "patient-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["booking"]["status"], "pending");
    assert!(json["booking"].get("draftToken").is_none());

    let (status, _) = send(
        &state,
        get_as(&format!("/bookings/{booking_id}?draft_token={token}"), "patient-2"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Payment Intent Tests ──

#[tokio::test]
async fn test_payment_intent_issued() {
    let (state, gateway) = test_state();
    let (_, draft) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc", "lipid"])),
    )
    .await;

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/payment-intent",
            "patient-1",
            serde_json::json!({"bookingId": draft["bookingId"], "draftToken": draft["draftToken"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["amount"], "80.00");
    assert_eq!(json["currency"], "usd");
    assert!(json["clientSecret"].as_str().unwrap().ends_with("_secret_abc"));

    let intent_id = json["paymentIntentId"].as_str().unwrap();
    let snapshot = gateway.intents.lock().unwrap()[intent_id].clone();
    assert_eq!(snapshot.amount_minor, 8000);
}

#[tokio::test]
async fn test_payment_intent_rejected_for_expired_draft() {
    let (state, _) = test_state();
    let (_, draft) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc"])),
    )
    .await;
    {
        let db = state.db.lock().unwrap();
        db.execute(
            "UPDATE bookings SET draft_expires_at = '2000-01-01 00:00:00' WHERE id = ?1",
            [draft["bookingId"].as_str().unwrap()],
        )
        .unwrap();
    }

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/payment-intent",
            "patient-1",
            serde_json::json!({"bookingId": draft["bookingId"], "draftToken": draft["draftToken"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "draft_expired");
}

#[tokio::test]
async fn test_payment_intent_wrong_token() {
    let (state, _) = test_state();
    let (_, draft) = send(
        &state,
        post_json("/bookings/draft", "patient-1", draft_body(&["cbc"])),
    )
    .await;

    let (status, _) = send(
        &state,
        post_json(
            "/bookings/payment-intent",
            "patient-1",
            serde_json::json!({"bookingId": draft["bookingId"], "draftToken": "not-the-token"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_payment_intent_not_replaced_while_processing() {
    let (state, gateway) = test_state();
    let (booking_id, token, intent_id) = draft_with_intent(&state).await;
    gateway.set_status(&intent_id, IntentStatus::Processing);

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/payment-intent",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "draftToken": token}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "payment_in_progress");
    assert_eq!(gateway.intents.lock().unwrap().len(), 1);
    assert_eq!(
        count(&state, &format!("SELECT COUNT(*) FROM bookings WHERE stripe_payment_intent_id = '{intent_id}'")),
        1
    );
}

// ── Webhook Tests ──

#[tokio::test]
async fn test_webhook_confirms_booking() {
    let (state, _) = test_state();
    let (booking_id, _, intent_id) = draft_with_intent(&state).await;

    let (status, json) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 8000),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (status, view) = send(&state, get_as(&format!("/bookings/{booking_id}"), "patient-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["booking"]["status"], "confirmed");
    assert!(view["booking"]["confirmationNumber"]
        .as_str()
        .unwrap()
        .starts_with("PHL-"));
    assert_eq!(view["payment"]["amount"], "80.00");
    assert_eq!(view["payment"]["cardLast4"], "4242");
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 1);
}

#[tokio::test]
async fn test_duplicate_webhook_is_idempotent() {
    let (state, _) = test_state();
    let (booking_id, _, intent_id) = draft_with_intent(&state).await;

    let (status, _) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 8000),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, first) = send(&state, get_as(&format!("/bookings/{booking_id}"), "patient-1")).await;

    let (status, json) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 8000),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    let (_, second) = send(&state, get_as(&format!("/bookings/{booking_id}"), "patient-1")).await;
    assert_eq!(
        first["booking"]["confirmationNumber"],
        second["booking"]["confirmationNumber"]
    );
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 1);
}

#[tokio::test]
async fn test_webhook_bad_signature_rejected() {
    let (state, _) = test_state();
    let (booking_id, _, intent_id) = draft_with_intent(&state).await;

    let mut req = webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 8000);
    req.headers_mut().insert(
        "stripe-signature",
        format!("t={},v1={}", chrono::Utc::now().timestamp(), "00".repeat(32))
            .parse()
            .unwrap(),
    );

    let (status, json) = send(&state, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 0);

    let status: String = {
        let db = state.db.lock().unwrap();
        db.query_row("SELECT status FROM bookings WHERE id = ?1", [&booking_id], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(status, "pending");
}

#[tokio::test]
async fn test_webhook_missing_signature_rejected() {
    let (state, _) = test_state();
    let req = Request::builder()
        .method("POST")
        .uri("/webhooks/payment")
        .header("Content-Type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let (status, _) = send(&state, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_unrelated_event_acknowledged() {
    let (state, _) = test_state();
    let (status, json) = send(
        &state,
        webhook_request("payment_intent.created", "evt_9", "pi_whatever", 100),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn test_webhook_unknown_intent_acknowledged() {
    let (state, _) = test_state();
    let (status, json) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_2", "pi_not_ours", 8000),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 0);
}

#[tokio::test]
async fn test_webhook_payment_failed_keeps_booking_pending() {
    let (state, _) = test_state();
    let (booking_id, token, intent_id) = draft_with_intent(&state).await;

    let (status, _) = send(
        &state,
        webhook_request("payment_intent.payment_failed", "evt_f", &intent_id, 8000),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payment_failures"), 1);

    let (status, view) = send(
        &state,
        get_as(&format!("/bookings/{booking_id}?draft_token={token}"), "patient-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["booking"]["status"], "pending");
}

#[tokio::test]
async fn test_webhook_amount_mismatch_not_acknowledged() {
    let (state, _) = test_state();
    let (_, _, intent_id) = draft_with_intent(&state).await;

    let (status, json) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 100),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["success"], false);
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 0);
}

// ── Client Confirmation Tests ──

#[tokio::test]
async fn test_client_confirmation_before_payment_succeeds() {
    let (state, _) = test_state();
    let (booking_id, _, intent_id) = draft_with_intent(&state).await;

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/confirm",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "paymentIntentId": intent_id}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "payment_not_succeeded");
}

#[tokio::test]
async fn test_client_confirmation_then_webhook() {
    let (state, gateway) = test_state();
    let (booking_id, _, intent_id) = draft_with_intent(&state).await;
    gateway.set_status(&intent_id, IntentStatus::Succeeded);

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/confirm",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "paymentIntentId": intent_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let number = json["confirmationNumber"].as_str().unwrap().to_string();
    assert_eq!(json["booking"]["status"], "confirmed");

    let (status, _) = send(
        &state,
        webhook_request("payment_intent.succeeded", "evt_1", &intent_id, 8000),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, again) = send(
        &state,
        post_json(
            "/bookings/confirm",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "paymentIntentId": intent_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["confirmationNumber"], number.as_str());
    assert_eq!(count(&state, "SELECT COUNT(*) FROM payments"), 1);
}

#[tokio::test]
async fn test_client_confirmation_intent_mismatch() {
    let (state, _) = test_state();
    let (booking_id, _, _) = draft_with_intent(&state).await;

    let (status, json) = send(
        &state,
        post_json(
            "/bookings/confirm",
            "patient-1",
            serde_json::json!({"bookingId": booking_id, "paymentIntentId": "pi_someone_else"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "intent_mismatch");
}
