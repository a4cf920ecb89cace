//! Shared fixtures for service tests: a seeded in-memory database and a scriptable gateway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::config::AppConfig;
use crate::db;
use crate::models::{CollectionType, ServiceAddress};
use crate::services::draft::{create_draft, DraftReceipt, DraftRequest};
use crate::services::gateway::{
    ChargeDetails, CreateIntentRequest, CreatedIntent, IntentSnapshot, IntentStatus,
    PaymentError, PaymentGateway,
};
use crate::state::AppState;

#[derive(Clone, Default)]
pub struct MockGateway {
    pub created: Arc<Mutex<Vec<CreateIntentRequest>>>,
    pub intents: Arc<Mutex<HashMap<String, IntentSnapshot>>>,
    pub delay: Arc<Mutex<Option<Duration>>>,
    pub fail_create: Arc<Mutex<bool>>,
    pub lookups: Arc<AtomicUsize>,
    counter: Arc<AtomicUsize>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(&self, intent_id: &str) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_id) {
            intent.status = IntentStatus::Succeeded;
            intent.payment_method_type = Some("card".to_string());
            intent.charge = ChargeDetails {
                charge_id: Some(format!("ch_{intent_id}")),
                brand: Some("visa".to_string()),
                last4: Some("4242".to_string()),
            };
        }
    }

    pub fn fail(&self, intent_id: &str) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_id) {
            intent.status = IntentStatus::RequiresPaymentMethod;
            intent.last_error = Some(PaymentError {
                code: Some("card_declined".to_string()),
                message: Some("Your card was declined.".to_string()),
            });
        }
    }

    pub fn snapshot(&self, intent_id: &str) -> IntentSnapshot {
        self.intents.lock().unwrap()[intent_id].clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(&self, request: &CreateIntentRequest) -> anyhow::Result<CreatedIntent> {
        self.pause().await;
        if *self.fail_create.lock().unwrap() {
            anyhow::bail!("gateway unavailable");
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let intent_id = format!("pi_test_{n}");
        self.created.lock().unwrap().push(request.clone());
        self.intents.lock().unwrap().insert(
            intent_id.clone(),
            IntentSnapshot {
                intent_id: intent_id.clone(),
                status: IntentStatus::RequiresPaymentMethod,
                amount_minor: request.amount_minor,
                currency: request.currency.clone(),
                payment_method_type: None,
                charge: ChargeDetails::default(),
                last_error: None,
            },
        );

        Ok(CreatedIntent {
            client_secret: format!("{intent_id}_secret"),
            intent_id,
        })
    }

    async fn get_intent(&self, intent_id: &str) -> anyhow::Result<IntentSnapshot> {
        self.pause().await;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such intent: {intent_id}"))
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        port: 3000,
        database_url: ":memory:".to_string(),
        currency: "usd".to_string(),
        stripe_secret_key: String::new(),
        stripe_api_base: "http://localhost".to_string(),
        stripe_webhook_secret: "whsec_test".to_string(),
        webhook_tolerance_secs: 300,
        gateway_timeout: Duration::from_millis(100),
    }
}

pub fn seeded_state(gateway: MockGateway) -> AppState {
    let conn = db::init_db(":memory:").unwrap();
    conn.execute_batch(
        "INSERT INTO providers (id, name) VALUES ('prov-1', 'Northside Draws');
         INSERT INTO provider_services (id, provider_id, service_id, name, cost, commission_percent, start_date) VALUES
           ('ps-cbc', 'prov-1', 'cbc', 'Complete blood count', '35.00', '12.5', '2025-01-01'),
           ('ps-lipid', 'prov-1', 'lipid', 'Lipid panel', '45.00', '15', '2025-01-01');",
    )
    .unwrap();

    AppState {
        db: Arc::new(Mutex::new(conn)),
        config: test_config(),
        gateway: Box::new(gateway),
    }
}

pub fn draft_request(service_ids: &[&str]) -> DraftRequest {
    DraftRequest {
        provider_id: "prov-1".to_string(),
        service_ids: service_ids.iter().map(|s| s.to_string()).collect(),
        collection_type: CollectionType::HomeVisit,
        scheduled_date: NaiveDate::from_ymd_opt(2025, 5, 3).unwrap(),
        time_slot: "09:00-10:00".to_string(),
        address: ServiceAddress {
            line1: "12 Elm St".to_string(),
            line2: None,
            city: "Springfield".to_string(),
            region: "IL".to_string(),
            postal_code: "62701".to_string(),
        },
        notes: None,
    }
}

pub fn draft_for(
    state: &AppState,
    patient_id: &str,
    service_ids: &[&str],
    now: NaiveDateTime,
) -> DraftReceipt {
    let mut db = state.db().unwrap();
    create_draft(&mut db, patient_id, &draft_request(service_ids), "usd", now).unwrap()
}
