#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use tuition_ledger::billing::{
    BillingContext, BillingPeriod, Buyer, CreateOrderRequest, EnrollmentStatus, GatewayError,
    GuardianNotifier, IntentRequest, IntentStatus, ListedAsset, Money, MemoryLedgerStore,
    PaymentGateway, PaymentIntent, SchoolId, StaticEnrollmentDirectory, StudentRef,
};
use tuition_ledger::config::BillingConfig;

pub const TUITION: Money = Money::from_minor(45_000);

/// Gateway double: intents succeed unless told otherwise, status answers are scripted per intent.
#[derive(Default)]
pub struct ScriptedGateway {
    refuse_intents: AtomicBool,
    unreachable: AtomicBool,
    statuses: Mutex<HashMap<String, IntentStatus>>,
    requested: Mutex<Vec<IntentRequest>>,
}

impl ScriptedGateway {
    pub fn refuse_intents(&self, refuse: bool) {
        self.refuse_intents.store(refuse, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn report(&self, intent_ref: &str, status: IntentStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(intent_ref.to_string(), status);
    }

    pub fn requested(&self) -> Vec<IntentRequest> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn request_payment_intent(
        &self,
        request: &IntentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        if self.refuse_intents.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                body: "maintenance".into(),
            });
        }
        self.requested.lock().unwrap().push(request.clone());
        Ok(PaymentIntent {
            intent_ref: format!("pi_{}", request.reference.simple()),
            qr_payload: format!("qr:{}", request.amount_cents),
            copy_paste_code: format!("copy:{}", request.reference.simple()),
        })
    }

    async fn intent_status(&self, intent_ref: &str) -> Result<IntentStatus, GatewayError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 502,
                body: "upstream down".into(),
            });
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(intent_ref)
            .copied()
            .unwrap_or(IntentStatus::Pending))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(&'static str, Value)>>,
}

impl RecordingNotifier {
    pub fn sent(&self, event: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| *name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Notifications are fire-and-forget, so give the spawned task a chance to run.
    pub async fn wait_for(&self, event: &str) -> Vec<Value> {
        for _ in 0..100 {
            let sent = self.sent(event);
            if !sent.is_empty() {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }
}

#[async_trait]
impl GuardianNotifier for RecordingNotifier {
    async fn notify_guardian(&self, event: &'static str, payload: Value) {
        self.sent.lock().unwrap().push((event, payload));
    }
}

pub struct Harness {
    pub school: SchoolId,
    pub students: Vec<Uuid>,
    pub store: Arc<MemoryLedgerStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub context: BillingContext,
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        store_retry_attempts: 2,
        poll_interval: Duration::from_millis(10),
        backoff_base: Duration::from_millis(1),
        gateway_timeout: Duration::from_secs(2),
        ..BillingConfig::default()
    }
}

/// A school with `students` active students on the standard tuition plan.
pub fn harness(students: usize) -> Harness {
    harness_with(students, test_config())
}

pub fn harness_with(students: usize, config: BillingConfig) -> Harness {
    let school = SchoolId(Uuid::new_v4());
    let mut enrollment = StaticEnrollmentDirectory::new();
    let mut ids = Vec::with_capacity(students);
    for index in 0..students {
        let id = Uuid::new_v4();
        enrollment = enrollment.with_student(school, student(id, index, EnrollmentStatus::Active), Some(TUITION));
        ids.push(id);
    }
    build(school, ids, enrollment, config)
}

pub fn build(
    school: SchoolId,
    students: Vec<Uuid>,
    enrollment: StaticEnrollmentDirectory,
    config: BillingConfig,
) -> Harness {
    let store = Arc::new(MemoryLedgerStore::new());
    let gateway = Arc::new(ScriptedGateway::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let context = BillingContext::new(
        store.clone(),
        Arc::new(enrollment),
        gateway.clone(),
        notifier.clone(),
        config,
    );
    Harness {
        school,
        students,
        store,
        gateway,
        notifier,
        context,
    }
}

pub fn student(id: Uuid, index: usize, status: EnrollmentStatus) -> StudentRef {
    StudentRef {
        id,
        guardian_name: format!("Guardian {index}"),
        enrollment_status: status,
    }
}

pub fn march_2025() -> BillingPeriod {
    BillingPeriod::new(3, 2025).unwrap()
}

pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
}

pub fn buyer() -> Buyer {
    Buyer {
        name: "Marta Souza".into(),
        email: "marta@example.com".into(),
        phone: "+55 11 98765-4321".into(),
    }
}

pub fn order_for(asset_ids: &[Uuid]) -> CreateOrderRequest {
    CreateOrderRequest {
        buyer: buyer(),
        asset_ids: asset_ids.to_vec(),
    }
}

impl Harness {
    /// Lists a fresh photo at `price` cents in an active sale album.
    pub async fn list_photo(&self, price: i64) -> Uuid {
        self.list_photo_in(Uuid::new_v4(), price).await
    }

    pub async fn list_photo_in(&self, album_id: Uuid, price: i64) -> Uuid {
        let asset_id = Uuid::new_v4();
        self.store
            .list_asset(
                self.school,
                ListedAsset {
                    asset_id,
                    album_id,
                    price: Money::from_minor(price),
                    sale_active: true,
                },
            )
            .await;
        asset_id
    }
}
