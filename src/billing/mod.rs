pub mod api;
pub mod enrollment;
pub mod gateway;
pub mod invoices;
pub mod models;
pub mod notify;
pub mod orders;
pub mod payments;
pub mod reconciliation;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod tokens;

use std::sync::Arc;

pub use enrollment::{EnrollmentDirectory, PgEnrollmentDirectory, StaticEnrollmentDirectory};
pub use gateway::{GatewayError, HttpPaymentGateway, IntentRequest, PaymentGateway};
pub use invoices::{nth_business_day, GenerationSummary, InvoiceDetail, InvoiceGenerator};
pub use models::{
    BillingPeriod, Buyer, DownloadToken, EnrollmentStatus, FinancialStats, IntentStatus, Invoice,
    InvoiceStatus, IssuedToken, LedgerSnapshot, LineItem, ListedAsset, Money, OrderStatus, Payment,
    PaymentIntent, PaymentMethod, RetailOrder, SchoolId, StudentRef,
};
pub use notify::{GuardianNotifier, LoggingNotifier};
pub use orders::{CreateOrderRequest, CreatedOrder, RetailOrderService};
pub use payments::{PaymentRecorder, PaymentRequest, PaymentTarget, RecordedPayment};
pub use reconciliation::{
    start_reconciliation_worker, ReconciliationHandle, ReconciliationJob, Reconciler,
    SettlementOutcome,
};
pub use scheduler::{process_tick as run_billing_automation_tick, spawn as spawn_billing_scheduler};
pub use stats::DelinquencyAggregator;
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use tokens::DownloadTokenIssuer;

use crate::config::BillingConfig;

/// key: billing-context -> every billing component wired over one store
#[derive(Clone)]
pub struct BillingContext {
    pub config: BillingConfig,
    pub store: Arc<dyn LedgerStore>,
    pub invoices: InvoiceGenerator,
    pub payments: PaymentRecorder,
    pub stats: DelinquencyAggregator,
    pub orders: RetailOrderService,
    pub tokens: DownloadTokenIssuer,
    pub reconciler: Arc<Reconciler>,
    pub notifier: Arc<dyn GuardianNotifier>,
    pub reconciliation: Option<ReconciliationHandle>,
}

impl BillingContext {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        enrollment: Arc<dyn EnrollmentDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn GuardianNotifier>,
        config: BillingConfig,
    ) -> Self {
        let payments = PaymentRecorder::new(store.clone(), config.clone());
        let tokens = DownloadTokenIssuer::new(store.clone(), config.clone());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            gateway.clone(),
            payments.clone(),
            tokens.clone(),
            notifier.clone(),
            config.clone(),
        ));

        Self {
            invoices: InvoiceGenerator::new(store.clone(), enrollment.clone(), config.clone()),
            stats: DelinquencyAggregator::new(store.clone(), enrollment),
            orders: RetailOrderService::new(store.clone(), gateway, config.clone()),
            payments,
            tokens,
            reconciler,
            notifier,
            store,
            config,
            reconciliation: None,
        }
    }

    /// Starts the reconciliation worker and routes new orders and callbacks through it.
    pub fn with_reconciliation_worker(mut self) -> Self {
        let handle = start_reconciliation_worker(self.reconciler.clone());
        self.orders = self.orders.with_watcher(handle.clone());
        self.reconciliation = Some(handle);
        self
    }
}
