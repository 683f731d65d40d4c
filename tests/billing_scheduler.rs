mod common;

use std::time::Duration;

use chrono::{Datelike, Utc};
use tokio::sync::mpsc::channel;

use common::{at, harness, march_2025, order_for};
use tuition_ledger::billing::{
    run_billing_automation_tick, BillingPeriod, InvoiceStatus, OrderStatus,
};
use tuition_ledger::job_queue::{run_job, start_worker, Job, JobQueue};

// key: billing-scheduler-tests -> sweeps and expiries queued per school
#[tokio::test]
async fn tick_queues_sweeps_and_expiries_for_schools_with_open_work() {
    let h = harness(2);
    h.context
        .invoices
        .generate_invoices(h.school, march_2025(), at(3, 9, 0))
        .await
        .unwrap();
    let photo = h.list_photo(1_000).await;
    let stale = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), at(3, 9, 0))
        .await
        .unwrap()
        .order;

    let (tx, mut rx) = channel(16);
    let jobs = JobQueue::new(tx, None);
    let report = run_billing_automation_tick(&h.context, &jobs, at(10, 0, 0))
        .await
        .unwrap();

    assert_eq!(report.schools, 1);
    assert_eq!(report.sweeps_queued, 1);
    assert_eq!(report.expiries_queued, 1);
    assert_eq!(report.watches_resumed, 0);

    let mut queued = Vec::new();
    while let Ok(item) = rx.try_recv() {
        assert!(item.id.is_none());
        queued.push(item.job);
    }
    assert_eq!(
        queued,
        vec![
            Job::SweepOverdue { school_id: h.school },
            Job::ReconcileOrder {
                school_id: h.school,
                order_id: stale.id,
            },
        ]
    );

    for job in queued {
        run_job(&h.context, job).await.unwrap();
    }
    let order = h.context.orders.order_status(h.school, stale.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Expired);
    let invoices = h.context.invoices.list_invoices(h.school, march_2025()).await.unwrap();
    assert!(invoices
        .iter()
        .all(|invoice| invoice.status == InvoiceStatus::Overdue));
}

#[tokio::test]
async fn tick_resumes_watching_live_orders() {
    let h = harness(0);
    let context = h.context.clone().with_reconciliation_worker();
    let handle = context.reconciliation.clone().expect("worker handle");
    let photo = h.list_photo(1_000).await;

    // created through the bare service, so nothing is watching it yet
    let order = h
        .context
        .orders
        .create_order(h.school, order_for(&[photo]), Utc::now())
        .await
        .unwrap()
        .order;
    assert!(!handle.is_watching(order.id));

    let (tx, _rx) = channel(16);
    let jobs = JobQueue::new(tx, None);
    let report = run_billing_automation_tick(&context, &jobs, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.watches_resumed, 1);
    assert_eq!(report.expiries_queued, 0);

    let mut watched = false;
    for _ in 0..100 {
        if handle.is_watching(order.id) {
            watched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(watched);
}

#[tokio::test]
async fn idle_ledger_produces_an_empty_tick() {
    let h = harness(3);
    let (tx, mut rx) = channel(4);
    let jobs = JobQueue::new(tx, None);

    let report = run_billing_automation_tick(&h.context, &jobs, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.schools, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn worker_pool_runs_submitted_generation_jobs() {
    let h = harness(3);
    let today = Utc::now().date_naive();
    let period = BillingPeriod::new(today.month(), today.year()).unwrap();
    let jobs = start_worker(h.context.clone(), None);

    assert!(
        jobs.submit(Job::GenerateInvoices {
            school_id: h.school,
            period,
        })
        .await
    );

    let mut invoices = Vec::new();
    for _ in 0..200 {
        invoices = h.context.invoices.list_invoices(h.school, period).await.unwrap();
        if invoices.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(invoices.len(), 3);
    assert_eq!(h.notifier.wait_for("invoices.generated").await.len(), 1);
}
