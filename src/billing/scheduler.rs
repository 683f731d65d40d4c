use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time;
use tracing::{debug, warn};

use super::reconciliation::ReconciliationJob;
use super::BillingContext;
use crate::job_queue::{Job, JobQueue};

/// Awaiting orders examined per school and tick.
const AWAITING_BATCH: i64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub schools: usize,
    pub sweeps_queued: usize,
    pub expiries_queued: usize,
    pub watches_resumed: usize,
}

/// key: billing-overdue-scheduler -> periodic sweeps and poller recovery
pub fn spawn(context: BillingContext, jobs: JobQueue) {
    let interval = context.config.sweep_interval;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match process_tick(&context, &jobs, Utc::now()).await {
                Ok(report) => debug!(?report, "billing automation tick finished"),
                Err(err) => warn!(?err, "billing automation tick failed"),
            }
        }
    });
}

/// key: billing-overdue-scheduler -> tick handler
///
/// Queues an overdue sweep per school with open work, queues a final reconciliation for every
/// order past its expiry, and re-attaches pollers to live orders nobody is watching (after a
/// restart, for instance).
pub async fn process_tick(
    context: &BillingContext,
    jobs: &JobQueue,
    now: DateTime<Utc>,
) -> Result<TickReport> {
    let mut report = TickReport::default();
    let schools = context.store.schools_with_open_work().await?;
    report.schools = schools.len();

    for school_id in schools {
        if jobs.submit(Job::SweepOverdue { school_id }).await {
            report.sweeps_queued += 1;
        }

        for order in context.store.awaiting_orders(school_id, AWAITING_BATCH).await? {
            if order.is_past_expiry(now) {
                if jobs
                    .submit(Job::ReconcileOrder {
                        school_id,
                        order_id: order.id,
                    })
                    .await
                {
                    report.expiries_queued += 1;
                }
                continue;
            }

            let Some(handle) = &context.reconciliation else {
                continue;
            };
            if handle.is_watching(order.id) {
                continue;
            }
            match handle
                .dispatch(ReconciliationJob::Watch {
                    school_id,
                    order_id: order.id,
                })
                .await
            {
                Ok(()) => report.watches_resumed += 1,
                Err(err) => warn!(%school_id, order_id = %order.id, %err, "failed to resume order watch"),
            }
        }
    }

    Ok(report)
}
