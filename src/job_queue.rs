use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::notify::notify_detached;
use crate::billing::{BillingContext, BillingPeriod, SchoolId};
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    GenerateInvoices {
        school_id: SchoolId,
        period: BillingPeriod,
    },
    SweepOverdue {
        school_id: SchoolId,
    },
    ReconcileOrder {
        school_id: SchoolId,
        order_id: Uuid,
    },
}

#[derive(Debug)]
pub struct QueuedJob {
    /// Row in `billing_jobs` when the queue is persistent.
    pub id: Option<i64>,
    pub job: Job,
}

/// key: billing-job-queue -> submit side of the worker pool
#[derive(Clone)]
pub struct JobQueue {
    sender: Sender<QueuedJob>,
    pool: Option<PgPool>,
    /// Stamped on every persisted row so a restart can tell its own rows from stale ones.
    boot: Uuid,
}

impl JobQueue {
    pub fn new(sender: Sender<QueuedJob>, pool: Option<PgPool>) -> Self {
        Self {
            sender,
            pool,
            boot: Uuid::new_v4(),
        }
    }

    pub async fn submit(&self, job: Job) -> bool {
        let id = match &self.pool {
            Some(pool) => persist_job(pool, self.boot, &job).await,
            None => None,
        };
        self.sender.send(QueuedJob { id, job }).await.is_ok()
    }
}

async fn persist_job(pool: &PgPool, boot: Uuid, job: &Job) -> Option<i64> {
    let payload = serde_json::to_value(job).ok()?;
    match sqlx::query_scalar(
        "INSERT INTO billing_jobs (payload, worker_boot) VALUES ($1, $2) RETURNING id",
    )
    .bind(payload)
    .bind(boot)
    .fetch_one(pool)
        .await
    {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(?err, "failed to persist billing job; running it unpersisted");
            None
        }
    }
}

/// Claims every row written by an earlier worker run, whether it was still queued or was
/// interrupted mid-job, and feeds it back to the workers. Rows submitted by this run are left
/// alone; they are already in the channel.
async fn replay_persisted(pool: &PgPool, boot: Uuid, sender: &Sender<QueuedJob>) {
    let rows = match sqlx::query(
        "UPDATE billing_jobs SET worker_boot = $1 WHERE worker_boot <> $1 RETURNING id, payload",
    )
    .bind(boot)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, "failed to load queued billing jobs");
            return;
        }
    };

    if !rows.is_empty() {
        info!(count = rows.len(), "replaying billing jobs left by an earlier run");
    }
    for row in rows {
        let id: i64 = row.get("id");
        let payload: Value = row.get("payload");
        match serde_json::from_value::<Job>(payload) {
            Ok(job) => {
                if sender.send(QueuedJob { id: Some(id), job }).await.is_err() {
                    warn!(job_id = id, "worker stopped during replay; remaining jobs wait for the next start");
                    return;
                }
            }
            Err(err) => {
                warn!(?err, job_id = id, "dropping unreadable billing job");
                complete_job(pool, id).await;
            }
        }
    }
}

async fn complete_job(pool: &PgPool, id: i64) {
    if let Err(err) = sqlx::query("DELETE FROM billing_jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
    {
        warn!(?err, job_id = id, "failed to clear completed billing job");
    }
}

/// Runs one job to completion.
pub async fn run_job(context: &BillingContext, job: Job) -> AppResult<()> {
    let now = Utc::now();
    match job {
        Job::GenerateInvoices { school_id, period } => {
            let summary = context
                .invoices
                .generate_invoices(school_id, period, now)
                .await?;
            if summary.created_count > 0 {
                notify_detached(
                    context.notifier.clone(),
                    "invoices.generated",
                    json!({
                        "school_id": school_id,
                        "period": period.to_string(),
                        "created_count": summary.created_count,
                    }),
                );
            }
        }
        Job::SweepOverdue { school_id } => {
            context.invoices.sweep_overdue(school_id, now).await?;
        }
        Job::ReconcileOrder {
            school_id,
            order_id,
        } => {
            let outcome = context.reconciler.sweep_order(school_id, order_id, now).await?;
            info!(
                %school_id,
                %order_id,
                status = outcome.order().status.as_str(),
                "order reconciled by job"
            );
        }
    }
    Ok(())
}

/// Starts the worker pool; each job runs on its own task, at most `worker_concurrency` at once.
pub fn start_worker(context: BillingContext, pool: Option<PgPool>) -> JobQueue {
    let (tx, mut rx): (Sender<QueuedJob>, Receiver<QueuedJob>) = channel(256);
    let permits = Arc::new(Semaphore::new(context.config.worker_concurrency.max(1)));

    let queue = JobQueue::new(tx.clone(), pool.clone());
    if let Some(db_pool) = pool.clone() {
        let boot = queue.boot;
        tokio::spawn(async move {
            replay_persisted(&db_pool, boot, &tx).await;
        });
    }

    let worker_pool = pool.clone();
    tokio::spawn(async move {
        while let Some(queued) = rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let context = context.clone();
            let db_pool = worker_pool.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let label = format!("{:?}", queued.job);
                match run_job(&context, queued.job).await {
                    Ok(()) => info!(job = %label, "billing job completed"),
                    Err(err) => error!(job = %label, error = %err, "billing job failed"),
                }
                if let (Some(db_pool), Some(id)) = (db_pool, queued.id) {
                    complete_job(&db_pool, id).await;
                }
            });
        }
    });

    queue
}
