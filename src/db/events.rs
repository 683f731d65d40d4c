use sqlx::{Executor, Postgres, Row};

use crate::billing::SchoolId;
use crate::telemetry::{BillingEvent, BillingEventType};

/// Returns `false` when the same event was already flagged for the order.
pub async fn insert<'c, E>(executor: E, event: &BillingEvent) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO billing_events (id, school_id, order_id, event_type, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (school_id, order_id, event_type) DO NOTHING
        "#,
    )
    .bind(event.id)
    .bind(event.school_id)
    .bind(event.order_id)
    .bind(event.event_type.as_str())
    .bind(&event.details)
    .bind(event.created_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_open<'c, E>(executor: E, school_id: SchoolId) -> Result<Vec<BillingEvent>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, school_id, order_id, event_type, details, created_at
        FROM billing_events
        WHERE school_id = $1 AND resolved_at IS NULL
        ORDER BY created_at DESC
        "#,
    )
    .bind(school_id)
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| {
            let event_type: String = row.try_get("event_type")?;
            Ok(BillingEvent {
                id: row.try_get("id")?,
                school_id: row.try_get("school_id")?,
                order_id: row.try_get("order_id")?,
                event_type: BillingEventType::parse(&event_type).ok_or_else(|| {
                    sqlx::Error::Decode(format!("unknown billing event `{event_type}`").into())
                })?,
                details: row.try_get("details")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
