use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::{BillingPeriod, Invoice, InvoiceStatus, LedgerSnapshot, SchoolId};

const INVOICE_COLUMNS: &str = "id, school_id, student_id, amount_cents, due_date, billing_month, \
     billing_year, status, created_at, updated_at";

/// Plain insert; the `invoices_one_per_student_period` constraint rejects duplicates.
pub async fn insert<'c, E>(executor: E, invoice: &Invoice) -> Result<Invoice, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO invoices (
            id, school_id, student_id, amount_cents, due_date,
            billing_month, billing_year, status, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(invoice.id)
    .bind(invoice.school_id)
    .bind(invoice.student_id)
    .bind(invoice.amount)
    .bind(invoice.due_date)
    .bind(invoice.billing_month)
    .bind(invoice.billing_year)
    .bind(invoice.status.as_str())
    .bind(invoice.created_at)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn get<'c, E>(
    executor: E,
    school_id: SchoolId,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE school_id = $1 AND id = $2"
    ))
    .bind(school_id)
    .bind(invoice_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(map_row).transpose()
}

/// Row-locks the invoice for the rest of the surrounding transaction.
pub async fn get_for_update<'c, E>(
    executor: E,
    school_id: SchoolId,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE school_id = $1 AND id = $2 FOR UPDATE"
    ))
    .bind(school_id)
    .bind(invoice_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(map_row).transpose()
}

pub async fn list_for_period<'c, E>(
    executor: E,
    school_id: SchoolId,
    period: BillingPeriod,
) -> Result<Vec<Invoice>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        r#"
        SELECT {INVOICE_COLUMNS} FROM invoices
        WHERE school_id = $1 AND billing_month = $2 AND billing_year = $3
        ORDER BY created_at, id
        "#
    ))
    .bind(school_id)
    .bind(period.month as i32)
    .bind(period.year)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

pub async fn set_status<'c, E>(
    executor: E,
    school_id: SchoolId,
    invoice_id: Uuid,
    status: InvoiceStatus,
    now: DateTime<Utc>,
) -> Result<Invoice, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        UPDATE invoices SET status = $3, updated_at = $4
        WHERE school_id = $1 AND id = $2
        RETURNING {INVOICE_COLUMNS}
        "#
    ))
    .bind(school_id)
    .bind(invoice_id)
    .bind(status.as_str())
    .bind(now)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

/// key: billing-overdue-sweep -> single statement, safe under concurrent payments
pub async fn mark_overdue<'c, E>(
    executor: E,
    school_id: SchoolId,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE invoices SET status = 'overdue', updated_at = $3
        WHERE school_id = $1 AND status = 'pending' AND due_date < $2
        "#,
    )
    .bind(school_id)
    .bind(today)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// All period figures in one statement so the rollup never mixes two ledger states.
pub async fn period_snapshot<'c, E>(
    executor: E,
    school_id: SchoolId,
    period: BillingPeriod,
) -> Result<LedgerSnapshot, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        WITH period_invoices AS (
            SELECT
                i.id,
                i.student_id,
                i.status,
                i.amount_cents,
                i.amount_cents - COALESCE(
                    (SELECT SUM(p.amount_cents) FROM payments p WHERE p.invoice_id = i.id),
                    0
                ) AS outstanding_cents
            FROM invoices i
            WHERE i.school_id = $1 AND i.billing_month = $2 AND i.billing_year = $3
        )
        SELECT
            (SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments
                WHERE school_id = $1 AND paid_at >= $4 AND paid_at < $5) AS revenue,
            COUNT(*) FILTER (WHERE status = 'pending') AS pending_count,
            COUNT(*) FILTER (WHERE status = 'overdue') AS overdue_count,
            COALESCE(SUM(outstanding_cents) FILTER (WHERE status IN ('pending', 'overdue')), 0)::BIGINT
                AS outstanding_amount,
            COALESCE(SUM(outstanding_cents) FILTER (WHERE status = 'overdue'), 0)::BIGINT
                AS overdue_amount,
            COALESCE(SUM(amount_cents) FILTER (WHERE status = 'paid'), 0)::BIGINT AS paid_amount,
            COUNT(DISTINCT student_id) FILTER (WHERE status = 'overdue') AS delinquent_students
        FROM period_invoices
        "#,
    )
    .bind(school_id)
    .bind(period.month as i32)
    .bind(period.year)
    .bind(period.start_utc())
    .bind(period.end_utc())
    .fetch_one(executor)
    .await?;

    Ok(LedgerSnapshot {
        revenue: row.try_get("revenue")?,
        pending_count: row.try_get("pending_count")?,
        overdue_count: row.try_get("overdue_count")?,
        outstanding_amount: row.try_get("outstanding_amount")?,
        overdue_amount: row.try_get("overdue_amount")?,
        paid_amount: row.try_get("paid_amount")?,
        delinquent_students: row.try_get("delinquent_students")?,
    })
}

pub async fn schools<'c, E>(executor: E) -> Result<Vec<SchoolId>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        SELECT school_id FROM invoices WHERE status = 'pending'
        UNION
        SELECT school_id FROM retail_orders WHERE status = 'awaiting_payment'
        "#,
    )
    .fetch_all(executor)
    .await
}

pub(crate) fn map_row(row: &PgRow) -> Result<Invoice, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Invoice {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        student_id: row.try_get("student_id")?,
        amount: row.try_get("amount_cents")?,
        due_date: row.try_get("due_date")?,
        billing_month: row.try_get("billing_month")?,
        billing_year: row.try_get("billing_year")?,
        status: InvoiceStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown invoice status `{status}`").into()))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
