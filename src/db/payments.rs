use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::{Money, Payment, PaymentMethod, SchoolId};

const PAYMENT_COLUMNS: &str = "id, school_id, invoice_id, order_id, amount_cents, method, paid_at, \
     recorded_by, reverses_payment_id, created_at";

pub async fn insert<'c, E>(executor: E, payment: &Payment) -> Result<Payment, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO payments (
            id, school_id, invoice_id, order_id, amount_cents, method,
            paid_at, recorded_by, reverses_payment_id, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {PAYMENT_COLUMNS}
        "#
    ))
    .bind(payment.id)
    .bind(payment.school_id)
    .bind(payment.invoice_id)
    .bind(payment.order_id)
    .bind(payment.amount)
    .bind(payment.method.as_str())
    .bind(payment.paid_at)
    .bind(&payment.recorded_by)
    .bind(payment.reverses_payment_id)
    .bind(payment.created_at)
    .fetch_one(executor)
    .await?;

    map_row(&row)
}

pub async fn get<'c, E>(
    executor: E,
    school_id: SchoolId,
    payment_id: Uuid,
) -> Result<Option<Payment>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE school_id = $1 AND id = $2"
    ))
    .bind(school_id)
    .bind(payment_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(map_row).transpose()
}

pub async fn list_for_invoice<'c, E>(
    executor: E,
    school_id: SchoolId,
    invoice_id: Uuid,
) -> Result<Vec<Payment>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(&format!(
        r#"
        SELECT {PAYMENT_COLUMNS} FROM payments
        WHERE school_id = $1 AND invoice_id = $2
        ORDER BY paid_at, created_at
        "#
    ))
    .bind(school_id)
    .bind(invoice_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(map_row).collect()
}

/// Net sum including reversals.
pub async fn sum_for_invoice<'c, E>(executor: E, invoice_id: Uuid) -> Result<Money, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(executor)
    .await
}

pub async fn is_reversed<'c, E>(executor: E, payment_id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM payments WHERE reverses_payment_id = $1)")
        .bind(payment_id)
        .fetch_one(executor)
        .await
}

fn map_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    let method: String = row.try_get("method")?;
    Ok(Payment {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        invoice_id: row.try_get("invoice_id")?,
        order_id: row.try_get("order_id")?,
        amount: row.try_get("amount_cents")?,
        method: PaymentMethod::parse(&method)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown payment method `{method}`").into()))?,
        paid_at: row.try_get("paid_at")?,
        recorded_by: row.try_get("recorded_by")?,
        reverses_payment_id: row.try_get("reverses_payment_id")?,
        created_at: row.try_get("created_at")?,
    })
}
