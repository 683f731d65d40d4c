use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, Row};
use uuid::Uuid;

use crate::billing::{Buyer, LineItem, ListedAsset, OrderStatus, RetailOrder, SchoolId};

const ORDER_COLUMNS: &str = "id, school_id, buyer_name, buyer_email, buyer_phone, total_amount_cents, \
     status, payment_intent_ref, failure_reason, created_at, expires_at, updated_at";

pub async fn insert(conn: &mut PgConnection, order: &RetailOrder) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO retail_orders (
            id, school_id, buyer_name, buyer_email, buyer_phone, total_amount_cents,
            status, payment_intent_ref, failure_reason, created_at, expires_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(order.id)
    .bind(order.school_id)
    .bind(&order.buyer.name)
    .bind(&order.buyer.email)
    .bind(&order.buyer.phone)
    .bind(order.total_amount)
    .bind(order.status.as_str())
    .bind(&order.payment_intent_ref)
    .bind(&order.failure_reason)
    .bind(order.created_at)
    .bind(order.expires_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await?;

    for item in &order.line_items {
        sqlx::query(
            "INSERT INTO retail_order_items (order_id, asset_id, album_id, unit_price_cents) VALUES ($1, $2, $3, $4)",
        )
        .bind(order.id)
        .bind(item.asset_id)
        .bind(item.album_id)
        .bind(item.unit_price)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub async fn get(
    conn: &mut PgConnection,
    school_id: SchoolId,
    order_id: Uuid,
    lock: bool,
) -> Result<Option<RetailOrder>, sqlx::Error> {
    let suffix = if lock { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {ORDER_COLUMNS} FROM retail_orders WHERE school_id = $1 AND id = $2{suffix}"
    ))
    .bind(school_id)
    .bind(order_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let items = line_items(conn, order_id).await?;
            Ok(Some(map_row(&row, items)?))
        }
        None => Ok(None),
    }
}

pub async fn get_by_intent(
    conn: &mut PgConnection,
    school_id: SchoolId,
    intent_ref: &str,
) -> Result<Option<RetailOrder>, sqlx::Error> {
    let order_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM retail_orders WHERE school_id = $1 AND payment_intent_ref = $2",
    )
    .bind(school_id)
    .bind(intent_ref)
    .fetch_optional(&mut *conn)
    .await?;

    match order_id {
        Some(order_id) => get(conn, school_id, order_id, false).await,
        None => Ok(None),
    }
}

/// Compare-and-set on status; returns `None` when the order was no longer in `from`.
#[allow(clippy::too_many_arguments)]
pub async fn transition(
    conn: &mut PgConnection,
    school_id: SchoolId,
    order_id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    payment_intent_ref: Option<&str>,
    failure_reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<RetailOrder>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE retail_orders SET
            status = $4,
            payment_intent_ref = COALESCE($5, payment_intent_ref),
            failure_reason = COALESCE($6, failure_reason),
            updated_at = $7
        WHERE school_id = $1 AND id = $2 AND status = $3
        RETURNING {ORDER_COLUMNS}
        "#
    ))
    .bind(school_id)
    .bind(order_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(payment_intent_ref)
    .bind(failure_reason)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => {
            let items = line_items(conn, order_id).await?;
            Ok(Some(map_row(&row, items)?))
        }
        None => Ok(None),
    }
}

pub async fn awaiting_payment(
    conn: &mut PgConnection,
    school_id: SchoolId,
    limit: i64,
) -> Result<Vec<RetailOrder>, sqlx::Error> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM retail_orders
        WHERE school_id = $1 AND status = 'awaiting_payment'
        ORDER BY expires_at
        LIMIT $2
        "#,
    )
    .bind(school_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut orders = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(order) = get(conn, school_id, id, false).await? {
            orders.push(order);
        }
    }
    Ok(orders)
}

pub async fn listed_assets(
    conn: &mut PgConnection,
    school_id: SchoolId,
    asset_ids: &[Uuid],
) -> Result<Vec<ListedAsset>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT a.id AS asset_id, a.album_id, a.price_cents, al.sale_active
        FROM sale_assets a
        JOIN sale_albums al ON al.id = a.album_id AND al.school_id = a.school_id
        WHERE a.school_id = $1 AND a.id = ANY($2)
        "#,
    )
    .bind(school_id)
    .bind(asset_ids)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ListedAsset {
                asset_id: row.try_get("asset_id")?,
                album_id: row.try_get("album_id")?,
                price: row.try_get("price_cents")?,
                sale_active: row.try_get("sale_active")?,
            })
        })
        .collect()
}

/// Assets among `asset_ids` already claimed by another paid order, with that order's id.
pub async fn sold_elsewhere(
    conn: &mut PgConnection,
    school_id: SchoolId,
    order_id: Uuid,
    asset_ids: &[Uuid],
) -> Result<Vec<(Uuid, Uuid)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT asset_id, order_id FROM sold_assets
        WHERE school_id = $1 AND asset_id = ANY($2) AND order_id <> $3
        "#,
    )
    .bind(school_id)
    .bind(asset_ids)
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await
}

/// Claims every asset for the order. Returns the ids actually claimed; a shorter list means a
/// concurrent settlement won one of them.
pub async fn claim_assets(
    conn: &mut PgConnection,
    school_id: SchoolId,
    order_id: Uuid,
    asset_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO sold_assets (school_id, asset_id, order_id, sold_at)
        SELECT $1, asset_id, $2, $4 FROM UNNEST($3::UUID[]) AS claimed(asset_id)
        ON CONFLICT (school_id, asset_id) DO NOTHING
        RETURNING asset_id
        "#,
    )
    .bind(school_id)
    .bind(order_id)
    .bind(asset_ids)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
}

async fn line_items(conn: &mut PgConnection, order_id: Uuid) -> Result<Vec<LineItem>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT asset_id, album_id, unit_price_cents FROM retail_order_items WHERE order_id = $1 ORDER BY asset_id",
    )
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(LineItem {
                asset_id: row.try_get("asset_id")?,
                album_id: row.try_get("album_id")?,
                unit_price: row.try_get("unit_price_cents")?,
            })
        })
        .collect()
}

fn map_row(row: &PgRow, line_items: Vec<LineItem>) -> Result<RetailOrder, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(RetailOrder {
        id: row.try_get("id")?,
        school_id: row.try_get("school_id")?,
        buyer: Buyer {
            name: row.try_get("buyer_name")?,
            email: row.try_get("buyer_email")?,
            phone: row.try_get("buyer_phone")?,
        },
        line_items,
        total_amount: row.try_get("total_amount_cents")?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown order status `{status}`").into()))?,
        payment_intent_ref: row.try_get("payment_intent_ref")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
