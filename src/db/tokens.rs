use chrono::{DateTime, Utc};
use sqlx::{Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::{DownloadToken, SchoolId};

pub async fn revoke_live<'c, E>(
    executor: E,
    school_id: SchoolId,
    order_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE download_tokens SET revoked_at = $3
        WHERE school_id = $1 AND order_id = $2 AND consumed_at IS NULL AND revoked_at IS NULL
        "#,
    )
    .bind(school_id)
    .bind(order_id)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn insert<'c, E>(executor: E, token: &DownloadToken) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO download_tokens (id, school_id, order_id, secret_hash, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(token.id)
    .bind(token.school_id)
    .bind(token.order_id)
    .bind(&token.secret_hash)
    .bind(token.expires_at)
    .bind(token.created_at)
    .execute(executor)
    .await?;

    Ok(())
}

/// One conditional update; returns the order id only when this call performed the redemption.
pub async fn consume<'c, E>(
    executor: E,
    school_id: SchoolId,
    secret_hash: &str,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        UPDATE download_tokens SET consumed_at = $3
        WHERE school_id = $1
          AND secret_hash = $2
          AND consumed_at IS NULL
          AND revoked_at IS NULL
          AND expires_at > $3
        RETURNING order_id
        "#,
    )
    .bind(school_id)
    .bind(secret_hash)
    .bind(now)
    .fetch_optional(executor)
    .await
}

pub async fn exists<'c, E>(
    executor: E,
    school_id: SchoolId,
    secret_hash: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM download_tokens WHERE school_id = $1 AND secret_hash = $2) AS present",
    )
    .bind(school_id)
    .bind(secret_hash)
    .fetch_one(executor)
    .await?;

    row.try_get("present")
}
