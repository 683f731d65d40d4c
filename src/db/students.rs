use sqlx::{Executor, Postgres, Row};
use uuid::Uuid;

use crate::billing::{BillingPeriod, EnrollmentStatus, Money, SchoolId, StudentRef};

/// Students active at any point of the period: enrolled before it ends and not withdrawn before
/// it starts.
pub async fn actively_enrolled<'c, E>(
    executor: E,
    school_id: SchoolId,
    period: BillingPeriod,
) -> Result<Vec<StudentRef>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, guardian_name
        FROM students
        WHERE school_id = $1
          AND enrollment_status = 'active'
          AND enrolled_on < $3
          AND (withdrawn_on IS NULL OR withdrawn_on >= $2)
        ORDER BY id
        "#,
    )
    .bind(school_id)
    .bind(period.start())
    .bind(period.end())
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(StudentRef {
                id: row.try_get("id")?,
                guardian_name: row.try_get("guardian_name")?,
                enrollment_status: EnrollmentStatus::Active,
            })
        })
        .collect()
}

pub async fn tuition_amount<'c, E>(
    executor: E,
    school_id: SchoolId,
    student_id: Uuid,
) -> Result<Option<Money>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let amount: Option<Option<Money>> = sqlx::query_scalar(
        "SELECT tuition_amount_cents FROM students WHERE school_id = $1 AND id = $2",
    )
    .bind(school_id)
    .bind(student_id)
    .fetch_optional(executor)
    .await?;

    Ok(amount.flatten())
}
