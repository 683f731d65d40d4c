use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{BillingPeriod, EnrollmentStatus, Money, SchoolId, StudentRef};
use crate::db;
use crate::error::AppResult;

/// key: enrollment-directory -> roster and tuition pricing owned by the enrollment system
#[async_trait]
pub trait EnrollmentDirectory: Send + Sync {
    async fn list_actively_enrolled_students(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<StudentRef>>;

    /// Current plan amount; `None` when the student has no plan.
    async fn tuition_plan(&self, school_id: SchoolId, student_id: Uuid) -> AppResult<Option<Money>>;
}

/// Reads the `students` mirror table kept in sync by the enrollment system.
#[derive(Clone)]
pub struct PgEnrollmentDirectory {
    pool: PgPool,
}

impl PgEnrollmentDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EnrollmentDirectory for PgEnrollmentDirectory {
    async fn list_actively_enrolled_students(
        &self,
        school_id: SchoolId,
        period: BillingPeriod,
    ) -> AppResult<Vec<StudentRef>> {
        Ok(db::students::actively_enrolled(&self.pool, school_id, period).await?)
    }

    async fn tuition_plan(&self, school_id: SchoolId, student_id: Uuid) -> AppResult<Option<Money>> {
        Ok(db::students::tuition_amount(&self.pool, school_id, student_id).await?)
    }
}

/// Fixed roster, for tests and `LEDGER_BACKEND=memory`.
#[derive(Debug, Clone, Default)]
pub struct StaticEnrollmentDirectory {
    rosters: HashMap<SchoolId, Vec<(StudentRef, Option<Money>)>>,
}

impl StaticEnrollmentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_student(mut self, school_id: SchoolId, student: StudentRef, plan: Option<Money>) -> Self {
        self.rosters
            .entry(school_id)
            .or_default()
            .push((student, plan));
        self
    }
}

#[async_trait]
impl EnrollmentDirectory for StaticEnrollmentDirectory {
    async fn list_actively_enrolled_students(
        &self,
        school_id: SchoolId,
        _period: BillingPeriod,
    ) -> AppResult<Vec<StudentRef>> {
        Ok(self
            .rosters
            .get(&school_id)
            .map(|roster| {
                roster
                    .iter()
                    .filter(|(student, _)| student.enrollment_status == EnrollmentStatus::Active)
                    .map(|(student, _)| student.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tuition_plan(&self, school_id: SchoolId, student_id: Uuid) -> AppResult<Option<Money>> {
        Ok(self.rosters.get(&school_id).and_then(|roster| {
            roster
                .iter()
                .find(|(student, _)| student.id == student_id)
                .and_then(|(_, plan)| *plan)
        }))
    }
}
