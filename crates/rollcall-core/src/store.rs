//! Collaborator interfaces for the remote document store.
//!
//! The core only reads scoped rosters and writes merge-upserts; how the
//! store persists them is up to the implementation.

use crate::types::{AttendanceRecord, EnrolledStudent, EnrollmentPayload, Scope};
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// Read side: the students enrolled in a scope.
#[async_trait]
pub trait StudentDirectory: Send + Sync {
    /// Every enrolled student in `scope`, in store-defined order.
    async fn list_students(&self, scope: &Scope) -> Result<Vec<EnrolledStudent>, StoreError>;
}

/// Write side for enrollment.
#[async_trait]
pub trait EnrollmentWriter: Send + Sync {
    /// Merge `payload` into the student's record. Fields absent from the
    /// payload are preserved; embeddings and sample images are appended.
    async fn upsert_student(
        &self,
        scope: &Scope,
        student_id: &str,
        payload: &EnrollmentPayload,
    ) -> Result<(), StoreError>;
}

/// Write/read side for attendance.
#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    /// Merge a record into the (scope, date, student) key.
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    async fn list_attendance(
        &self,
        scope: &Scope,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// Everything the attendance service needs from a store.
pub trait RosterStore: StudentDirectory + EnrollmentWriter + AttendanceLedger {}

impl<T: StudentDirectory + EnrollmentWriter + AttendanceLedger> RosterStore for T {}
