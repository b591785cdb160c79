use std::fmt;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::gateway::AttendanceConflict;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InactiveResource,
    NotEnrolled,
    InvalidInput,
    DuplicateRecord,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("course {course_id} is inactive")]
    InactiveResource { course_id: Uuid },

    #[error("student {student_id} is not enrolled in course {course_id}")]
    NotEnrolled { student_id: Uuid, course_id: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("attendance already recorded for student {student_id} in course {course_id} on {date}")]
    DuplicateRecord {
        student_id: Uuid,
        course_id: Uuid,
        date: NaiveDate,
    },

    #[error("batch rejected: {0}")]
    Batch(BatchRejection),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("metric computation failed: {0}")]
    Aggregation(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InactiveResource { .. } => ErrorKind::InactiveResource,
            Self::NotEnrolled { .. } => ErrorKind::NotEnrolled,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::DuplicateRecord { .. } => ErrorKind::DuplicateRecord,
            Self::Batch(rejection) => rejection.kind(),
            Self::Storage(_) | Self::Aggregation(_) => ErrorKind::Internal,
        }
    }

    pub fn course_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "course",
            id,
        }
    }

    /// Store failure, keeping an attendance collision as `DuplicateRecord`.
    pub(crate) fn from_store(err: anyhow::Error) -> Self {
        match err.downcast_ref::<AttendanceConflict>() {
            Some(conflict) => Self::DuplicateRecord {
                student_id: conflict.student_id,
                course_id: conflict.course_id,
                date: conflict.date,
            },
            None => Self::Storage(err),
        }
    }

    /// Builds the batch violation describing this error for entry `index`.
    pub(crate) fn into_violation(
        self,
        index: usize,
        student_id: Uuid,
        course_id: Uuid,
        date: Option<NaiveDate>,
    ) -> BatchViolation {
        BatchViolation {
            index,
            student_id,
            course_id,
            date,
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// One offending entry of a rejected batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchViolation {
    pub index: usize,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub date: Option<NaiveDate>,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for BatchViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry {}: {}", self.index, self.message)
    }
}

/// Every violation found while validating a batch. Nothing is written when
/// a batch is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRejection {
    pub violations: Vec<BatchViolation>,
}

impl BatchRejection {
    pub fn kind(&self) -> ErrorKind {
        let all_duplicates = !self.violations.is_empty()
            && self
                .violations
                .iter()
                .all(|v| v.kind == ErrorKind::DuplicateRecord);
        if all_duplicates {
            return ErrorKind::DuplicateRecord;
        }
        self.violations
            .first()
            .map_or(ErrorKind::InvalidInput, |v| v.kind)
    }

    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.violations.iter().map(|v| v.index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl fmt::Display for BatchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.violations.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}
