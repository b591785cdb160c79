//! Collaborator interfaces consumed by the ledgers and analytics.
//!
//! Implementations are not expected to be atomic across `bulk_create_*`
//! calls; the ledgers validate whole batches before issuing any write.
//! Attendance stores must refuse a second record for the same student,
//! course and day, reporting it as [`AttendanceConflict`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{AssessmentType, AttendanceRecord, AttendanceStatus, Course, GradeRecord};

#[async_trait]
pub trait CourseDirectory: Send + Sync {
    async fn get_course(&self, id: Uuid) -> anyhow::Result<Option<Course>>;
}

/// Looks up each distinct course once. Missing courses map to `None`.
pub(crate) async fn fetch_courses<I>(
    directory: &dyn CourseDirectory,
    ids: I,
) -> anyhow::Result<HashMap<Uuid, Option<Course>>>
where
    I: IntoIterator<Item = Uuid>,
{
    let mut courses = HashMap::new();
    for id in ids {
        if courses.contains_key(&id) {
            continue;
        }
        let course = directory.get_course(id).await?;
        courses.insert(id, course);
    }
    Ok(courses)
}

/// Course must exist, be active, and list the student.
pub(crate) fn ensure_enrolled(
    course: Option<&Course>,
    course_id: Uuid,
    student_id: Uuid,
) -> LedgerResult<()> {
    let course = course.ok_or(LedgerError::course_not_found(course_id))?;
    if !course.is_active {
        return Err(LedgerError::InactiveResource { course_id });
    }
    if !course.is_enrolled(student_id) {
        return Err(LedgerError::NotEnrolled {
            student_id,
            course_id,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradeFilter {
    pub student_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub assessment_type: Option<AssessmentType>,
}

impl GradeFilter {
    pub fn student(student_id: Uuid) -> Self {
        Self {
            student_id: Some(student_id),
            ..Self::default()
        }
    }

    pub fn course(course_id: Uuid) -> Self {
        Self {
            course_id: Some(course_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &GradeRecord) -> bool {
        self.student_id.map_or(true, |id| record.student_id == id)
            && self.course_id.map_or(true, |id| record.course_id == id)
            && self
                .assessment_type
                .map_or(true, |kind| record.assessment_type == kind)
    }
}

/// Carried inside the `anyhow::Error` of an attendance write that collided
/// with an existing (student, course, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("attendance already recorded for student {student_id} in course {course_id} on {date}")]
pub struct AttendanceConflict {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub date: NaiveDate,
}

impl AttendanceConflict {
    pub fn of(record: &AttendanceRecord) -> Self {
        Self {
            student_id: record.student_id,
            course_id: record.course_id,
            date: record.date,
        }
    }
}

/// Date bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceFilter {
    pub student_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<AttendanceStatus>,
}

impl AttendanceFilter {
    pub fn course_on(course_id: Uuid, date: NaiveDate) -> Self {
        Self {
            course_id: Some(course_id),
            from: Some(date),
            to: Some(date),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.student_id.map_or(true, |id| record.student_id == id)
            && self.course_id.map_or(true, |id| record.course_id == id)
            && self.from.map_or(true, |from| record.date >= from)
            && self.to.map_or(true, |to| record.date <= to)
            && self.status.map_or(true, |status| record.status == status)
    }
}

#[async_trait]
pub trait GradeStore: Send + Sync {
    async fn create_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord>;
    async fn bulk_create_grades(&self, records: Vec<GradeRecord>)
        -> anyhow::Result<Vec<GradeRecord>>;
    async fn get_grade(&self, id: Uuid) -> anyhow::Result<Option<GradeRecord>>;
    async fn update_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord>;
    async fn delete_grade(&self, id: Uuid) -> anyhow::Result<bool>;
    /// Newest first.
    async fn query_grades(&self, filter: GradeFilter) -> anyhow::Result<Vec<GradeRecord>>;
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn create_attendance(&self, record: AttendanceRecord)
        -> anyhow::Result<AttendanceRecord>;
    async fn bulk_create_attendance(
        &self,
        records: Vec<AttendanceRecord>,
    ) -> anyhow::Result<Vec<AttendanceRecord>>;
    async fn get_attendance(&self, id: Uuid) -> anyhow::Result<Option<AttendanceRecord>>;
    async fn update_attendance(&self, record: AttendanceRecord)
        -> anyhow::Result<AttendanceRecord>;
    async fn delete_attendance(&self, id: Uuid) -> anyhow::Result<bool>;
    /// Newest first.
    async fn query_attendance(
        &self,
        filter: AttendanceFilter,
    ) -> anyhow::Result<Vec<AttendanceRecord>>;
}
