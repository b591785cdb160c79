use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::attendance::AttendanceLedger;
use crate::gateway::CourseDirectory;
use crate::grades::GradeLedger;
use crate::memory::MemoryStore;
use crate::models::{AssessmentType, Course, GradeRecord, NewAttendance, NewGrade};

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub course_id: Uuid,
    pub second_course_id: Uuid,
    pub inactive_course_id: Uuid,
    pub students: Vec<Uuid>,
    pub outsider: Uuid,
    pub instructor: Uuid,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let students: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let course_id = Uuid::new_v4();
        let second_course_id = Uuid::new_v4();
        let inactive_course_id = Uuid::new_v4();

        store.upsert_course(Course {
            id: course_id,
            name: "Algebra II".to_string(),
            is_active: true,
            enrolled_students: students.clone(),
        });
        store.upsert_course(Course {
            id: second_course_id,
            name: "World History".to_string(),
            is_active: true,
            enrolled_students: students[..2].to_vec(),
        });
        store.upsert_course(Course {
            id: inactive_course_id,
            name: "Latin".to_string(),
            is_active: false,
            enrolled_students: students.clone(),
        });

        Self {
            store,
            course_id,
            second_course_id,
            inactive_course_id,
            students,
            outsider: Uuid::new_v4(),
            instructor: Uuid::new_v4(),
        }
    }

    pub fn grades(&self) -> GradeLedger {
        GradeLedger::new(self.store.clone(), self.store.clone())
    }

    pub fn attendance(&self) -> AttendanceLedger {
        AttendanceLedger::new(self.store.clone(), self.store.clone())
    }

    pub fn student(&self, index: usize) -> Uuid {
        self.students[index]
    }
}

/// Course directory over the fixture store that counts lookups.
pub(crate) struct CountingDirectory {
    inner: Arc<MemoryStore>,
    lookups: AtomicUsize,
}

impl CountingDirectory {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CourseDirectory for CountingDirectory {
    async fn get_course(&self, id: Uuid) -> anyhow::Result<Option<Course>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_course(id).await
    }
}

pub(crate) fn new_grade(student_id: Uuid, course_id: Uuid, kind: &str, score: f64) -> NewGrade {
    NewGrade {
        student_id,
        course_id,
        assessment_type: kind.to_string(),
        score,
        max_score: 100.0,
        feedback: None,
    }
}

pub(crate) fn new_attendance(
    student_id: Uuid,
    course_id: Uuid,
    date: NaiveDate,
    status: &str,
) -> NewAttendance {
    NewAttendance {
        student_id,
        course_id,
        date,
        status: status.to_string(),
        notes: None,
    }
}

pub(crate) fn day(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

/// Stored grade with a fixed timestamp, `minute` minutes into 2024-01-01.
pub(crate) fn graded(
    student_id: Uuid,
    course_id: Uuid,
    assessment_type: AssessmentType,
    percent: f64,
    minute: i64,
) -> GradeRecord {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
    GradeRecord {
        id: Uuid::new_v4(),
        student_id,
        course_id,
        assessment_type,
        score: percent,
        max_score: 100.0,
        letter_grade: crate::classification::letter_grade(percent),
        feedback: None,
        recorded_by: Uuid::nil(),
        recorded_at: base + chrono::Duration::minutes(minute),
    }
}
