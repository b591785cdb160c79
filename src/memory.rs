//! In-process implementation of every gateway trait.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::gateway::{
    AttendanceConflict, AttendanceFilter, AttendanceStore, CourseDirectory, GradeFilter, GradeStore,
};
use crate::models::{AttendanceRecord, Course, GradeRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    courses: RwLock<HashMap<Uuid, Course>>,
    grades: RwLock<Vec<GradeRecord>>,
    attendance: RwLock<Vec<AttendanceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_course(&self, course: Course) {
        self.courses.write().insert(course.id, course);
    }

    pub fn grade_count(&self) -> usize {
        self.grades.read().len()
    }

    pub fn attendance_count(&self) -> usize {
        self.attendance.read().len()
    }
}

#[async_trait]
impl CourseDirectory for MemoryStore {
    async fn get_course(&self, id: Uuid) -> anyhow::Result<Option<Course>> {
        Ok(self.courses.read().get(&id).cloned())
    }
}

#[async_trait]
impl GradeStore for MemoryStore {
    async fn create_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord> {
        self.grades.write().push(record.clone());
        Ok(record)
    }

    async fn bulk_create_grades(
        &self,
        records: Vec<GradeRecord>,
    ) -> anyhow::Result<Vec<GradeRecord>> {
        self.grades.write().extend(records.iter().cloned());
        Ok(records)
    }

    async fn get_grade(&self, id: Uuid) -> anyhow::Result<Option<GradeRecord>> {
        Ok(self.grades.read().iter().find(|g| g.id == id).cloned())
    }

    async fn update_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord> {
        let mut grades = self.grades.write();
        let slot = grades
            .iter_mut()
            .find(|g| g.id == record.id)
            .ok_or_else(|| anyhow!("grade {} not found", record.id))?;
        *slot = record.clone();
        Ok(record)
    }

    async fn delete_grade(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut grades = self.grades.write();
        let before = grades.len();
        grades.retain(|g| g.id != id);
        Ok(grades.len() != before)
    }

    async fn query_grades(&self, filter: GradeFilter) -> anyhow::Result<Vec<GradeRecord>> {
        let mut matched: Vec<GradeRecord> = self
            .grades
            .read()
            .iter()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(matched)
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn create_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
        let mut attendance = self.attendance.write();
        if attendance.iter().any(|a| same_day(a, &record)) {
            return Err(AttendanceConflict::of(&record).into());
        }
        attendance.push(record.clone());
        Ok(record)
    }

    async fn bulk_create_attendance(
        &self,
        records: Vec<AttendanceRecord>,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut attendance = self.attendance.write();
        for (index, record) in records.iter().enumerate() {
            let clash = attendance.iter().any(|a| same_day(a, record))
                || records[..index].iter().any(|a| same_day(a, record));
            if clash {
                return Err(AttendanceConflict::of(record).into());
            }
        }
        attendance.extend(records.iter().cloned());
        Ok(records)
    }

    async fn get_attendance(&self, id: Uuid) -> anyhow::Result<Option<AttendanceRecord>> {
        Ok(self.attendance.read().iter().find(|a| a.id == id).cloned())
    }

    async fn update_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
        let mut attendance = self.attendance.write();
        let slot = attendance
            .iter_mut()
            .find(|a| a.id == record.id)
            .ok_or_else(|| anyhow!("attendance {} not found", record.id))?;
        *slot = record.clone();
        Ok(record)
    }

    async fn delete_attendance(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut attendance = self.attendance.write();
        let before = attendance.len();
        attendance.retain(|a| a.id != id);
        Ok(attendance.len() != before)
    }

    async fn query_attendance(
        &self,
        filter: AttendanceFilter,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut matched: Vec<AttendanceRecord> = self
            .attendance
            .read()
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(matched)
    }
}

fn same_day(a: &AttendanceRecord, b: &AttendanceRecord) -> bool {
    a.student_id == b.student_id && a.course_id == b.course_id && a.date == b.date
}
