use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BatchRejection, BatchViolation, ErrorKind, LedgerError, LedgerResult};
use crate::gateway::{ensure_enrolled, fetch_courses, AttendanceFilter, AttendanceStore, CourseDirectory};
use crate::models::{
    AttendancePatch, AttendanceRecord, AttendanceStatus, AttendanceValidation, NewAttendance,
    StatusCounts,
};

type DayKey = (Uuid, Uuid, NaiveDate);

/// Sole writer of attendance records. At most one record exists per
/// student, course and calendar day.
#[derive(Clone)]
pub struct AttendanceLedger {
    directory: Arc<dyn CourseDirectory>,
    store: Arc<dyn AttendanceStore>,
}

impl AttendanceLedger {
    pub fn new(directory: Arc<dyn CourseDirectory>, store: Arc<dyn AttendanceStore>) -> Self {
        Self { directory, store }
    }

    #[tracing::instrument(skip(self, input), fields(student_id = %input.student_id, course_id = %input.course_id, date = %input.date))]
    pub async fn record_attendance(
        &self,
        input: NewAttendance,
        recorded_by: Uuid,
    ) -> LedgerResult<AttendanceRecord> {
        let course = self.directory.get_course(input.course_id).await?;
        let record = ensure_enrolled(course.as_ref(), input.course_id, input.student_id)
            .and_then(|()| build_record(input, recorded_by, Utc::now()))
            .inspect_err(|err| warn!(error = %err, "attendance rejected"))?;

        if self.find_existing(record.student_id, record.course_id, record.date).await?.is_some() {
            warn!("duplicate attendance rejected");
            return Err(LedgerError::DuplicateRecord {
                student_id: record.student_id,
                course_id: record.course_id,
                date: record.date,
            });
        }

        let saved = self
            .store
            .create_attendance(record)
            .await
            .map_err(LedgerError::from_store)
            .inspect_err(|err| warn!(error = %err, "attendance rejected by store"))?;
        info!(attendance_id = %saved.id, status = %saved.status, "attendance recorded");
        Ok(saved)
    }

    /// All-or-nothing. Rejects duplicates against storage and within the
    /// batch itself, listing every one of them.
    #[tracing::instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn bulk_record_attendance(
        &self,
        inputs: Vec<NewAttendance>,
        recorded_by: Uuid,
    ) -> LedgerResult<Vec<AttendanceRecord>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let courses = fetch_courses(self.directory.as_ref(), inputs.iter().map(|a| a.course_id)).await?;
        let stored = self.stored_days(&inputs).await?;
        let recorded_at = Utc::now();
        let mut seen: HashMap<DayKey, usize> = HashMap::new();
        let mut records = Vec::with_capacity(inputs.len());
        let mut violations = Vec::new();

        for (index, input) in inputs.into_iter().enumerate() {
            let key = (input.student_id, input.course_id, input.date);
            let (student_id, course_id, date) = key;

            let course = courses.get(&course_id).and_then(Option::as_ref);
            if let Err(err) = ensure_enrolled(course, course_id, student_id) {
                violations.push(err.into_violation(index, student_id, course_id, Some(date)));
            }
            if stored.contains(&key) {
                let err = LedgerError::DuplicateRecord {
                    student_id,
                    course_id,
                    date,
                };
                violations.push(err.into_violation(index, student_id, course_id, Some(date)));
            }
            match seen.get(&key) {
                Some(first) => violations.push(BatchViolation {
                    index,
                    student_id,
                    course_id,
                    date: Some(date),
                    kind: ErrorKind::DuplicateRecord,
                    message: format!(
                        "duplicates entry {first} for student {student_id} in course {course_id} on {date}"
                    ),
                }),
                None => {
                    seen.insert(key, index);
                }
            }
            match build_record(input, recorded_by, recorded_at) {
                Ok(record) => records.push(record),
                Err(err) => {
                    violations.push(err.into_violation(index, student_id, course_id, Some(date)));
                }
            }
        }

        if !violations.is_empty() {
            let rejection = BatchRejection { violations };
            warn!(offending = ?rejection.indices(), "attendance batch rejected");
            return Err(LedgerError::Batch(rejection));
        }

        let saved = self
            .store
            .bulk_create_attendance(records)
            .await
            .map_err(LedgerError::from_store)?;
        info!(count = saved.len(), "attendance batch recorded");
        Ok(saved)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_attendance(
        &self,
        id: Uuid,
        patch: AttendancePatch,
        updated_by: Uuid,
    ) -> LedgerResult<AttendanceRecord> {
        let mut record = self
            .store
            .get_attendance(id)
            .await?
            .ok_or(LedgerError::NotFound {
                entity: "attendance",
                id,
            })?;

        if let Some(status) = patch.status.as_deref() {
            record.status = parse_status(status)?;
        }
        if patch.notes.is_some() {
            record.notes = patch.notes;
        }
        record.recorded_by = updated_by;
        record.recorded_at = Utc::now();

        let saved = self.store.update_attendance(record).await?;
        info!(attendance_id = %saved.id, status = %saved.status, "attendance updated");
        Ok(saved)
    }

    pub async fn validate_attendance(&self, input: &NewAttendance) -> LedgerResult<AttendanceValidation> {
        let mut errors = Vec::new();

        let course = self.directory.get_course(input.course_id).await?;
        if let Err(err) = ensure_enrolled(course.as_ref(), input.course_id, input.student_id) {
            errors.push(err.to_string());
        }
        if let Err(err) = input.status.parse::<AttendanceStatus>() {
            errors.push(err);
        }
        if self
            .find_existing(input.student_id, input.course_id, input.date)
            .await?
            .is_some()
        {
            errors.push("attendance already recorded for this student on this date".to_string());
        }
        if input.date > today() {
            errors.push("attendance date cannot be in the future".to_string());
        }

        Ok(AttendanceValidation {
            is_valid: errors.is_empty(),
            errors,
        })
    }

    /// Present or late over all records, in percent. 0.0 without records.
    pub async fn calculate_attendance_rate(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
    ) -> LedgerResult<f64> {
        let filter = AttendanceFilter {
            student_id: Some(student_id),
            course_id,
            ..AttendanceFilter::default()
        };
        let records = self.store.query_attendance(filter).await?;
        Ok(records.iter().collect::<StatusCounts>().rate())
    }

    pub async fn get_absent_students(&self, course_id: Uuid, date: NaiveDate) -> LedgerResult<Vec<Uuid>> {
        let filter = AttendanceFilter {
            status: Some(AttendanceStatus::Absent),
            ..AttendanceFilter::course_on(course_id, date)
        };
        let records = self.store.query_attendance(filter).await?;
        Ok(records.into_iter().map(|r| r.student_id).collect())
    }

    pub async fn get_student_attendance(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> LedgerResult<Vec<AttendanceRecord>> {
        let filter = AttendanceFilter {
            student_id: Some(student_id),
            course_id,
            from,
            to,
            status: None,
        };
        Ok(self.store.query_attendance(filter).await?)
    }

    pub async fn get_course_attendance(
        &self,
        course_id: Uuid,
        date: Option<NaiveDate>,
    ) -> LedgerResult<Vec<AttendanceRecord>> {
        let filter = AttendanceFilter {
            course_id: Some(course_id),
            from: date,
            to: date,
            ..AttendanceFilter::default()
        };
        Ok(self.store.query_attendance(filter).await?)
    }

    pub async fn delete_attendance(&self, id: Uuid) -> LedgerResult<bool> {
        let deleted = self.store.delete_attendance(id).await?;
        if deleted {
            info!(attendance_id = %id, "attendance deleted");
        }
        Ok(deleted)
    }

    async fn find_existing(
        &self,
        student_id: Uuid,
        course_id: Uuid,
        date: NaiveDate,
    ) -> anyhow::Result<Option<AttendanceRecord>> {
        let filter = AttendanceFilter {
            student_id: Some(student_id),
            ..AttendanceFilter::course_on(course_id, date)
        };
        Ok(self.store.query_attendance(filter).await?.into_iter().next())
    }

    // One query per distinct course, spanning the batch's dates for it.
    async fn stored_days(&self, inputs: &[NewAttendance]) -> anyhow::Result<HashSet<DayKey>> {
        let mut spans: HashMap<Uuid, (NaiveDate, NaiveDate)> = HashMap::new();
        for input in inputs {
            spans
                .entry(input.course_id)
                .and_modify(|(from, to)| {
                    *from = (*from).min(input.date);
                    *to = (*to).max(input.date);
                })
                .or_insert((input.date, input.date));
        }

        let mut stored = HashSet::new();
        for (course_id, (from, to)) in spans {
            let filter = AttendanceFilter {
                course_id: Some(course_id),
                from: Some(from),
                to: Some(to),
                ..AttendanceFilter::default()
            };
            for record in self.store.query_attendance(filter).await? {
                stored.insert((record.student_id, record.course_id, record.date));
            }
        }
        Ok(stored)
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn build_record(
    input: NewAttendance,
    recorded_by: Uuid,
    recorded_at: DateTime<Utc>,
) -> LedgerResult<AttendanceRecord> {
    let status = parse_status(&input.status)?;
    if input.date > recorded_at.date_naive() {
        return Err(LedgerError::InvalidInput(format!(
            "attendance date {} is in the future",
            input.date
        )));
    }

    Ok(AttendanceRecord {
        id: Uuid::new_v4(),
        student_id: input.student_id,
        course_id: input.course_id,
        date: input.date,
        status,
        notes: input.notes,
        recorded_by,
        recorded_at,
    })
}

fn parse_status(value: &str) -> LedgerResult<AttendanceStatus> {
    value.parse().map_err(LedgerError::InvalidInput)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::{day, new_attendance, CountingDirectory, Fixture};
    use async_trait::async_trait;

    /// Yields after every lookup so concurrent writers interleave between
    /// the duplicate check and the insert.
    struct YieldingStore(Arc<MemoryStore>);

    #[async_trait]
    impl AttendanceStore for YieldingStore {
        async fn create_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
            self.0.create_attendance(record).await
        }

        async fn bulk_create_attendance(
            &self,
            records: Vec<AttendanceRecord>,
        ) -> anyhow::Result<Vec<AttendanceRecord>> {
            self.0.bulk_create_attendance(records).await
        }

        async fn get_attendance(&self, id: Uuid) -> anyhow::Result<Option<AttendanceRecord>> {
            self.0.get_attendance(id).await
        }

        async fn update_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
            self.0.update_attendance(record).await
        }

        async fn delete_attendance(&self, id: Uuid) -> anyhow::Result<bool> {
            self.0.delete_attendance(id).await
        }

        async fn query_attendance(
            &self,
            filter: AttendanceFilter,
        ) -> anyhow::Result<Vec<AttendanceRecord>> {
            let found = self.0.query_attendance(filter).await;
            tokio::task::yield_now().await;
            found
        }
    }

    #[tokio::test]
    async fn second_record_for_same_day_is_duplicate() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let input = new_attendance(fx.student(0), fx.course_id, day(2024, 3, 4), "present");

        ledger.record_attendance(input.clone(), fx.instructor).await.unwrap();
        let err = ledger.record_attendance(input, fx.instructor).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
        assert_eq!(fx.store.attendance_count(), 1);
    }

    #[tokio::test]
    async fn same_student_other_day_or_course_is_fine() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let student = fx.student(1);

        ledger
            .record_attendance(new_attendance(student, fx.course_id, day(2024, 3, 4), "present"), fx.instructor)
            .await
            .unwrap();
        ledger
            .record_attendance(new_attendance(student, fx.course_id, day(2024, 3, 5), "Late"), fx.instructor)
            .await
            .unwrap();
        ledger
            .record_attendance(
                new_attendance(student, fx.second_course_id, day(2024, 3, 4), "absent"),
                fx.instructor,
            )
            .await
            .unwrap();

        assert_eq!(fx.store.attendance_count(), 3);
    }

    #[tokio::test]
    async fn rejects_bad_status_future_date_and_outsiders() {
        let fx = Fixture::new();
        let ledger = fx.attendance();

        let bad_status = ledger
            .record_attendance(new_attendance(fx.student(0), fx.course_id, day(2024, 3, 4), "asleep"), fx.instructor)
            .await
            .unwrap_err();
        assert_eq!(bad_status.kind(), ErrorKind::InvalidInput);

        let tomorrow = today().succ_opt().unwrap();
        let future = ledger
            .record_attendance(new_attendance(fx.student(0), fx.course_id, tomorrow, "present"), fx.instructor)
            .await
            .unwrap_err();
        assert_eq!(future.kind(), ErrorKind::InvalidInput);

        let outsider = ledger
            .record_attendance(new_attendance(fx.outsider, fx.course_id, day(2024, 3, 4), "present"), fx.instructor)
            .await
            .unwrap_err();
        assert_eq!(outsider.kind(), ErrorKind::NotEnrolled);

        let inactive = ledger
            .record_attendance(
                new_attendance(fx.student(0), fx.inactive_course_id, day(2024, 3, 4), "present"),
                fx.instructor,
            )
            .await
            .unwrap_err();
        assert_eq!(inactive.kind(), ErrorKind::InactiveResource);
        assert_eq!(fx.store.attendance_count(), 0);
    }

    #[tokio::test]
    async fn bulk_rejects_every_stored_duplicate() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let date = day(2024, 4, 1);
        for i in 0..2 {
            ledger
                .record_attendance(new_attendance(fx.student(i), fx.course_id, date, "present"), fx.instructor)
                .await
                .unwrap();
        }

        let batch: Vec<NewAttendance> = (0..4)
            .map(|i| new_attendance(fx.student(i), fx.course_id, date, "absent"))
            .collect();
        let err = ledger.bulk_record_attendance(batch, fx.instructor).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
        let LedgerError::Batch(rejection) = err else {
            panic!("expected batch rejection");
        };
        assert_eq!(rejection.indices(), vec![0, 1]);
        assert!(rejection.violations.iter().all(|v| v.date == Some(date)));
        assert_eq!(fx.store.attendance_count(), 2);
    }

    #[tokio::test]
    async fn bulk_rejects_duplicates_within_the_batch() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let date = day(2024, 4, 2);
        let batch = vec![
            new_attendance(fx.student(0), fx.course_id, date, "present"),
            new_attendance(fx.student(1), fx.course_id, date, "present"),
            new_attendance(fx.student(0), fx.course_id, date, "late"),
        ];

        let err = ledger.bulk_record_attendance(batch, fx.instructor).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
        let LedgerError::Batch(rejection) = err else {
            panic!("expected batch rejection");
        };
        assert_eq!(rejection.indices(), vec![2]);
        assert!(rejection.violations[0].message.contains("duplicates entry 0"));
        assert_eq!(fx.store.attendance_count(), 0);
    }

    #[tokio::test]
    async fn bulk_success_writes_all() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let batch = vec![
            new_attendance(fx.student(0), fx.course_id, day(2024, 4, 3), "present"),
            new_attendance(fx.student(0), fx.course_id, day(2024, 4, 4), "excused"),
            new_attendance(fx.student(1), fx.second_course_id, day(2024, 4, 3), "absent"),
        ];

        let saved = ledger.bulk_record_attendance(batch, fx.instructor).await.unwrap();

        assert_eq!(saved.len(), 3);
        assert_eq!(saved[1].status, AttendanceStatus::Excused);
        assert_eq!(fx.store.attendance_count(), 3);
    }

    #[tokio::test]
    async fn rate_is_zero_without_records() {
        let fx = Fixture::new();
        let ledger = fx.attendance();

        let rate = ledger.calculate_attendance_rate(fx.student(3), None).await.unwrap();
        assert_eq!(rate, 0.0);
    }

    #[tokio::test]
    async fn rate_counts_late_as_attended() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let student = fx.student(0);
        let statuses = ["present", "late", "absent", "excused"];
        for (offset, status) in statuses.iter().enumerate() {
            ledger
                .record_attendance(
                    new_attendance(student, fx.course_id, day(2024, 5, 1 + offset as u32), status),
                    fx.instructor,
                )
                .await
                .unwrap();
        }
        ledger
            .record_attendance(new_attendance(student, fx.second_course_id, day(2024, 5, 1), "absent"), fx.instructor)
            .await
            .unwrap();

        let course_rate = ledger
            .calculate_attendance_rate(student, Some(fx.course_id))
            .await
            .unwrap();
        assert_eq!(course_rate, 50.0);
        let overall = ledger.calculate_attendance_rate(student, None).await.unwrap();
        assert_eq!(overall, 40.0);
    }

    #[tokio::test]
    async fn absent_students_match_exact_date() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let monday = day(2024, 5, 6);
        let batch = vec![
            new_attendance(fx.student(0), fx.course_id, monday, "absent"),
            new_attendance(fx.student(1), fx.course_id, monday, "present"),
            new_attendance(fx.student(2), fx.course_id, monday.succ_opt().unwrap(), "absent"),
            new_attendance(fx.student(3), fx.course_id, monday, "absent"),
        ];
        ledger.bulk_record_attendance(batch, fx.instructor).await.unwrap();

        let mut absent = ledger.get_absent_students(fx.course_id, monday).await.unwrap();
        absent.sort();
        let mut expected = vec![fx.student(0), fx.student(3)];
        expected.sort();
        assert_eq!(absent, expected);
    }

    #[tokio::test]
    async fn update_changes_status_in_place() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let record = ledger
            .record_attendance(new_attendance(fx.student(0), fx.course_id, day(2024, 3, 4), "absent"), fx.instructor)
            .await
            .unwrap();

        let patch = AttendancePatch {
            status: Some("excused".to_string()),
            notes: Some("doctor's note".to_string()),
        };
        let updated = ledger.update_attendance(record.id, patch, fx.instructor).await.unwrap();

        assert_eq!(updated.id, record.id);
        assert_eq!(updated.status, AttendanceStatus::Excused);
        assert_eq!(fx.store.attendance_count(), 1);

        let bad = AttendancePatch {
            status: Some("gone".to_string()),
            notes: None,
        };
        let err = ledger.update_attendance(record.id, bad, fx.instructor).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let missing = ledger
            .update_attendance(Uuid::new_v4(), AttendancePatch::default(), fx.instructor)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn validation_flags_duplicates_and_future_dates() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let input = new_attendance(fx.student(0), fx.course_id, day(2024, 3, 4), "present");
        assert!(ledger.validate_attendance(&input).await.unwrap().is_valid);

        ledger.record_attendance(input.clone(), fx.instructor).await.unwrap();
        let report = ledger.validate_attendance(&input).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);

        let future = new_attendance(fx.outsider, fx.course_id, today().succ_opt().unwrap(), "nope");
        let report = ledger.validate_attendance(&future).await.unwrap();
        assert_eq!(report.errors.len(), 3);
    }

    #[tokio::test]
    async fn listing_filters_by_course_and_range() {
        let fx = Fixture::new();
        let ledger = fx.attendance();
        let student = fx.student(0);
        for d in 1..=5 {
            ledger
                .record_attendance(new_attendance(student, fx.course_id, day(2024, 6, d), "present"), fx.instructor)
                .await
                .unwrap();
        }

        let ranged = ledger
            .get_student_attendance(student, Some(fx.course_id), Some(day(2024, 6, 2)), Some(day(2024, 6, 4)))
            .await
            .unwrap();
        assert_eq!(ranged.len(), 3);
        assert_eq!(ranged[0].date, day(2024, 6, 4));

        let on_day = ledger
            .get_course_attendance(fx.course_id, Some(day(2024, 6, 5)))
            .await
            .unwrap();
        assert_eq!(on_day.len(), 1);

        assert!(ledger.delete_attendance(on_day[0].id).await.unwrap());
        assert_eq!(ledger.get_course_attendance(fx.course_id, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn concurrent_records_for_same_day_keep_one() {
        let fx = Fixture::new();
        let ledger = AttendanceLedger::new(fx.store.clone(), Arc::new(YieldingStore(fx.store.clone())));
        let input = new_attendance(fx.student(0), fx.course_id, day(2024, 6, 3), "present");

        let (first, second) = tokio::join!(
            ledger.record_attendance(input.clone(), fx.instructor),
            ledger.record_attendance(input, fx.instructor),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let err = outcomes.into_iter().find_map(Result::err).unwrap();
        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
        assert_eq!(fx.store.attendance_count(), 1);
    }

    #[tokio::test]
    async fn bulk_looks_up_each_course_once() {
        let fx = Fixture::new();
        let directory = CountingDirectory::new(fx.store.clone());
        let ledger = AttendanceLedger::new(directory.clone(), fx.store.clone());
        let batch: Vec<NewAttendance> = (0..10u32)
            .map(|i| {
                let course = if i % 2 == 0 { fx.course_id } else { fx.second_course_id };
                new_attendance(fx.student((i % 2) as usize), course, day(2024, 4, 1 + i), "present")
            })
            .collect();

        let saved = ledger.bulk_record_attendance(batch, fx.instructor).await.unwrap();

        assert_eq!(saved.len(), 10);
        assert_eq!(directory.lookups(), 2);
    }
}
