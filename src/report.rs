use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::{AttendanceFilter, AttendanceStore, CourseDirectory};
use crate::models::{
    round2, AbsenceNotice, AbsenceNotification, AttendanceAnalytics, AttendanceRecord,
    AttendanceReport, AttendanceStatus, DailyAttendance, NoticePriority, PerformanceSummary,
    StatusCounts,
};

#[derive(Clone)]
pub struct AttendanceReporter {
    directory: Arc<dyn CourseDirectory>,
    store: Arc<dyn AttendanceStore>,
    config: EngineConfig,
}

impl AttendanceReporter {
    pub fn new(directory: Arc<dyn CourseDirectory>, store: Arc<dyn AttendanceStore>) -> Self {
        Self::with_config(directory, store, EngineConfig::default())
    }

    pub fn with_config(
        directory: Arc<dyn CourseDirectory>,
        store: Arc<dyn AttendanceStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            directory,
            store,
            config,
        }
    }

    /// Every day of the inclusive range appears in `daily_attendance`, with
    /// zero counts when nothing was recorded. Every enrolled student gets a
    /// rate, 0.0 when they have no records in range.
    #[tracing::instrument(skip(self))]
    pub async fn generate_attendance_report(
        &self,
        course_id: Uuid,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> LedgerResult<AttendanceReport> {
        let course = self
            .directory
            .get_course(course_id)
            .await?
            .ok_or(LedgerError::course_not_found(course_id))?;

        let end_date = end_date.unwrap_or_else(|| Utc::now().date_naive());
        let start_date = match start_date {
            Some(start_date) => start_date,
            None => end_date
                .checked_sub_signed(Duration::days(self.config.report_window_days))
                .ok_or_else(|| {
                    LedgerError::InvalidInput(format!("report window before {end_date} is out of range"))
                })?,
        };
        if start_date > end_date {
            return Err(LedgerError::InvalidInput(format!(
                "report start {start_date} is after end {end_date}"
            )));
        }

        let filter = AttendanceFilter {
            course_id: Some(course_id),
            from: Some(start_date),
            to: Some(end_date),
            ..AttendanceFilter::default()
        };
        let records = self.store.query_attendance(filter).await?;

        let mut by_day: BTreeMap<NaiveDate, StatusCounts> = BTreeMap::new();
        for record in &records {
            by_day.entry(record.date).or_default().add(record.status);
        }
        let mut daily_attendance = Vec::new();
        let mut date = start_date;
        loop {
            daily_attendance.push(DailyAttendance {
                date,
                counts: by_day.remove(&date).unwrap_or_default(),
            });
            // succ_opt ends the walk at NaiveDate::MAX.
            match date.succ_opt() {
                Some(next) if next <= end_date => date = next,
                _ => break,
            }
        }

        let student_attendance_rates = course
            .enrolled_students
            .iter()
            .map(|student_id| {
                let counts: StatusCounts = records
                    .iter()
                    .filter(|r| r.student_id == *student_id)
                    .collect();
                (*student_id, round2(counts.rate()))
            })
            .collect();

        let overall: StatusCounts = records.iter().collect();
        debug!(days = daily_attendance.len(), records = records.len(), "attendance report built");

        Ok(AttendanceReport {
            course_id,
            course_name: course.name,
            start_date,
            end_date,
            total_records: records.len(),
            overall_attendance_rate: round2(overall.rate()),
            student_attendance_rates,
            daily_attendance,
            status_distribution: status_distribution(&records),
        })
    }

    /// All-time view over the course; only days with records are listed.
    pub async fn attendance_analytics(&self, course_id: Uuid) -> LedgerResult<AttendanceAnalytics> {
        let filter = AttendanceFilter {
            course_id: Some(course_id),
            ..AttendanceFilter::default()
        };
        let records = self.store.query_attendance(filter).await?;

        let mut by_day: BTreeMap<NaiveDate, StatusCounts> = BTreeMap::new();
        for record in &records {
            by_day.entry(record.date).or_default().add(record.status);
        }
        let overall: StatusCounts = records.iter().collect();

        Ok(AttendanceAnalytics {
            course_id,
            total_records: records.len(),
            attendance_rate: round2(overall.rate()),
            status_distribution: status_distribution(&records),
            daily_attendance: by_day
                .into_iter()
                .map(|(date, counts)| DailyAttendance { date, counts })
                .collect(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn absence_notifications(
        &self,
        course_id: Uuid,
        date: NaiveDate,
    ) -> LedgerResult<AbsenceNotice> {
        let course = self
            .directory
            .get_course(course_id)
            .await?
            .ok_or(LedgerError::course_not_found(course_id))?;

        let absent = AttendanceFilter {
            status: Some(AttendanceStatus::Absent),
            ..AttendanceFilter::course_on(course_id, date)
        };
        let absent_records = self.store.query_attendance(absent).await?;

        let mut notifications = Vec::with_capacity(absent_records.len());
        for record in absent_records {
            let history = AttendanceFilter {
                student_id: Some(record.student_id),
                course_id: Some(course_id),
                ..AttendanceFilter::default()
            };
            let counts: StatusCounts = self.store.query_attendance(history).await?.iter().collect();
            let attendance_rate = round2(counts.rate());
            let priority = if attendance_rate < self.config.low_attendance_threshold {
                NoticePriority::High
            } else {
                NoticePriority::Normal
            };
            notifications.push(AbsenceNotification {
                student_id: record.student_id,
                attendance_rate,
                priority,
                message: format!("Absence recorded for {} on {}", course.name, date),
            });
        }

        Ok(AbsenceNotice {
            course_id,
            course_name: course.name,
            date,
            absent_count: notifications.len(),
            notifications,
        })
    }
}

fn status_distribution(records: &[AttendanceRecord]) -> BTreeMap<AttendanceStatus, usize> {
    let mut distribution = BTreeMap::new();
    for record in records {
        *distribution.entry(record.status).or_insert(0) += 1;
    }
    distribution
}

pub fn render_attendance_report(report: &AttendanceReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Report: {}", report.course_name);
    let _ = writeln!(
        output,
        "Period {} to {} ({} records, {:.2}% attended)",
        report.start_date, report.end_date, report.total_records, report.overall_attendance_rate
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Mix");

    if report.status_distribution.is_empty() {
        let _ = writeln!(output, "No attendance recorded for this window.");
    } else {
        for (status, count) in &report.status_distribution {
            let _ = writeln!(output, "- {status}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Daily Attendance");
    let _ = writeln!(output, "| Date | Present | Late | Absent | Excused | Total |");
    let _ = writeln!(output, "|------|---------|------|--------|---------|-------|");
    for day in &report.daily_attendance {
        let c = &day.counts;
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} |",
            day.date, c.present, c.late, c.absent, c.excused, c.total
        );
    }

    let mut rates: Vec<(&Uuid, &f64)> = report.student_attendance_rates.iter().collect();
    rates.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Students by Attendance Rate");

    if rates.is_empty() {
        let _ = writeln!(output, "No students enrolled.");
    } else {
        for (student_id, rate) in rates {
            let _ = writeln!(output, "- {student_id}: {rate:.2}%");
        }
    }

    output
}

pub fn render_performance(summary: &PerformanceSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Performance Summary for {}", summary.student_id);
    let gpa = summary
        .gpa
        .map_or_else(|| "n/a".to_string(), |gpa| format!("{gpa:.2}"));
    let _ = writeln!(
        output,
        "{} grades, average {:.2}%, GPA {}, trend {}",
        summary.total_grades,
        summary.average_score,
        gpa,
        summary.trend.trend.as_str()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Courses");

    if summary.course_performance.is_empty() {
        let _ = writeln!(output, "No grades recorded.");
    } else {
        for (course_id, course) in &summary.course_performance {
            let _ = writeln!(
                output,
                "- {}: {:.2}% ({}, {:.1} points) across {} grades",
                course_id, course.average_score, course.letter_grade, course.gpa_points, course.grade_count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Assessment Types");
    for (kind, breakdown) in &summary.assessment_breakdown {
        let _ = writeln!(
            output,
            "- {}: {:.2}% over {}",
            kind, breakdown.average_score, breakdown.count
        );
    }

    output
}
