use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::gateway::{
    AttendanceConflict, AttendanceFilter, AttendanceStore, CourseDirectory, GradeFilter, GradeStore,
};
use crate::models::{AttendanceRecord, Course, GradeRecord, NewAttendance, NewGrade};

const GRADE_COLUMNS: &str = "SELECT id, student_id, course_id, assessment_type, score, max_score, \
     letter_grade, feedback, recorded_by, recorded_at FROM academic_ledger.grades";

const ATTENDANCE_COLUMNS: &str = "SELECT id, student_id, course_id, date, status, notes, \
     recorded_by, recorded_at FROM academic_ledger.attendance";

/// Postgres-backed directory and stores under the `academic_ledger` schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = [
        Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
        Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
        Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
    ];
    let courses = [
        (
            Uuid::parse_str("6b1f0c4e-9a55-4f0e-a3de-2c8f3b7d1e01")?,
            "Algebra II",
            true,
        ),
        (
            Uuid::parse_str("a4c9e8d2-71b3-4c6a-9f10-5e2d8b4c3a02")?,
            "World History",
            true,
        ),
        (
            Uuid::parse_str("f0e1d2c3-b4a5-4968-8776-655443322103")?,
            "Latin",
            false,
        ),
    ];

    for (id, name, is_active) in courses {
        sqlx::query(
            r#"
            INSERT INTO academic_ledger.courses (id, name, is_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, is_active = EXCLUDED.is_active
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(is_active)
        .execute(pool)
        .await?;

        for student_id in students {
            sqlx::query(
                r#"
                INSERT INTO academic_ledger.course_enrollments (course_id, student_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(id)
            .bind(student_id)
            .execute(pool)
            .await?;
        }
    }

    let (algebra, _, _) = courses[0];
    let start = NaiveDate::from_ymd_opt(2026, 1, 5).context("invalid date")?;
    let statuses = ["present", "present", "late", "absent", "present"];

    for (offset, status) in statuses.iter().enumerate() {
        let date = start + chrono::Duration::days(offset as i64);
        for student_id in students {
            sqlx::query(
                r#"
                INSERT INTO academic_ledger.attendance
                (id, student_id, course_id, date, status, notes, recorded_by, recorded_at)
                VALUES ($1, $2, $3, $4, $5, NULL, $6, NOW())
                ON CONFLICT (student_id, course_id, date) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(student_id)
            .bind(algebra)
            .bind(date)
            .bind(*status)
            .bind(Uuid::nil())
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

/// Reads grade rows with headers matching `NewGrade` field names.
pub fn read_grades_csv(csv_path: &Path) -> anyhow::Result<Vec<NewGrade>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<NewGrade>().enumerate() {
        rows.push(result.with_context(|| format!("bad grade row {}", line + 1))?);
    }
    Ok(rows)
}

/// Reads attendance rows with headers matching `NewAttendance` field names.
pub fn read_attendance_csv(csv_path: &Path) -> anyhow::Result<Vec<NewAttendance>> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut rows = Vec::new();
    for (line, result) in reader.deserialize::<NewAttendance>().enumerate() {
        rows.push(result.with_context(|| format!("bad attendance row {}", line + 1))?);
    }
    Ok(rows)
}

fn grade_from_row(row: &PgRow) -> anyhow::Result<GradeRecord> {
    let assessment_type: String = row.try_get("assessment_type")?;
    let letter_grade: String = row.try_get("letter_grade")?;
    Ok(GradeRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        course_id: row.try_get("course_id")?,
        assessment_type: assessment_type.parse().map_err(|e: String| anyhow!(e))?,
        score: row.try_get("score")?,
        max_score: row.try_get("max_score")?,
        letter_grade: letter_grade.parse().map_err(|e: String| anyhow!(e))?,
        feedback: row.try_get("feedback")?,
        recorded_by: row.try_get("recorded_by")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn attendance_from_row(row: &PgRow) -> anyhow::Result<AttendanceRecord> {
    let status: String = row.try_get("status")?;
    Ok(AttendanceRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        course_id: row.try_get("course_id")?,
        date: row.try_get("date")?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        notes: row.try_get("notes")?,
        recorded_by: row.try_get("recorded_by")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

async fn insert_grade<'e, E>(executor: E, record: &GradeRecord) -> anyhow::Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO academic_ledger.grades
        (id, student_id, course_id, assessment_type, score, max_score,
         letter_grade, feedback, recorded_by, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(record.id)
    .bind(record.student_id)
    .bind(record.course_id)
    .bind(record.assessment_type.as_str())
    .bind(record.score)
    .bind(record.max_score)
    .bind(record.letter_grade.as_str())
    .bind(&record.feedback)
    .bind(record.recorded_by)
    .bind(record.recorded_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_attendance<'e, E>(executor: E, record: &AttendanceRecord) -> anyhow::Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO academic_ledger.attendance
        (id, student_id, course_id, date, status, notes, recorded_by, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.id)
    .bind(record.student_id)
    .bind(record.course_id)
    .bind(record.date)
    .bind(record.status.as_str())
    .bind(&record.notes)
    .bind(record.recorded_by)
    .bind(record.recorded_at)
    .execute(executor)
    .await
    .map_err(|err| attendance_write_error(err, record))?;
    Ok(())
}

// SQLSTATE 23505 on (student_id, course_id, date) is a duplicate day.
fn attendance_write_error(err: sqlx::Error, record: &AttendanceRecord) -> anyhow::Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AttendanceConflict::of(record).into()
        }
        _ => err.into(),
    }
}

#[async_trait]
impl CourseDirectory for PgStore {
    async fn get_course(&self, id: Uuid) -> anyhow::Result<Option<Course>> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.name, c.is_active,
                   COALESCE(
                       array_agg(e.student_id) FILTER (WHERE e.student_id IS NOT NULL),
                       '{}'
                   ) AS enrolled_students
            FROM academic_ledger.courses c
            LEFT JOIN academic_ledger.course_enrollments e ON e.course_id = c.id
            WHERE c.id = $1
            GROUP BY c.id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> anyhow::Result<Course> {
            Ok(Course {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                is_active: row.try_get("is_active")?,
                enrolled_students: row.try_get("enrolled_students")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl GradeStore for PgStore {
    async fn create_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord> {
        insert_grade(&self.pool, &record).await?;
        Ok(record)
    }

    async fn bulk_create_grades(
        &self,
        records: Vec<GradeRecord>,
    ) -> anyhow::Result<Vec<GradeRecord>> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            insert_grade(&mut *tx, record).await?;
        }
        tx.commit().await?;
        info!(count = records.len(), "grades inserted");
        Ok(records)
    }

    async fn get_grade(&self, id: Uuid) -> anyhow::Result<Option<GradeRecord>> {
        let row = sqlx::query(&format!("{GRADE_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(grade_from_row).transpose()
    }

    async fn update_grade(&self, record: GradeRecord) -> anyhow::Result<GradeRecord> {
        let result = sqlx::query(
            r#"
            UPDATE academic_ledger.grades
            SET assessment_type = $2, score = $3, max_score = $4, letter_grade = $5,
                feedback = $6, recorded_by = $7, recorded_at = $8
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.assessment_type.as_str())
        .bind(record.score)
        .bind(record.max_score)
        .bind(record.letter_grade.as_str())
        .bind(&record.feedback)
        .bind(record.recorded_by)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("grade {} does not exist", record.id));
        }
        Ok(record)
    }

    async fn delete_grade(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM academic_ledger.grades WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_grades(&self, filter: GradeFilter) -> anyhow::Result<Vec<GradeRecord>> {
        let mut query = QueryBuilder::<Postgres>::new(GRADE_COLUMNS);
        query.push(" WHERE TRUE");
        if let Some(student_id) = filter.student_id {
            query.push(" AND student_id = ").push_bind(student_id);
        }
        if let Some(course_id) = filter.course_id {
            query.push(" AND course_id = ").push_bind(course_id);
        }
        if let Some(kind) = filter.assessment_type {
            query.push(" AND assessment_type = ").push_bind(kind.as_str());
        }
        query.push(" ORDER BY recorded_at DESC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(grade_from_row).collect()
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn create_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
        insert_attendance(&self.pool, &record).await?;
        Ok(record)
    }

    async fn bulk_create_attendance(
        &self,
        records: Vec<AttendanceRecord>,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            insert_attendance(&mut *tx, record).await?;
        }
        tx.commit().await?;
        info!(count = records.len(), "attendance inserted");
        Ok(records)
    }

    async fn get_attendance(&self, id: Uuid) -> anyhow::Result<Option<AttendanceRecord>> {
        let row = sqlx::query(&format!("{ATTENDANCE_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attendance_from_row).transpose()
    }

    async fn update_attendance(&self, record: AttendanceRecord) -> anyhow::Result<AttendanceRecord> {
        let result = sqlx::query(
            r#"
            UPDATE academic_ledger.attendance
            SET status = $2, notes = $3, recorded_by = $4, recorded_at = $5
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(&record.notes)
        .bind(record.recorded_by)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("attendance record {} does not exist", record.id));
        }
        Ok(record)
    }

    async fn delete_attendance(&self, id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM academic_ledger.attendance WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_attendance(
        &self,
        filter: AttendanceFilter,
    ) -> anyhow::Result<Vec<AttendanceRecord>> {
        let mut query = QueryBuilder::<Postgres>::new(ATTENDANCE_COLUMNS);
        query.push(" WHERE TRUE");
        if let Some(student_id) = filter.student_id {
            query.push(" AND student_id = ").push_bind(student_id);
        }
        if let Some(course_id) = filter.course_id {
            query.push(" AND course_id = ").push_bind(course_id);
        }
        if let Some(from) = filter.from {
            query.push(" AND date >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND date <= ").push_bind(to);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        query.push(" ORDER BY date DESC, recorded_at DESC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(attendance_from_row).collect()
    }
}
