use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use academic_ledger::db::{self, PgStore};
use academic_ledger::report::{render_attendance_report, render_performance};
use academic_ledger::{
    AttendanceLedger, AttendanceReporter, DatabaseConfig, GradeLedger, PerformanceAggregator,
};

#[derive(Parser)]
#[command(name = "academic-ledger")]
#[command(about = "Grade and attendance ledger with course analytics", long_about = None)]
struct Cli {
    #[command(flatten)]
    database: DatabaseConfig,
    /// Fallback filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample courses, enrollments and attendance
    Seed,
    /// Import grades from a CSV file; any bad row rejects the whole file
    ImportGrades {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        recorded_by: Uuid,
    },
    /// Import attendance from a CSV file; any bad row rejects the whole file
    ImportAttendance {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        recorded_by: Uuid,
    },
    /// Summarize one student's grades
    Performance {
        #[arg(long)]
        student: Uuid,
    },
    /// Course-wide grade analytics as JSON
    CourseAnalytics {
        #[arg(long)]
        course: Uuid,
    },
    /// Generate a markdown attendance report
    AttendanceReport {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        #[arg(long, default_value = "attendance-report.md")]
        out: PathBuf,
    },
    /// List absence notifications for a course day
    Absences {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    academic_ledger::init_logging(&cli.log_level);

    let store = Arc::new(PgStore::connect(&cli.database).await?);

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportGrades { csv, recorded_by } => {
            let rows = db::read_grades_csv(&csv)?;
            let ledger = GradeLedger::new(store.clone(), store.clone());
            let inserted = ledger.bulk_record_grades(rows, recorded_by).await?;
            println!("Inserted {} grades from {}.", inserted.len(), csv.display());
        }
        Commands::ImportAttendance { csv, recorded_by } => {
            let rows = db::read_attendance_csv(&csv)?;
            let ledger = AttendanceLedger::new(store.clone(), store.clone());
            let inserted = ledger.bulk_record_attendance(rows, recorded_by).await?;
            println!(
                "Inserted {} attendance records from {}.",
                inserted.len(),
                csv.display()
            );
        }
        Commands::Performance { student } => {
            let aggregator = PerformanceAggregator::new(store.clone());
            let summary = aggregator.get_student_performance(student).await?;
            print!("{}", render_performance(&summary));
        }
        Commands::CourseAnalytics { course } => {
            let aggregator = PerformanceAggregator::new(store.clone());
            let analytics = aggregator.get_course_analytics(course).await?;
            println!("{}", serde_json::to_string_pretty(&analytics)?);
        }
        Commands::AttendanceReport {
            course,
            start,
            end,
            out,
        } => {
            let reporter = AttendanceReporter::new(store.clone(), store.clone());
            let report = reporter.generate_attendance_report(course, start, end).await?;
            std::fs::write(&out, render_attendance_report(&report))
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Absences { course, date } => {
            let reporter = AttendanceReporter::new(store.clone(), store.clone());
            let notice = reporter.absence_notifications(course, date).await?;

            if notice.notifications.is_empty() {
                println!("No absences recorded for {} on {}.", notice.course_name, date);
                return Ok(());
            }

            println!("{} absences in {} on {}:", notice.absent_count, notice.course_name, date);
            for notification in &notice.notifications {
                println!(
                    "- {} ({:?} priority) attendance {:.2}%",
                    notification.student_id, notification.priority, notification.attendance_rate
                );
            }
        }
    }

    Ok(())
}
