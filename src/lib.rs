//! Grade and attendance ledgers with read-only analytics for a school
//! backend. Course data and persistence are supplied through the traits in
//! [`gateway`].

pub mod attendance;
pub mod classification;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod grades;
pub mod memory;
pub mod models;
pub mod performance;
pub mod report;

#[cfg(test)]
mod testing;

pub use attendance::AttendanceLedger;
pub use config::{DatabaseConfig, EngineConfig};
pub use error::{BatchRejection, BatchViolation, ErrorKind, LedgerError, LedgerResult};
pub use gateway::{AttendanceFilter, AttendanceStore, CourseDirectory, GradeFilter, GradeStore};
pub use grades::GradeLedger;
pub use memory::MemoryStore;
pub use performance::PerformanceAggregator;
pub use report::AttendanceReporter;

/// Installs the stderr subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}
