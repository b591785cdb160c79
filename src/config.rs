use clap::Args;

/// Database connection settings, read from flags or the environment.
#[derive(Debug, Clone, Args)]
pub struct DatabaseConfig {
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,
    #[arg(long, env = "LEDGER_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

/// Analytics policy knobs. The grading table itself is fixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub report_window_days: i64,
    pub trend_min_recent: usize,
    pub trend_threshold: f64,
    pub low_attendance_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            report_window_days: 30,
            trend_min_recent: 3,
            trend_threshold: 5.0,
            low_attendance_threshold: 75.0,
        }
    }
}
