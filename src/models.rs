use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentType {
    Quiz,
    Exam,
    Assignment,
    Project,
    Participation,
}

impl AssessmentType {
    pub const ALL: [AssessmentType; 5] = [
        Self::Quiz,
        Self::Exam,
        Self::Assignment,
        Self::Project,
        Self::Participation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quiz => "quiz",
            Self::Exam => "exam",
            Self::Assignment => "assignment",
            Self::Project => "project",
            Self::Participation => "participation",
        }
    }
}

impl FromStr for AssessmentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!(
                    "assessment type '{value}' must be one of: {}",
                    allowed.join(", ")
                )
            })
    }
}

impl fmt::Display for AssessmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub const ALL: [AttendanceStatus; 4] = [Self::Present, Self::Absent, Self::Late, Self::Excused];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                format!("status '{value}' must be one of: present, absent, late, excused")
            })
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LetterGrade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "A-")]
    AMinus,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "B-")]
    BMinus,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "C-")]
    CMinus,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "F")]
    F,
}

impl LetterGrade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::AMinus => "A-",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::BMinus => "B-",
            Self::CPlus => "C+",
            Self::C => "C",
            Self::CMinus => "C-",
            Self::DPlus => "D+",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

impl FromStr for LetterGrade {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let grade = match value.trim() {
            "A+" => Self::APlus,
            "A" => Self::A,
            "A-" => Self::AMinus,
            "B+" => Self::BPlus,
            "B" => Self::B,
            "B-" => Self::BMinus,
            "C+" => Self::CPlus,
            "C" => Self::C,
            "C-" => Self::CMinus,
            "D+" => Self::DPlus,
            "D" => Self::D,
            "F" => Self::F,
            other => return Err(format!("unknown letter grade '{other}'")),
        };
        Ok(grade)
    }
}

impl fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A course as seen through the enrollment directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub enrolled_students: Vec<Uuid>,
}

impl Course {
    pub fn is_enrolled(&self, student_id: Uuid) -> bool {
        self.enrolled_students.contains(&student_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub assessment_type: AssessmentType,
    pub score: f64,
    pub max_score: f64,
    pub letter_grade: LetterGrade,
    pub feedback: Option<String>,
    pub recorded_by: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl GradeRecord {
    pub fn percentage(&self) -> f64 {
        percentage(self.score, self.max_score)
    }
}

pub fn percentage(score: f64, max_score: f64) -> f64 {
    if max_score > 0.0 {
        score / max_score * 100.0
    } else {
        0.0
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Caller-supplied grade. The letter grade is never part of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGrade {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub assessment_type: String,
    pub score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradePatch {
    pub score: Option<f64>,
    pub max_score: Option<f64>,
    pub assessment_type: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
    pub recorded_by: Uuid,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttendance {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub date: NaiveDate,
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendancePatch {
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub percentage: f64,
    pub letter_grade: LetterGrade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Stable => "stable",
            Self::InsufficientData => "insufficient_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub trend: Trend,
    pub improvement: f64,
    pub recent_average: f64,
    pub overall_average: f64,
}

impl TrendSummary {
    pub fn insufficient() -> Self {
        Self {
            trend: Trend::InsufficientData,
            improvement: 0.0,
            recent_average: 0.0,
            overall_average: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseBreakdown {
    pub average_score: f64,
    pub grade_count: usize,
    pub letter_grade: LetterGrade,
    pub gpa_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssessmentBreakdown {
    pub count: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub student_id: Uuid,
    pub total_grades: usize,
    pub average_score: f64,
    pub gpa: Option<f64>,
    pub grade_distribution: BTreeMap<LetterGrade, usize>,
    pub course_performance: BTreeMap<Uuid, CourseBreakdown>,
    pub assessment_breakdown: BTreeMap<AssessmentType, AssessmentBreakdown>,
    pub trend: TrendSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseAnalytics {
    pub course_id: Uuid,
    pub total_grades: usize,
    pub average_score: f64,
    pub grade_distribution: BTreeMap<LetterGrade, usize>,
    pub assessment_breakdown: BTreeMap<AssessmentType, AssessmentBreakdown>,
    pub student_averages: BTreeMap<Uuid, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradePoint {
    pub recorded_at: DateTime<Utc>,
    pub percentage: f64,
    pub letter_grade: LetterGrade,
    pub assessment_type: AssessmentType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeTrend {
    #[serde(flatten)]
    pub summary: TrendSummary,
    pub history: Vec<GradePoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
    pub total: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
        self.total += 1;
    }

    pub fn attended(&self) -> usize {
        self.present + self.late
    }

    /// Attended share in percent; 0.0 when nothing was recorded.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.attended() as f64 / self.total as f64 * 100.0
        }
    }
}

impl<'a> FromIterator<&'a AttendanceRecord> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = &'a AttendanceRecord>>(records: I) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.add(record.status);
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyAttendance {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceAnalytics {
    pub course_id: Uuid,
    pub total_records: usize,
    pub attendance_rate: f64,
    pub status_distribution: BTreeMap<AttendanceStatus, usize>,
    pub daily_attendance: Vec<DailyAttendance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceReport {
    pub course_id: Uuid,
    pub course_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_records: usize,
    pub overall_attendance_rate: f64,
    pub student_attendance_rates: BTreeMap<Uuid, f64>,
    pub daily_attendance: Vec<DailyAttendance>,
    pub status_distribution: BTreeMap<AttendanceStatus, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticePriority {
    High,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceNotification {
    pub student_id: Uuid,
    pub attendance_rate: f64,
    pub priority: NoticePriority,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceNotice {
    pub course_id: Uuid,
    pub course_name: String,
    pub date: NaiveDate,
    pub absent_count: usize,
    pub notifications: Vec<AbsenceNotification>,
}
