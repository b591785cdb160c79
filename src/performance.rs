//! Read-only grade analytics.
//!
//! Each metric is a pure function over an immutable snapshot of records.
//! Independent metrics run on the blocking pool and are joined before the
//! summary is assembled; if any of them fails the whole call fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::classification::classify;
use crate::config::EngineConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::gateway::{GradeFilter, GradeStore};
use crate::models::{
    round2, AssessmentBreakdown, AssessmentType, CourseAnalytics, CourseBreakdown, GradePoint,
    GradeRecord, GradeTrend, LetterGrade, PerformanceSummary, Trend, TrendSummary,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicStats {
    pub average_score: f64,
    pub gpa: Option<f64>,
}

#[derive(Clone)]
pub struct PerformanceAggregator {
    store: Arc<dyn GradeStore>,
    config: EngineConfig,
}

impl PerformanceAggregator {
    pub fn new(store: Arc<dyn GradeStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn GradeStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_student_performance(&self, student_id: Uuid) -> LedgerResult<PerformanceSummary> {
        let records = self.store.query_grades(GradeFilter::student(student_id)).await?;
        if records.is_empty() {
            return Ok(empty_summary(student_id));
        }

        let total_grades = records.len();
        let snapshot: Arc<[GradeRecord]> = records.into();
        let config = self.config;

        let (basic, grade_distribution, course_performance, assessment_breakdown, trend) = tokio::try_join!(
            spawn_metric(&snapshot, basic_stats),
            spawn_metric(&snapshot, letter_distribution),
            spawn_metric(&snapshot, course_breakdown),
            spawn_metric(&snapshot, assessment_breakdown),
            spawn_metric(&snapshot, move |records| trend(records, &config)),
        )
        .map_err(|err| LedgerError::Aggregation(err.to_string()))?;

        debug!(total_grades, gpa = ?basic.gpa, trend = trend.trend.as_str(), "student performance computed");
        Ok(PerformanceSummary {
            student_id,
            total_grades,
            average_score: basic.average_score,
            gpa: basic.gpa,
            grade_distribution,
            course_performance,
            assessment_breakdown,
            trend,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_course_analytics(&self, course_id: Uuid) -> LedgerResult<CourseAnalytics> {
        let records = self.store.query_grades(GradeFilter::course(course_id)).await?;
        let total_grades = records.len();
        let snapshot: Arc<[GradeRecord]> = records.into();

        let (average_score, grade_distribution, assessment_breakdown, student_averages) = tokio::try_join!(
            spawn_metric(&snapshot, |records| round2(mean_percentage(records))),
            spawn_metric(&snapshot, letter_distribution),
            spawn_metric(&snapshot, assessment_breakdown),
            spawn_metric(&snapshot, student_averages),
        )
        .map_err(|err| LedgerError::Aggregation(err.to_string()))?;

        debug!(total_grades, average_score, "course analytics computed");
        Ok(CourseAnalytics {
            course_id,
            total_grades,
            average_score,
            grade_distribution,
            assessment_breakdown,
            student_averages,
        })
    }

    /// Chronological grade history with the trend label.
    pub async fn get_grade_trends(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
    ) -> LedgerResult<GradeTrend> {
        let filter = GradeFilter {
            course_id,
            ..GradeFilter::student(student_id)
        };
        let mut records = self.store.query_grades(filter).await?;
        records.sort_by_key(|r| r.recorded_at);

        let history = records
            .iter()
            .map(|r| GradePoint {
                recorded_at: r.recorded_at,
                percentage: round2(r.percentage()),
                letter_grade: r.letter_grade,
                assessment_type: r.assessment_type,
            })
            .collect();

        Ok(GradeTrend {
            summary: trend(&records, &self.config),
            history,
        })
    }
}

fn spawn_metric<T, F>(snapshot: &Arc<[GradeRecord]>, metric: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&[GradeRecord]) -> T + Send + 'static,
{
    let records = Arc::clone(snapshot);
    tokio::task::spawn_blocking(move || metric(&records))
}

fn empty_summary(student_id: Uuid) -> PerformanceSummary {
    PerformanceSummary {
        student_id,
        total_grades: 0,
        average_score: 0.0,
        gpa: None,
        grade_distribution: BTreeMap::new(),
        course_performance: BTreeMap::new(),
        assessment_breakdown: BTreeMap::new(),
        trend: TrendSummary::insufficient(),
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn mean_percentage(records: &[GradeRecord]) -> f64 {
    mean(records.iter().map(GradeRecord::percentage)).unwrap_or(0.0)
}

fn percentages_by_course(records: &[GradeRecord]) -> BTreeMap<Uuid, Vec<f64>> {
    let mut grouped: BTreeMap<Uuid, Vec<f64>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.course_id).or_default().push(record.percentage());
    }
    grouped
}

/// Mean of per-course GPA points, each course weighted equally regardless
/// of how many assessments it holds. `None` without records.
pub fn gpa(records: &[GradeRecord]) -> Option<f64> {
    mean(
        percentages_by_course(records)
            .into_values()
            .filter_map(mean)
            .map(|course_mean| classify(course_mean).gpa_points),
    )
}

pub fn basic_stats(records: &[GradeRecord]) -> BasicStats {
    BasicStats {
        average_score: round2(mean_percentage(records)),
        gpa: gpa(records).map(round2),
    }
}

pub fn letter_distribution(records: &[GradeRecord]) -> BTreeMap<LetterGrade, usize> {
    let mut distribution = BTreeMap::new();
    for record in records {
        *distribution.entry(record.letter_grade).or_insert(0) += 1;
    }
    distribution
}

pub fn course_breakdown(records: &[GradeRecord]) -> BTreeMap<Uuid, CourseBreakdown> {
    percentages_by_course(records)
        .into_iter()
        .filter_map(|(course_id, scores)| {
            let average = mean(scores.iter().copied())?;
            let class = classify(average);
            Some((
                course_id,
                CourseBreakdown {
                    average_score: round2(average),
                    grade_count: scores.len(),
                    letter_grade: class.letter_grade,
                    gpa_points: class.gpa_points,
                },
            ))
        })
        .collect()
}

pub fn assessment_breakdown(records: &[GradeRecord]) -> BTreeMap<AssessmentType, AssessmentBreakdown> {
    let mut grouped: BTreeMap<AssessmentType, (f64, usize)> = BTreeMap::new();
    for record in records {
        let entry = grouped.entry(record.assessment_type).or_insert((0.0, 0));
        entry.0 += record.percentage();
        entry.1 += 1;
    }
    grouped
        .into_iter()
        .map(|(kind, (sum, count))| {
            (
                kind,
                AssessmentBreakdown {
                    count,
                    average_score: round2(sum / count as f64),
                },
            )
        })
        .collect()
}

pub fn student_averages(records: &[GradeRecord]) -> BTreeMap<Uuid, f64> {
    let mut grouped: BTreeMap<Uuid, Vec<f64>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.student_id).or_default().push(record.percentage());
    }
    grouped
        .into_iter()
        .filter_map(|(student_id, scores)| mean(scores).map(|avg| (student_id, round2(avg))))
        .collect()
}

/// Compares the most recent quarter of grades (at least `trend_min_recent`)
/// against the overall mean.
pub fn trend(records: &[GradeRecord], config: &EngineConfig) -> TrendSummary {
    if records.len() < 2 {
        return TrendSummary::insufficient();
    }

    let mut ordered: Vec<&GradeRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.recorded_at);
    let scores: Vec<f64> = ordered.iter().map(|r| r.percentage()).collect();

    let recent_count = (scores.len() / 4).max(config.trend_min_recent).min(scores.len());
    let overall_average = mean(scores.iter().copied()).unwrap_or(0.0);
    let recent_average = mean(scores[scores.len() - recent_count..].iter().copied()).unwrap_or(0.0);
    let improvement = recent_average - overall_average;

    let trend = if improvement > config.trend_threshold {
        Trend::Improving
    } else if improvement < -config.trend_threshold {
        Trend::Declining
    } else {
        Trend::Stable
    };

    TrendSummary {
        trend,
        improvement: round2(improvement),
        recent_average: round2(recent_average),
        overall_average: round2(overall_average),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::graded;

    async fn aggregator_with(records: Vec<GradeRecord>) -> PerformanceAggregator {
        let store = Arc::new(MemoryStore::new());
        store.bulk_create_grades(records).await.unwrap();
        PerformanceAggregator::new(store)
    }

    fn series(student: Uuid, course: Uuid, scores: &[f64]) -> Vec<GradeRecord> {
        scores
            .iter()
            .enumerate()
            .map(|(i, score)| graded(student, course, AssessmentType::Quiz, *score, i as i64))
            .collect()
    }

    #[tokio::test]
    async fn student_without_grades_gets_empty_summary() {
        let aggregator = aggregator_with(Vec::new()).await;

        let summary = aggregator.get_student_performance(Uuid::new_v4()).await.unwrap();

        assert_eq!(summary.total_grades, 0);
        assert_eq!(summary.gpa, None);
        assert_eq!(summary.average_score, 0.0);
        assert!(summary.grade_distribution.is_empty());
        assert!(summary.course_performance.is_empty());
        assert!(summary.assessment_breakdown.is_empty());
        assert_eq!(summary.trend.trend, Trend::InsufficientData);
    }

    #[tokio::test]
    async fn gpa_averages_courses_not_assessments() {
        let student = Uuid::new_v4();
        let (math, history) = (Uuid::new_v4(), Uuid::new_v4());
        let mut records = series(student, math, &[90.0, 100.0, 95.0, 95.0, 92.0, 98.0]);
        records.push(graded(student, history, AssessmentType::Exam, 75.0, 30));
        let aggregator = aggregator_with(records).await;

        let summary = aggregator.get_student_performance(student).await.unwrap();

        assert_eq!(summary.gpa, Some(3.0));
        assert_eq!(summary.total_grades, 7);
        assert_eq!(summary.course_performance[&math].grade_count, 6);
        assert_eq!(summary.course_performance[&math].gpa_points, 4.0);
        assert_eq!(summary.course_performance[&history].letter_grade, LetterGrade::C);
        assert_eq!(summary.course_performance[&history].gpa_points, 2.0);
    }

    #[tokio::test]
    async fn summary_breaks_down_letters_and_assessment_types() {
        let student = Uuid::new_v4();
        let course = Uuid::new_v4();
        let records = vec![
            graded(student, course, AssessmentType::Quiz, 85.0, 0),
            graded(student, course, AssessmentType::Quiz, 84.0, 1),
            graded(student, course, AssessmentType::Exam, 97.0, 2),
            graded(student, course, AssessmentType::Project, 60.0, 3),
        ];
        let aggregator = aggregator_with(records).await;

        let summary = aggregator.get_student_performance(student).await.unwrap();

        assert_eq!(summary.average_score, 81.5);
        assert_eq!(summary.grade_distribution[&LetterGrade::B], 2);
        assert_eq!(summary.grade_distribution[&LetterGrade::APlus], 1);
        assert_eq!(summary.grade_distribution[&LetterGrade::F], 1);
        assert_eq!(summary.assessment_breakdown[&AssessmentType::Quiz].count, 2);
        assert_eq!(summary.assessment_breakdown[&AssessmentType::Quiz].average_score, 84.5);
        assert_eq!(summary.assessment_breakdown[&AssessmentType::Exam].average_score, 97.0);
        assert!(!summary.assessment_breakdown.contains_key(&AssessmentType::Participation));
    }

    #[test]
    fn trend_labels_follow_recent_quarter() {
        let config = EngineConfig::default();
        let (student, course) = (Uuid::new_v4(), Uuid::new_v4());

        let mut rising = vec![60.0; 8];
        rising.extend([90.0; 4]);
        let up = trend(&series(student, course, &rising), &config);
        assert_eq!(up.trend, Trend::Improving);
        assert_eq!(up.recent_average, 90.0);
        assert_eq!(up.overall_average, 70.0);
        assert_eq!(up.improvement, 20.0);

        let mut falling = vec![90.0; 8];
        falling.extend([60.0; 4]);
        assert_eq!(trend(&series(student, course, &falling), &config).trend, Trend::Declining);

        assert_eq!(trend(&series(student, course, &[80.0; 6]), &config).trend, Trend::Stable);
        assert_eq!(trend(&series(student, course, &[80.0]), &config).trend, Trend::InsufficientData);
        // two records: the recent window covers everything
        assert_eq!(trend(&series(student, course, &[50.0, 95.0]), &config).trend, Trend::Stable);
    }

    #[test]
    fn trend_ignores_input_order() {
        let config = EngineConfig::default();
        let (student, course) = (Uuid::new_v4(), Uuid::new_v4());
        let mut records = series(student, course, &[60.0, 60.0, 60.0, 60.0, 60.0, 95.0, 95.0, 95.0]);
        records.reverse();
        assert_eq!(trend(&records, &config).trend, Trend::Improving);
    }

    #[test]
    fn gpa_is_none_without_records() {
        assert_eq!(gpa(&[]), None);
        assert_eq!(basic_stats(&[]).average_score, 0.0);
    }

    #[tokio::test]
    async fn course_analytics_cover_every_student() {
        let course = Uuid::new_v4();
        let (ana, ben) = (Uuid::new_v4(), Uuid::new_v4());
        let mut records = series(ana, course, &[80.0, 90.0]);
        records.extend(series(ben, course, &[70.0]));
        records.push(graded(ben, Uuid::new_v4(), AssessmentType::Exam, 10.0, 9));
        let aggregator = aggregator_with(records).await;

        let analytics = aggregator.get_course_analytics(course).await.unwrap();

        assert_eq!(analytics.total_grades, 3);
        assert_eq!(analytics.average_score, 80.0);
        assert_eq!(analytics.student_averages[&ana], 85.0);
        assert_eq!(analytics.student_averages[&ben], 70.0);
        assert_eq!(analytics.grade_distribution.values().sum::<usize>(), 3);

        let empty = aggregator.get_course_analytics(Uuid::new_v4()).await.unwrap();
        assert_eq!(empty.total_grades, 0);
        assert_eq!(empty.average_score, 0.0);
        assert!(empty.student_averages.is_empty());
    }

    #[tokio::test]
    async fn grade_trends_list_history_oldest_first() {
        let (student, course) = (Uuid::new_v4(), Uuid::new_v4());
        let mut records = series(student, course, &[70.0, 75.0, 99.0]);
        records.push(graded(student, Uuid::new_v4(), AssessmentType::Exam, 40.0, 50));
        let aggregator = aggregator_with(records).await;

        let scoped = aggregator.get_grade_trends(student, Some(course)).await.unwrap();
        assert_eq!(scoped.history.len(), 3);
        assert_eq!(scoped.history[0].percentage, 70.0);
        assert_eq!(scoped.history[2].letter_grade, LetterGrade::APlus);
        assert_eq!(scoped.summary.trend, Trend::Stable);

        let all = aggregator.get_grade_trends(student, None).await.unwrap();
        assert_eq!(all.history.len(), 4);
        assert_eq!(all.history[3].assessment_type, AssessmentType::Exam);

        let none = aggregator.get_grade_trends(Uuid::new_v4(), None).await.unwrap();
        assert!(none.history.is_empty());
        assert_eq!(none.summary.trend, Trend::InsufficientData);
    }
}
