use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classification::classify;
use crate::error::{BatchRejection, LedgerError, LedgerResult};
use crate::gateway::{ensure_enrolled, fetch_courses, CourseDirectory, GradeFilter, GradeStore};
use crate::models::{
    percentage, AssessmentType, GradePatch, GradeRecord, GradeValidation, LetterGrade, NewGrade,
};

/// Sole writer of grade records and sole owner of letter-grade derivation.
#[derive(Clone)]
pub struct GradeLedger {
    directory: Arc<dyn CourseDirectory>,
    store: Arc<dyn GradeStore>,
}

impl GradeLedger {
    pub fn new(directory: Arc<dyn CourseDirectory>, store: Arc<dyn GradeStore>) -> Self {
        Self { directory, store }
    }

    #[tracing::instrument(skip(self, input), fields(student_id = %input.student_id, course_id = %input.course_id))]
    pub async fn record_grade(&self, input: NewGrade, recorded_by: Uuid) -> LedgerResult<GradeRecord> {
        let course = self.directory.get_course(input.course_id).await?;
        let record = ensure_enrolled(course.as_ref(), input.course_id, input.student_id)
            .and_then(|()| build_record(input, recorded_by, Utc::now()))
            .inspect_err(|err| warn!(error = %err, "grade rejected"))?;

        let saved = self.store.create_grade(record).await?;
        info!(grade_id = %saved.id, letter = %saved.letter_grade, "grade recorded");
        Ok(saved)
    }

    /// All-or-nothing: every entry is validated before anything is written.
    #[tracing::instrument(skip(self, inputs), fields(count = inputs.len()))]
    pub async fn bulk_record_grades(
        &self,
        inputs: Vec<NewGrade>,
        recorded_by: Uuid,
    ) -> LedgerResult<Vec<GradeRecord>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let courses = fetch_courses(self.directory.as_ref(), inputs.iter().map(|g| g.course_id)).await?;
        let recorded_at = Utc::now();
        let mut records = Vec::with_capacity(inputs.len());
        let mut violations = Vec::new();

        for (index, input) in inputs.into_iter().enumerate() {
            let (student_id, course_id) = (input.student_id, input.course_id);
            let course = courses.get(&course_id).and_then(Option::as_ref);
            if let Err(err) = ensure_enrolled(course, course_id, student_id) {
                violations.push(err.into_violation(index, student_id, course_id, None));
            }
            match build_record(input, recorded_by, recorded_at) {
                Ok(record) => records.push(record),
                Err(err) => violations.push(err.into_violation(index, student_id, course_id, None)),
            }
        }

        if !violations.is_empty() {
            let rejection = BatchRejection { violations };
            warn!(offending = ?rejection.indices(), "grade batch rejected");
            return Err(LedgerError::Batch(rejection));
        }

        let saved = self.store.bulk_create_grades(records).await?;
        info!(count = saved.len(), "grade batch recorded");
        Ok(saved)
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update_grade(
        &self,
        id: Uuid,
        patch: GradePatch,
        updated_by: Uuid,
    ) -> LedgerResult<GradeRecord> {
        let mut record = self.get_grade(id).await?;

        if let Some(kind) = patch.assessment_type.as_deref() {
            record.assessment_type = parse_assessment_type(kind)?;
        }
        if patch.score.is_some() || patch.max_score.is_some() {
            let score = patch.score.unwrap_or(record.score);
            let max_score = patch.max_score.unwrap_or(record.max_score);
            check_scores(score, max_score)
                .map_err(LedgerError::InvalidInput)
                .inspect_err(|err| warn!(error = %err, "grade update rejected"))?;
            record.score = score;
            record.max_score = max_score;
            record.letter_grade = classify(percentage(score, max_score)).letter_grade;
        }
        if patch.feedback.is_some() {
            record.feedback = patch.feedback;
        }
        record.recorded_by = updated_by;
        record.recorded_at = Utc::now();

        let saved = self.store.update_grade(record).await?;
        info!(grade_id = %saved.id, letter = %saved.letter_grade, "grade updated");
        Ok(saved)
    }

    /// Dry run of [`record_grade`](Self::record_grade) that reports every problem.
    pub async fn validate_grade(&self, input: &NewGrade) -> LedgerResult<GradeValidation> {
        let mut errors = Vec::new();

        let course = self.directory.get_course(input.course_id).await?;
        if let Err(err) = ensure_enrolled(course.as_ref(), input.course_id, input.student_id) {
            errors.push(err.to_string());
        }
        errors.extend(score_problems(input.score, input.max_score));
        if let Err(err) = parse_assessment_type(&input.assessment_type) {
            errors.push(err.to_string());
        }

        let scorable = input.score.is_finite() && input.max_score.is_finite() && input.max_score > 0.0;
        let (percentage, letter_grade) = if scorable {
            let pct = percentage(input.score, input.max_score);
            (pct, classify(pct).letter_grade)
        } else {
            (0.0, LetterGrade::F)
        };

        Ok(GradeValidation {
            is_valid: errors.is_empty(),
            errors,
            percentage,
            letter_grade,
        })
    }

    pub async fn get_grade(&self, id: Uuid) -> LedgerResult<GradeRecord> {
        self.store
            .get_grade(id)
            .await?
            .ok_or(LedgerError::NotFound { entity: "grade", id })
    }

    pub async fn get_student_grades(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
    ) -> LedgerResult<Vec<GradeRecord>> {
        let filter = GradeFilter {
            course_id,
            ..GradeFilter::student(student_id)
        };
        Ok(self.store.query_grades(filter).await?)
    }

    pub async fn get_course_grades(&self, course_id: Uuid) -> LedgerResult<Vec<GradeRecord>> {
        Ok(self.store.query_grades(GradeFilter::course(course_id)).await?)
    }

    pub async fn delete_grade(&self, id: Uuid) -> LedgerResult<bool> {
        let deleted = self.store.delete_grade(id).await?;
        if deleted {
            info!(grade_id = %id, "grade deleted");
        }
        Ok(deleted)
    }
}

fn build_record(
    input: NewGrade,
    recorded_by: Uuid,
    recorded_at: DateTime<Utc>,
) -> LedgerResult<GradeRecord> {
    let assessment_type = parse_assessment_type(&input.assessment_type)?;
    check_scores(input.score, input.max_score).map_err(LedgerError::InvalidInput)?;
    let letter_grade = classify(percentage(input.score, input.max_score)).letter_grade;

    Ok(GradeRecord {
        id: Uuid::new_v4(),
        student_id: input.student_id,
        course_id: input.course_id,
        assessment_type,
        score: input.score,
        max_score: input.max_score,
        letter_grade,
        feedback: input.feedback,
        recorded_by,
        recorded_at,
    })
}

fn parse_assessment_type(value: &str) -> LedgerResult<AssessmentType> {
    value.parse().map_err(LedgerError::InvalidInput)
}

fn check_scores(score: f64, max_score: f64) -> Result<(), String> {
    match score_problems(score, max_score).into_iter().next() {
        Some(problem) => Err(problem),
        None => Ok(()),
    }
}

/// Every score rule the pair breaks, in the order writes report them.
fn score_problems(score: f64, max_score: f64) -> Vec<String> {
    if !score.is_finite() || !max_score.is_finite() {
        return vec!["scores must be finite numbers".to_string()];
    }
    let mut problems = Vec::new();
    if max_score <= 0.0 {
        problems.push(format!("maximum score must be positive, got {max_score}"));
    }
    if score < 0.0 {
        problems.push(format!("score cannot be negative, got {score}"));
    }
    if score > max_score {
        problems.push(format!("score {score} exceeds maximum score {max_score}"));
    }
    problems
}
