//! Quiz score tracking: per-user score aggregation across the fixed
//! curriculum, cached course point totals, and the per-user quiz completion
//! cache refreshed on every scheduled run.

use crate::canvas::{CanvasClient, CanvasError};
use crate::models::{AssignmentKey, AssignmentMap};
use crate::points::{self, PointsBreakdown, ScoreAggregate};
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Quiz titles excluded from the completion cache (ungraded housekeeping
/// quizzes).
const EXCLUDED_QUIZ_TITLES: [&str; 5] = [
    "terms of use",
    "terms of service",
    "syllabus quiz",
    "course introduction",
    "welcome quiz",
];

pub fn is_excluded_quiz(title: &str) -> bool {
    let title = title.to_lowercase();
    EXCLUDED_QUIZ_TITLES.iter().any(|t| title.contains(t))
}

#[derive(Serialize, Debug, Clone)]
pub struct QuizScoreEntry {
    pub quiz_id: i64,
    pub quiz_title: String,
    pub score: f64,
    pub points_possible: f64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub workflow_state: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct MissingQuizEntry {
    pub quiz_id: i64,
    pub quiz_title: String,
    pub points_possible: f64,
    pub due_at: Option<DateTime<Utc>>,
    pub status: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct UserQuizData {
    pub scores: Vec<QuizScoreEntry>,
    pub missing: Vec<MissingQuizEntry>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CoursePointsOutcome {
    pub canvas_course_id: i64,
    pub total_points: f64,
    pub included_count: usize,
    pub excluded_count: usize,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct BatchOutcome {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct QuizUpdateOutcome {
    pub processed: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct QuizTracker {
    canvas: CanvasClient,
    store: Store,
}

impl QuizTracker {
    pub fn new(canvas: CanvasClient, store: Store) -> Self {
        QuizTracker { canvas, store }
    }

    /// Aggregate a user's submission scores across the curriculum, in order.
    /// A key with no discovered assignment id is skipped; the first
    /// configured assignment with no score (or a failed fetch) voids the
    /// pass and stops the loop.
    pub async fn aggregate_user_scores(
        &self,
        canvas_course: i64,
        canvas_user: i64,
        map: &AssignmentMap,
    ) -> ScoreAggregate {
        let mut agg = ScoreAggregate {
            all_submitted: true,
            ..Default::default()
        };

        for key in AssignmentKey::CURRICULUM {
            let Some(assignment_id) = map.get(key) else {
                continue;
            };
            match self
                .canvas
                .get_submission(canvas_course, assignment_id, canvas_user)
                .await
            {
                Ok(submission) => match submission.score {
                    Some(score) => {
                        agg.total_score += score;
                        if key.is_exam() {
                            agg.exam_scores.push(score);
                        }
                    }
                    None => {
                        agg.all_submitted = false;
                        break;
                    }
                },
                Err(err) => {
                    tracing::warn!(user = canvas_user, assignment = %key, error = %err,
                        "submission fetch failed, voiding eligibility pass");
                    agg.all_submitted = false;
                    break;
                }
            }
        }

        agg
    }

    pub async fn calculate_total_points(
        &self,
        canvas_course: i64,
    ) -> Result<PointsBreakdown, CanvasError> {
        let assignments = self.canvas.list_assignments(canvas_course).await?;
        Ok(points::gradable_points(&assignments))
    }

    /// Recompute and cache a course's gradable point total.
    pub async fn update_course_points(&self, canvas_course: i64) -> Result<CoursePointsOutcome> {
        let breakdown = self.calculate_total_points(canvas_course).await?;
        self.store
            .set_course_points(canvas_course, breakdown.total_points)
            .await?;
        Ok(CoursePointsOutcome {
            canvas_course_id: canvas_course,
            total_points: breakdown.total_points,
            included_count: breakdown.included.len(),
            excluded_count: breakdown.excluded.len(),
        })
    }

    pub async fn update_all_course_points(&self) -> Result<BatchOutcome> {
        let courses = self.store.courses_with_canvas_id().await?;
        let mut outcome = BatchOutcome {
            total: courses.len(),
            ..Default::default()
        };

        for course in courses {
            let Some(canvas_id) = course.canvas_course_id else {
                continue;
            };
            match self.update_course_points(canvas_id).await {
                Ok(update) => {
                    outcome.successful += 1;
                    tracing::info!(course = canvas_id, total = update.total_points,
                        "course points updated");
                }
                Err(err) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!("course {canvas_id}: {err}"));
                }
            }
        }

        Ok(outcome)
    }

    /// Per-user quiz completion snapshot from the assignments listing.
    pub async fn fetch_user_quiz_scores(
        &self,
        canvas_course: i64,
        canvas_user: i64,
    ) -> Result<UserQuizData, CanvasError> {
        let assignments = self
            .canvas
            .list_user_course_assignments(canvas_user, canvas_course)
            .await?;

        let mut data = UserQuizData::default();

        for assignment in assignments {
            if !assignment.is_quiz_assignment || is_excluded_quiz(&assignment.name) {
                continue;
            }
            let quiz_id = assignment.quiz_id.unwrap_or(assignment.id);
            let points_possible = assignment.points_possible.unwrap_or(0.0);

            if !assignment.has_submitted_submissions {
                data.missing.push(MissingQuizEntry {
                    quiz_id,
                    quiz_title: assignment.name,
                    points_possible,
                    due_at: assignment.due_at,
                    status: "not_submitted",
                });
                continue;
            }

            let submission = self
                .canvas
                .get_submission(canvas_course, assignment.id, canvas_user)
                .await
                .ok();

            match submission.and_then(|s| s.score.map(|score| (score, s))) {
                Some((score, submission)) => data.scores.push(QuizScoreEntry {
                    quiz_id,
                    quiz_title: assignment.name,
                    score,
                    points_possible,
                    submitted_at: submission.submitted_at,
                    workflow_state: submission
                        .workflow_state
                        .unwrap_or_else(|| "submitted".into()),
                }),
                // Submitted but not yet graded.
                None => data.missing.push(MissingQuizEntry {
                    quiz_id,
                    quiz_title: assignment.name,
                    points_possible,
                    due_at: assignment.due_at,
                    status: "submitted_no_score",
                }),
            }
        }

        Ok(data)
    }

    /// Refresh the cached quiz completion status for every active learner.
    /// Canvas failures skip the user; store failures abort the run.
    pub async fn process_all_quiz_updates(&self) -> Result<QuizUpdateOutcome> {
        let users = self.store.quiz_update_candidates().await?;
        let mut outcome = QuizUpdateOutcome::default();

        for user in users {
            match self
                .fetch_user_quiz_scores(user.canvas_course_id, user.canvas_user_id)
                .await
            {
                Ok(data) => {
                    self.store
                        .update_quiz_status(
                            user.id,
                            &serde_json::to_value(&data.scores)?,
                            &serde_json::to_value(&data.missing)?,
                        )
                        .await?;
                    outcome.processed += 1;
                }
                Err(err) => {
                    tracing::warn!(user = user.canvas_user_id, error = %err,
                        "quiz status fetch failed");
                    outcome.errors += 1;
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn housekeeping_quizzes_are_excluded() {
        assert!(is_excluded_quiz("Terms of Use Quiz"));
        assert!(is_excluded_quiz("Welcome Quiz"));
        assert!(is_excluded_quiz("SYLLABUS QUIZ"));
        assert!(!is_excluded_quiz("Images"));
        assert!(!is_excluded_quiz("Exam 4"));
    }
}
