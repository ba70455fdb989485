//! The status progression engine. Each run selects the LMS-linked rows on
//! the forward track and advances each at most one step, based on fresh
//! Canvas state. Transition decisions are pure functions over the fetched
//! evidence; only the apply step writes.

use crate::canvas::{CanvasClient, Enrollment, Submission};
use crate::models::{AssignmentKey, AssignmentMap, Milestone, ProgressibleRow, Status};
use crate::points::{ScoreAggregate, COMPLETION_MIN_SCORE};
use crate::store::Store;
use crate::tracker::QuizTracker;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: Status,
    pub milestone: Option<Milestone>,
}

/// What the engine fetched for one row, shaped by the row's current status.
#[derive(Debug)]
pub enum Evidence<'a> {
    /// submitter / earner: the user's enrollment in the course, if any.
    Enrollment(Option<&'a Enrollment>),
    /// active / enrollee: the gating quiz submission; `None` when the
    /// assignment id is not configured for the course.
    GateSubmission(Option<&'a Submission>),
    /// completer / reenrolled: the aggregated curriculum scores.
    Scores(&'a ScoreAggregate),
}

/// The transition rule table. Only the rule matching the row's current
/// status fires, so a row advances at most one step per run.
pub fn decide(status: Status, evidence: &Evidence) -> Option<Transition> {
    match (status, evidence) {
        (Status::Submitter, Evidence::Enrollment(enrollment)) => {
            enrollment_accepted(*enrollment).then_some(Transition {
                to: Status::Active,
                milestone: None,
            })
        }
        (Status::Active, Evidence::GateSubmission(submission)) => submission
            .filter(|s| gate_completed(s))
            .map(|_| Transition {
                to: Status::Enrollee,
                milestone: Some(Milestone::Enrolled),
            }),
        (Status::Enrollee, Evidence::GateSubmission(submission)) => submission
            .filter(|s| gate_completed(s))
            .map(|_| Transition {
                to: Status::Completer,
                milestone: None,
            }),
        (Status::Completer, Evidence::Scores(agg)) => {
            agg.qualifies_for_certificate().then_some(Transition {
                to: Status::Earner,
                milestone: Some(Milestone::Earner),
            })
        }
        (Status::Earner, Evidence::Enrollment(enrollment)) => {
            enrollment_accepted(*enrollment).then_some(Transition {
                to: Status::Review,
                milestone: None,
            })
        }
        (Status::Reenrolled, Evidence::Scores(agg)) => {
            agg.qualifies_for_certificate().then_some(Transition {
                to: Status::Earner,
                milestone: Some(Milestone::Earner),
            })
        }
        _ => None,
    }
}

fn enrollment_accepted(enrollment: Option<&Enrollment>) -> bool {
    enrollment
        .and_then(|e| e.enrollment_state)
        .is_some_and(|state| state.is_participating())
}

fn gate_completed(submission: &Submission) -> bool {
    submission.score.is_some_and(|s| s >= COMPLETION_MIN_SCORE)
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct RunStats {
    pub processed: usize,
    pub updated: usize,
    pub errors: usize,
}

pub struct ProgressionEngine {
    canvas: CanvasClient,
    store: Store,
    tracker: QuizTracker,
}

impl ProgressionEngine {
    pub fn new(canvas: CanvasClient, store: Store, tracker: QuizTracker) -> Self {
        ProgressionEngine {
            canvas,
            store,
            tracker,
        }
    }

    /// One progression pass over every eligible registration. Canvas
    /// failures skip the row for this run; store failures abort.
    pub async fn run_pass(&self) -> Result<RunStats> {
        let rows = self.store.progressible().await?;
        tracing::info!(count = rows.len(), "progression pass over eligible registrations");

        let mut stats = RunStats::default();
        let mut maps: HashMap<Uuid, AssignmentMap> = HashMap::new();

        for row in rows {
            stats.processed += 1;
            if !maps.contains_key(&row.course_id) {
                let map = self.store.assignment_map(row.course_id).await?;
                maps.insert(row.course_id, map);
            }
            let map = &maps[&row.course_id];

            match self.evaluate(&row, map).await {
                Ok(Some(transition)) => {
                    self.store
                        .advance(row.id, transition.to, transition.milestone)
                        .await?;
                    tracing::info!(email = %row.email, from = %row.status, to = %transition.to,
                        "registration advanced");
                    stats.updated += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(email = %row.email, status = %row.status, error = %err,
                        "canvas check failed, row left unchanged");
                    stats.errors += 1;
                }
            }
        }

        tracing::info!(updated = stats.updated, errors = stats.errors, "progression pass done");
        Ok(stats)
    }

    /// Fetch the evidence for the row's current status and apply the rule
    /// table. Returns Ok(None) when the row simply does not advance.
    async fn evaluate(
        &self,
        row: &ProgressibleRow,
        map: &AssignmentMap,
    ) -> Result<Option<Transition>, crate::canvas::CanvasError> {
        match row.status {
            Status::Submitter | Status::Earner => {
                let enrollment = self
                    .canvas
                    .get_enrollment(row.canvas_course_id, row.canvas_user_id)
                    .await?;
                let decision = decide(row.status, &Evidence::Enrollment(enrollment.as_ref()));
                if decision.is_none() {
                    tracing::debug!(email = %row.email, "enrollment not yet accepted");
                }
                Ok(decision)
            }
            Status::Active => {
                let Some(assignment_id) = map.get(AssignmentKey::TermsOfUse) else {
                    tracing::info!(email = %row.email,
                        "terms-of-use check skipped (assignment id not configured)");
                    return Ok(None);
                };
                let submission = self
                    .canvas
                    .get_submission(row.canvas_course_id, assignment_id, row.canvas_user_id)
                    .await?;
                Ok(decide(row.status, &Evidence::GateSubmission(Some(&submission))))
            }
            Status::Enrollee => {
                let Some(assignment_id) = map.get(AssignmentKey::Exam4) else {
                    return Ok(None);
                };
                let submission = self
                    .canvas
                    .get_submission(row.canvas_course_id, assignment_id, row.canvas_user_id)
                    .await?;
                Ok(decide(row.status, &Evidence::GateSubmission(Some(&submission))))
            }
            Status::Completer => {
                let agg = self
                    .tracker
                    .aggregate_user_scores(row.canvas_course_id, row.canvas_user_id, map)
                    .await;
                Ok(decide(row.status, &Evidence::Scores(&agg)))
            }
            // Not selected by the progression filter.
            Status::Expired | Status::Reenrolled | Status::Review => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::EnrollmentState;

    fn enrollment(state: &str) -> Enrollment {
        serde_json::from_str(&format!(r#"{{"enrollment_state": "{state}"}}"#)).unwrap()
    }

    fn submission(score: Option<f64>) -> Submission {
        match score {
            Some(s) => serde_json::from_str(&format!(r#"{{"score": {s}}}"#)).unwrap(),
            None => serde_json::from_str("{}").unwrap(),
        }
    }

    fn eligible_scores() -> ScoreAggregate {
        ScoreAggregate {
            total_score: 95.0,
            exam_scores: vec![10.0, 9.0, 10.0, 8.0],
            all_submitted: true,
        }
    }

    #[test]
    fn submitter_advances_on_accepted_enrollment() {
        let active = enrollment("active");
        let t = decide(Status::Submitter, &Evidence::Enrollment(Some(&active))).unwrap();
        assert_eq!(t.to, Status::Active);
        assert_eq!(t.milestone, None);

        let completed = enrollment("completed");
        assert!(decide(Status::Submitter, &Evidence::Enrollment(Some(&completed))).is_some());

        let invited = enrollment("invited");
        assert!(decide(Status::Submitter, &Evidence::Enrollment(Some(&invited))).is_none());
        assert!(decide(Status::Submitter, &Evidence::Enrollment(None)).is_none());
    }

    #[test]
    fn quiz_gates_require_minimum_score() {
        let passed = submission(Some(1.0));
        let t = decide(Status::Active, &Evidence::GateSubmission(Some(&passed))).unwrap();
        assert_eq!(t.to, Status::Enrollee);
        assert_eq!(t.milestone, Some(Milestone::Enrolled));

        let zero = submission(Some(0.0));
        assert!(decide(Status::Active, &Evidence::GateSubmission(Some(&zero))).is_none());

        let ungraded = submission(None);
        assert!(decide(Status::Enrollee, &Evidence::GateSubmission(Some(&ungraded))).is_none());

        // unconfigured assignment id: no advance, no error
        assert!(decide(Status::Active, &Evidence::GateSubmission(None)).is_none());

        let t = decide(Status::Enrollee, &Evidence::GateSubmission(Some(&passed))).unwrap();
        assert_eq!(t.to, Status::Completer);
    }

    #[test]
    fn completer_advances_only_when_eligible() {
        let t = decide(Status::Completer, &Evidence::Scores(&eligible_scores())).unwrap();
        assert_eq!(t.to, Status::Earner);
        assert_eq!(t.milestone, Some(Milestone::Earner));

        let mut short = eligible_scores();
        short.total_score = 92.0;
        assert!(decide(Status::Completer, &Evidence::Scores(&short)).is_none());
    }

    #[test]
    fn earner_moves_to_review_on_enrollment_recheck() {
        let active = enrollment("active");
        let t = decide(Status::Earner, &Evidence::Enrollment(Some(&active))).unwrap();
        assert_eq!(t.to, Status::Review);
    }

    #[test]
    fn reenrolled_rejoins_track_at_earner() {
        let t = decide(Status::Reenrolled, &Evidence::Scores(&eligible_scores())).unwrap();
        assert_eq!(t.to, Status::Earner);
        assert_eq!(t.milestone, Some(Milestone::Earner));
    }

    #[test]
    fn transitions_are_monotonic_along_the_track() {
        // Every forward-track transition targets the immediate successor.
        let active = enrollment("active");
        let passed = submission(Some(5.0));
        let scores = eligible_scores();
        let evidence: Vec<(Status, Evidence)> = vec![
            (Status::Submitter, Evidence::Enrollment(Some(&active))),
            (Status::Active, Evidence::GateSubmission(Some(&passed))),
            (Status::Enrollee, Evidence::GateSubmission(Some(&passed))),
            (Status::Completer, Evidence::Scores(&scores)),
            (Status::Earner, Evidence::Enrollment(Some(&active))),
        ];
        for (status, ev) in &evidence {
            let t = decide(*status, ev).unwrap();
            let here = Status::TRACK.iter().position(|s| s == status).unwrap();
            assert_eq!(Status::TRACK[here + 1], t.to);
        }
    }

    #[test]
    fn terminal_and_branch_statuses_never_advance_on_track_evidence() {
        let active = enrollment("active");
        assert!(decide(Status::Review, &Evidence::Enrollment(Some(&active))).is_none());
        assert!(decide(Status::Expired, &Evidence::Enrollment(Some(&active))).is_none());
        // a second run with unchanged state re-derives the same status
        let invited = enrollment("invited");
        assert!(decide(Status::Submitter, &Evidence::Enrollment(Some(&invited))).is_none());
    }

    #[test]
    fn wrong_evidence_shape_never_fires() {
        // Rules are keyed on (status, evidence) pairs; mismatches are inert.
        let scores = eligible_scores();
        assert!(decide(Status::Submitter, &Evidence::Scores(&scores)).is_none());
        let passed = submission(Some(1.0));
        assert!(decide(Status::Completer, &Evidence::GateSubmission(Some(&passed))).is_none());
    }

    #[test]
    fn participating_states() {
        assert!(EnrollmentState::Active.is_participating());
        assert!(EnrollmentState::Completed.is_participating());
        assert!(!EnrollmentState::Inactive.is_participating());
    }
}
