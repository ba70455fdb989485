//! Pure scoring rules: the gradable-points breakdown for a course and the
//! certificate eligibility bar applied to a user's aggregated scores.

use crate::canvas::Assignment;
use serde::Serialize;

/// Certificate policy. A pass requires every curriculum submission graded,
/// this many total points, and all four exams at or above the exam floor.
pub const CERTIFICATE_MIN_TOTAL_SCORE: f64 = 93.0;
pub const CERTIFICATE_EXAM_COUNT: usize = 4;
pub const CERTIFICATE_MIN_EXAM_SCORE: f64 = 8.0;

/// Score threshold treating a gated quiz (terms of use, exam 4) as done.
pub const COMPLETION_MIN_SCORE: f64 = 1.0;

#[derive(Serialize, Debug, Clone)]
pub struct AssignmentPoints {
    pub id: i64,
    pub name: String,
    pub points: f64,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct PointsBreakdown {
    pub total_points: f64,
    pub included: Vec<AssignmentPoints>,
    pub excluded: Vec<AssignmentPoints>,
    pub total_assignments: usize,
}

/// Sum points_possible over assignments that count toward the final grade.
/// Assignments flagged omit_from_final_grade are recorded but not summed;
/// zero-point assignments are ignored entirely.
pub fn gradable_points(assignments: &[Assignment]) -> PointsBreakdown {
    let mut breakdown = PointsBreakdown {
        total_assignments: assignments.len(),
        ..Default::default()
    };

    for assignment in assignments {
        let points = assignment.points_possible.unwrap_or(0.0);
        if points <= 0.0 {
            continue;
        }
        let entry = AssignmentPoints {
            id: assignment.id,
            name: assignment.name.clone(),
            points,
        };
        if assignment.omit_from_final_grade {
            breakdown.excluded.push(entry);
        } else {
            breakdown.total_points += points;
            breakdown.included.push(entry);
        }
    }

    breakdown
}

/// A user's scores aggregated across the fixed curriculum. `all_submitted`
/// flips false the moment any configured assignment has no score; the
/// aggregation loop stops there and the pass is void.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreAggregate {
    pub total_score: f64,
    pub exam_scores: Vec<f64>,
    pub all_submitted: bool,
}

impl ScoreAggregate {
    pub fn qualifies_for_certificate(&self) -> bool {
        self.all_submitted
            && self.total_score >= CERTIFICATE_MIN_TOTAL_SCORE
            && self.exam_scores.len() == CERTIFICATE_EXAM_COUNT
            && self
                .exam_scores
                .iter()
                .all(|s| *s >= CERTIFICATE_MIN_EXAM_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(id: i64, name: &str, points: f64, omit: bool) -> Assignment {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "points_possible": points,
            "omit_from_final_grade": omit,
        }))
        .unwrap()
    }

    #[test]
    fn omitted_assignment_excluded_from_total_but_recorded() {
        let assignments = vec![
            assignment(1, "Exam 1", 10.0, false),
            assignment(2, "Compliance Quiz", 50.0, true),
        ];
        let breakdown = gradable_points(&assignments);
        assert_eq!(breakdown.total_points, 10.0);
        assert_eq!(breakdown.included.len(), 1);
        assert_eq!(breakdown.excluded.len(), 1);
        assert_eq!(breakdown.excluded[0].points, 50.0);
        assert_eq!(breakdown.total_assignments, 2);
    }

    #[test]
    fn zero_point_assignments_are_ignored() {
        let assignments = vec![
            assignment(1, "Survey", 0.0, false),
            assignment(2, "Exam 1", 10.0, false),
        ];
        let breakdown = gradable_points(&assignments);
        assert_eq!(breakdown.total_points, 10.0);
        assert_eq!(breakdown.included.len(), 1);
        assert!(breakdown.excluded.is_empty());
    }

    #[test]
    fn eligibility_boundary_at_93() {
        let eligible = ScoreAggregate {
            total_score: 93.0,
            exam_scores: vec![10.0, 9.0, 10.0, 8.0],
            all_submitted: true,
        };
        assert!(eligible.qualifies_for_certificate());

        let short = ScoreAggregate {
            total_score: 92.0,
            ..eligible.clone()
        };
        assert!(!short.qualifies_for_certificate());
    }

    #[test]
    fn three_exam_scores_never_qualify() {
        let agg = ScoreAggregate {
            total_score: 120.0,
            exam_scores: vec![10.0, 10.0, 10.0],
            all_submitted: true,
        };
        assert!(!agg.qualifies_for_certificate());
    }

    #[test]
    fn exam_floor_applies_to_minimum() {
        let agg = ScoreAggregate {
            total_score: 100.0,
            exam_scores: vec![10.0, 9.0, 10.0, 7.5],
            all_submitted: true,
        };
        assert!(!agg.qualifies_for_certificate());
    }

    #[test]
    fn missing_submission_voids_the_pass() {
        let agg = ScoreAggregate {
            total_score: 100.0,
            exam_scores: vec![10.0, 9.0, 10.0, 8.0],
            all_submitted: false,
        };
        assert!(!agg.qualifies_for_certificate());
    }

    #[test]
    fn full_course_scenario_reaches_eligibility() {
        // Course: four 10-point exams, one 63-point quiz, one omitted
        // 1-point terms-of-use item.
        let assignments = vec![
            assignment(1, "Exam 1", 10.0, false),
            assignment(2, "Exam 2", 10.0, false),
            assignment(3, "Exam 3", 10.0, false),
            assignment(4, "Exam 4", 10.0, false),
            assignment(5, "Quiz 1", 63.0, false),
            assignment(6, "Terms of Use", 1.0, true),
        ];
        let breakdown = gradable_points(&assignments);
        assert_eq!(breakdown.total_points, 103.0);
        assert_eq!(breakdown.excluded.len(), 1);

        // User scores 10, 9, 10, 8 on the exams and 56 on the quiz.
        let agg = ScoreAggregate {
            total_score: 10.0 + 9.0 + 10.0 + 8.0 + 56.0,
            exam_scores: vec![10.0, 9.0, 10.0, 8.0],
            all_submitted: true,
        };
        assert_eq!(agg.total_score, 93.0);
        assert!(agg.qualifies_for_certificate());
    }
}
