use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Registration lifecycle. A row holds exactly one status at a time; the
/// progression engine is the only writer after the registration form.
#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "registration_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Submitter,
    Active,
    Enrollee,
    Completer,
    Earner,
    Expired,
    Reenrolled,
    Review,
}

impl Status {
    /// The forward track, in order. Expired/reenrolled form the side branch.
    pub const TRACK: [Status; 6] = [
        Status::Submitter,
        Status::Active,
        Status::Enrollee,
        Status::Completer,
        Status::Earner,
        Status::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Submitter => "submitter",
            Status::Active => "active",
            Status::Enrollee => "enrollee",
            Status::Completer => "completer",
            Status::Earner => "earner",
            Status::Expired => "expired",
            Status::Reenrolled => "reenrolled",
            Status::Review => "review",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "deletion_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeletionStatus {
    Active,
    Deleted,
}

/// The fixed curriculum. Each key names one Canvas assignment whose external
/// id lives in the course_assignments table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentKey {
    OverviewOfDocumentAccessibility,
    Images,
    Hyperlinks,
    ContrastColorReliance,
    OptimizingWriting,
    Exam1,
    HeadingsInWord,
    OptimizingPowerpointPresentations,
    ListsColumns,
    Tables,
    Exam2,
    EvaluatingAccessibility,
    PracticingEvaluationRepair,
    CreatingPdfs,
    Exam3,
    IntroductionToOptimizingPdfs,
    CheckingAccessibility,
    ReadingOrderTool,
    ContentOrderAndTagsOrder,
    Exam4,
    TermsOfUse,
}

impl AssignmentKey {
    /// Graded curriculum items in evaluation order. The terms-of-use quiz is
    /// not part of the graded total; it only gates the enrollee transition.
    pub const CURRICULUM: [AssignmentKey; 20] = [
        AssignmentKey::OverviewOfDocumentAccessibility,
        AssignmentKey::Images,
        AssignmentKey::Hyperlinks,
        AssignmentKey::ContrastColorReliance,
        AssignmentKey::OptimizingWriting,
        AssignmentKey::Exam1,
        AssignmentKey::HeadingsInWord,
        AssignmentKey::OptimizingPowerpointPresentations,
        AssignmentKey::ListsColumns,
        AssignmentKey::Tables,
        AssignmentKey::Exam2,
        AssignmentKey::EvaluatingAccessibility,
        AssignmentKey::PracticingEvaluationRepair,
        AssignmentKey::CreatingPdfs,
        AssignmentKey::Exam3,
        AssignmentKey::IntroductionToOptimizingPdfs,
        AssignmentKey::CheckingAccessibility,
        AssignmentKey::ReadingOrderTool,
        AssignmentKey::ContentOrderAndTagsOrder,
        AssignmentKey::Exam4,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentKey::OverviewOfDocumentAccessibility => "overview_of_document_accessibility",
            AssignmentKey::Images => "images",
            AssignmentKey::Hyperlinks => "hyperlinks",
            AssignmentKey::ContrastColorReliance => "contrast_color_reliance",
            AssignmentKey::OptimizingWriting => "optimizing_writing",
            AssignmentKey::Exam1 => "exam_1",
            AssignmentKey::HeadingsInWord => "headings_in_word",
            AssignmentKey::OptimizingPowerpointPresentations => {
                "optimizing_powerpoint_presentations"
            }
            AssignmentKey::ListsColumns => "lists_columns",
            AssignmentKey::Tables => "tables",
            AssignmentKey::Exam2 => "exam_2",
            AssignmentKey::EvaluatingAccessibility => "evaluating_accessibility",
            AssignmentKey::PracticingEvaluationRepair => "practicing_evaluation_repair",
            AssignmentKey::CreatingPdfs => "creating_pdfs",
            AssignmentKey::Exam3 => "exam_3",
            AssignmentKey::IntroductionToOptimizingPdfs => "introduction_to_optimizing_pdfs",
            AssignmentKey::CheckingAccessibility => "checking_accessibility",
            AssignmentKey::ReadingOrderTool => "reading_order_tool",
            AssignmentKey::ContentOrderAndTagsOrder => "content_order_and_tags_order",
            AssignmentKey::Exam4 => "exam_4",
            AssignmentKey::TermsOfUse => "terms_of_use",
        }
    }

    pub fn parse(s: &str) -> Option<AssignmentKey> {
        AssignmentKey::CURRICULUM
            .iter()
            .chain(std::iter::once(&AssignmentKey::TermsOfUse))
            .copied()
            .find(|k| k.as_str() == s)
    }

    pub fn is_exam(&self) -> bool {
        matches!(
            self,
            AssignmentKey::Exam1 | AssignmentKey::Exam2 | AssignmentKey::Exam3 | AssignmentKey::Exam4
        )
    }

    /// Match a Canvas assignment title to a curriculum key. Titles are
    /// normalized the same way the course builder derives keys: lowercased,
    /// punctuation dropped, words joined with underscores.
    pub fn from_assignment_name(name: &str) -> Option<AssignmentKey> {
        let lowered = name.to_lowercase();
        if lowered.contains("terms of use") {
            return Some(AssignmentKey::TermsOfUse);
        }
        AssignmentKey::parse(&normalize_title(name))
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_title(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Milestone date columns, written once when the matching transition fires
/// and never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Enrolled,
    Earner,
    Reenrolled,
}

impl Milestone {
    pub fn column(&self) -> &'static str {
        match self {
            Milestone::Enrolled => "enrolleddate",
            Milestone::Earner => "earnerdate",
            Milestone::Reenrolled => "reenrolleddate",
        }
    }
}

/// Per-course map of curriculum key -> Canvas assignment id. A missing entry
/// means discovery has not found that assignment yet; checks against it are
/// skipped, never errors.
#[derive(Debug, Clone, Default)]
pub struct AssignmentMap {
    ids: HashMap<AssignmentKey, i64>,
}

impl AssignmentMap {
    pub fn from_rows(rows: impl IntoIterator<Item = (String, Option<i64>)>) -> Self {
        let mut ids = HashMap::new();
        for (key, id) in rows {
            if let (Some(key), Some(id)) = (AssignmentKey::parse(&key), id) {
                ids.insert(key, id);
            }
        }
        AssignmentMap { ids }
    }

    pub fn get(&self, key: AssignmentKey) -> Option<i64> {
        self.ids.get(&key).copied()
    }

    pub fn insert(&mut self, key: AssignmentKey, id: i64) {
        self.ids.insert(key, id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub canvas_course_id: Option<i64>,
    pub course_title: String,
    pub course_code: Option<String>,
    pub cohort: Option<String>,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub total_quiz_points: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Registration {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub canvas_user_id: Option<i64>,
    pub course_id: Option<Uuid>,
    pub status: Status,
    pub deletion_status: DeletionStatus,
    pub enrolleddate: Option<DateTime<Utc>>,
    pub earnerdate: Option<DateTime<Utc>>,
    pub certificatesent: Option<DateTime<Utc>>,
    pub reenrolleddate: Option<DateTime<Utc>>,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Joined registration+course row matching the progression selection filter:
/// both external ids are present, so the non-Option fields are safe.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ProgressibleRow {
    pub id: Uuid,
    pub email: String,
    pub status: Status,
    pub canvas_user_id: i64,
    pub course_id: Uuid,
    pub canvas_course_id: i64,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ExpiredUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub cohort: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct CronHistory {
    pub id: Uuid,
    pub job: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: f64,
    pub status: String,
    pub summary: Option<serde_json::Value>,
    pub errors: Option<serde_json::Value>,
    pub steps: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatusCount {
    pub status: Status,
    pub count: i64,
}

#[derive(Serialize, Debug, Clone)]
pub struct ReportSummary {
    pub total_registrations: i64,
    pub by_status: Vec<StatusCount>,
    pub certificates_issued: i64,
    pub total_courses: i64,
    pub open_courses: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curriculum_is_twenty_items_with_four_exams() {
        assert_eq!(AssignmentKey::CURRICULUM.len(), 20);
        let exams = AssignmentKey::CURRICULUM.iter().filter(|k| k.is_exam()).count();
        assert_eq!(exams, 4);
        // exam 4 is evaluated last
        assert_eq!(AssignmentKey::CURRICULUM[19], AssignmentKey::Exam4);
        // terms of use is not part of the graded curriculum
        assert!(!AssignmentKey::CURRICULUM.contains(&AssignmentKey::TermsOfUse));
    }

    #[test]
    fn assignment_key_roundtrip() {
        for key in AssignmentKey::CURRICULUM {
            assert_eq!(AssignmentKey::parse(key.as_str()), Some(key));
        }
        assert_eq!(
            AssignmentKey::parse("terms_of_use"),
            Some(AssignmentKey::TermsOfUse)
        );
        assert_eq!(AssignmentKey::parse("bogus"), None);
    }

    #[test]
    fn assignment_name_matching() {
        assert_eq!(
            AssignmentKey::from_assignment_name("Headings in Word"),
            Some(AssignmentKey::HeadingsInWord)
        );
        assert_eq!(
            AssignmentKey::from_assignment_name("Exam 1"),
            Some(AssignmentKey::Exam1)
        );
        assert_eq!(
            AssignmentKey::from_assignment_name("Terms of Use Quiz"),
            Some(AssignmentKey::TermsOfUse)
        );
        assert_eq!(AssignmentKey::from_assignment_name("Midterm Survey"), None);
    }

    #[test]
    fn assignment_map_ignores_unknown_keys_and_null_ids() {
        let map = AssignmentMap::from_rows(vec![
            ("exam_1".to_string(), Some(101)),
            ("exam_2".to_string(), None),
            ("not_a_key".to_string(), Some(999)),
        ]);
        assert_eq!(map.get(AssignmentKey::Exam1), Some(101));
        assert_eq!(map.get(AssignmentKey::Exam2), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn status_track_order() {
        assert_eq!(
            Status::TRACK,
            [
                Status::Submitter,
                Status::Active,
                Status::Enrollee,
                Status::Completer,
                Status::Earner,
                Status::Review
            ]
        );
        assert_eq!(Status::Earner.to_string(), "earner");
    }
}
