//! Thin client for the Canvas REST API. No retries, no caching: every cron
//! run polls fresh, and callers decide whether a failure skips the row or
//! aborts the batch.

use crate::config::CanvasConfig;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Per-call timeout for polling endpoints.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("canvas returned HTTP {status} for {endpoint}")]
    Status { status: StatusCode, endpoint: String },

    #[error("canvas request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    Invited,
    Active,
    Completed,
    Inactive,
    #[serde(other)]
    Unknown,
}

impl EnrollmentState {
    /// The user has accepted the invite (or finished the course).
    pub fn is_participating(&self) -> bool {
        matches!(self, EnrollmentState::Active | EnrollmentState::Completed)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Enrollment {
    pub id: Option<i64>,
    pub enrollment_state: Option<EnrollmentState>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Submission {
    pub score: Option<f64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub workflow_state: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Assignment {
    pub id: i64,
    pub name: String,
    pub points_possible: Option<f64>,
    #[serde(default)]
    pub omit_from_final_grade: bool,
    #[serde(default)]
    pub is_quiz_assignment: bool,
    #[serde(default)]
    pub has_submitted_submissions: bool,
    pub quiz_id: Option<i64>,
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: i64,
    pub title: Option<String>,
    pub points_possible: Option<f64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CanvasCourse {
    pub id: i64,
    pub name: Option<String>,
    pub course_code: Option<String>,
    pub public_description: Option<String>,
}

#[derive(Clone)]
pub struct CanvasClient {
    http: Client,
    base_url: String,
    token: String,
    account_id: i64,
}

impl CanvasClient {
    pub fn new(config: &CanvasConfig) -> Result<Self, CanvasError> {
        let http = Client::builder().timeout(CALL_TIMEOUT).build()?;
        Ok(CanvasClient {
            http,
            base_url: config.api_url.clone(),
            token: config.access_token.clone(),
            account_id: config.account_id,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CanvasError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CanvasError::Status {
                status: resp.status(),
                endpoint: path.to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    /// First enrollment of the user in the course, if any. An empty listing
    /// (user never invited) is `None`, not an error.
    pub async fn get_enrollment(
        &self,
        course: i64,
        user: i64,
    ) -> Result<Option<Enrollment>, CanvasError> {
        let enrollments: Vec<Enrollment> = self
            .get_json(
                &format!("/courses/{course}/enrollments"),
                &[("user_id", user.to_string())],
            )
            .await?;
        Ok(enrollments.into_iter().next())
    }

    pub async fn get_submission(
        &self,
        course: i64,
        assignment: i64,
        user: i64,
    ) -> Result<Submission, CanvasError> {
        self.get_json(
            &format!("/courses/{course}/assignments/{assignment}/submissions/{user}"),
            &[],
        )
        .await
    }

    pub async fn list_assignments(&self, course: i64) -> Result<Vec<Assignment>, CanvasError> {
        self.get_json(&format!("/courses/{course}/assignments"), &[]).await
    }

    /// Assignments with the user's submission context, used by the per-user
    /// quiz status cache.
    pub async fn list_user_course_assignments(
        &self,
        user: i64,
        course: i64,
    ) -> Result<Vec<Assignment>, CanvasError> {
        self.get_json(
            &format!("/users/{user}/courses/{course}/assignments"),
            &[("per_page", "100".to_string())],
        )
        .await
    }

    /// Quizzes-only listing; the fast path for batched points recomputes.
    pub async fn list_quizzes(&self, course: i64) -> Result<Vec<Quiz>, CanvasError> {
        self.get_json(&format!("/courses/{course}/quizzes"), &[]).await
    }

    pub async fn list_account_courses(&self) -> Result<Vec<CanvasCourse>, CanvasError> {
        self.get_json(
            &format!("/accounts/{}/courses", self.account_id),
            &[("per_page", "100".to_string())],
        )
        .await
    }

    pub async fn create_enrollment(
        &self,
        course: i64,
        user: i64,
        state: &str,
    ) -> Result<(), CanvasError> {
        let path = format!("/courses/{course}/enrollments");
        let body = json!({
            "enrollment": {
                "user_id": user,
                "type": "StudentEnrollment",
                "enrollment_state": state,
                "notify": true,
            }
        });
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CanvasError::Status {
                status: resp.status(),
                endpoint: path,
            });
        }
        Ok(())
    }

    /// Publish a course by sending the 'offer' event.
    pub async fn publish_course(&self, course: i64) -> Result<(), CanvasError> {
        let path = format!("/courses/{course}");
        let body = json!({ "course": { "event": "offer" } });
        let resp = self
            .http
            .put(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CanvasError::Status {
                status: resp.status(),
                endpoint: path,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_state_wire_format() {
        let e: Enrollment =
            serde_json::from_str(r#"{"id": 7, "enrollment_state": "active"}"#).unwrap();
        assert_eq!(e.enrollment_state, Some(EnrollmentState::Active));
        assert!(e.enrollment_state.unwrap().is_participating());

        let e: Enrollment =
            serde_json::from_str(r#"{"enrollment_state": "creation_pending"}"#).unwrap();
        assert_eq!(e.enrollment_state, Some(EnrollmentState::Unknown));
        assert!(!e.enrollment_state.unwrap().is_participating());

        assert!(!EnrollmentState::Invited.is_participating());
        assert!(EnrollmentState::Completed.is_participating());
    }

    #[test]
    fn submission_without_score_field() {
        let s: Submission =
            serde_json::from_str(r#"{"workflow_state": "unsubmitted"}"#).unwrap();
        assert!(s.score.is_none());

        let s: Submission = serde_json::from_str(r#"{"score": 0.0}"#).unwrap();
        assert_eq!(s.score, Some(0.0));
    }

    #[test]
    fn assignment_flag_defaults() {
        let a: Assignment =
            serde_json::from_str(r#"{"id": 1, "name": "Exam 1", "points_possible": 10}"#).unwrap();
        assert!(!a.omit_from_final_grade);
        assert!(!a.is_quiz_assignment);
        assert_eq!(a.points_possible, Some(10.0));
    }
}
