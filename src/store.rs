//! All SQL lives here. Progression and reporting queries always exclude
//! soft-deleted rows; a store failure is fatal to the calling run.

use crate::canvas::CanvasCourse;
use crate::db::Db;
use crate::models::{
    AssignmentKey, AssignmentMap, Course, CronHistory, ExpiredUser, Milestone, ProgressibleRow,
    Registration, ReportSummary, Status, StatusCount,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Advisory lock key guarding scheduler runs; overlapping invocations bail
/// out instead of double-processing rows.
const RUN_LOCK_KEY: i64 = 0x636f_686f;

#[derive(Clone)]
pub struct Store {
    db: Db,
}

/// Holds the scheduler advisory lock on a dedicated connection until
/// released. If the process dies the lock dies with the session.
pub struct RunLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

impl RunLock {
    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

impl Store {
    pub fn new(db: Db) -> Self {
        Store { db }
    }

    pub async fn try_run_lock(&self) -> Result<Option<RunLock>, sqlx::Error> {
        let mut conn = self.db.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked.then_some(RunLock { conn }))
    }

    // --- progression queries ---

    /// Rows the engine may touch: real, LMS-linked registrations on the
    /// forward track. Everything else is never advanced.
    pub async fn progressible(&self) -> Result<Vec<ProgressibleRow>, sqlx::Error> {
        sqlx::query_as::<_, ProgressibleRow>(
            r#"
            SELECT r.id, r.email, r.status, r.canvas_user_id,
                   c.id AS course_id, c.canvas_course_id
            FROM registrations r
            JOIN courses c ON r.course_id = c.id
            WHERE r.status IN ('submitter', 'active', 'enrollee', 'completer', 'earner')
              AND r.canvas_user_id IS NOT NULL
              AND r.course_id IS NOT NULL
              AND c.canvas_course_id IS NOT NULL
              AND r.deletion_status = 'active'
            ORDER BY r.created_at
            "#,
        )
        .fetch_all(&self.db)
        .await
    }

    pub async fn assignment_map(&self, course_id: Uuid) -> Result<AssignmentMap, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, Option<i64>)>(
            "SELECT assignment_key, canvas_assignment_id FROM course_assignments WHERE course_id = $1",
        )
        .bind(course_id)
        .fetch_all(&self.db)
        .await?;
        Ok(AssignmentMap::from_rows(rows))
    }

    pub async fn advance(
        &self,
        id: Uuid,
        to: Status,
        milestone: Option<Milestone>,
    ) -> Result<(), sqlx::Error> {
        match milestone {
            None => {
                sqlx::query("UPDATE registrations SET status = $2, updated_at = now() WHERE id = $1")
                    .bind(id)
                    .bind(to)
                    .execute(&self.db)
                    .await?;
            }
            Some(m) => {
                // COALESCE keeps milestone dates append-only.
                let sql = format!(
                    "UPDATE registrations SET status = $2, {col} = COALESCE({col}, now()), \
                     updated_at = now() WHERE id = $1",
                    col = m.column()
                );
                sqlx::query(&sql).bind(id).bind(to).execute(&self.db).await?;
            }
        }
        Ok(())
    }

    // --- weekly sweep ---

    pub async fn recently_closed_courses(&self) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT id FROM courses
            WHERE close_date >= CURRENT_DATE - INTERVAL '7 days'
              AND close_date <= CURRENT_DATE
            "#,
        )
        .fetch_all(&self.db)
        .await
    }

    /// Expire rows that started but did not finish in a closed cohort.
    pub async fn expire_unfinished(&self, course_ids: &[Uuid]) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE registrations SET status = 'expired', updated_at = now()
            WHERE course_id = ANY($1)
              AND status IN ('enrollee', 'completer')
              AND deletion_status = 'active'
            "#,
        )
        .bind(course_ids)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn expired_in_courses(
        &self,
        course_ids: &[Uuid],
    ) -> Result<Vec<ExpiredUser>, sqlx::Error> {
        sqlx::query_as::<_, ExpiredUser>(
            r#"
            SELECT r.id, r.name, r.email, c.cohort
            FROM registrations r
            JOIN courses c ON r.course_id = c.id
            WHERE r.course_id = ANY($1)
              AND r.status = 'expired'
              AND r.deletion_status = 'active'
            "#,
        )
        .bind(course_ids)
        .fetch_all(&self.db)
        .await
    }

    /// Re-enrolled users with activity in the last day, due an eligibility
    /// recheck.
    pub async fn reenrolled_candidates(&self) -> Result<Vec<ProgressibleRow>, sqlx::Error> {
        sqlx::query_as::<_, ProgressibleRow>(
            r#"
            SELECT r.id, r.email, r.status, r.canvas_user_id,
                   c.id AS course_id, c.canvas_course_id
            FROM registrations r
            JOIN courses c ON r.course_id = c.id
            WHERE r.status = 'reenrolled'
              AND r.last_activity_date >= now() - INTERVAL '24 hours'
              AND r.canvas_user_id IS NOT NULL
              AND c.canvas_course_id IS NOT NULL
              AND r.deletion_status = 'active'
            "#,
        )
        .fetch_all(&self.db)
        .await
    }

    // --- quiz status cache ---

    pub async fn quiz_update_candidates(&self) -> Result<Vec<ProgressibleRow>, sqlx::Error> {
        sqlx::query_as::<_, ProgressibleRow>(
            r#"
            SELECT r.id, r.email, r.status, r.canvas_user_id,
                   c.id AS course_id, c.canvas_course_id
            FROM registrations r
            JOIN courses c ON r.course_id = c.id
            WHERE r.status IN ('active', 'enrollee', 'completer')
              AND r.canvas_user_id IS NOT NULL
              AND c.canvas_course_id IS NOT NULL
              AND r.deletion_status = 'active'
            "#,
        )
        .fetch_all(&self.db)
        .await
    }

    pub async fn update_quiz_status(
        &self,
        id: Uuid,
        scores: &serde_json::Value,
        missing: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE registrations
            SET quiz_completion_status = $2, missing_quizzes = $3, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(scores)
        .bind(missing)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // --- courses ---

    pub async fn courses_with_canvas_id(&self) -> Result<Vec<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>(
            "SELECT * FROM courses WHERE canvas_course_id IS NOT NULL ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await
    }

    pub async fn course_by_canvas_id(&self, canvas_id: i64) -> Result<Option<Course>, sqlx::Error> {
        sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE canvas_course_id = $1")
            .bind(canvas_id)
            .fetch_optional(&self.db)
            .await
    }

    /// Courses whose cached point total has never been computed; processed
    /// in bounded batches to cap external-call volume per run.
    pub async fn courses_needing_points(&self, limit: i64) -> Result<Vec<(Uuid, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT id, canvas_course_id FROM courses
            WHERE canvas_course_id IS NOT NULL
              AND (total_quiz_points IS NULL OR total_quiz_points = 0)
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }

    pub async fn set_course_points(&self, canvas_id: i64, total: f64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE courses SET total_quiz_points = $2, updated_at = now() WHERE canvas_course_id = $1",
        )
        .bind(canvas_id)
        .bind(total)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn known_canvas_course_ids(&self) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT canvas_course_id FROM courses WHERE canvas_course_id IS NOT NULL")
            .fetch_all(&self.db)
            .await
    }

    /// Insert a discovered Canvas course; existing rows are left untouched.
    pub async fn insert_course(&self, course: &CanvasCourse) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO courses (id, canvas_course_id, course_title, course_code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (canvas_course_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(course.id)
        .bind(course.name.clone().unwrap_or_else(|| "Unnamed Course".into()))
        .bind(course.course_code.clone())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_assignment_id(
        &self,
        course_id: Uuid,
        key: AssignmentKey,
        canvas_assignment_id: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO course_assignments (course_id, assignment_key, canvas_assignment_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (course_id, assignment_key)
            DO UPDATE SET canvas_assignment_id = EXCLUDED.canvas_assignment_id
            "#,
        )
        .bind(course_id)
        .bind(key.as_str())
        .bind(canvas_assignment_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // --- cron history ---

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_cron_history(
        &self,
        job: &str,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        duration: f64,
        status: &str,
        summary: &serde_json::Value,
        errors: &serde_json::Value,
        steps: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO cron_history (id, job, start_time, end_time, duration, status, summary, errors, steps)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job)
        .bind(start_time)
        .bind(end_time)
        .bind(duration)
        .bind(status)
        .bind(summary)
        .bind(errors)
        .bind(steps)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn recent_cron_history(&self, limit: i64) -> Result<Vec<CronHistory>, sqlx::Error> {
        sqlx::query_as::<_, CronHistory>(
            "SELECT * FROM cron_history ORDER BY start_time DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }

    // --- reporting ---

    pub async fn recent_registrations(&self, limit: i64) -> Result<Vec<Registration>, sqlx::Error> {
        sqlx::query_as::<_, Registration>(
            r#"
            SELECT * FROM registrations
            WHERE deletion_status = 'active'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }

    pub async fn report_summary(&self) -> Result<ReportSummary, sqlx::Error> {
        let by_status = sqlx::query_as::<_, (Status, i64)>(
            r#"
            SELECT status, COUNT(*) AS count
            FROM registrations
            WHERE deletion_status = 'active'
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect::<Vec<_>>();

        let total_registrations = by_status.iter().map(|s| s.count).sum();

        let certificates_issued: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM registrations WHERE earnerdate IS NOT NULL AND deletion_status = 'active'",
        )
        .fetch_one(&self.db)
        .await?;

        let total_courses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM courses")
            .fetch_one(&self.db)
            .await?;

        let open_courses: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM courses WHERE open_date <= CURRENT_DATE AND close_date >= CURRENT_DATE",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(ReportSummary {
            total_registrations,
            by_status,
            certificates_issued,
            total_courses,
            open_courses,
        })
    }
}
