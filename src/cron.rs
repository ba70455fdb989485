//! Scheduled job entry points. The daily run advances registrations and
//! refreshes the quiz cache; the weekly run adds the expiry sweep, course
//! import, and points recompute; the trigger variant records a durable
//! cron_history row per execution.

use crate::canvas::CanvasClient;
use crate::config::AppConfig;
use crate::db::Db;
use crate::mailer::{self, Mailer};
use crate::models::{AssignmentKey, Status};
use crate::progression::{decide, Evidence, ProgressionEngine, RunStats};
use crate::store::Store;
use crate::tracker::{BatchOutcome, QuizTracker, QuizUpdateOutcome};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::time::Duration;

/// Points recomputes are batched and paced so one run cannot overwhelm the
/// Canvas API.
pub const POINTS_BATCH_SIZE: i64 = 50;
pub const INTER_CALL_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct JobContext {
    pub store: Store,
    pub canvas: CanvasClient,
    pub mailer: Mailer,
    pub config: AppConfig,
}

impl JobContext {
    pub fn new(config: AppConfig, db: Db) -> Result<Self> {
        let canvas = CanvasClient::new(&config.canvas)?;
        let mailer = Mailer::new(config.mailgun.clone());
        Ok(JobContext {
            store: Store::new(db),
            canvas,
            mailer,
            config,
        })
    }

    pub fn tracker(&self) -> QuizTracker {
        QuizTracker::new(self.canvas.clone(), self.store.clone())
    }

    pub fn engine(&self) -> ProgressionEngine {
        ProgressionEngine::new(self.canvas.clone(), self.store.clone(), self.tracker())
    }
}

#[derive(Serialize, Debug)]
pub struct DailySummary {
    pub progression: RunStats,
    pub quiz: QuizUpdateOutcome,
}

#[derive(Serialize, Debug, Default)]
pub struct ImportOutcome {
    pub seen: usize,
    pub imported: usize,
    pub assignments_discovered: usize,
    pub errors: usize,
}

#[derive(Serialize, Debug)]
pub struct WeeklySummary {
    pub reenrolled_checked: usize,
    pub reenrolled_advanced: usize,
    pub expired: u64,
    pub emails_sent: usize,
    pub emails_failed: usize,
    pub quiz: QuizUpdateOutcome,
    pub import: ImportOutcome,
    pub points: BatchOutcome,
}

#[derive(Serialize, Debug, Clone)]
pub struct StepRecord {
    pub step: &'static str,
    pub status: &'static str,
    pub message: String,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
pub struct CronOutcome {
    pub job: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: f64,
    pub status: String,
    pub steps: Vec<StepRecord>,
    pub errors: Vec<String>,
    pub summary: serde_json::Map<String, serde_json::Value>,
}

impl CronOutcome {
    fn begin(job: &str) -> Self {
        CronOutcome {
            job: job.to_string(),
            start_time: Utc::now(),
            end_time: None,
            duration: 0.0,
            status: "running".into(),
            steps: Vec::new(),
            errors: Vec::new(),
            summary: serde_json::Map::new(),
        }
    }

    fn step(&mut self, step: &'static str, status: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(step, status, "{message}");
        self.steps.push(StepRecord {
            step,
            status,
            message,
        });
    }

    fn record(&mut self, key: &str, value: serde_json::Value) {
        self.summary.insert(key.to_string(), value);
    }

    fn finish(&mut self, status: &str) {
        let end = Utc::now();
        self.duration = (end - self.start_time).num_milliseconds() as f64 / 1000.0;
        self.end_time = Some(end);
        self.status = status.to_string();
    }
}

/// Daily run: progression pass, then the cheap per-user quiz cache refresh.
/// Course import and points recompute are deferred to the weekly run to
/// bound daily runtime. Returns None when another run holds the lock.
pub async fn run_daily(ctx: &JobContext) -> Result<Option<DailySummary>> {
    let Some(lock) = ctx.store.try_run_lock().await? else {
        tracing::warn!("daily run skipped: another scheduler run holds the lock");
        return Ok(None);
    };

    tracing::info!("daily cron started");
    let progression = ctx.engine().run_pass().await?;
    let quiz = ctx.tracker().process_all_quiz_updates().await?;
    tracing::info!(
        updates = progression.updated,
        errors = progression.errors,
        quiz_processed = quiz.processed,
        quiz_errors = quiz.errors,
        "daily cron completed"
    );
    tracing::info!("course import skipped (weekly run handles it)");

    lock.release().await?;
    Ok(Some(DailySummary { progression, quiz }))
}

/// Weekly run: re-enrolled eligibility recheck, expiry sweep + email, quiz
/// cache refresh, Canvas course import, and the batched points recompute.
pub async fn run_weekly(ctx: &JobContext) -> Result<Option<WeeklySummary>> {
    let Some(lock) = ctx.store.try_run_lock().await? else {
        tracing::warn!("weekly run skipped: another scheduler run holds the lock");
        return Ok(None);
    };

    tracing::info!("weekly cron started");
    let tracker = ctx.tracker();

    // 1. Re-enrolled users: recheck certificate eligibility, and on success
    // invite them into the review cohort.
    let candidates = ctx.store.reenrolled_candidates().await?;
    let reenrolled_checked = candidates.len();
    let mut reenrolled_advanced = 0;
    for row in candidates {
        let map = ctx.store.assignment_map(row.course_id).await?;
        let agg = tracker
            .aggregate_user_scores(row.canvas_course_id, row.canvas_user_id, &map)
            .await;
        if let Some(transition) = decide(Status::Reenrolled, &Evidence::Scores(&agg)) {
            ctx.store
                .advance(row.id, transition.to, transition.milestone)
                .await?;
            reenrolled_advanced += 1;
            tracing::info!(email = %row.email, "re-enrolled user earned certificate");
            if let Err(err) = ctx
                .canvas
                .create_enrollment(row.canvas_course_id, row.canvas_user_id, "invited")
                .await
            {
                tracing::warn!(email = %row.email, error = %err,
                    "review cohort enrollment failed");
            }
        }
    }

    // 2. Cohorts that closed in the last week: expire unfinished rows and
    // offer re-enrollment by email.
    let closed = ctx.store.recently_closed_courses().await?;
    let mut expired = 0;
    let mut emails_sent = 0;
    let mut emails_failed = 0;
    if !closed.is_empty() {
        expired = ctx.store.expire_unfinished(&closed).await?;
        tracing::info!(courses = closed.len(), expired, "expiry sweep done");
        for user in ctx.store.expired_in_courses(&closed).await? {
            let body = mailer::reenroll_body(
                &user.name,
                user.cohort.as_deref().unwrap_or("your cohort"),
                ctx.config.reenrollment_fee,
                &ctx.config.reenroll_url,
            );
            match ctx
                .mailer
                .send(&user.email, mailer::REENROLL_SUBJECT, &body)
                .await
            {
                Ok(()) => emails_sent += 1,
                Err(err) => {
                    emails_failed += 1;
                    tracing::warn!(email = %user.email, error = %err,
                        "re-enrollment email failed");
                }
            }
        }
    }

    // 3. Quiz cache refresh for all active learners.
    let quiz = tracker.process_all_quiz_updates().await?;

    // 4. New course discovery from Canvas.
    let import = import_courses(ctx).await?;

    // 5. Batched points recompute for courses without a cached total.
    let points = recompute_points_batch(ctx, false).await?;

    tracing::info!(
        imported = import.imported,
        points_ok = points.successful,
        points_failed = points.failed,
        "weekly cron completed"
    );

    lock.release().await?;
    Ok(Some(WeeklySummary {
        reenrolled_checked,
        reenrolled_advanced,
        expired,
        emails_sent,
        emails_failed,
        quiz,
        import,
        points,
    }))
}

/// The optimized manual/scheduled trigger: same work as the daily run plus
/// the fast-path points batch, with per-step records persisted to
/// cron_history as the execution audit trail.
pub async fn run_trigger(ctx: &JobContext) -> Result<Option<CronOutcome>> {
    let Some(lock) = ctx.store.try_run_lock().await? else {
        tracing::warn!("trigger skipped: another scheduler run holds the lock");
        return Ok(None);
    };

    let mut outcome = CronOutcome::begin("trigger");

    let result: Result<()> = async {
        outcome.step("progression", "started", "running progression pass");
        let stats = ctx.engine().run_pass().await?;
        outcome.record("progression_updated", json!(stats.updated));
        outcome.record("progression_errors", json!(stats.errors));
        outcome.step(
            "progression",
            "completed",
            format!("{} updates, {} errors", stats.updated, stats.errors),
        );

        outcome.step("quiz_tracking", "started", "refreshing quiz status cache");
        let quiz = ctx.tracker().process_all_quiz_updates().await?;
        outcome.record("quiz_processed", json!(quiz.processed));
        outcome.record("quiz_errors", json!(quiz.errors));
        outcome.step(
            "quiz_tracking",
            "completed",
            format!("{} processed, {} errors", quiz.processed, quiz.errors),
        );

        outcome.step("points_batch", "started", "recomputing course points (fast path)");
        let points = recompute_points_batch(ctx, true).await?;
        outcome.record("points_successful", json!(points.successful));
        outcome.record("points_failed", json!(points.failed));
        outcome.step(
            "points_batch",
            "completed",
            format!(
                "{} of {} courses updated, {} failed",
                points.successful, points.total, points.failed
            ),
        );

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            outcome.finish("completed");
            outcome.step("finalize", "completed", format!("done in {:.2}s", outcome.duration));
        }
        Err(err) => {
            outcome.errors.push(err.to_string());
            outcome.finish("error");
            tracing::error!(error = %err, "trigger run failed");
        }
    }

    // History write failures must not mask the run itself.
    if let Err(err) = ctx
        .store
        .insert_cron_history(
            &outcome.job,
            outcome.start_time,
            outcome.end_time,
            outcome.duration,
            &outcome.status,
            &serde_json::to_value(&outcome.summary).unwrap_or_default(),
            &serde_json::to_value(&outcome.errors).unwrap_or_default(),
            &serde_json::to_value(&outcome.steps).unwrap_or_default(),
        )
        .await
    {
        tracing::warn!(error = %err, "failed to store cron history");
    }

    lock.release().await?;
    Ok(Some(outcome))
}

/// Discover Canvas courses the local database has never seen, then map
/// their curriculum assignment ids.
pub async fn import_courses(ctx: &JobContext) -> Result<ImportOutcome> {
    let mut outcome = ImportOutcome::default();

    let known: HashSet<i64> = ctx.store.known_canvas_course_ids().await?.into_iter().collect();
    let courses = match ctx.canvas.list_account_courses().await {
        Ok(courses) => courses,
        Err(err) => {
            tracing::warn!(error = %err, "course listing failed, skipping import");
            outcome.errors += 1;
            return Ok(outcome);
        }
    };

    outcome.seen = courses.len();
    for course in courses {
        if known.contains(&course.id) {
            continue;
        }
        if ctx.store.insert_course(&course).await? {
            outcome.imported += 1;
            tracing::info!(course = course.id, title = course.name.as_deref().unwrap_or(""),
                "course imported");
            if let Some(row) = ctx.store.course_by_canvas_id(course.id).await? {
                match discover_assignments(ctx, row.id, course.id).await {
                    Ok(found) => outcome.assignments_discovered += found,
                    Err(err) => {
                        outcome.errors += 1;
                        tracing::warn!(course = course.id, error = %err,
                            "assignment discovery failed");
                    }
                }
            }
        }
    }

    Ok(outcome)
}

/// Match a course's Canvas assignments to curriculum keys by title and
/// store the ids. Unmatched assignments are left alone.
pub async fn discover_assignments(
    ctx: &JobContext,
    course_row_id: uuid::Uuid,
    canvas_course_id: i64,
) -> Result<usize> {
    let assignments = ctx.canvas.list_assignments(canvas_course_id).await?;
    let mut found = 0;
    for assignment in &assignments {
        if let Some(key) = AssignmentKey::from_assignment_name(&assignment.name) {
            ctx.store
                .set_assignment_id(course_row_id, key, assignment.id)
                .await?;
            found += 1;
            tracing::info!(course = canvas_course_id, key = %key, id = assignment.id,
                "assignment id discovered");
        }
    }
    Ok(found)
}

/// Recompute cached point totals for a bounded batch of courses, pacing
/// calls with a small delay. The fast path sums the quizzes listing; the
/// full path uses the gradable-points breakdown over assignments.
pub async fn recompute_points_batch(ctx: &JobContext, fast: bool) -> Result<BatchOutcome> {
    let batch = ctx.store.courses_needing_points(POINTS_BATCH_SIZE).await?;
    let tracker = ctx.tracker();
    let mut outcome = BatchOutcome {
        total: batch.len(),
        ..Default::default()
    };

    for (_, canvas_id) in batch {
        let result: Result<()> = if fast {
            match ctx.canvas.list_quizzes(canvas_id).await {
                Ok(quizzes) => {
                    let total: f64 = quizzes
                        .iter()
                        .filter_map(|q| q.points_possible)
                        .filter(|p| *p > 0.0)
                        .sum();
                    ctx.store.set_course_points(canvas_id, total).await?;
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        } else {
            tracker.update_course_points(canvas_id).await.map(|_| ())
        };

        match result {
            Ok(()) => outcome.successful += 1,
            Err(err) => {
                outcome.failed += 1;
                outcome.errors.push(format!("course {canvas_id}: {err}"));
                tracing::warn!(course = canvas_id, error = %err, "points recompute failed");
            }
        }

        tokio::time::sleep(INTER_CALL_DELAY).await;
    }

    Ok(outcome)
}
