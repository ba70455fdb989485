use axum::http::StatusCode;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use std::sync::Arc;

use crate::cron::{self, CronOutcome, JobContext};
use crate::models::{CronHistory, Registration, ReportSummary};

pub fn router(ctx: Arc<JobContext>) -> Router {
    Router::new()
        // manual trigger + audit trail
        .route("/api/cron/run", post(run_cron))
        .route("/api/cron/history", get(cron_history))
        // dashboard data
        .route("/api/reports/summary", get(report_summary))
        .route("/api/registrations", get(registrations))
        .with_state(ctx)
}

/// When ADMIN_TOKEN is configured the trigger endpoint requires it as a
/// bearer token; without one the endpoint is open (trusted network).
fn authorize(
    ctx: &JobContext,
    auth: Option<&TypedHeader<Authorization<Bearer>>>,
) -> Result<(), (StatusCode, String)> {
    match &ctx.config.admin_token {
        None => Ok(()),
        Some(expected) => match auth {
            Some(TypedHeader(header)) if header.token() == expected => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "invalid or missing token".into())),
        },
    }
}

async fn run_cron(
    State(ctx): State<Arc<JobContext>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<CronOutcome>, (StatusCode, String)> {
    authorize(&ctx, auth.as_ref())?;
    match cron::run_trigger(&ctx).await.map_err(e500)? {
        Some(outcome) => Ok(Json(outcome)),
        None => Err((
            StatusCode::CONFLICT,
            "another scheduler run is in progress".into(),
        )),
    }
}

async fn cron_history(
    State(ctx): State<Arc<JobContext>>,
) -> Result<Json<Vec<CronHistory>>, (StatusCode, String)> {
    let history = ctx.store.recent_cron_history(20).await.map_err(e500)?;
    Ok(Json(history))
}

async fn report_summary(
    State(ctx): State<Arc<JobContext>>,
) -> Result<Json<ReportSummary>, (StatusCode, String)> {
    let summary = ctx.store.report_summary().await.map_err(e500)?;
    Ok(Json(summary))
}

async fn registrations(
    State(ctx): State<Arc<JobContext>>,
) -> Result<Json<Vec<Registration>>, (StatusCode, String)> {
    let rows = ctx.store.recent_registrations(100).await.map_err(e500)?;
    Ok(Json(rows))
}

// --- helpers ---

fn e500<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
