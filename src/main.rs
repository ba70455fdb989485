use anyhow::Result;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cohortsync::config::AppConfig;
use cohortsync::cron::{self, JobContext};
use cohortsync::{db, routes};

#[derive(Parser, Debug)]
#[command(name = "cohortsync", version, about = "Course registration sync against Canvas")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (manual trigger, cron history, reports)
    Serve,
    /// Daily run: progression pass + quiz status cache refresh
    Daily,
    /// Weekly run: expiry sweep, emails, course import, points recompute
    Weekly,
    /// Optimized trigger run, recorded to cron_history
    Trigger,
    /// Quiz score tracker utilities
    Tracker {
        #[command(subcommand)]
        command: TrackerCommand,
    },
    /// Discover curriculum assignment ids by title, for one course or all
    DiscoverAssignments {
        /// Canvas course id; omit to process every known course
        course: Option<i64>,
    },
    /// Publish a Canvas course (send the 'offer' event)
    PublishCourse { course: i64 },
}

#[derive(Subcommand, Debug)]
enum TrackerCommand {
    /// Calculate total gradable quiz points for a course
    CalculatePoints { course: i64 },
    /// Recompute and store total quiz points for a course
    UpdateCoursePoints { course: i64 },
    /// Recompute total quiz points for every known course
    UpdateAllPoints,
    /// Refresh the quiz completion cache for all active users
    UpdateAll,
    /// Show quiz completion for one user in one course
    TestUser { user: i64, course: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "cohortsync=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;
    let ctx = JobContext::new(config, pool)?;

    match cli.command {
        Command::Serve => serve(ctx).await?,
        Command::Daily => match cron::run_daily(&ctx).await? {
            Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
            None => println!("skipped: another scheduler run is in progress"),
        },
        Command::Weekly => match cron::run_weekly(&ctx).await? {
            Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
            None => println!("skipped: another scheduler run is in progress"),
        },
        Command::Trigger => match cron::run_trigger(&ctx).await? {
            Some(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            None => println!("skipped: another scheduler run is in progress"),
        },
        Command::Tracker { command } => run_tracker(&ctx, command).await?,
        Command::DiscoverAssignments { course } => discover(&ctx, course).await?,
        Command::PublishCourse { course } => {
            ctx.canvas.publish_course(course).await?;
            println!("course {course} published");
        }
    }

    Ok(())
}

async fn serve(ctx: JobContext) -> Result<()> {
    let port = ctx.config.http_port;
    let ctx = Arc::new(ctx);

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_tracker(ctx: &JobContext, command: TrackerCommand) -> Result<()> {
    let tracker = ctx.tracker();
    match command {
        TrackerCommand::CalculatePoints { course } => {
            let breakdown = tracker.calculate_total_points(course).await?;
            println!("Total Quiz Points: {}", breakdown.total_points);
            println!("Included assignments: {}", breakdown.included.len());
            println!("Excluded assignments: {}", breakdown.excluded.len());
            println!("Total assignments: {}", breakdown.total_assignments);
        }
        TrackerCommand::UpdateCoursePoints { course } => {
            match tracker.update_course_points(course).await {
                Ok(update) => {
                    println!(
                        "Updated course {} with {} total points",
                        update.canvas_course_id, update.total_points
                    );
                    println!("Included assignments: {}", update.included_count);
                    println!("Excluded assignments: {}", update.excluded_count);
                }
                Err(err) => {
                    eprintln!("Failed to update course {course}: {err}");
                    std::process::exit(1);
                }
            }
        }
        TrackerCommand::UpdateAllPoints => {
            println!("Updating total quiz points for all courses...");
            let results = tracker.update_all_course_points().await?;
            println!("Total courses: {}", results.total);
            println!("Successful: {}", results.successful);
            println!("Failed: {}", results.failed);
            for error in results.errors.iter().take(10) {
                println!("- {error}");
            }
            if results.errors.len() > 10 {
                println!("... and {} more errors", results.errors.len() - 10);
            }
        }
        TrackerCommand::UpdateAll => {
            let results = tracker.process_all_quiz_updates().await?;
            println!("Processed: {}", results.processed);
            println!("Errors: {}", results.errors);
        }
        TrackerCommand::TestUser { user, course } => {
            let data = tracker.fetch_user_quiz_scores(course, user).await?;
            println!("Quiz data for user {user} in course {course}:");
            println!("Completed quizzes: {}", data.scores.len());
            println!("Missing quizzes: {}", data.missing.len());
            if !data.scores.is_empty() {
                println!("\nCompleted:");
                for entry in &data.scores {
                    println!("- {}: {}/{}", entry.quiz_title, entry.score, entry.points_possible);
                }
            }
            if !data.missing.is_empty() {
                println!("\nMissing:");
                for entry in &data.missing {
                    println!("- {} ({})", entry.quiz_title, entry.status);
                }
            }
        }
    }
    Ok(())
}

async fn discover(ctx: &JobContext, course: Option<i64>) -> Result<()> {
    let courses = match course {
        Some(canvas_id) => match ctx.store.course_by_canvas_id(canvas_id).await? {
            Some(row) => vec![row],
            None => anyhow::bail!("course {canvas_id} not found in database"),
        },
        None => ctx.store.courses_with_canvas_id().await?,
    };

    for row in courses {
        let Some(canvas_id) = row.canvas_course_id else {
            continue;
        };
        match cron::discover_assignments(ctx, row.id, canvas_id).await {
            Ok(found) => println!("{}: {} assignment ids mapped", row.course_title, found),
            Err(err) => println!("{}: discovery failed: {err}", row.course_title),
        }
    }
    Ok(())
}
