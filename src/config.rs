use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub http_port: u16,
    pub admin_token: Option<String>,
    pub canvas: CanvasConfig,
    pub mailgun: MailgunConfig,
    pub reenrollment_fee: u32,
    pub reenroll_url: String,
}

#[derive(Debug, Clone)]
pub struct CanvasConfig {
    pub api_url: String,
    pub access_token: String,
    pub account_id: i64,
}

#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub api_key: String,
    pub domain: String,
    pub region: String,
    pub from: String,
    pub reply_to: String,
    pub disabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let canvas = CanvasConfig {
            api_url: required("CANVAS_API_URL")?.trim_end_matches('/').to_string(),
            access_token: required("CANVAS_API_TOKEN")?,
            account_id: env::var("CANVAS_ACCOUNT_ID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        };

        let mailgun = MailgunConfig {
            api_key: env::var("MAILGUN_API_KEY").unwrap_or_default(),
            domain: env::var("MAILGUN_DOMAIN").unwrap_or_default(),
            region: env::var("MAILGUN_REGION").unwrap_or_else(|_| "us".into()),
            from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "noreply@example.org".into()),
            reply_to: env::var("EMAIL_REPLY_TO")
                .unwrap_or_else(|_| "support@example.org".into()),
            disabled: env::var("DISABLE_EMAILS").map(|v| !v.is_empty()).unwrap_or(false),
        };

        Ok(AppConfig {
            database_url: required("DATABASE_URL")?,
            http_port: env::var("PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8081),
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            canvas,
            mailgun,
            reenrollment_fee: env::var("REENROLLMENT_FEE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(25),
            reenroll_url: env::var("REENROLL_URL")
                .unwrap_or_else(|_| "https://example.org/reenroll".into()),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} not set"))
}
