//! Mailgun HTTP sender. Send failures are logged by callers and never
//! retried; the kill-switch logs instead of sending.

use crate::config::MailgunConfig;
use reqwest::Client;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("mailgun returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("mailgun request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub fn api_base(region: &str) -> &'static str {
    if region == "eu" {
        "https://api.eu.mailgun.net/v3/"
    } else {
        "https://api.mailgun.net/v3/"
    }
}

#[derive(Clone)]
pub struct Mailer {
    http: Client,
    config: MailgunConfig,
}

impl Mailer {
    pub fn new(config: MailgunConfig) -> Self {
        Mailer {
            http: Client::new(),
            config,
        }
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        if self.config.disabled {
            tracing::info!(to, subject, "email disabled: would send");
            return Ok(());
        }

        let endpoint = format!(
            "{}{}/messages",
            api_base(&self.config.region),
            self.config.domain
        );
        let form = [
            ("from", self.config.from.as_str()),
            ("to", to),
            ("subject", subject),
            ("text", body),
            ("h:Reply-To", self.config.reply_to.as_str()),
        ];

        let resp = self
            .http
            .post(&endpoint)
            .basic_auth("api", Some(&self.config.api_key))
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(MailError::Status(resp.status()));
        }
        Ok(())
    }
}

pub const REENROLL_SUBJECT: &str = "Re-enroll in Accessibility Course";

/// Body of the re-enrollment offer sent when a cohort closes with the
/// learner still mid-course.
pub fn reenroll_body(name: &str, cohort: &str, fee: u32, reenroll_url: &str) -> String {
    format!(
        "Hello {name},\n\n\
         Our records show you started but did not complete your cohort: {cohort}.\n\
         You are eligible to re-enroll for a ${fee} fee and finish the course.\n\n\
         To re-enroll, please visit: {reenroll_url} (or contact us for help).\n\n\
         If you have questions, reply to this email.\n\n\
         Thank you!"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_endpoints() {
        assert_eq!(api_base("eu"), "https://api.eu.mailgun.net/v3/");
        assert_eq!(api_base("us"), "https://api.mailgun.net/v3/");
        assert_eq!(api_base("anything-else"), "https://api.mailgun.net/v3/");
    }

    #[test]
    fn reenroll_body_names_cohort_and_fee() {
        let body = reenroll_body("Ada", "2026-03", 25, "https://example.org/reenroll");
        assert!(body.starts_with("Hello Ada,"));
        assert!(body.contains("cohort: 2026-03"));
        assert!(body.contains("$25 fee"));
        assert!(body.contains("https://example.org/reenroll"));
    }
}
