use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

/// Delivers OTP codes through a Brevo-style transactional email HTTP API.
///
/// Without an API key the code is logged instead — a dev convenience only,
/// since anyone who can read the process log can reset the password. Do not
/// run production without `KEYWARDEN_EMAIL_API_KEY`. With a key configured
/// the code never reaches the log, even when delivery fails.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The email API accepted the message.
    Sent,
    /// No API key configured; the code was written to the log instead.
    DevLogged,
    /// The email API rejected the message or was unreachable.
    Failed,
}

#[derive(Clone)]
pub struct OtpMailer {
    client: reqwest::Client,
    api_key: Option<String>,
    api_url: String,
    from_address: String,
    from_name: String,
    otp_expire_minutes: u64,
}

impl OtpMailer {
    pub fn new(
        api_key: Option<String>,
        api_url: String,
        from_address: String,
        from_name: String,
        otp_expire_minutes: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("build mailer reqwest client");

        Self {
            client,
            api_key,
            api_url,
            from_address,
            from_name,
            otp_expire_minutes,
        }
    }

    /// Send the reset code. The OTP entry is already persisted by the time
    /// this runs, so delivery failure is a warning, not an error — the
    /// operator can still read the code from the log in dev mode.
    pub async fn send_reset_code(&self, to_email: &str, code: &str) -> DeliveryOutcome {
        let Some(ref api_key) = self.api_key else {
            warn!(email = %to_email, otp = %code, "no email API key configured — dev-mode OTP log");
            return DeliveryOutcome::DevLogged;
        };

        let text_body = format!(
            "Password Reset Request\n\n\
             Your OTP code is: {code}\n\n\
             This code will expire in {} minutes.\n\n\
             If you did not request this, please ignore this email.\n\n---\n{}",
            self.otp_expire_minutes, self.from_name,
        );

        let payload = json!({
            "sender": {"name": self.from_name, "email": self.from_address},
            "to": [{"email": to_email}],
            "subject": "Password Reset OTP Code",
            "textContent": text_body,
        });

        let result = self
            .client
            .post(&self.api_url)
            .header("api-key", api_key)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(email = %to_email, "OTP email delivered");
                DeliveryOutcome::Sent
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!(email = %to_email, %status, body, "email API rejected OTP delivery");
                DeliveryOutcome::Failed
            }
            Err(e) => {
                warn!(email = %to_email, error = %e, "OTP email delivery failed");
                DeliveryOutcome::Failed
            }
        }
    }
}
