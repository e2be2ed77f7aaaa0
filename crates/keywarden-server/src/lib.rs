pub mod auth;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod mailer;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub auth: auth::AuthConfig,
    pub mailer: mailer::OtpMailer,
    /// Minutes an OTP code stays valid after a reset request.
    pub otp_expire_minutes: u64,
    /// Minimum accepted length for a new password.
    pub min_password_len: usize,
}

pub use server::{run, ServerConfig};
