use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{require_admin, AuthConfig},
    handlers::{
        create_key, delete_key, get_key, health, list_keys, login, request_reset, update_key,
        validate_key, verify_reset,
    },
    mailer::OtpMailer,
    store::{crypto, AdminAccount, Store},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// HS256 signing secret. The server refuses to start without one.
    pub jwt_secret: String,
    pub token_expire_minutes: u64,
    pub otp_expire_minutes: u64,
    pub min_password_len: usize,
    pub cors_origins: Option<String>,
    /// Transactional email API key ($KEYWARDEN_EMAIL_API_KEY). When unset,
    /// OTP codes go to the process log instead — dev mode only.
    pub email_api_key: Option<String>,
    pub email_api_url: String,
    pub email_from_address: String,
    pub email_from_name: String,
    /// Seed admin credentials, applied only when no account exists yet.
    pub admin_username: String,
    pub admin_password: Option<String>,
    pub admin_email: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("KEYWARDEN_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("KEYWARDEN_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("KEYWARDEN_DATA_DIR").ok().map(PathBuf::from),
            jwt_secret: std::env::var("KEYWARDEN_JWT_SECRET").unwrap_or_default(),
            token_expire_minutes: std::env::var("KEYWARDEN_TOKEN_EXPIRE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            otp_expire_minutes: std::env::var("KEYWARDEN_OTP_EXPIRE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            min_password_len: std::env::var("KEYWARDEN_MIN_PASSWORD_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            cors_origins: std::env::var("KEYWARDEN_CORS_ORIGINS").ok(),
            email_api_key: std::env::var("KEYWARDEN_EMAIL_API_KEY").ok(),
            email_api_url: std::env::var("KEYWARDEN_EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.brevo.com/v3/smtp/email".into()),
            email_from_address: std::env::var("KEYWARDEN_EMAIL_FROM")
                .unwrap_or_else(|_| "noreply@example.com".into()),
            email_from_name: std::env::var("KEYWARDEN_EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "Keywarden".into()),
            admin_username: std::env::var("KEYWARDEN_ADMIN_USERNAME")
                .unwrap_or_else(|_| "admin".into()),
            admin_password: std::env::var("KEYWARDEN_ADMIN_PASSWORD").ok(),
            admin_email: std::env::var("KEYWARDEN_ADMIN_EMAIL")
                .unwrap_or_else(|_| "admin@example.com".into()),
        }
    }
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.jwt_secret.trim().is_empty() {
        anyhow::bail!("KEYWARDEN_JWT_SECRET is required");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let db_path = data_dir.join("keywarden.db");
    let store = Store::open(&db_path).context("open store")?;

    seed_admin(&store, &cfg)?;

    if cfg.email_api_key.is_none() {
        warn!("no KEYWARDEN_EMAIL_API_KEY set — OTP codes will be logged, not emailed");
    }

    let mailer = OtpMailer::new(
        cfg.email_api_key.clone(),
        cfg.email_api_url.clone(),
        cfg.email_from_address.clone(),
        cfg.email_from_name.clone(),
        cfg.otp_expire_minutes,
    );

    let state = AppState {
        store,
        auth: AuthConfig {
            jwt_secret: cfg.jwt_secret.clone(),
            token_expire_minutes: cfg.token_expire_minutes,
        },
        mailer,
        otp_expire_minutes: cfg.otp_expire_minutes,
        min_password_len: cfg.min_password_len,
    };

    let cors = build_cors(cfg.cors_origins.as_deref());

    // Public routes: login, the reset flow, and product-side validation.
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/request-reset", post(request_reset))
        .route("/auth/verify-reset", post(verify_reset))
        .route("/keys/validate", post(validate_key));

    // Admin key management (bearer token required).
    let protected = Router::new()
        .route("/keys/create", post(create_key))
        .route("/keys/list", get(list_keys))
        .route("/keys/{key_value}", get(get_key))
        .route("/keys/{key_value}", put(update_key))
        .route("/keys/{key_value}", delete(delete_key))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "keywarden server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// Create the initial admin account if the store is empty. A generated
/// password is logged once so first login is possible; change it through
/// the reset flow afterwards.
fn seed_admin(store: &Store, cfg: &ServerConfig) -> Result<()> {
    if store.has_admins()? {
        return Ok(());
    }

    let (password, generated) = match &cfg.admin_password {
        Some(p) => (p.clone(), false),
        None => {
            use rand::Rng;
            let mut bytes = [0u8; 12];
            rand::thread_rng().fill(&mut bytes);
            (hex::encode(bytes), true)
        }
    };

    let now = Store::now();
    let account = AdminAccount {
        username: cfg.admin_username.clone(),
        password_hash: crypto::hash_password(&password)?,
        email: cfg.admin_email.clone(),
        created_at: now,
        updated_at: now,
    };
    store.put_admin(&account)?;

    if generated {
        warn!(
            username = %account.username,
            password = %password,
            "seeded admin account with a generated password — change it"
        );
    } else {
        info!(username = %account.username, "seeded admin account");
    }
    Ok(())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn seed_config(username: &str) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: None,
            jwt_secret: "test-secret".into(),
            token_expire_minutes: 60,
            otp_expire_minutes: 10,
            min_password_len: 8,
            cors_origins: None,
            email_api_key: None,
            email_api_url: String::new(),
            email_from_address: "noreply@example.com".into(),
            email_from_name: "Keywarden".into(),
            admin_username: username.into(),
            admin_password: Some("seed-password-1".into()),
            admin_email: "admin@example.com".into(),
        }
    }

    #[test]
    fn seeds_only_an_empty_store() {
        let (store, _dir) = test_store();

        seed_admin(&store, &seed_config("admin")).unwrap();
        assert!(store.get_admin("admin").unwrap().is_some());

        // Any existing account suppresses seeding, whatever its username.
        seed_admin(&store, &seed_config("ops")).unwrap();
        assert!(store.get_admin("ops").unwrap().is_none());
    }
}
