use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    auth::{self, AdminIdentity},
    error::ApiError,
    store::{
        crypto,
        otp::generate_otp_code,
        ConsumeOutcome, KeyType, LicenseKey, MachineInfo, Store, ValidationOutcome,
    },
    AppState,
};

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Health ───────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Login ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let account = state
        .store
        .get_admin(&body.username)?
        .ok_or(ApiError::InvalidCredentials)?;

    if !crypto::verify_password(&body.password, &account.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let token = auth::issue_token(&state.auth, &account.username)?;
    info!(username = %account.username, "admin logged in");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

// ── Password reset flow ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RequestResetRequest {
    pub email: String,
    pub new_password: String,
    pub confirm_password: String,
}

pub async fn request_reset(
    State(state): State<AppState>,
    Json(body): Json<RequestResetRequest>,
) -> Result<Response, ApiError> {
    if body.new_password != body.confirm_password {
        return Err(ApiError::Validation("passwords do not match".into()));
    }
    if body.new_password.len() < state.min_password_len {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            state.min_password_len
        )));
    }
    if !body.email.contains('@') {
        return Err(ApiError::Validation("invalid email address".into()));
    }

    if state.store.find_admin_by_email(&body.email)?.is_none() {
        return Err(ApiError::NotFound("email not found".into()));
    }

    let code = generate_otp_code();
    let pending_hash = crypto::hash_password(&body.new_password)?;
    let now = Store::now();
    let expires_at = now + state.otp_expire_minutes as i64 * 60;

    // Persist before any delivery attempt; a failed email must not lose
    // the ledger entry.
    state
        .store
        .create_reset_otp(&body.email, &code, &pending_hash, now, expires_at)?;

    state.mailer.send_reset_code(&body.email, &code).await;

    Ok(Json(json!({
        "message": "OTP sent to email",
        "expires_in_minutes": state.otp_expire_minutes,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct VerifyResetRequest {
    pub email: String,
    pub otp_code: String,
}

pub async fn verify_reset(
    State(state): State<AppState>,
    Json(body): Json<VerifyResetRequest>,
) -> Result<Response, ApiError> {
    let now = Store::now();
    match state.store.consume_reset_otp(&body.email, &body.otp_code, now)? {
        ConsumeOutcome::Applied => {
            Ok(Json(json!({"message": "Password reset successful"})).into_response())
        }
        ConsumeOutcome::Invalid => Err(ApiError::InvalidOtp),
        ConsumeOutcome::Expired => Err(ApiError::OtpExpired),
        ConsumeOutcome::AlreadyUsed => Err(ApiError::OtpAlreadyUsed),
        ConsumeOutcome::NoAccount => Err(ApiError::NotFound("account not found".into())),
    }
}

// ── Key management (admin) ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(rename = "type")]
    pub key_type: String,
    pub note: Option<String>,
}

pub async fn create_key(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Response, ApiError> {
    let key_type = KeyType::parse(&body.key_type).ok_or_else(|| {
        ApiError::Validation("invalid type: must be trial/month/year/lifetime".into())
    })?;

    let record = state
        .store
        .create_key(key_type, body.note)?
        .ok_or_else(|| ApiError::Conflict("could not allocate a unique key value".into()))?;

    info!(admin = %identity.username, key = %record.key_value, "key created");
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

pub async fn list_keys(
    State(state): State<AppState>,
    Extension(_identity): Extension<AdminIdentity>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.store.list_keys()?;
    Ok(Json(json!({"keys": records})))
}

pub async fn get_key(
    State(state): State<AppState>,
    Extension(_identity): Extension<AdminIdentity>,
    Path(key_value): Path<String>,
) -> Result<Json<LicenseKey>, ApiError> {
    let record = state
        .store
        .get_key(&key_value)?
        .ok_or_else(|| ApiError::NotFound("key not found".into()))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub is_active: Option<bool>,
    pub note: Option<String>,
}

pub async fn update_key(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Path(key_value): Path<String>,
    Json(body): Json<UpdateKeyRequest>,
) -> Result<Json<LicenseKey>, ApiError> {
    let record = state
        .store
        .update_key(&key_value, body.is_active, body.note)?
        .ok_or_else(|| ApiError::NotFound("key not found".into()))?;

    info!(admin = %identity.username, key = %key_value, is_active = record.is_active, "key updated");
    Ok(Json(record))
}

pub async fn delete_key(
    State(state): State<AppState>,
    Extension(identity): Extension<AdminIdentity>,
    Path(key_value): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_key(&key_value)? {
        return Err(ApiError::NotFound("key not found".into()));
    }
    info!(admin = %identity.username, key = %key_value, "key deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Validation (product-facing, no auth) ─────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ValidateKeyRequest {
    pub key_value: String,
    pub machine_name: Option<String>,
    pub os_version: Option<String>,
    pub revit_version: Option<String>,
    pub cpu_info: Option<String>,
    pub ip_address: Option<String>,
    pub machine_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateKeyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Called by the end-user product, so no auth and no detail beyond the
/// documented reasons.
pub async fn validate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ValidateKeyRequest>,
) -> Result<Json<ValidateKeyResponse>, ApiError> {
    let ip_address = body
        .ip_address
        .clone()
        .unwrap_or_else(|| extract_ip(&headers, &addr));

    let machine = MachineInfo {
        machine_name: body.machine_name,
        os_version: body.os_version,
        revit_version: body.revit_version,
        cpu_info: body.cpu_info,
        ip_address: Some(ip_address),
        machine_hash: body.machine_hash,
    };

    let now = Store::now();
    let response = match state.store.validate_key(&body.key_value, machine, now)? {
        ValidationOutcome::Valid(record) => ValidateKeyResponse {
            valid: true,
            reason: None,
            expires_at: record.expires_at,
            machine_hash: record.machine.and_then(|m| m.machine_hash),
            note: record.note,
        },
        ValidationOutcome::NotFound => ValidateKeyResponse {
            valid: false,
            reason: Some("not_found"),
            expires_at: None,
            machine_hash: None,
            note: None,
        },
        ValidationOutcome::Inactive(record) => ValidateKeyResponse {
            valid: false,
            reason: Some("inactive"),
            expires_at: record.expires_at,
            machine_hash: None,
            note: None,
        },
        ValidationOutcome::Expired(record) => ValidateKeyResponse {
            valid: false,
            reason: Some("expired"),
            expires_at: record.expires_at,
            machine_hash: None,
            note: None,
        },
    };
    Ok(Json(response))
}
