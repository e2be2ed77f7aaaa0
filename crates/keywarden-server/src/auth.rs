use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ApiError;
use crate::AppState;

/// Token issuance settings, shared through `AppState`.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expire_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Admin username.
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
}

/// Identity inserted as a request extension by `require_admin`.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub username: String,
}

fn unix_timestamp() -> Result<u64, ApiError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("system clock before epoch")))?;
    Ok(now.as_secs())
}

/// Issue a signed HS256 bearer token for an admin. Verification is
/// stateless; revocation happens by expiry only.
pub fn issue_token(cfg: &AuthConfig, username: &str) -> Result<String, ApiError> {
    let now = unix_timestamp()?;
    let exp = now + cfg.token_expire_minutes * 60;

    let claims = AccessTokenClaims {
        sub: username.to_owned(),
        iat: now as usize,
        exp: exp as usize,
    };

    let header = Header::new(Algorithm::HS256);
    jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to issue jwt: {e}")))
}

/// Validate a bearer token's signature and expiry.
pub fn verify_token(cfg: &AuthConfig, token: &str) -> Result<AccessTokenClaims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;

    let data = jsonwebtoken::decode::<AccessTokenClaims>(
        token,
        &DecodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::Unauthorized("invalid or expired token".into()))?;

    Ok(data.claims)
}

/// Axum middleware guarding the admin key-management routes. Validates
/// `Authorization: Bearer <jwt>` and confirms the admin account still
/// exists before letting the request through.
pub async fn require_admin(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::Unauthorized("missing bearer token".into()).into_response();
    };

    let claims = match verify_token(&state.auth, token) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    match state.store.get_admin(&claims.sub) {
        Ok(Some(account)) => {
            request.extensions_mut().insert(AdminIdentity {
                username: account.username,
            });
            next.run(request).await
        }
        Ok(None) => {
            warn!(sub = %claims.sub, "token subject no longer exists");
            ApiError::Unauthorized("unknown admin".into()).into_response()
        }
        Err(e) => ApiError::Internal(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            token_expire_minutes: 60,
        }
    }

    #[test]
    fn round_trip() {
        let cfg = test_cfg();
        let token = issue_token(&cfg, "admin").unwrap();
        let claims = verify_token(&cfg, &token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.exp, claims.iat + 3600);
    }

    #[test]
    fn expired_token_is_rejected() {
        let cfg = test_cfg();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as usize;
        let claims = AccessTokenClaims {
            sub: "admin".into(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(cfg.jwt_secret.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            verify_token(&cfg, &token),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let cfg = test_cfg();
        let token = issue_token(&cfg, "admin").unwrap();

        let other = AuthConfig {
            jwt_secret: "different-secret".into(),
            token_expire_minutes: 60,
        };
        assert!(matches!(
            verify_token(&other, &token),
            Err(ApiError::Unauthorized(_))
        ));
    }
}
