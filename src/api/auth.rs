//! Bearer JWT authentication.
//!
//! - Clients send `Authorization: Bearer <jwt>` signed with `JWT_SECRET` (HS256)
//! - The `userId` claim becomes the request principal and selects the workspace
//! - A missing token is 401; an invalid or expired one is 403
//! - When `DEV_MODE=true`, checks are skipped and every request runs as `DEV_USER_ID`

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use super::types::api_error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub username: Option<String>,
}

/// Tokens are minted by the account service; tests sign their own.
#[cfg(test)]
pub(crate) const TOKEN_TTL_DAYS: i64 = 7;

#[cfg(test)]
pub(crate) fn issue_token(secret: &str, user: &AuthUser) -> anyhow::Result<String> {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header};

    let now = Utc::now();
    let claims = Claims {
        user_id: user.id.clone(),
        email: user.email.clone(),
        username: user.username.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::days(TOKEN_TTL_DAYS)).timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

fn verify_token(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    if token_data.claims.user_id.trim().is_empty() {
        anyhow::bail!("token has an empty userId");
    }
    Ok(token_data.claims)
}

pub async fn require_auth(
    State(state): State<std::sync::Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.auth.auth_required(state.config.dev_mode) {
        req.extensions_mut().insert(AuthUser {
            id: state.config.auth.dev_user_id.clone(),
            email: None,
            username: Some(state.config.auth.dev_user_id.clone()),
        });
        return next.run(req).await;
    }

    // Fail closed when auth is required but not configured.
    let Some(secret) = state.config.auth.jwt_secret.as_deref() else {
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "JWT_SECRET not configured").into_response();
    };

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("")
        .trim();

    if token.is_empty() {
        return api_error(StatusCode::UNAUTHORIZED, "Access token required").into_response();
    }

    match verify_token(token, secret) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser {
                id: claims.user_id,
                email: claims.email,
                username: claims.username,
            });
            next.run(req).await
        }
        Err(e) => {
            tracing::debug!("Rejected bearer token: {}", e);
            api_error(StatusCode::FORBIDDEN, "Invalid or expired token").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;

    fn alice() -> AuthUser {
        AuthUser {
            id: "alice".to_string(),
            email: Some("alice@example.com".to_string()),
            username: None,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let token = issue_token("s3cret", &alice()).unwrap();
        let claims = verify_token(&token, "s3cret").unwrap();
        assert_eq!(claims.user_id, "alice");
        assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
        assert!(claims.exp - claims.iat >= TOKEN_TTL_DAYS * 24 * 3600 - 1);
    }

    #[test]
    fn test_wrong_secret_and_expired_tokens_fail() {
        let token = issue_token("s3cret", &alice()).unwrap();
        assert!(verify_token(&token, "other").is_err());

        let expired = Claims {
            user_id: "alice".to_string(),
            email: None,
            username: None,
            iat: 0,
            exp: Utc::now().timestamp() - 3600,
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &expired,
            &EncodingKey::from_secret(b"s3cret"),
        )
        .unwrap();
        assert!(verify_token(&token, "s3cret").is_err());
    }
}
