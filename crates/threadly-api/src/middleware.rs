use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use threadly_core::Principal;
use threadly_types::api::Claims;

use crate::AppState;

/// Validate an HS256 token issued by the auth service.
pub fn verify_token(token: &str, secret: &str) -> Option<Principal> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(Principal::new(data.claims.sub, data.claims.username)),
        Err(e) => {
            debug!("Rejected token: {}", e);
            None
        }
    }
}

/// Extract and validate the bearer token, then expose the caller as a
/// `Principal` extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let principal = verify_token(token, &state.jwt_secret).ok_or(StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    fn token(secret: &str, exp_offset: i64) -> (Uuid, String) {
        let sub = Uuid::new_v4();
        let claims = Claims {
            sub,
            username: "alice".into(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        (sub, token)
    }

    #[test]
    fn valid_token_yields_principal() {
        let (sub, token) = token("s3cret", 3600);
        let principal = verify_token(&token, "s3cret").unwrap();
        assert_eq!(principal.user_id, sub);
        assert_eq!(principal.username, "alice");
    }

    #[test]
    fn wrong_secret_or_expired_is_rejected() {
        let (_, token_a) = token("s3cret", 3600);
        assert!(verify_token(&token_a, "other").is_none());

        let (_, expired) = token("s3cret", -3600);
        assert!(verify_token(&expired, "s3cret").is_none());
        assert!(verify_token("not-a-jwt", "s3cret").is_none());
    }
}
