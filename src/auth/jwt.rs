//! Bearer token validation against the identity provider's HS256 secret.

use crate::error::{AppError, AppResult};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,   // user_id
    pub name: String,  // display name
    pub exp: i64,
    pub iat: i64,
}

/// Verified identity attached to every action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

#[derive(Clone)]
pub struct JwtSecret {
    secret: String,
}

impl JwtSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Issue a token the way the identity provider does. Used by tests and local tooling.
    pub fn issue(&self, identity: &Identity) -> AppResult<String> {
        let now = Utc::now();
        let exp = (now + Duration::days(7)).timestamp();
        let claims = Claims {
            sub: identity.user_id.clone(),
            name: identity.username.clone(),
            exp,
            iat: now.timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("jwt encode: {}", e)))
    }

    pub fn validate(&self, token: &str) -> AppResult<Identity> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AppError::Unauthenticated(e.to_string()))?;
        if data.claims.sub.trim().is_empty() {
            return Err(AppError::Unauthenticated("token has no subject".to_string()));
        }
        let username = if data.claims.name.trim().is_empty() {
            data.claims.sub.clone()
        } else {
            data.claims.name
        };
        Ok(Identity {
            user_id: data.claims.sub,
            username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates_to_same_identity() {
        let secret = JwtSecret::new("test-jwt-secret-min-32-chars!!".to_string());
        let alice = Identity::new("alice", "Alice");
        let token = secret.issue(&alice).unwrap();
        assert_eq!(secret.validate(&token).unwrap(), alice);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let issuer = JwtSecret::new("issuer-secret-issuer-secret-1234".to_string());
        let verifier = JwtSecret::new("another-secret-another-secret-99".to_string());
        let token = issuer.issue(&Identity::new("bob", "Bob")).unwrap();
        let err = verifier.validate(&token).unwrap_err();
        assert!(matches!(err, AppError::Unauthenticated(_)));
    }

    #[test]
    fn garbage_token_is_unauthenticated() {
        let secret = JwtSecret::new("test-jwt-secret-min-32-chars!!".to_string());
        assert!(matches!(
            secret.validate("not-a-jwt"),
            Err(AppError::Unauthenticated(_))
        ));
    }
}
