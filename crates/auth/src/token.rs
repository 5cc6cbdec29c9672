//! Signed session tokens (HS256).
//!
//! A session is a pair of self-contained tokens: a short-lived access token
//! and a long-lived refresh token. Both carry the identity id and an explicit
//! `type` claim; validation rejects a token presented for the wrong purpose.
//! Refreshing rotates the whole pair. There is no revocation list: an old
//! refresh token stays verifiable until its original expiry, and rotation
//! security rests on the short access lifetime and clients discarding old
//! tokens.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ACCESS_TTL_SECS: i64 = 15 * 60;
const REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("invalid token")]
    Invalid,

    #[error("failed to hash password")]
    Hashing,
}

/// Purpose of a token, embedded as the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims carried by every session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// An issued session: access + refresh, with the access expiry in seconds.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Issues and validates session tokens with a shared symmetric secret.
///
/// Every gateway instance must be constructed with the same secret so tokens
/// issued by one instance validate on any other.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        // The claim set has no registered subject/audience to check.
        validation.required_spec_claims.clear();

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issue a fresh access/refresh pair for an identity.
    pub fn issue_pair(&self, user_id: i64) -> Result<TokenPair, AuthError> {
        let access = self.issue(user_id, TokenType::Access, ACCESS_TTL_SECS)?;
        let refresh = self.issue(user_id, TokenType::Refresh, REFRESH_TTL_SECS)?;

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            expires_in: ACCESS_TTL_SECS,
        })
    }

    /// Validate a token and require it to be of the expected type.
    pub fn validate(&self, token: &str, expected: TokenType) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })?;

        if data.claims.token_type != expected {
            return Err(AuthError::Invalid);
        }

        Ok(data.claims)
    }

    /// Rotate a refresh token into a brand-new pair for the same identity.
    pub fn refresh_pair(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.validate(refresh_token, TokenType::Refresh)?;
        self.issue_pair(claims.user_id)
    }

    fn issue(
        &self,
        user_id: i64,
        token_type: TokenType,
        ttl_secs: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            user_id,
            token_type,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret")
    }

    #[test]
    fn pair_decodes_to_issuing_identity() {
        let svc = service();
        let pair = svc.issue_pair(42).unwrap();

        let access = svc.validate(&pair.access_token, TokenType::Access).unwrap();
        let refresh = svc
            .validate(&pair.refresh_token, TokenType::Refresh)
            .unwrap();

        assert_eq!(access.user_id, 42);
        assert_eq!(refresh.user_id, 42);
        assert_eq!(pair.expires_in, 15 * 60);
    }

    #[test]
    fn access_token_rejected_as_refresh() {
        let svc = service();
        let pair = svc.issue_pair(1).unwrap();

        assert_eq!(
            svc.refresh_pair(&pair.access_token).unwrap_err(),
            AuthError::Invalid
        );
    }

    #[test]
    fn refresh_rotation_preserves_identity() {
        let svc = service();
        let first = svc.issue_pair(7).unwrap();
        let second = svc.refresh_pair(&first.refresh_token).unwrap();
        let third = svc.refresh_pair(&second.refresh_token).unwrap();

        for pair in [&first, &second, &third] {
            let claims = svc.validate(&pair.access_token, TokenType::Access).unwrap();
            assert_eq!(claims.user_id, 7);
        }
    }

    #[test]
    fn expired_token_rejected() {
        let svc = service();
        let past = Utc::now() - Duration::hours(2);
        let claims = Claims {
            user_id: 9,
            token_type: TokenType::Access,
            iat: past.timestamp(),
            nbf: past.timestamp(),
            exp: (past + Duration::seconds(60)).timestamp(),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert_eq!(
            svc.validate(&token, TokenType::Access).unwrap_err(),
            AuthError::Expired
        );
    }

    #[test]
    fn foreign_secret_rejected() {
        let other = TokenService::new("other-secret");
        let pair = other.issue_pair(3).unwrap();

        assert_eq!(
            service()
                .validate(&pair.access_token, TokenType::Access)
                .unwrap_err(),
            AuthError::Invalid
        );
    }

    #[test]
    fn garbage_rejected() {
        assert_eq!(
            service().validate("not-a-token", TokenType::Access).unwrap_err(),
            AuthError::Invalid
        );
    }
}
