//! User identity model and registration validation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ServiceError;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 50;
pub const PASSWORD_MIN: usize = 6;

/// A registered identity.
///
/// The password verifier is a salted slow hash; the plaintext password never
/// reaches this type and the verifier is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_verifier: String,
    pub created_at: DateTime<Utc>,
}

/// Validate registration input against the length constraints.
pub fn validate_registration(username: &str, password: &str) -> Result<(), ServiceError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(ServiceError::validation(format!(
            "username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )));
    }
    if password.chars().count() < PASSWORD_MIN {
        return Err(ServiceError::validation(format!(
            "password must be at least {PASSWORD_MIN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_length_boundaries() {
        assert!(validate_registration("ab", "secret1").is_err());
        assert!(validate_registration("abc", "secret1").is_ok());
        assert!(validate_registration(&"x".repeat(50), "secret1").is_ok());
        assert!(validate_registration(&"x".repeat(51), "secret1").is_err());
    }

    #[test]
    fn password_length_boundaries() {
        assert!(validate_registration("alice", "12345").is_err());
        assert!(validate_registration("alice", "123456").is_ok());
    }

    #[test]
    fn verifier_is_never_serialized() {
        let user = User {
            id: 1,
            username: "alice".to_string(),
            password_verifier: "$2b$12$abcdefghijklmnopqrstuv".to_string(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("$2b$"));
    }
}
