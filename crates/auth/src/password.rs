//! Password hashing.
//!
//! bcrypt at the default cost lands around the intended ~100ms per hash on
//! current hardware. Callers on async paths must move these onto a blocking
//! thread (`tokio::task::spawn_blocking`).

use bcrypt::DEFAULT_COST;

use crate::token::AuthError;

/// Compute a salted verifier for a plaintext password.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, DEFAULT_COST).map_err(|_| AuthError::Hashing)
}

/// Check a plaintext password against a stored verifier.
///
/// Malformed verifiers verify as false rather than erroring; the login path
/// treats both identically.
pub fn verify_password(password: &str, verifier: &str) -> bool {
    bcrypt::verify(password, verifier).unwrap_or(false)
}
