//! Account service: registration, login, and session refresh.

use std::sync::Arc;

use tracing::{info, warn};

use conveyor_auth::{hash_password, verify_password, TokenPair, TokenService};
use conveyor_core::{user, ServiceError, ServiceResult};
use conveyor_infra::repository::UserRepository;
use conveyor_infra::{with_transaction, Database};

pub struct AccountService {
    db: Arc<dyn Database>,
    users: Arc<dyn UserRepository>,
    tokens: Arc<TokenService>,
}

impl AccountService {
    pub fn new(
        db: Arc<dyn Database>,
        users: Arc<dyn UserRepository>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self { db, users, tokens }
    }

    /// Register a new identity, returning its id.
    pub async fn register(&self, username: &str, password: &str) -> ServiceResult<i64> {
        user::validate_registration(username, password)?;

        if self.users.get_by_username(username).await?.is_some() {
            return Err(ServiceError::conflict("username already exists"));
        }

        // bcrypt is deliberately slow; keep it off the async threads.
        let password = password.to_string();
        let verifier = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|_| ServiceError::internal("password hashing task failed"))?
            .map_err(|_| ServiceError::internal("failed to hash password"))?;

        let user_id = with_transaction(&*self.db, |mut tx| async {
            let id = self.users.create(&mut tx, username, &verifier).await?;
            Ok::<_, ServiceError>((tx, id))
        })
        .await?;

        info!(user_id, username, "user registered");
        Ok(user_id)
    }

    /// Verify credentials and issue a session pair.
    ///
    /// Unknown usernames and verifier mismatches are indistinguishable to
    /// the caller.
    pub async fn login(&self, username: &str, password: &str) -> ServiceResult<TokenPair> {
        let Some(found) = self.users.get_by_username(username).await? else {
            return Err(ServiceError::InvalidCredentials);
        };

        let password = password.to_string();
        let verifier = found.password_verifier.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &verifier))
            .await
            .map_err(|_| ServiceError::internal("password verification task failed"))?;

        if !verified {
            warn!(username, "login attempt with invalid password");
            return Err(ServiceError::InvalidCredentials);
        }

        self.tokens
            .issue_pair(found.id)
            .map_err(|_| ServiceError::internal("failed to issue session tokens"))
    }

    /// Rotate a refresh token into a new session pair.
    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<TokenPair> {
        self.tokens
            .refresh_pair(refresh_token)
            .map_err(|_| ServiceError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_auth::TokenType;
    use conveyor_infra::repository::memory::InMemoryStore;

    fn service() -> (AccountService, Arc<TokenService>) {
        let store = InMemoryStore::new();
        let tokens = Arc::new(TokenService::new("test-secret"));
        let service = AccountService::new(
            Arc::new(store.clone()),
            Arc::new(store.user_repository()),
            tokens.clone(),
        );
        (service, tokens)
    }

    #[tokio::test]
    async fn register_then_login_round_trip() {
        let (service, tokens) = service();

        let id = service.register("alice", "Pw123!").await.unwrap();
        let pair = service.login("alice", "Pw123!").await.unwrap();

        let claims = tokens
            .validate(&pair.access_token, TokenType::Access)
            .unwrap();
        assert_eq!(claims.user_id, id);
    }

    #[tokio::test]
    async fn register_enforces_length_constraints() {
        let (service, _) = service();

        assert!(matches!(
            service.register("ab", "Pw123!").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(service.register("abc", "Pw123!").await.is_ok());

        assert!(matches!(
            service.register("bob", "12345").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(service.register("bob", "123456").await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let (service, _) = service();

        service.register("alice", "Pw123!").await.unwrap();
        assert!(matches!(
            service.register("alice", "Other9!").await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn login_failures_are_uniform() {
        let (service, _) = service();
        service.register("alice", "Pw123!").await.unwrap();

        assert!(matches!(
            service.login("nobody", "Pw123!").await,
            Err(ServiceError::InvalidCredentials)
        ));
        assert!(matches!(
            service.login("alice", "wrong-password").await,
            Err(ServiceError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_for_the_same_identity() {
        let (service, tokens) = service();

        let id = service.register("alice", "Pw123!").await.unwrap();
        let first = service.login("alice", "Pw123!").await.unwrap();
        let second = service.refresh(&first.refresh_token).await.unwrap();

        let claims = tokens
            .validate(&second.access_token, TokenType::Access)
            .unwrap();
        assert_eq!(claims.user_id, id);
    }

    #[tokio::test]
    async fn refresh_rejects_access_tokens() {
        let (service, _) = service();

        service.register("alice", "Pw123!").await.unwrap();
        let pair = service.login("alice", "Pw123!").await.unwrap();

        assert!(matches!(
            service.refresh(&pair.access_token).await,
            Err(ServiceError::InvalidToken)
        ));
    }
}
