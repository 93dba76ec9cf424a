pub use in_memory_users_repository::InMemoryUsersRepository;
pub use postgres_users_repository::{PostgresUsersRepository, PostgresUsersRepositoryConfig};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::api::{Role, UserId};

mod in_memory_users_repository;
mod postgres_users_repository;

#[derive(Debug, thiserror::Error)]
pub enum UsersRepositoryError {
    #[error("User {0} not found")]
    NotFound(UserId),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid or unknown token")]
    InvalidToken,

    #[error("{}", .0.join(", "))]
    Invalid(Vec<String>),

    #[error("Failed to hash password: {0}")]
    PasswordHash(String),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub roles: Vec<Role>,
}

#[async_trait::async_trait]
pub trait UsersRepository: Send + Sync {
    /// Registers a new borrower with the default member role. The email is
    /// unique case-insensitively.
    async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, UsersRepositoryError>;

    /// Verifies credentials and rotates the opaque session token
    async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, String), UsersRepositoryError>;

    /// Invalidates the session token
    async fn logout(&self, token: &str) -> Result<(), UsersRepositoryError>;

    async fn find_by_token(&self, token: &str) -> Result<UserRecord, UsersRepositoryError>;

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, UsersRepositoryError>;

    /// Replaces the role assignments; used to seed the librarian account
    async fn set_roles(
        &self,
        user_id: UserId,
        roles: Vec<Role>,
    ) -> Result<(), UsersRepositoryError>;
}

pub(crate) fn email_taken_error() -> UsersRepositoryError {
    UsersRepositoryError::Invalid(vec!["Email has already been taken".to_string()])
}

pub(crate) fn validate_registration(
    email: &str,
    password: &str,
) -> Result<(), UsersRepositoryError> {
    let mut errors = Vec::new();
    if email.trim().is_empty() {
        errors.push("Email can't be blank".to_string());
    } else if !email.contains('@') {
        errors.push("Email is invalid".to_string());
    }
    if password.len() < 6 {
        errors.push("Password is too short (minimum is 6 characters)".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(UsersRepositoryError::Invalid(errors))
    }
}

pub(crate) fn hash_password(password: &str) -> Result<String, UsersRepositoryError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| UsersRepositoryError::PasswordHash(err.to_string()))
}

pub(crate) fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// 32 random bytes, hex-encoded. Opaque to clients.
pub(crate) fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}
