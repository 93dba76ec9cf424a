use actix_web::http::header::AUTHORIZATION;
use actix_web::HttpRequest;

use crate::api::{Role, UserId};
use crate::users_repository::{UsersRepository, UsersRepositoryError};

/// Request-scoped caller context. Resolved once per request from the session
/// token and passed explicitly to ledger and reporting code; there is no
/// implicit current-user state anywhere else.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Caller {
    pub id: UserId,
    pub email: String,
    pub roles: Vec<Role>,
}

impl Caller {
    pub fn primary_role(&self) -> Option<Role> {
        self.roles.first().copied()
    }

    pub fn is_librarian(&self) -> bool {
        self.roles.contains(&Role::Librarian)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    /// The token store itself failed; distinct from a bad token so the HTTP
    /// layer can answer 500 instead of 401
    #[error("Token lookup failed: {0}")]
    Repository(UsersRepositoryError),
}

/// The token is the last whitespace-separated element of the Authorization
/// header, so both `Bearer <token>` and a bare token are accepted.
pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .split_whitespace()
        .last()
}

pub async fn authenticate(
    req: &HttpRequest,
    users_repository: &dyn UsersRepository,
) -> Result<Caller, AuthError> {
    let token = bearer_token(req).ok_or(AuthError::Unauthorized)?;

    match users_repository.find_by_token(token).await {
        Ok(user) => Ok(Caller {
            id: user.id,
            email: user.email,
            roles: user.roles,
        }),
        Err(UsersRepositoryError::InvalidToken) => Err(AuthError::Unauthorized),
        Err(err) => Err(AuthError::Repository(err)),
    }
}
