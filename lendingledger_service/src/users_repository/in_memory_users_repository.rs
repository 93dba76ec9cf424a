use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::api::{Role, UserId};
use crate::users_repository::{
    email_taken_error, generate_token, hash_password, validate_registration, verify_password,
    UserRecord, UsersRepository, UsersRepositoryError,
};

#[derive(Debug, Clone)]
struct StoredUser {
    email: String,
    password_hash: String,
    auth_token: Option<String>,
    roles: Vec<Role>,
}

pub struct InMemoryUsersRepository {
    users: parking_lot::RwLock<HashMap<UserId, StoredUser>>,
    user_sequence_generator: AtomicI32,
}

impl Default for InMemoryUsersRepository {
    fn default() -> Self {
        Self {
            users: Default::default(),
            user_sequence_generator: AtomicI32::new(1),
        }
    }
}

fn record(id: UserId, user: &StoredUser) -> UserRecord {
    UserRecord {
        id,
        email: user.email.clone(),
        roles: user.roles.clone(),
    }
}

#[async_trait::async_trait]
impl UsersRepository for InMemoryUsersRepository {
    async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, UsersRepositoryError> {
        validate_registration(email, password)?;
        let password_hash = hash_password(password)?;

        let mut locked_users = self.users.write();
        if locked_users
            .values()
            .any(|user| user.email.eq_ignore_ascii_case(email))
        {
            return Err(email_taken_error());
        }

        let id = self.user_sequence_generator.fetch_add(1, Ordering::Relaxed);
        let user = StoredUser {
            email: email.to_string(),
            password_hash,
            auth_token: None,
            roles: vec![Role::Member],
        };
        let result = record(id, &user);
        locked_users.insert(id, user);
        Ok(result)
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, String), UsersRepositoryError> {
        let mut locked_users = self.users.write();

        let (&id, user) = locked_users
            .iter_mut()
            .find(|(_, user)| user.email.eq_ignore_ascii_case(email))
            .ok_or(UsersRepositoryError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash) {
            return Err(UsersRepositoryError::InvalidCredentials);
        }

        let token = generate_token();
        user.auth_token = Some(token.clone());
        Ok((record(id, user), token))
    }

    async fn logout(&self, token: &str) -> Result<(), UsersRepositoryError> {
        let mut locked_users = self.users.write();

        let user = locked_users
            .values_mut()
            .find(|user| user.auth_token.as_deref() == Some(token))
            .ok_or(UsersRepositoryError::InvalidToken)?;

        user.auth_token = None;
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<UserRecord, UsersRepositoryError> {
        self.users
            .read()
            .iter()
            .find(|(_, user)| user.auth_token.as_deref() == Some(token))
            .map(|(&id, user)| record(id, user))
            .ok_or(UsersRepositoryError::InvalidToken)
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, UsersRepositoryError> {
        self.users
            .read()
            .get(&user_id)
            .map(|user| record(user_id, user))
            .ok_or(UsersRepositoryError::NotFound(user_id))
    }

    async fn set_roles(
        &self,
        user_id: UserId,
        roles: Vec<Role>,
    ) -> Result<(), UsersRepositoryError> {
        let mut locked_users = self.users.write();
        let user = locked_users
            .get_mut(&user_id)
            .ok_or(UsersRepositoryError::NotFound(user_id))?;
        user.roles = roles;
        Ok(())
    }
}

#[cfg(test)]
mod tests_in_memory_users_repository {
    use super::*;

    #[tokio::test]
    /// Covers registration and session handling in one narrative
    /// 1. Registers a member, duplicate email is rejected case-insensitively
    /// 2. Login with wrong password fails, correct one yields a token
    /// 3. Token resolves the user until logout invalidates it
    async fn test_registration_and_sessions() {
        let repository = InMemoryUsersRepository::default();

        let user = repository
            .register("member@books.com", "password")
            .await
            .expect("Failed to register");
        assert_eq!(user.roles, vec![Role::Member]);

        let duplicate = repository.register("MEMBER@books.com", "password").await;
        assert!(matches!(
            duplicate,
            Err(UsersRepositoryError::Invalid(..))
        ));

        let wrong_password = repository.login("member@books.com", "nope!!").await;
        assert!(matches!(
            wrong_password,
            Err(UsersRepositoryError::InvalidCredentials)
        ));

        let (logged_in, token) = repository
            .login("member@books.com", "password")
            .await
            .expect("Failed to login");
        assert_eq!(logged_in, user);

        let resolved = repository
            .find_by_token(&token)
            .await
            .expect("Failed to resolve token");
        assert_eq!(resolved, user);

        repository.logout(&token).await.expect("Failed to logout");
        let stale = repository.find_by_token(&token).await;
        assert!(matches!(stale, Err(UsersRepositoryError::InvalidToken)));
    }

    #[tokio::test]
    /// Login rotates the token; the previous one stops resolving
    async fn test_login_rotates_token() {
        let repository = InMemoryUsersRepository::default();
        repository
            .register("member@books.com", "password")
            .await
            .expect("Failed to register");

        let (_, first_token) = repository
            .login("member@books.com", "password")
            .await
            .expect("Failed to login");
        let (_, second_token) = repository
            .login("member@books.com", "password")
            .await
            .expect("Failed to login again");

        assert_ne!(first_token, second_token);
        assert!(repository.find_by_token(&second_token).await.is_ok());
        assert!(matches!(
            repository.find_by_token(&first_token).await,
            Err(UsersRepositoryError::InvalidToken)
        ));
    }

    #[tokio::test]
    /// Seeding replaces the default member role
    async fn test_set_roles() {
        let repository = InMemoryUsersRepository::default();
        let user = repository
            .register("librarian@books.com", "password")
            .await
            .expect("Failed to register");

        repository
            .set_roles(user.id, vec![Role::Librarian])
            .await
            .expect("Failed to set roles");

        let updated = repository.get_user(user.id).await.unwrap();
        assert_eq!(updated.roles, vec![Role::Librarian]);

        let unknown = repository.set_roles(user.id + 1000, vec![Role::Member]).await;
        assert!(matches!(unknown, Err(UsersRepositoryError::NotFound(..))));
    }
}
