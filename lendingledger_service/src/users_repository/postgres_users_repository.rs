use anyhow::Context;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Statement};

use crate::api::{Role, UserId};
use crate::users_repository::{
    email_taken_error, generate_token, hash_password, validate_registration, verify_password,
    UserRecord, UsersRepository, UsersRepositoryError,
};

pub struct PostgresUsersRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresUsersRepository {
    client: Client,
}

impl PostgresUsersRepository {
    pub async fn init(config: PostgresUsersRepositoryConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        tracing::info!("Postgres connection_str: {}", connection_str);
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("connection error: {}", e);
            }
        });

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS users (
            id              SERIAL PRIMARY KEY,
            email           TEXT NOT NULL,
            password_hash   TEXT NOT NULL,
            auth_token      TEXT
            );
        CREATE UNIQUE INDEX IF NOT EXISTS users_email_unique ON users (LOWER(email));
        CREATE TABLE IF NOT EXISTS roles (
            id              SERIAL PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE
            );
        CREATE TABLE IF NOT EXISTS user_roles (
            user_id         INTEGER NOT NULL,
            role_id         INTEGER NOT NULL,
            UNIQUE (user_id, role_id)
            );
        INSERT INTO roles (name) VALUES ('librarian'), ('member')
            ON CONFLICT (name) DO NOTHING
        ",
            )
            .await
            .context("Failed to setup users tables")?;

        Ok(Self { client })
    }

    async fn roles_of(&self, user_id: UserId) -> Result<Vec<Role>, UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT roles.name FROM roles \
                 JOIN user_roles ON user_roles.role_id = roles.id \
                 WHERE user_roles.user_id = $1 ORDER BY roles.id",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&user_id]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                row.try_get::<_, String>(0)
                    .ok()
                    .and_then(|name| Role::from_name(&name))
            })
            .collect())
    }

    async fn assign_role(
        &self,
        user_id: UserId,
        role: Role,
    ) -> Result<(), UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "INSERT INTO user_roles (user_id, role_id) \
                 SELECT $1, roles.id FROM roles WHERE roles.name = $2 \
                 ON CONFLICT (user_id, role_id) DO NOTHING",
            )
            .await?;
        self.client.execute(&stmt, &[&user_id, &role.as_str()]).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl UsersRepository for PostgresUsersRepository {
    async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserRecord, UsersRepositoryError> {
        validate_registration(email, password)?;
        let password_hash = hash_password(password)?;

        let stmt: Statement = self
            .client
            .prepare("INSERT INTO users (email, password_hash) VALUES ($1, $2) RETURNING id")
            .await?;

        let rows = self
            .client
            .query(&stmt, &[&email, &password_hash])
            .await
            .map_err(|err| {
                if err
                    .as_db_error()
                    // This is unique constraint validation error
                    .map(|db_err| db_err.code() == &SqlState::from_code("23505"))
                    .unwrap_or_default()
                {
                    email_taken_error()
                } else {
                    err.into()
                }
            })?;

        let user_id: UserId = rows
            .first()
            .ok_or_else(|| UsersRepositoryError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        self.assign_role(user_id, Role::Member).await?;

        Ok(UserRecord {
            id: user_id,
            email: email.to_string(),
            roles: vec![Role::Member],
        })
    }

    async fn login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, String), UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(
                "SELECT id, email, password_hash FROM users WHERE LOWER(email) = LOWER($1)",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&email]).await?;
        let row = rows
            .first()
            .ok_or(UsersRepositoryError::InvalidCredentials)?;

        let user_id: UserId = row.try_get(0)?;
        let stored_email: String = row.try_get(1)?;
        let password_hash: String = row.try_get(2)?;

        if !verify_password(password, &password_hash) {
            return Err(UsersRepositoryError::InvalidCredentials);
        }

        let token = generate_token();
        let update_stmt: Statement = self
            .client
            .prepare("UPDATE users SET auth_token = $1 WHERE id = $2")
            .await?;
        self.client.execute(&update_stmt, &[&token, &user_id]).await?;

        let roles = self.roles_of(user_id).await?;
        Ok((
            UserRecord {
                id: user_id,
                email: stored_email,
                roles,
            },
            token,
        ))
    }

    async fn logout(&self, token: &str) -> Result<(), UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("UPDATE users SET auth_token = NULL WHERE auth_token = $1 RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&token]).await?;
        if rows.is_empty() {
            Err(UsersRepositoryError::InvalidToken)
        } else {
            Ok(())
        }
    }

    async fn find_by_token(&self, token: &str) -> Result<UserRecord, UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id, email FROM users WHERE auth_token = $1")
            .await?;

        let rows = self.client.query(&stmt, &[&token]).await?;
        let row = rows.first().ok_or(UsersRepositoryError::InvalidToken)?;

        let user_id: UserId = row.try_get(0)?;
        let email: String = row.try_get(1)?;
        let roles = self.roles_of(user_id).await?;

        Ok(UserRecord {
            id: user_id,
            email,
            roles,
        })
    }

    async fn get_user(&self, user_id: UserId) -> Result<UserRecord, UsersRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id, email FROM users WHERE id = $1")
            .await?;

        let rows = self.client.query(&stmt, &[&user_id]).await?;
        let row = rows.first().ok_or(UsersRepositoryError::NotFound(user_id))?;

        let email: String = row.try_get(1)?;
        let roles = self.roles_of(user_id).await?;

        Ok(UserRecord {
            id: user_id,
            email,
            roles,
        })
    }

    async fn set_roles(
        &self,
        user_id: UserId,
        roles: Vec<Role>,
    ) -> Result<(), UsersRepositoryError> {
        // Ensure the user exists before rewriting assignments
        self.get_user(user_id).await?;

        let delete_stmt: Statement = self
            .client
            .prepare("DELETE FROM user_roles WHERE user_id = $1")
            .await?;
        self.client.execute(&delete_stmt, &[&user_id]).await?;

        for role in roles {
            self.assign_role(user_id, role).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests_postgres_users_repository {
    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use super::*;

    async fn start_postgres_container_and_init_repo(
    ) -> (ContainerAsync<GenericImage>, PostgresUsersRepository) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(repo) = PostgresUsersRepository::init(PostgresUsersRepositoryConfig {
                hostname: "127.0.0.1".to_string(),
                username: "postgres".to_string(),
                password: "postgres".to_string(),
            })
            .await
            {
                return (_pg_container, repo);
            }
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Covers account and session management against a real database
    /// Combined into one big test to avoid duplicate container setup
    /// 1. Registers a member, duplicate email rejected case-insensitively
    /// 2. Login returns a token that resolves the user with the member role
    /// 3. Promoting to librarian replaces the role set
    /// 4. Logout invalidates the token
    async fn test_user_management() {
        let (_container, repository) = start_postgres_container_and_init_repo().await;

        let user = repository
            .register("member@books.com", "password")
            .await
            .expect("Failed to register");
        assert_eq!(user.roles, vec![Role::Member]);

        let duplicate = repository.register("MEMBER@books.com", "password").await;
        assert!(matches!(duplicate, Err(UsersRepositoryError::Invalid(..))));

        let wrong = repository.login("member@books.com", "wrong!").await;
        assert!(matches!(
            wrong,
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
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.roles, vec![Role::Member]);

        repository
            .set_roles(user.id, vec![Role::Librarian])
            .await
            .expect("Failed to set roles");
        let promoted = repository.get_user(user.id).await.unwrap();
        assert_eq!(promoted.roles, vec![Role::Librarian]);

        repository.logout(&token).await.expect("Failed to logout");
        let stale = repository.find_by_token(&token).await;
        assert!(matches!(stale, Err(UsersRepositoryError::InvalidToken)));
    }
}
