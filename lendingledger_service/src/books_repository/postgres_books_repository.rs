use anyhow::Context;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::api::{BookDetails, BookDetailsPatch, BookId};
use crate::books_repository::{
    apply_patch, isbn_taken_error, validate_details, BookWithId, BooksRepository,
    BooksRepositoryError,
};

pub struct PostgresBooksRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresBooksRepository {
    client: Client,
}

const BOOK_COLUMNS: &str = "id, title, author, genre, isbn, copies";

fn book_from_row(row: &Row) -> Result<BookWithId, BooksRepositoryError> {
    Ok(BookWithId {
        id: row.try_get(0)?,
        details: BookDetails {
            title: row.try_get(1)?,
            author: row.try_get(2)?,
            genre: row.try_get(3)?,
            isbn: row.try_get(4)?,
            copies: row.try_get(5)?,
        },
    })
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.as_db_error()
        // This is unique constraint validation error
        .map(|db_err| db_err.code() == &SqlState::from_code("23505"))
        .unwrap_or_default()
}

impl PostgresBooksRepository {
    pub async fn init(config: PostgresBooksRepositoryConfig) -> anyhow::Result<Self> {
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
        CREATE TABLE IF NOT EXISTS books (
            id              SERIAL PRIMARY KEY,
            title           TEXT NOT NULL,
            author          TEXT NOT NULL,
            genre           TEXT NOT NULL DEFAULT '',
            isbn            TEXT NOT NULL UNIQUE,
            copies          INTEGER NOT NULL DEFAULT 0 CHECK (copies >= 0)
            )
        ",
            )
            .await
            .context("Failed to setup books table")?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl BooksRepository for PostgresBooksRepository {
    async fn add_book(&self, details: BookDetails) -> Result<BookWithId, BooksRepositoryError> {
        validate_details(&details)?;

        let stmt: Statement = self
            .client
            .prepare(
                "INSERT INTO books (title, author, genre, isbn, copies) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id, title, author, genre, isbn, copies",
            )
            .await?;

        let rows = self
            .client
            .query(
                &stmt,
                &[
                    &details.title,
                    &details.author,
                    &details.genre,
                    &details.isbn,
                    &details.copies,
                ],
            )
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    isbn_taken_error()
                } else {
                    err.into()
                }
            })?;

        book_from_row(
            rows.first()
                .ok_or_else(|| BooksRepositoryError::Other("Id not returned".to_string()))?,
        )
    }

    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<BookWithId, BooksRepositoryError> {
        let current = self.get_book(book_id).await?;
        let updated = apply_patch(&current.details, &patch);
        validate_details(&updated)?;

        let stmt: Statement = self
            .client
            .prepare(
                "UPDATE books SET title = $1, author = $2, genre = $3, isbn = $4, copies = $5 \
                 WHERE id = $6 RETURNING id, title, author, genre, isbn, copies",
            )
            .await?;

        let rows = self
            .client
            .query(
                &stmt,
                &[
                    &updated.title,
                    &updated.author,
                    &updated.genre,
                    &updated.isbn,
                    &updated.copies,
                    &book_id,
                ],
            )
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    isbn_taken_error()
                } else {
                    err.into()
                }
            })?;

        book_from_row(
            rows.first()
                .ok_or(BooksRepositoryError::NotFound(book_id))?,
        )
    }

    async fn get_book(&self, book_id: BookId) -> Result<BookWithId, BooksRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT id, title, author, genre, isbn, copies FROM books WHERE id = ($1)")
            .await?;

        let rows = self.client.query(&stmt, &[&book_id]).await?;

        book_from_row(
            rows.first()
                .ok_or(BooksRepositoryError::NotFound(book_id))?,
        )
    }

    async fn delete_book(&self, book_id: BookId) -> Result<(), BooksRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare("DELETE FROM books WHERE id = $1 RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&book_id]).await?;

        if rows.is_empty() {
            Err(BooksRepositoryError::NotFound(book_id))
        } else {
            Ok(())
        }
    }

    async fn list_books(&self) -> Result<Vec<BookWithId>, BooksRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(&format!("SELECT {} FROM books ORDER BY id", BOOK_COLUMNS))
            .await?;

        let rows = self.client.query(&stmt, &[]).await?;
        rows.iter().map(book_from_row).collect()
    }

    async fn search_books(&self, query: &str) -> Result<Vec<BookWithId>, BooksRepositoryError> {
        let stmt: Statement = self
            .client
            .prepare(&format!(
                "SELECT {} FROM books \
                 WHERE LOWER(title) LIKE $1 OR LOWER(author) LIKE $1 \
                    OR LOWER(genre) LIKE $1 OR LOWER(isbn) LIKE $1 \
                 ORDER BY id",
                BOOK_COLUMNS
            ))
            .await?;

        let pattern = format!("%{}%", query.to_lowercase());
        let rows = self.client.query(&stmt, &[&pattern]).await?;
        rows.iter().map(book_from_row).collect()
    }
}

#[cfg(test)]
mod tests_postgres_books_repository {
    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use super::*;

    async fn start_postgres_container_and_init_repo(
    ) -> (ContainerAsync<GenericImage>, PostgresBooksRepository) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(repo) = PostgresBooksRepository::init(PostgresBooksRepositoryConfig {
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
    /// Covers the inventory lifecycle against a real database
    /// Combined into one big test to avoid duplicate container setup
    /// 1. Adds a book, reads it back, lists it
    /// 2. Rejects a duplicate isbn
    /// 3. Patches the copy count
    /// 4. Searches by author substring
    /// 5. Deletes the book
    async fn test_book_management() {
        let (_container, repository) = start_postgres_container_and_init_repo().await;

        let details = BookDetails {
            title: "Snow Crash".to_string(),
            author: "Neal Stephenson".to_string(),
            genre: "Science Fiction".to_string(),
            isbn: "978-0553380958".to_string(),
            copies: 2,
        };

        let added = repository
            .add_book(details.clone())
            .await
            .expect("Failed to add book");
        assert_eq!(added.details, details);

        let fetched = repository
            .get_book(added.id)
            .await
            .expect("Failed to get book");
        assert_eq!(fetched, added);

        let listed = repository.list_books().await.expect("Failed to list");
        assert!(listed.contains(&added));

        let duplicate = repository.add_book(details.clone()).await;
        assert!(matches!(duplicate, Err(BooksRepositoryError::Invalid(..))));

        let updated = repository
            .update_book(
                added.id,
                BookDetailsPatch {
                    copies: Some(5),
                    ..BookDetailsPatch::default()
                },
            )
            .await
            .expect("Failed to update book");
        assert_eq!(updated.details.copies, 5);

        let found = repository
            .search_books("stephenson")
            .await
            .expect("Failed to search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, added.id);

        repository
            .delete_book(added.id)
            .await
            .expect("Failed to delete book");
        let missing = repository.get_book(added.id).await;
        assert!(matches!(missing, Err(BooksRepositoryError::NotFound(..))));
    }
}
