use anyhow::Context;
use chrono::NaiveDate;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row, Statement};

use crate::api::{BookId, BorrowId, BorrowRecord, BorrowStatus, UserId};
use crate::borrows_repository::{
    BorrowsFilter, BorrowsRepository, BorrowsRepositoryError,
};

pub struct PostgresBorrowsRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresBorrowsRepository {
    // Mutex rather than a bare client so create_borrow can run a transaction
    client: Mutex<Client>,
}

const BORROW_COLUMNS: &str = "id, user_id, book_id, status, due_at, created_at, updated_at";

fn status_to_i32(status: BorrowStatus) -> i32 {
    match status {
        BorrowStatus::Borrowed => 0,
        BorrowStatus::Returned => 1,
    }
}

fn status_from_i32(value: i32) -> Result<BorrowStatus, BorrowsRepositoryError> {
    match value {
        0 => Ok(BorrowStatus::Borrowed),
        1 => Ok(BorrowStatus::Returned),
        other => Err(BorrowsRepositoryError::Other(format!(
            "Unknown borrow status {}",
            other
        ))),
    }
}

fn borrow_from_row(row: &Row) -> Result<BorrowRecord, BorrowsRepositoryError> {
    Ok(BorrowRecord {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        book_id: row.try_get(2)?,
        status: status_from_i32(row.try_get(3)?)?,
        due_at: row.try_get(4)?,
        created_at: row.try_get(5)?,
        updated_at: row.try_get(6)?,
    })
}

impl PostgresBorrowsRepository {
    pub async fn init(config: PostgresBorrowsRepositoryConfig) -> anyhow::Result<Self> {
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
        CREATE TABLE IF NOT EXISTS borrows (
            id              SERIAL PRIMARY KEY,
            user_id         INTEGER NOT NULL,
            book_id         INTEGER NOT NULL,
            status          INTEGER NOT NULL DEFAULT 0,
            due_at          DATE,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        CREATE UNIQUE INDEX IF NOT EXISTS borrows_one_active_per_user_and_book
            ON borrows (user_id, book_id) WHERE status = 0
        ",
            )
            .await
            .context("Failed to setup borrows table")?;

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait::async_trait]
impl BorrowsRepository for PostgresBorrowsRepository {
    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        due_at: NaiveDate,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        // The book row is locked for the whole transaction, so concurrent
        // creates for the same book serialize and each one counts the active
        // borrows the previous one committed. The partial unique index stays
        // as a backstop for the duplicate-borrow invariant.
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;

        let book_rows = transaction
            .query(
                "SELECT copies FROM books WHERE id = $1 FOR UPDATE",
                &[&book_id],
            )
            .await?;
        let Some(book_row) = book_rows.first() else {
            return Err(BorrowsRepositoryError::BookNotFound(book_id));
        };
        let copies: i32 = book_row.try_get(0)?;

        let duplicates = transaction
            .query(
                "SELECT 1 FROM borrows WHERE user_id = $1 AND book_id = $2 AND status = 0",
                &[&user_id, &book_id],
            )
            .await?;
        if !duplicates.is_empty() {
            return Err(BorrowsRepositoryError::AlreadyBorrowed(book_id));
        }

        let active: i64 = transaction
            .query_one(
                "SELECT COUNT(*) FROM borrows WHERE book_id = $1 AND status = 0",
                &[&book_id],
            )
            .await?
            .try_get(0)?;
        if i64::from(copies) - active <= 0 {
            return Err(BorrowsRepositoryError::NoCopiesAvailable(book_id));
        }

        let row = transaction
            .query_one(
                "INSERT INTO borrows (user_id, book_id, status, due_at) \
                 VALUES ($1, $2, 0, $3) \
                 RETURNING id, user_id, book_id, status, due_at, created_at, updated_at",
                &[&user_id, &book_id, &due_at],
            )
            .await
            .map_err(|err| {
                if err
                    .as_db_error()
                    // This is unique constraint validation error
                    .map(|db_err| db_err.code() == &SqlState::from_code("23505"))
                    .unwrap_or_default()
                {
                    BorrowsRepositoryError::AlreadyBorrowed(book_id)
                } else {
                    err.into()
                }
            })?;
        let record = borrow_from_row(&row)?;

        transaction.commit().await?;
        Ok(record)
    }

    async fn update_status(
        &self,
        borrow_id: BorrowId,
        new_status: BorrowStatus,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        if new_status != BorrowStatus::Returned {
            // Existence first, so an unknown id maps to NotFound for every
            // requested status
            self.get_borrow(borrow_id).await?;
            return Err(BorrowsRepositoryError::InvalidStatus);
        }

        let rows = {
            let client = self.client.lock().await;
            let stmt: Statement = client
                .prepare(
                    "UPDATE borrows SET status = 1, updated_at = now() \
                     WHERE id = $1 AND status = 0 \
                     RETURNING id, user_id, book_id, status, due_at, created_at, updated_at",
                )
                .await?;
            client.query(&stmt, &[&borrow_id]).await?
        };

        if let Some(row) = rows.first() {
            return borrow_from_row(row);
        }

        // Either the record does not exist or it is already returned
        match self.get_borrow(borrow_id).await {
            Ok(_) => Err(BorrowsRepositoryError::InvalidStatus),
            Err(err) => Err(err),
        }
    }

    async fn get_borrow(
        &self,
        borrow_id: BorrowId,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        let client = self.client.lock().await;
        let stmt: Statement = client
            .prepare(&format!(
                "SELECT {} FROM borrows WHERE id = $1",
                BORROW_COLUMNS
            ))
            .await?;

        let rows = client.query(&stmt, &[&borrow_id]).await?;

        borrow_from_row(
            rows.first()
                .ok_or(BorrowsRepositoryError::NotFound(borrow_id))?,
        )
    }

    async fn list_borrows(
        &self,
        filter: BorrowsFilter,
    ) -> Result<Vec<BorrowRecord>, BorrowsRepositoryError> {
        let client = self.client.lock().await;
        let status = filter.status.map(status_to_i32);
        let rows = match (filter.user_id, status) {
            (Some(user_id), Some(status)) => {
                let stmt = client
                    .prepare(&format!(
                        "SELECT {} FROM borrows WHERE user_id = $1 AND status = $2 ORDER BY id",
                        BORROW_COLUMNS
                    ))
                    .await?;
                client.query(&stmt, &[&user_id, &status]).await?
            }
            (Some(user_id), None) => {
                let stmt = client
                    .prepare(&format!(
                        "SELECT {} FROM borrows WHERE user_id = $1 ORDER BY id",
                        BORROW_COLUMNS
                    ))
                    .await?;
                client.query(&stmt, &[&user_id]).await?
            }
            (None, Some(status)) => {
                let stmt = client
                    .prepare(&format!(
                        "SELECT {} FROM borrows WHERE status = $1 ORDER BY id",
                        BORROW_COLUMNS
                    ))
                    .await?;
                client.query(&stmt, &[&status]).await?
            }
            (None, None) => {
                let stmt = client
                    .prepare(&format!("SELECT {} FROM borrows ORDER BY id", BORROW_COLUMNS))
                    .await?;
                client.query(&stmt, &[]).await?
            }
        };

        rows.iter().map(borrow_from_row).collect()
    }

    async fn count_active_borrows(
        &self,
        book_id: BookId,
    ) -> Result<i64, BorrowsRepositoryError> {
        let client = self.client.lock().await;
        let stmt: Statement = client
            .prepare("SELECT COUNT(*) FROM borrows WHERE book_id = $1 AND status = 0")
            .await?;

        let rows = client.query(&stmt, &[&book_id]).await?;
        let count: i64 = rows
            .first()
            .ok_or_else(|| BorrowsRepositoryError::Other("Count not returned".to_string()))?
            .try_get(0)?;
        Ok(count)
    }

    async fn active_borrow_counts(&self) -> Result<HashMap<BookId, i64>, BorrowsRepositoryError> {
        let client = self.client.lock().await;
        let stmt: Statement = client
            .prepare("SELECT book_id, COUNT(*) FROM borrows WHERE status = 0 GROUP BY book_id")
            .await?;

        let rows = client.query(&stmt, &[]).await?;
        rows.iter()
            .map(|row| {
                let book_id: BookId = row.try_get(0)?;
                let count: i64 = row.try_get(1)?;
                Ok((book_id, count))
            })
            .collect()
    }

    async fn purge_book(&self, book_id: BookId) -> Result<(), BorrowsRepositoryError> {
        let client = self.client.lock().await;
        let stmt: Statement = client
            .prepare("DELETE FROM borrows WHERE book_id = $1")
            .await?;
        client.execute(&stmt, &[&book_id]).await?;
        Ok(())
    }
}
