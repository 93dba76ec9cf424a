pub use in_memory_borrows_repository::InMemoryBorrowsRepository;
pub use postgres_borrows_repository::{
    PostgresBorrowsRepository, PostgresBorrowsRepositoryConfig,
};

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::api::{BookId, BorrowId, BorrowRecord, BorrowStatus, UserId};

mod in_memory_borrows_repository;
mod postgres_borrows_repository;

#[derive(Debug, thiserror::Error)]
pub enum BorrowsRepositoryError {
    #[error("Borrow {0} not found")]
    NotFound(BorrowId),

    #[error("Book must exist")]
    BookNotFound(BookId),

    #[error("Book has no available copies")]
    NoCopiesAvailable(BookId),

    #[error("Book is already borrowed by this user. Please return it before borrowing again.")]
    AlreadyBorrowed(BookId),

    #[error("Status transition not allowed")]
    InvalidStatus,

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BorrowsFilter {
    pub user_id: Option<UserId>,
    pub status: Option<BorrowStatus>,
}

/// The ledger of borrow records. Creation is the sole gate protecting the
/// availability invariant: a record enters in `borrowed` state only while
/// `copies - active borrows > 0` holds for its book, and a borrower never
/// holds two active records for the same book. Both backends make the
/// check-and-insert atomic.
#[async_trait::async_trait]
pub trait BorrowsRepository: Send + Sync {
    /// Creates an active borrow for the given borrower and book
    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        due_at: NaiveDate,
    ) -> Result<BorrowRecord, BorrowsRepositoryError>;

    /// The only legal transition is borrowed -> returned; a second return of
    /// the same record fails instead of silently re-succeeding
    async fn update_status(
        &self,
        borrow_id: BorrowId,
        new_status: BorrowStatus,
    ) -> Result<BorrowRecord, BorrowsRepositoryError>;

    async fn get_borrow(&self, borrow_id: BorrowId)
        -> Result<BorrowRecord, BorrowsRepositoryError>;

    /// Lists records in insertion order, optionally scoped to a borrower
    /// and/or status
    async fn list_borrows(
        &self,
        filter: BorrowsFilter,
    ) -> Result<Vec<BorrowRecord>, BorrowsRepositoryError>;

    async fn count_active_borrows(
        &self,
        book_id: BookId,
    ) -> Result<i64, BorrowsRepositoryError>;

    /// Active borrow counts grouped by book, for availability reporting
    async fn active_borrow_counts(&self) -> Result<HashMap<BookId, i64>, BorrowsRepositoryError>;

    /// Removes every record for a book; used when the book itself is deleted
    async fn purge_book(&self, book_id: BookId) -> Result<(), BorrowsRepositoryError>;
}
