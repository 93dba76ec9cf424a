use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::api::{BookId, BorrowId, BorrowRecord, BorrowStatus, UserId};
use crate::books_repository::{BooksRepository, BooksRepositoryError};
use crate::borrows_repository::{
    BorrowsFilter, BorrowsRepository, BorrowsRepositoryError,
};

pub struct InMemoryBorrowsRepository {
    books: Arc<dyn BooksRepository>,
    borrows: parking_lot::RwLock<HashMap<BorrowId, BorrowRecord>>,
    borrow_sequence_generator: AtomicI32,
}

impl InMemoryBorrowsRepository {
    pub fn new(books: Arc<dyn BooksRepository>) -> Self {
        Self {
            books,
            borrows: Default::default(),
            borrow_sequence_generator: AtomicI32::new(1),
        }
    }
}

#[async_trait::async_trait]
impl BorrowsRepository for InMemoryBorrowsRepository {
    async fn create_borrow(
        &self,
        user_id: UserId,
        book_id: BookId,
        due_at: NaiveDate,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        let book = self.books.get_book(book_id).await.map_err(|err| match err {
            BooksRepositoryError::NotFound(id) => BorrowsRepositoryError::BookNotFound(id),
            other => BorrowsRepositoryError::Other(other.to_string()),
        })?;

        // Lock held across check and insert, so the invariants cannot be
        // crossed by concurrent creates
        let mut locked_borrows = self.borrows.write();

        if locked_borrows.values().any(|borrow| {
            borrow.book_id == book_id
                && borrow.user_id == user_id
                && borrow.status == BorrowStatus::Borrowed
        }) {
            return Err(BorrowsRepositoryError::AlreadyBorrowed(book_id));
        }

        let active = locked_borrows
            .values()
            .filter(|borrow| borrow.book_id == book_id && borrow.status == BorrowStatus::Borrowed)
            .count() as i64;
        if i64::from(book.details.copies) - active <= 0 {
            return Err(BorrowsRepositoryError::NoCopiesAvailable(book_id));
        }

        let id = self
            .borrow_sequence_generator
            .fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let record = BorrowRecord {
            id,
            user_id,
            book_id,
            status: BorrowStatus::Borrowed,
            due_at: Some(due_at),
            created_at: now,
            updated_at: now,
        };
        locked_borrows.insert(id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        borrow_id: BorrowId,
        new_status: BorrowStatus,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        let mut locked_borrows = self.borrows.write();

        let record = locked_borrows
            .get_mut(&borrow_id)
            .ok_or(BorrowsRepositoryError::NotFound(borrow_id))?;

        match (record.status, new_status) {
            (BorrowStatus::Borrowed, BorrowStatus::Returned) => {
                record.status = BorrowStatus::Returned;
                record.updated_at = Utc::now();
                Ok(record.clone())
            }
            _ => Err(BorrowsRepositoryError::InvalidStatus),
        }
    }

    async fn get_borrow(
        &self,
        borrow_id: BorrowId,
    ) -> Result<BorrowRecord, BorrowsRepositoryError> {
        self.borrows
            .read()
            .get(&borrow_id)
            .cloned()
            .ok_or(BorrowsRepositoryError::NotFound(borrow_id))
    }

    async fn list_borrows(
        &self,
        filter: BorrowsFilter,
    ) -> Result<Vec<BorrowRecord>, BorrowsRepositoryError> {
        let mut records: Vec<BorrowRecord> = self
            .borrows
            .read()
            .values()
            .filter(|borrow| {
                filter
                    .user_id
                    .map(|user_id| borrow.user_id == user_id)
                    .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| borrow.status == status)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by_key(|borrow| borrow.id);
        Ok(records)
    }

    async fn count_active_borrows(
        &self,
        book_id: BookId,
    ) -> Result<i64, BorrowsRepositoryError> {
        Ok(self
            .borrows
            .read()
            .values()
            .filter(|borrow| borrow.book_id == book_id && borrow.status == BorrowStatus::Borrowed)
            .count() as i64)
    }

    async fn active_borrow_counts(&self) -> Result<HashMap<BookId, i64>, BorrowsRepositoryError> {
        let mut counts = HashMap::new();
        for borrow in self.borrows.read().values() {
            if borrow.status == BorrowStatus::Borrowed {
                *counts.entry(borrow.book_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn purge_book(&self, book_id: BookId) -> Result<(), BorrowsRepositoryError> {
        self.borrows
            .write()
            .retain(|_, borrow| borrow.book_id != book_id);
        Ok(())
    }
}
