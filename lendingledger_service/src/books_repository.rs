pub use in_memory_books_repository::InMemoryBooksRepository;
pub use postgres_books_repository::{PostgresBooksRepository, PostgresBooksRepositoryConfig};

use crate::api::{BookDetails, BookDetailsPatch, BookId};

mod in_memory_books_repository;
mod postgres_books_repository;

#[derive(thiserror::Error, Debug)]
pub enum BooksRepositoryError {
    #[error("Book {0} not found")]
    NotFound(BookId),

    #[error("{}", .0.join(", "))]
    Invalid(Vec<String>),

    #[error("Failed to deserialize book: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BookWithId {
    pub id: BookId,
    pub details: BookDetails,
}

#[async_trait::async_trait]
pub trait BooksRepository: Send + Sync {
    /// Adds a book to the inventory, returns the stored book with its id
    async fn add_book(&self, details: BookDetails) -> Result<BookWithId, BooksRepositoryError>;
    /// Applies a partial update; only the supplied fields change
    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<BookWithId, BooksRepositoryError>;
    /// Retrieves a single book, the canonical source of its copy count
    async fn get_book(&self, book_id: BookId) -> Result<BookWithId, BooksRepositoryError>;
    /// Removes a book; the caller is responsible for purging dependent ledger rows first
    async fn delete_book(&self, book_id: BookId) -> Result<(), BooksRepositoryError>;
    /// Lists all books in insertion order of ids
    async fn list_books(&self) -> Result<Vec<BookWithId>, BooksRepositoryError>;
    /// Case-insensitive substring search over title, author, genre and isbn
    async fn search_books(&self, query: &str) -> Result<Vec<BookWithId>, BooksRepositoryError>;
}

/// Field validation shared by both backends. Messages mirror the public API
/// error texts.
pub(crate) fn validate_details(details: &BookDetails) -> Result<(), BooksRepositoryError> {
    let mut errors = Vec::new();
    if details.title.trim().is_empty() {
        errors.push("Title can't be blank".to_string());
    }
    if details.author.trim().is_empty() {
        errors.push("Author can't be blank".to_string());
    }
    if details.isbn.trim().is_empty() {
        errors.push("Isbn can't be blank".to_string());
    }
    if details.copies < 0 {
        errors.push("Copies must be greater than or equal to 0".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BooksRepositoryError::Invalid(errors))
    }
}

pub(crate) fn isbn_taken_error() -> BooksRepositoryError {
    BooksRepositoryError::Invalid(vec!["Isbn has already been taken".to_string()])
}

pub(crate) fn apply_patch(details: &BookDetails, patch: &BookDetailsPatch) -> BookDetails {
    BookDetails {
        title: patch.title.clone().unwrap_or_else(|| details.title.clone()),
        author: patch
            .author
            .clone()
            .unwrap_or_else(|| details.author.clone()),
        genre: patch.genre.clone().unwrap_or_else(|| details.genre.clone()),
        isbn: patch.isbn.clone().unwrap_or_else(|| details.isbn.clone()),
        copies: patch.copies.unwrap_or(details.copies),
    }
}
