use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};

use serde_json::json;

use crate::api::{BookDetails, BookDetailsPatch, BookId};
use crate::books_repository::{
    isbn_taken_error, validate_details, BookWithId, BooksRepository, BooksRepositoryError,
};

pub struct InMemoryBooksRepository {
    book_sequence_generator: AtomicI32,
    books: parking_lot::RwLock<HashMap<BookId, BookDetails>>,
}

impl Default for InMemoryBooksRepository {
    fn default() -> Self {
        Self {
            book_sequence_generator: AtomicI32::new(1),
            books: Default::default(),
        }
    }
}

fn matches_query(details: &BookDetails, query: &str) -> bool {
    let query = query.to_lowercase();
    details.title.to_lowercase().contains(&query)
        || details.author.to_lowercase().contains(&query)
        || details.genre.to_lowercase().contains(&query)
        || details.isbn.to_lowercase().contains(&query)
}

#[async_trait::async_trait]
impl BooksRepository for InMemoryBooksRepository {
    async fn add_book(&self, details: BookDetails) -> Result<BookWithId, BooksRepositoryError> {
        validate_details(&details)?;

        let mut locked_books = self.books.write();
        if locked_books.values().any(|book| book.isbn == details.isbn) {
            return Err(isbn_taken_error());
        }
        let id = self.book_sequence_generator.fetch_add(1, Ordering::Relaxed);
        locked_books.insert(id, details.clone());
        Ok(BookWithId { id, details })
    }

    async fn update_book(
        &self,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> Result<BookWithId, BooksRepositoryError> {
        let mut locked_books = self.books.write();

        let current = locked_books
            .get(&book_id)
            .ok_or(BooksRepositoryError::NotFound(book_id))?;

        let mut result_book = json!(current);
        json_patch::merge(&mut result_book, &json!(patch));
        let result_book: BookDetails = serde_json::from_value(result_book)?;

        validate_details(&result_book)?;
        if locked_books
            .iter()
            .any(|(&id, book)| id != book_id && book.isbn == result_book.isbn)
        {
            return Err(isbn_taken_error());
        }

        locked_books.insert(book_id, result_book.clone());
        Ok(BookWithId {
            id: book_id,
            details: result_book,
        })
    }

    async fn get_book(&self, book_id: BookId) -> Result<BookWithId, BooksRepositoryError> {
        self.books
            .read()
            .get(&book_id)
            .cloned()
            .map(|details| BookWithId {
                id: book_id,
                details,
            })
            .ok_or(BooksRepositoryError::NotFound(book_id))
    }

    async fn delete_book(&self, book_id: BookId) -> Result<(), BooksRepositoryError> {
        self.books
            .write()
            .remove(&book_id)
            .map(|_| ())
            .ok_or(BooksRepositoryError::NotFound(book_id))
    }

    async fn list_books(&self) -> Result<Vec<BookWithId>, BooksRepositoryError> {
        let mut books: Vec<BookWithId> = self
            .books
            .read()
            .iter()
            .map(|(&id, details)| BookWithId {
                id,
                details: details.clone(),
            })
            .collect();
        books.sort_by_key(|book| book.id);
        Ok(books)
    }

    async fn search_books(&self, query: &str) -> Result<Vec<BookWithId>, BooksRepositoryError> {
        let mut books: Vec<BookWithId> = self
            .books
            .read()
            .iter()
            .filter(|(_, details)| matches_query(details, query))
            .map(|(&id, details)| BookWithId {
                id,
                details: details.clone(),
            })
            .collect();
        books.sort_by_key(|book| book.id);
        Ok(books)
    }
}
