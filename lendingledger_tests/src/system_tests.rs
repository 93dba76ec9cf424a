use std::time::UNIX_EPOCH;

use lendingledger_service::api::{
    BookDetails, BookDetailsPatch, BorrowStatus, CreateBorrowRequest,
};
use lendingledger_service::client::LendingLedgerClient;

const SERVICE_URL: &str = "http://127.0.0.1:8080";

// The service must be started with LIBRARIAN_EMAIL / LIBRARIAN_PASSWORD
// matching these values
const LIBRARIAN_EMAIL: &str = "librarian@books.com";
const LIBRARIAN_PASSWORD: &str = "password";

fn unique_email(prefix: &str) -> String {
    format!(
        "{}{}-{}@example.com",
        prefix,
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        rand::random::<u16>()
    )
}

fn unique_isbn() -> String {
    format!(
        "978-{}{}",
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        rand::random::<u16>()
    )
}

#[tokio::test]
/// Catalog management as a librarian
/// Logs in with the seeded librarian account
/// Creates a book
/// Gets the book
/// Patches the book
/// Searches for the patched title
/// Deletes the book and checks it is gone
async fn book_management_e2e_test() {
    let client = LendingLedgerClient::new(SERVICE_URL).expect("Failed to create client");

    let login = client
        .login(LIBRARIAN_EMAIL, LIBRARIAN_PASSWORD)
        .await
        .expect("Failed to login as librarian");
    let token = login.token;

    let isbn = unique_isbn();
    let book_details = BookDetails {
        title: "The Left Hand of Darkness".to_string(),
        author: "Ursula K. Le Guin".to_string(),
        genre: "Science Fiction".to_string(),
        isbn: isbn.clone(),
        copies: 3,
    };

    let book = client
        .add_book(&token, book_details.clone())
        .await
        .expect("Failed to add book");
    assert_eq!(book.title, book_details.title);
    assert_eq!(book.available_copies, 3);

    let returned_book = client
        .get_book(&token, book.id)
        .await
        .expect("Failed to get book")
        .expect("Book not found");
    assert_eq!(returned_book.isbn, isbn);

    let updated_title = format!(
        "updated title {}",
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    );
    let patch = BookDetailsPatch {
        title: Some(updated_title.clone()),
        ..BookDetailsPatch::default()
    };

    let patched_book = client
        .update_book(&token, book.id, patch)
        .await
        .expect("Failed to patch book");
    assert_eq!(patched_book.title, updated_title);
    assert_eq!(patched_book.author, book_details.author);

    let matches = client
        .search_books(&token, &updated_title)
        .await
        .expect("Failed to search books");
    assert!(matches.iter().any(|record| record.id == book.id));

    let all_books = client
        .list_books(&token)
        .await
        .expect("Failed to list books");
    assert!(all_books.iter().any(|record| record.id == book.id));

    client
        .delete_book(&token, book.id)
        .await
        .expect("Failed to delete book");

    let deleted = client
        .get_book(&token, book.id)
        .await
        .expect("Failed to query deleted book");
    assert!(deleted.is_none());
}

#[tokio::test]
/// Lending lifecycle across two members
/// Registers two members and a book with a single copy
/// First member borrows the book
/// A repeated borrow by the same member is rejected
/// The second member is rejected because no copies remain
/// The librarian returns the borrow, freeing the copy
/// The second member can then borrow the book
async fn borrow_lifecycle_e2e_test() {
    let client = LendingLedgerClient::new(SERVICE_URL).expect("Failed to create client");

    let librarian_token = client
        .login(LIBRARIAN_EMAIL, LIBRARIAN_PASSWORD)
        .await
        .expect("Failed to login as librarian")
        .token;

    let first_email = unique_email("member-a-");
    let second_email = unique_email("member-b-");
    client
        .register(&first_email, "password", "password")
        .await
        .expect("Failed to register first member");
    client
        .register(&second_email, "password", "password")
        .await
        .expect("Failed to register second member");

    let first_token = client
        .login(&first_email, "password")
        .await
        .expect("Failed to login first member")
        .token;
    let second_token = client
        .login(&second_email, "password")
        .await
        .expect("Failed to login second member")
        .token;

    let book = client
        .add_book(
            &librarian_token,
            BookDetails {
                title: "Borrowable".to_string(),
                author: "Author".to_string(),
                genre: "Fiction".to_string(),
                isbn: unique_isbn(),
                copies: 1,
            },
        )
        .await
        .expect("Failed to add book");

    // BORROW
    let borrow = client
        .create_borrow(
            &first_token,
            CreateBorrowRequest {
                book_id: book.id,
                due_at: None,
            },
        )
        .await
        .expect("Failed to call create borrow")
        .expect("Borrow was rejected");
    assert_eq!(borrow.book_id, book.id);
    assert_eq!(borrow.status, BorrowStatus::Borrowed);
    assert!(borrow.due_at.is_some());

    // BORROW AGAIN - rejected, the member already holds the book
    let rejection = client
        .create_borrow(
            &first_token,
            CreateBorrowRequest {
                book_id: book.id,
                due_at: None,
            },
        )
        .await
        .expect("Failed to call create borrow")
        .expect_err("Duplicate borrow was accepted");
    assert!(rejection
        .iter()
        .any(|message| message.contains("already borrowed")));

    // SECOND MEMBER - rejected, the only copy is out
    let rejection = client
        .create_borrow(
            &second_token,
            CreateBorrowRequest {
                book_id: book.id,
                due_at: None,
            },
        )
        .await
        .expect("Failed to call create borrow")
        .expect_err("Borrow of an unavailable book was accepted");
    assert!(rejection
        .iter()
        .any(|message| message.contains("no available copies")));

    // RETURN as librarian
    let returned = client
        .return_borrow(&librarian_token, borrow.id)
        .await
        .expect("Failed to call return borrow")
        .expect("Return was rejected");
    assert_eq!(returned.status, BorrowStatus::Returned);

    // RETURN AGAIN - rejected, the borrow is already closed
    let rejection = client
        .return_borrow(&librarian_token, borrow.id)
        .await
        .expect("Failed to call return borrow")
        .expect_err("Second return was accepted");
    assert!(!rejection.is_empty());

    // SECOND MEMBER retries now that the copy is free
    let second_borrow = client
        .create_borrow(
            &second_token,
            CreateBorrowRequest {
                book_id: book.id,
                due_at: None,
            },
        )
        .await
        .expect("Failed to call create borrow")
        .expect("Borrow was rejected after the copy was freed");
    assert_eq!(second_borrow.status, BorrowStatus::Borrowed);
    assert_ne!(second_borrow.user_id, borrow.user_id);

    // MEMBER borrow listing only shows their own loans
    let first_member_borrows = client
        .list_borrows(&first_token)
        .await
        .expect("Failed to list borrows");
    assert!(first_member_borrows
        .iter()
        .all(|view| view.user.is_none()));
    assert!(!first_member_borrows
        .iter()
        .any(|view| view.id == second_borrow.id));
}

#[tokio::test]
/// Dashboard report for both roles
/// A member sees their own stats and loans only
/// The librarian additionally sees library stats and the full ledger
async fn dashboard_e2e_test() {
    let client = LendingLedgerClient::new(SERVICE_URL).expect("Failed to create client");

    let librarian_token = client
        .login(LIBRARIAN_EMAIL, LIBRARIAN_PASSWORD)
        .await
        .expect("Failed to login as librarian")
        .token;

    let member_email = unique_email("member-dash-");
    client
        .register(&member_email, "password", "password")
        .await
        .expect("Failed to register member");
    let member_token = client
        .login(&member_email, "password")
        .await
        .expect("Failed to login member")
        .token;

    let book = client
        .add_book(
            &librarian_token,
            BookDetails {
                title: "Dashboard fodder".to_string(),
                author: "Author".to_string(),
                genre: "Fiction".to_string(),
                isbn: unique_isbn(),
                copies: 2,
            },
        )
        .await
        .expect("Failed to add book");

    let borrow = client
        .create_borrow(
            &member_token,
            CreateBorrowRequest {
                book_id: book.id,
                due_at: None,
            },
        )
        .await
        .expect("Failed to call create borrow")
        .expect("Borrow was rejected");

    let member_report = client
        .get_dashboard(&member_token)
        .await
        .expect("Failed to get member dashboard");
    assert!(member_report.library_stats.is_none());
    assert!(member_report.all_borrows.is_none());
    assert!(member_report.members_with_due_books.is_none());
    assert_eq!(member_report.user_stats.borrowed_count, 1);
    assert!(member_report
        .borrows
        .iter()
        .any(|view| view.id == borrow.id));

    let librarian_report = client
        .get_dashboard(&librarian_token)
        .await
        .expect("Failed to get librarian dashboard");
    let library_stats = librarian_report
        .library_stats
        .expect("Library stats missing");
    assert!(library_stats.total_borrowed >= 1);
    assert!(library_stats.total_books >= 2);
    let all_borrows = librarian_report
        .all_borrows
        .expect("Full ledger missing from librarian dashboard");
    let ledger_entry = all_borrows
        .iter()
        .find(|view| view.id == borrow.id)
        .expect("Member loan missing from full ledger");
    let borrower = ledger_entry
        .user
        .as_ref()
        .expect("Borrower missing from ledger entry");
    assert_eq!(borrower.email, member_email);
}

#[tokio::test]
/// Role enforcement over the wire
/// A member cannot create books or return borrows
/// Requests without a token are rejected
async fn permissions_e2e_test() {
    let client = LendingLedgerClient::new(SERVICE_URL).expect("Failed to create client");

    let member_email = unique_email("member-perm-");
    client
        .register(&member_email, "password", "password")
        .await
        .expect("Failed to register member");
    let member_token = client
        .login(&member_email, "password")
        .await
        .expect("Failed to login member")
        .token;

    let forbidden = client
        .add_book(
            &member_token,
            BookDetails {
                title: "Should not exist".to_string(),
                author: "Author".to_string(),
                genre: "Fiction".to_string(),
                isbn: unique_isbn(),
                copies: 1,
            },
        )
        .await;
    assert!(forbidden.is_err());

    let unauthenticated = client.list_books("not-a-real-token").await;
    assert!(unauthenticated.is_err());

    // LOGOUT invalidates the token
    client
        .logout(&member_token)
        .await
        .expect("Failed to logout");
    let after_logout = client.list_books(&member_token).await;
    assert!(after_logout.is_err());
}
