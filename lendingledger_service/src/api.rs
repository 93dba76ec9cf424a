use chrono::{DateTime, NaiveDate, Utc};
use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};

pub type UserId = i32;
pub type BookId = i32;
pub type BorrowId = i32;

/// The closed set of roles known to the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Apiv2Schema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Librarian,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Librarian => "librarian",
            Role::Member => "member",
        }
    }

    pub fn from_name(name: &str) -> Option<Role> {
        match name {
            "librarian" => Some(Role::Librarian),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "lowercase")]
pub enum BorrowStatus {
    Borrowed,
    Returned,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookDetails {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub genre: String,
    pub isbn: String,
    pub copies: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookDetailsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copies: Option<i32>,
}

/// Book as served to clients. `available_copies` is `copies` minus the number
/// of active borrows and is deliberately not clamped, so it can go negative
/// when the copy count was reduced below the active loan count.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub genre: String,
    pub isbn: String,
    pub copies: i32,
    pub available_copies: i64,
}

/// A single ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BorrowRecord {
    pub id: BorrowId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub status: BorrowStatus,
    pub due_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserSummary {
    pub id: UserId,
    pub email: String,
}

/// Ledger row joined with its book, and with the borrower when the caller is
/// a librarian.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BorrowView {
    pub id: BorrowId,
    pub status: BorrowStatus,
    pub due_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub book: BookRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct CreateBorrowRequest {
    pub book_id: BookId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UpdateBorrowRequest {
    pub status: BorrowStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub password_confirmation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserResponse {
    pub id: UserId,
    pub email: String,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct LoginResponse {
    pub message: String,
    pub user: UserResponse,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct SearchRequest {
    // `search_string` is accepted as a legacy spelling of the parameter
    #[serde(alias = "search_string")]
    pub q: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct LibraryStats {
    pub total_books: i64,
    pub total_borrowed: i64,
    pub available_books: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserStats {
    pub borrowed_count: i64,
    pub due_today_count: i64,
    pub overdue_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct MemberWithDueBooks {
    pub user_id: UserId,
    pub email: String,
    pub due_books_count: i64,
}

/// Role-scoped dashboard snapshot. Librarian-only fields are `null` for
/// members.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct DashboardReport {
    pub role: Option<Role>,
    pub library_stats: Option<LibraryStats>,
    pub user_stats: UserStats,
    pub borrows: Vec<BorrowView>,
    pub all_borrows: Option<Vec<BorrowView>>,
    pub due_today_borrows: Vec<BorrowView>,
    pub members_with_due_books: Option<Vec<MemberWithDueBooks>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ErrorsResponse {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct MessageResponse {
    pub message: String,
}

#[cfg(test)]
mod tests_api {
    use super::*;

    #[test]
    fn test_search_request_accepts_both_parameter_spellings() {
        let canonical: SearchRequest = serde_json::from_str(r#"{"q": "dune"}"#).unwrap();
        assert_eq!(canonical.q, "dune");

        let legacy: SearchRequest =
            serde_json::from_str(r#"{"search_string": "dune"}"#).unwrap();
        assert_eq!(legacy.q, "dune");
    }
}
