use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::api::{
    BorrowView, DashboardReport, LibraryStats, MemberWithDueBooks, UserId, UserStats,
};
use crate::auth::Caller;
use crate::books_repository::BookWithId;

/// Builds the role-scoped dashboard snapshot from an already-fetched view of
/// the ledger. Pure on purpose: `today` is evaluated once by the caller so
/// every figure in the report agrees on what "today" means.
///
/// For a librarian, `active_borrows` is the global set of active borrows
/// (each carrying its borrower); for a member it is the caller's own set.
pub fn build_report(
    caller: &Caller,
    today: NaiveDate,
    books: &[BookWithId],
    active_borrows: &[BorrowView],
) -> DashboardReport {
    let is_librarian = caller.is_librarian();

    let user_active: Vec<&BorrowView> = if is_librarian {
        active_borrows
            .iter()
            .filter(|borrow| {
                borrow
                    .user
                    .as_ref()
                    .map(|user| user.id == caller.id)
                    .unwrap_or(false)
            })
            .collect()
    } else {
        active_borrows.iter().collect()
    };

    let library_stats = is_librarian.then(|| {
        let total_books: i64 = books
            .iter()
            .map(|book| i64::from(book.details.copies))
            .sum();
        let total_borrowed = active_borrows.len() as i64;
        LibraryStats {
            total_books,
            total_borrowed,
            // Clamped here, unlike the per-book available_copies figure
            available_books: (total_books - total_borrowed).max(0),
        }
    });

    let members_with_due_books = is_librarian.then(|| {
        let mut counts: BTreeMap<UserId, (String, i64)> = BTreeMap::new();
        for borrow in active_borrows {
            let due = matches!(borrow.due_at, Some(due_at) if due_at <= today);
            if let (true, Some(user)) = (due, borrow.user.as_ref()) {
                counts.entry(user.id).or_insert((user.email.clone(), 0)).1 += 1;
            }
        }
        counts
            .into_iter()
            .map(|(user_id, (email, due_books_count))| MemberWithDueBooks {
                user_id,
                email,
                due_books_count,
            })
            .collect::<Vec<_>>()
    });

    let due_today_borrows: Vec<BorrowView> = user_active
        .iter()
        .filter(|borrow| borrow.due_at == Some(today))
        .map(|&borrow| borrow.clone())
        .collect();
    let overdue_count = user_active
        .iter()
        .filter(|borrow| matches!(borrow.due_at, Some(due_at) if due_at < today))
        .count() as i64;

    let user_stats = UserStats {
        borrowed_count: user_active.len() as i64,
        due_today_count: due_today_borrows.len() as i64,
        overdue_count,
    };

    DashboardReport {
        role: caller.primary_role(),
        library_stats,
        user_stats,
        borrows: user_active.into_iter().cloned().collect(),
        all_borrows: is_librarian.then(|| active_borrows.to_vec()),
        due_today_borrows,
        members_with_due_books,
    }
}

#[cfg(test)]
mod tests_dashboard {
    use chrono::{Days, TimeZone, Utc};

    use crate::api::{
        BookDetails, BookId, BookRecord, BorrowId, BorrowStatus, Role, UserSummary,
    };

    use super::*;

    fn librarian() -> Caller {
        Caller {
            id: 100,
            email: "librarian@books.com".to_string(),
            roles: vec![Role::Librarian],
        }
    }

    fn member(id: UserId) -> Caller {
        Caller {
            id,
            email: format!("member{}@books.com", id),
            roles: vec![Role::Member],
        }
    }

    fn book(id: BookId, copies: i32) -> BookWithId {
        BookWithId {
            id,
            details: BookDetails {
                title: format!("Book {}", id),
                author: "Author".to_string(),
                genre: "Fiction".to_string(),
                isbn: format!("isbn-{}", id),
                copies,
            },
        }
    }

    fn active_borrow(
        id: BorrowId,
        book: &BookWithId,
        borrower: &Caller,
        due_at: Option<NaiveDate>,
    ) -> BorrowView {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        BorrowView {
            id,
            status: BorrowStatus::Borrowed,
            due_at,
            created_at: timestamp,
            updated_at: timestamp,
            book: BookRecord {
                id: book.id,
                title: book.details.title.clone(),
                author: book.details.author.clone(),
                genre: book.details.genre.clone(),
                isbn: book.details.isbn.clone(),
                copies: book.details.copies,
                available_copies: i64::from(book.details.copies),
            },
            user: Some(UserSummary {
                id: borrower.id,
                email: borrower.email.clone(),
            }),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
    }

    #[test]
    fn test_member_report_has_no_librarian_sections() {
        let caller = member(1);
        let books = vec![book(1, 3)];
        let mut borrow = active_borrow(1, &books[0], &caller, Some(today()));
        // Member-scoped views carry no borrower
        borrow.user = None;

        let report = build_report(&caller, today(), &books, &[borrow]);

        assert_eq!(report.role, Some(Role::Member));
        assert_eq!(report.library_stats, None);
        assert_eq!(report.all_borrows, None);
        assert_eq!(report.members_with_due_books, None);
        assert_eq!(report.user_stats.borrowed_count, 1);
        assert_eq!(report.user_stats.due_today_count, 1);
        assert_eq!(report.user_stats.overdue_count, 0);
        assert_eq!(report.due_today_borrows.len(), 1);
    }

    #[test]
    fn test_librarian_total_borrowed_matches_all_borrows() {
        let caller = librarian();
        let books = vec![book(1, 3), book(2, 2)];
        let borrows = vec![
            active_borrow(1, &books[0], &member(1), Some(today())),
            active_borrow(2, &books[0], &member(2), None),
            active_borrow(3, &books[1], &caller, Some(today())),
        ];

        let report = build_report(&caller, today(), &books, &borrows);

        let stats = report.library_stats.expect("Missing library stats");
        assert_eq!(stats.total_books, 5);
        assert_eq!(stats.total_borrowed, 3);
        assert_eq!(stats.available_books, 2);
        assert_eq!(
            stats.total_borrowed,
            report.all_borrows.expect("Missing all borrows").len() as i64
        );

        // Only the librarian's own borrow lands in the user-scoped fields
        assert_eq!(report.user_stats.borrowed_count, 1);
        assert_eq!(report.borrows.len(), 1);
        assert_eq!(report.borrows[0].id, 3);
    }

    #[test]
    fn test_available_books_is_clamped_to_zero() {
        let caller = librarian();
        // Copies were reduced below the number of active loans
        let books = vec![book(1, 1)];
        let borrows = vec![
            active_borrow(1, &books[0], &member(1), None),
            active_borrow(2, &books[0], &member(2), None),
        ];

        let report = build_report(&caller, today(), &books, &borrows);
        let stats = report.library_stats.unwrap();
        assert_eq!(stats.total_books, 1);
        assert_eq!(stats.total_borrowed, 2);
        assert_eq!(stats.available_books, 0);
    }

    #[test]
    fn test_due_today_is_not_overdue() {
        let caller = member(1);
        let books = vec![book(1, 2)];
        let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
        let tomorrow = today().checked_add_days(Days::new(1)).unwrap();

        let mut due_today = active_borrow(1, &books[0], &caller, Some(today()));
        due_today.user = None;
        let mut overdue = active_borrow(2, &books[0], &caller, Some(yesterday));
        overdue.user = None;
        let mut not_due = active_borrow(3, &books[0], &caller, Some(tomorrow));
        not_due.user = None;

        let report = build_report(&caller, today(), &books, &[due_today, overdue, not_due]);

        assert_eq!(report.user_stats.borrowed_count, 3);
        assert_eq!(report.user_stats.due_today_count, 1);
        assert_eq!(report.user_stats.overdue_count, 1);
        assert_eq!(report.due_today_borrows.len(), 1);
        assert_eq!(report.due_today_borrows[0].id, 1);
    }

    #[test]
    fn test_members_with_due_books_groups_by_borrower() {
        let caller = librarian();
        let books = vec![book(1, 5), book(2, 5)];
        let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
        let tomorrow = today().checked_add_days(Days::new(1)).unwrap();

        let member_a = member(1);
        let member_b = member(2);
        let borrows = vec![
            // Member A: one overdue, one due today -> counted twice
            active_borrow(1, &books[0], &member_a, Some(yesterday)),
            active_borrow(2, &books[1], &member_a, Some(today())),
            // Member B: due in the future only -> not listed
            active_borrow(3, &books[0], &member_b, Some(tomorrow)),
        ];

        let report = build_report(&caller, today(), &books, &borrows);
        let due = report.members_with_due_books.unwrap();
        assert_eq!(
            due,
            vec![MemberWithDueBooks {
                user_id: member_a.id,
                email: member_a.email.clone(),
                due_books_count: 2,
            }]
        );
    }

    #[test]
    fn test_borrows_without_due_date_never_count_as_due() {
        let caller = member(1);
        let books = vec![book(1, 2)];
        let mut borrow = active_borrow(1, &books[0], &caller, None);
        borrow.user = None;

        let report = build_report(&caller, today(), &books, &[borrow]);
        assert_eq!(report.user_stats.borrowed_count, 1);
        assert_eq!(report.user_stats.due_today_count, 0);
        assert_eq!(report.user_stats.overdue_count, 0);
    }
}
