use crate::api::Role;
use crate::auth::Caller;

/// Every permission-gated operation the HTTP layer exposes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    ListBooks,
    ShowBook,
    SearchBooks,
    CreateBook,
    UpdateBook,
    DeleteBook,
    ListBorrows,
    ShowBorrow,
    CreateBorrow,
    UpdateBorrow,
    ViewDashboard,
}

/// The permission table over the closed role set. Exhaustive on purpose:
/// adding a role or an action forces a decision here.
pub fn role_allows(role: Role, action: Action) -> bool {
    match role {
        Role::Librarian => match action {
            Action::ListBooks
            | Action::ShowBook
            | Action::SearchBooks
            | Action::CreateBook
            | Action::UpdateBook
            | Action::DeleteBook
            | Action::ListBorrows
            | Action::ShowBorrow
            | Action::CreateBorrow
            | Action::UpdateBorrow
            | Action::ViewDashboard => true,
        },
        Role::Member => match action {
            Action::ListBooks
            | Action::ShowBook
            | Action::SearchBooks
            | Action::ListBorrows
            | Action::ShowBorrow
            | Action::CreateBorrow
            | Action::ViewDashboard => true,
            Action::CreateBook
            | Action::UpdateBook
            | Action::DeleteBook
            | Action::UpdateBorrow => false,
        },
    }
}

pub fn caller_allows(caller: &Caller, action: Action) -> bool {
    caller.roles.iter().any(|&role| role_allows(role, action))
}
