use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use actix_web::web::Data;
use actix_web::{Error, HttpRequest, HttpResponse};
use chrono::{Days, NaiveDate, Utc};
use paperclip::actix::{
    api_v2_operation,
    web::{self},
};

use crate::api::{
    BookId, BookRecord, BorrowId, BorrowRecord, BorrowStatus, BorrowView, CreateBorrowRequest,
    ErrorResponse, ErrorsResponse, LoginRequest, LoginResponse, MessageResponse, RegisterRequest,
    SearchRequest, UpdateBorrowRequest, UserId, UserResponse, UserSummary,
};
use crate::auth::{authenticate, bearer_token, AuthError, Caller};
use crate::books_repository::{BookWithId, BooksRepository, BooksRepositoryError};
use crate::borrows_repository::{BorrowsFilter, BorrowsRepository, BorrowsRepositoryError};
use crate::dashboard::build_report;
use crate::permissions::{caller_allows, Action};
use crate::users_repository::{UsersRepository, UsersRepositoryError};

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorResponse {
        error: "Unauthorized".to_string(),
    })
}

fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().json(ErrorResponse {
        error: "Forbidden".to_string(),
    })
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: message.to_string(),
    })
}

fn unprocessable(errors: Vec<String>) -> HttpResponse {
    HttpResponse::UnprocessableEntity().json(ErrorsResponse { errors })
}

/// Resolves the caller and checks the permission table; both failures map to
/// their response right here so handlers stay a single match over the
/// repository call.
async fn authorize(
    req: &HttpRequest,
    users_repository: &dyn UsersRepository,
    action: Action,
) -> Result<Caller, HttpResponse> {
    let caller = match authenticate(req, users_repository).await {
        Ok(caller) => caller,
        Err(AuthError::Unauthorized) => return Err(unauthorized()),
        Err(AuthError::Repository(err)) => {
            tracing::error!("Token lookup failed {}", err);
            return Err(HttpResponse::InternalServerError().finish());
        }
    };
    if caller_allows(&caller, action) {
        Ok(caller)
    } else {
        Err(forbidden())
    }
}

fn book_record(book: &BookWithId, active_borrows: i64) -> BookRecord {
    BookRecord {
        id: book.id,
        title: book.details.title.clone(),
        author: book.details.author.clone(),
        genre: book.details.genre.clone(),
        isbn: book.details.isbn.clone(),
        copies: book.details.copies,
        // Intentionally unclamped; negative when copies dropped below loans
        available_copies: i64::from(book.details.copies) - active_borrows,
    }
}

fn default_due_date() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_add_days(Days::new(15)).unwrap_or(today)
}

async fn assemble_borrow_views(
    records: Vec<BorrowRecord>,
    include_user: bool,
    books_repository: &dyn BooksRepository,
    borrows_repository: &dyn BorrowsRepository,
    users_repository: &dyn UsersRepository,
) -> anyhow::Result<Vec<BorrowView>> {
    let books: HashMap<BookId, BookWithId> = books_repository
        .list_books()
        .await?
        .into_iter()
        .map(|book| (book.id, book))
        .collect();
    let counts = borrows_repository.active_borrow_counts().await?;

    let mut emails: HashMap<UserId, String> = HashMap::new();
    if include_user {
        let user_ids: BTreeSet<UserId> = records.iter().map(|record| record.user_id).collect();
        for user_id in user_ids {
            emails.insert(user_id, users_repository.get_user(user_id).await?.email);
        }
    }

    Ok(records
        .into_iter()
        .filter_map(|record| {
            let book = books.get(&record.book_id)?;
            let active = counts.get(&book.id).copied().unwrap_or(0);
            Some(BorrowView {
                id: record.id,
                status: record.status,
                due_at: record.due_at,
                created_at: record.created_at,
                updated_at: record.updated_at,
                book: book_record(book, active),
                user: if include_user {
                    Some(UserSummary {
                        id: record.user_id,
                        email: emails.get(&record.user_id).cloned().unwrap_or_default(),
                    })
                } else {
                    None
                },
            })
        })
        .collect())
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn register(
    users_repository: Data<Arc<dyn UsersRepository>>,
    request: web::Json<RegisterRequest>,
) -> Result<HttpResponse, Error> {
    let request = request.into_inner();
    if request.password != request.password_confirmation {
        return Ok(unprocessable(vec![
            "Password confirmation doesn't match Password".to_string(),
        ]));
    }

    Ok(
        match users_repository
            .register(&request.email, &request.password)
            .await
        {
            Ok(user) => HttpResponse::Created().json(UserResponse {
                id: user.id,
                email: user.email,
                roles: user.roles,
            }),
            Err(UsersRepositoryError::Invalid(errors)) => unprocessable(errors),
            Err(err) => {
                tracing::error!("Register failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn login(
    users_repository: Data<Arc<dyn UsersRepository>>,
    request: web::Json<LoginRequest>,
) -> Result<HttpResponse, Error> {
    Ok(
        match users_repository
            .login(&request.email, &request.password)
            .await
        {
            Ok((user, token)) => HttpResponse::Ok().json(LoginResponse {
                message: "Login successful".to_string(),
                user: UserResponse {
                    id: user.id,
                    email: user.email,
                    roles: user.roles,
                },
                token,
            }),
            Err(UsersRepositoryError::InvalidCredentials) => {
                HttpResponse::Unauthorized().json(ErrorResponse {
                    error: "Invalid email or password".to_string(),
                })
            }
            Err(err) => {
                tracing::error!("Login failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn logout(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
) -> Result<HttpResponse, Error> {
    let Some(token) = bearer_token(&req) else {
        return Ok(unauthorized());
    };

    Ok(match users_repository.logout(token).await {
        Ok(()) => HttpResponse::Ok().json(MessageResponse {
            message: "Logged out successfully".to_string(),
        }),
        Err(UsersRepositoryError::InvalidToken) => unauthorized(),
        Err(err) => {
            tracing::error!("Logout failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn get_all_books(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::ListBooks).await
    {
        return Ok(response);
    }

    let books = match books_repository.list_books().await {
        Ok(books) => books,
        Err(err) => {
            tracing::error!("Get all books failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };
    let counts = match borrows_repository.active_borrow_counts().await {
        Ok(counts) => counts,
        Err(err) => {
            tracing::error!("Get active borrow counts failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };

    let records: Vec<BookRecord> = books
        .iter()
        .map(|book| book_record(book, counts.get(&book.id).copied().unwrap_or(0)))
        .collect();
    Ok(HttpResponse::Ok().json(records))
}

#[api_v2_operation]
pub async fn get_book(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::ShowBook).await
    {
        return Ok(response);
    }
    let book_id = book_id.into_inner();

    Ok(match books_repository.get_book(book_id).await {
        Ok(book) => match borrows_repository.count_active_borrows(book_id).await {
            Ok(active) => HttpResponse::Ok().json(book_record(&book, active)),
            Err(err) => {
                tracing::error!("Count active borrows failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
        Err(BooksRepositoryError::NotFound(_)) => not_found("Book not found"),
        Err(err) => {
            tracing::error!("Get book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn add_book(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    details: web::Json<crate::api::BookDetails>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::CreateBook).await
    {
        return Ok(response);
    }

    Ok(match books_repository.add_book(details.into_inner()).await {
        // A fresh book has no active borrows yet
        Ok(book) => HttpResponse::Created().json(book_record(&book, 0)),
        Err(BooksRepositoryError::Invalid(errors)) => unprocessable(errors),
        Err(err) => {
            tracing::error!("Add book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn update_book(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    book_id: web::Path<BookId>,
    patch: web::Json<crate::api::BookDetailsPatch>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::UpdateBook).await
    {
        return Ok(response);
    }
    let book_id = book_id.into_inner();

    Ok(
        match books_repository
            .update_book(book_id, patch.into_inner())
            .await
        {
            Ok(book) => match borrows_repository.count_active_borrows(book_id).await {
                Ok(active) => HttpResponse::Ok().json(book_record(&book, active)),
                Err(err) => {
                    tracing::error!("Count active borrows failed {}", err);
                    HttpResponse::InternalServerError().finish()
                }
            },
            Err(BooksRepositoryError::NotFound(_)) => not_found("Book not found"),
            Err(BooksRepositoryError::Invalid(errors)) => unprocessable(errors),
            Err(err) => {
                tracing::error!("Update book failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn delete_book(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::DeleteBook).await
    {
        return Ok(response);
    }
    let book_id = book_id.into_inner();

    Ok(match books_repository.delete_book(book_id).await {
        Ok(()) => {
            // Deletion cascades over the ledger
            if let Err(err) = borrows_repository.purge_book(book_id).await {
                tracing::error!("Purge borrows failed {}", err);
                return Ok(HttpResponse::InternalServerError().finish());
            }
            HttpResponse::Ok().json(MessageResponse {
                message: "Book deleted successfully".to_string(),
            })
        }
        Err(BooksRepositoryError::NotFound(_)) => not_found("Book not found"),
        Err(err) => {
            tracing::error!("Delete book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn search_books(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    request: web::Json<SearchRequest>,
) -> Result<HttpResponse, Error> {
    if let Err(response) =
        authorize(&req, users_repository.get_ref().as_ref(), Action::SearchBooks).await
    {
        return Ok(response);
    }

    let query = request.into_inner().q;
    if query.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: "Search parameter is required".to_string(),
        }));
    }

    let books = match books_repository.search_books(&query).await {
        Ok(books) => books,
        Err(err) => {
            tracing::error!("Search books failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };
    let counts = match borrows_repository.active_borrow_counts().await {
        Ok(counts) => counts,
        Err(err) => {
            tracing::error!("Get active borrow counts failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };

    let records: Vec<BookRecord> = books
        .iter()
        .map(|book| book_record(book, counts.get(&book.id).copied().unwrap_or(0)))
        .collect();
    Ok(HttpResponse::Ok().json(records))
}

#[api_v2_operation]
pub async fn list_borrows(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
) -> Result<HttpResponse, Error> {
    let caller = match authorize(&req, users_repository.get_ref().as_ref(), Action::ListBorrows)
        .await
    {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let is_librarian = caller.is_librarian();
    let filter = BorrowsFilter {
        user_id: if is_librarian { None } else { Some(caller.id) },
        status: None,
    };

    let records = match borrows_repository.list_borrows(filter).await {
        Ok(records) => records,
        Err(err) => {
            tracing::error!("List borrows failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };

    match assemble_borrow_views(
        records,
        is_librarian,
        books_repository.get_ref().as_ref(),
        borrows_repository.get_ref().as_ref(),
        users_repository.get_ref().as_ref(),
    )
    .await
    {
        Ok(views) => Ok(HttpResponse::Ok().json(views)),
        Err(err) => {
            tracing::error!("Assemble borrows failed {}", err);
            Ok(HttpResponse::InternalServerError().finish())
        }
    }
}

#[api_v2_operation]
pub async fn get_borrow(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    borrow_id: web::Path<BorrowId>,
) -> Result<HttpResponse, Error> {
    let caller = match authorize(&req, users_repository.get_ref().as_ref(), Action::ShowBorrow)
        .await
    {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    Ok(match borrows_repository.get_borrow(borrow_id.into_inner()).await {
        Ok(record) => {
            // Members may only see their own ledger entries
            if !caller.is_librarian() && record.user_id != caller.id {
                forbidden()
            } else {
                HttpResponse::Ok().json(record)
            }
        }
        Err(BorrowsRepositoryError::NotFound(_)) => not_found("Borrow not found"),
        Err(err) => {
            tracing::error!("Get borrow failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn create_borrow(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    request: web::Json<CreateBorrowRequest>,
) -> Result<HttpResponse, Error> {
    let caller = match authorize(
        &req,
        users_repository.get_ref().as_ref(),
        Action::CreateBorrow,
    )
    .await
    {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let request = request.into_inner();
    let due_at = request.due_at.unwrap_or_else(default_due_date);

    Ok(
        match borrows_repository
            .create_borrow(caller.id, request.book_id, due_at)
            .await
        {
            Ok(record) => HttpResponse::Created().json(record),
            Err(
                err @ (BorrowsRepositoryError::BookNotFound(_)
                | BorrowsRepositoryError::NoCopiesAvailable(_)
                | BorrowsRepositoryError::AlreadyBorrowed(_)),
            ) => unprocessable(vec![err.to_string()]),
            Err(err) => {
                tracing::error!("Create borrow failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn update_borrow(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
    borrow_id: web::Path<BorrowId>,
    request: web::Json<UpdateBorrowRequest>,
) -> Result<HttpResponse, Error> {
    if let Err(response) = authorize(
        &req,
        users_repository.get_ref().as_ref(),
        Action::UpdateBorrow,
    )
    .await
    {
        return Ok(response);
    }

    Ok(
        match borrows_repository
            .update_status(borrow_id.into_inner(), request.status)
            .await
        {
            Ok(record) => HttpResponse::Ok().json(record),
            Err(err @ BorrowsRepositoryError::InvalidStatus) => {
                unprocessable(vec![err.to_string()])
            }
            Err(BorrowsRepositoryError::NotFound(_)) => not_found("Borrow not found"),
            Err(err) => {
                tracing::error!("Update borrow failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn dashboard(
    req: HttpRequest,
    users_repository: Data<Arc<dyn UsersRepository>>,
    books_repository: Data<Arc<dyn BooksRepository>>,
    borrows_repository: Data<Arc<dyn BorrowsRepository>>,
) -> Result<HttpResponse, Error> {
    let caller = match authorize(
        &req,
        users_repository.get_ref().as_ref(),
        Action::ViewDashboard,
    )
    .await
    {
        Ok(caller) => caller,
        Err(response) => return Ok(response),
    };

    let is_librarian = caller.is_librarian();
    let filter = BorrowsFilter {
        user_id: if is_librarian { None } else { Some(caller.id) },
        status: Some(BorrowStatus::Borrowed),
    };

    let records = match borrows_repository.list_borrows(filter).await {
        Ok(records) => records,
        Err(err) => {
            tracing::error!("List active borrows failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };
    let active_borrows = match assemble_borrow_views(
        records,
        is_librarian,
        books_repository.get_ref().as_ref(),
        borrows_repository.get_ref().as_ref(),
        users_repository.get_ref().as_ref(),
    )
    .await
    {
        Ok(views) => views,
        Err(err) => {
            tracing::error!("Assemble borrows failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };
    let books = match books_repository.list_books().await {
        Ok(books) => books,
        Err(err) => {
            tracing::error!("List books failed {}", err);
            return Ok(HttpResponse::InternalServerError().finish());
        }
    };

    // One reference instant for every date comparison in the report
    let today = Utc::now().date_naive();
    Ok(HttpResponse::Ok().json(build_report(&caller, today, &books, &active_borrows)))
}
