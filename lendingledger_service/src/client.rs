use anyhow::{bail, Context};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;

use crate::api::{
    BookDetails, BookDetailsPatch, BookId, BookRecord, BorrowId, BorrowRecord, BorrowStatus,
    BorrowView, CreateBorrowRequest, DashboardReport, ErrorsResponse, LoginRequest, LoginResponse,
    RegisterRequest, SearchRequest, UpdateBorrowRequest, UserResponse,
};

pub struct LendingLedgerClient {
    url: String,
    client: ClientWithMiddleware,
}

impl LendingLedgerClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            // Insert the tracing middleware
            .with(TracingMiddleware::default())
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> anyhow::Result<UserResponse> {
        let response = self
            .client
            .post(format!("{}/api/v1/users", self.url))
            .json(&RegisterRequest {
                email: email.to_string(),
                password: password.to_string(),
                password_confirmation: password_confirmation.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to register: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn login(&self, email: &str, password: &str) -> anyhow::Result<LoginResponse> {
        let response = self
            .client
            .post(format!("{}/api/v1/login", self.url))
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to login: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn logout(&self, token: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/v1/logout", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to logout: {}", response.text().await.unwrap_or_default())
        }
        Ok(())
    }

    pub async fn add_book(&self, token: &str, details: BookDetails) -> anyhow::Result<BookRecord> {
        let response = self
            .client
            .post(format!("{}/api/v1/books", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&details)
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to add book: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn get_book(
        &self,
        token: &str,
        book_id: BookId,
    ) -> anyhow::Result<Option<BookRecord>> {
        let response = self
            .client
            .get(format!("{}/api/v1/books/{}", self.url, book_id))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("Failed to get book: {}", response.text().await.unwrap_or_default())
        }
        Ok(Some(response.json().await?))
    }

    pub async fn list_books(&self, token: &str) -> anyhow::Result<Vec<BookRecord>> {
        let response = self
            .client
            .get(format!("{}/api/v1/books", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to list books: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn update_book(
        &self,
        token: &str,
        book_id: BookId,
        patch: BookDetailsPatch,
    ) -> anyhow::Result<BookRecord> {
        let response = self
            .client
            .put(format!("{}/api/v1/books/{}", self.url, book_id))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&patch)
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to update book: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn delete_book(&self, token: &str, book_id: BookId) -> anyhow::Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/v1/books/{}", self.url, book_id))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to delete book: {}", response.text().await.unwrap_or_default())
        }
        Ok(())
    }

    pub async fn search_books(&self, token: &str, query: &str) -> anyhow::Result<Vec<BookRecord>> {
        let response = self
            .client
            .post(format!("{}/api/v1/books/search", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&SearchRequest {
                q: query.to_string(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to search books: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    /// Ok(Err(messages)) carries a 422 rejection, so tests can assert on the
    /// exact invariant violation
    pub async fn create_borrow(
        &self,
        token: &str,
        request: CreateBorrowRequest,
    ) -> anyhow::Result<Result<BorrowRecord, Vec<String>>> {
        let response = self
            .client
            .post(format!("{}/api/v1/borrows", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let rejection: ErrorsResponse = response.json().await?;
            return Ok(Err(rejection.errors));
        }
        if !response.status().is_success() {
            bail!("Failed to create borrow: {}", response.text().await.unwrap_or_default())
        }
        Ok(Ok(response.json().await?))
    }

    pub async fn return_borrow(
        &self,
        token: &str,
        borrow_id: BorrowId,
    ) -> anyhow::Result<Result<BorrowRecord, Vec<String>>> {
        let response = self
            .client
            .put(format!("{}/api/v1/borrows/{}", self.url, borrow_id))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&UpdateBorrowRequest {
                status: BorrowStatus::Returned,
            })
            .send()
            .await?;

        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let rejection: ErrorsResponse = response.json().await?;
            return Ok(Err(rejection.errors));
        }
        if !response.status().is_success() {
            bail!("Failed to return borrow: {}", response.text().await.unwrap_or_default())
        }
        Ok(Ok(response.json().await?))
    }

    pub async fn list_borrows(&self, token: &str) -> anyhow::Result<Vec<BorrowView>> {
        let response = self
            .client
            .get(format!("{}/api/v1/borrows", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to list borrows: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }

    pub async fn get_dashboard(&self, token: &str) -> anyhow::Result<DashboardReport> {
        let response = self
            .client
            .get(format!("{}/api/v1/dashboard", self.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("Failed to get dashboard: {}", response.text().await.unwrap_or_default())
        }
        Ok(response.json().await?)
    }
}
