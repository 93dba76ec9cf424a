use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use lendingledger_service::api::Role;
use lendingledger_service::app_config::config_app;
use lendingledger_service::books_repository::{
    BooksRepository, InMemoryBooksRepository, PostgresBooksRepository,
    PostgresBooksRepositoryConfig,
};
use lendingledger_service::borrows_repository::{
    BorrowsRepository, InMemoryBorrowsRepository, PostgresBorrowsRepository,
    PostgresBorrowsRepositoryConfig,
};
use lendingledger_service::settings::Settings;
use lendingledger_service::users_repository::{
    InMemoryUsersRepository, PostgresUsersRepository, PostgresUsersRepositoryConfig,
    UsersRepository, UsersRepositoryError,
};

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "lendingledger_service";

    // Start a new Jaeger trace pipeline.
    // Spans are exported in batch - recommended setup for a production application.
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Filter based on level - trace, debug, info, warn, error
    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    // Create a `tracing` layer using the Jaeger tracer
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    // Create a `tracing` layer to emit spans as structured logs to stdout
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    // Combined them all together in a `tracing` subscriber
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

/// Creates the librarian account configured in the settings; a no-op when the
/// email is already registered.
async fn seed_librarian(users_repository: &dyn UsersRepository, settings: &Settings) {
    let (Some(email), Some(password)) = (
        settings.librarian_email.as_deref(),
        settings.librarian_password.as_deref(),
    ) else {
        return;
    };

    match users_repository.register(email, password).await {
        Ok(user) => {
            if let Err(err) = users_repository
                .set_roles(user.id, vec![Role::Librarian])
                .await
            {
                tracing::warn!("Failed to assign librarian role: {}", err);
            } else {
                tracing::info!("Seeded librarian account {}", email);
            }
        }
        Err(UsersRepositoryError::Invalid(_)) => {
            tracing::info!("Librarian account {} already present", email);
        }
        Err(err) => tracing::warn!("Failed to seed librarian account: {}", err),
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    let settings = Settings::from_env().expect("Failed to read settings");
    println!(
        "starting HTTP server at http://localhost:{}",
        settings.port
    );

    let (users_repository, books_repository, borrows_repository): (
        Arc<dyn UsersRepository>,
        Arc<dyn BooksRepository>,
        Arc<dyn BorrowsRepository>,
    ) = if settings.use_in_memory_db {
        let books: Arc<dyn BooksRepository> = Arc::new(InMemoryBooksRepository::default());
        (
            Arc::new(InMemoryUsersRepository::default()),
            books.clone(),
            Arc::new(InMemoryBorrowsRepository::new(books)),
        )
    } else {
        let users = PostgresUsersRepository::init(PostgresUsersRepositoryConfig {
            hostname: settings.db_host.clone(),
            username: settings.db_username.clone(),
            password: settings.db_password.clone(),
        })
        .await
        .expect("Failed to init postgres users repository");
        let books = PostgresBooksRepository::init(PostgresBooksRepositoryConfig {
            hostname: settings.db_host.clone(),
            username: settings.db_username.clone(),
            password: settings.db_password.clone(),
        })
        .await
        .expect("Failed to init postgres books repository");
        let borrows = PostgresBorrowsRepository::init(PostgresBorrowsRepositoryConfig {
            hostname: settings.db_host.clone(),
            username: settings.db_username.clone(),
            password: settings.db_password.clone(),
        })
        .await
        .expect("Failed to init postgres borrows repository");
        (Arc::new(users), Arc::new(books), Arc::new(borrows))
    };

    seed_librarian(users_repository.as_ref(), &settings).await;

    let port = settings.port;
    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(users_repository.clone()))
            .app_data(web::Data::new(books_repository.clone()))
            .app_data(web::Data::new(borrows_repository.clone()))
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
