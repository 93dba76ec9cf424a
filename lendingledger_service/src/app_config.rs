use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/login").route(web::post().to(handlers::login)))
                .service(web::resource("/logout").route(web::delete().to(handlers::logout)))
                .service(web::resource("/users").route(web::post().to(handlers::register)))
                .service(
                    web::resource("/books")
                        .route(web::get().to(handlers::get_all_books))
                        .route(web::post().to(handlers::add_book)),
                )
                .service(
                    web::resource("/books/search").route(web::post().to(handlers::search_books)),
                )
                .service(
                    web::resource("/books/{book_id}")
                        .route(web::get().to(handlers::get_book))
                        .route(web::put().to(handlers::update_book))
                        .route(web::patch().to(handlers::update_book))
                        .route(web::delete().to(handlers::delete_book)),
                )
                .service(
                    web::resource("/borrows")
                        .route(web::get().to(handlers::list_borrows))
                        .route(web::post().to(handlers::create_borrow)),
                )
                .service(
                    web::resource("/borrows/{borrow_id}")
                        .route(web::get().to(handlers::get_borrow))
                        .route(web::put().to(handlers::update_borrow))
                        .route(web::patch().to(handlers::update_borrow)),
                )
                .service(web::resource("/dashboard").route(web::get().to(handlers::dashboard))),
        );
}
