//! Route table

pub mod ai;
pub mod batches;

use actix_web::web;

/// Wire up the `/v1` surface.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .route("/ping", web::get().to(ai::ping))
            .route("/models", web::get().to(ai::list_models))
            .route("/embeddings", web::post().to(ai::embeddings))
            .route("/chat/completions", web::post().to(ai::chat_completions))
            .route("/files", web::post().to(batches::upload_file))
            .route("/files/{id}/content", web::get().to(batches::file_content))
            .route("/batches", web::get().to(batches::list_batches))
            .route("/batches", web::post().to(batches::create_batch))
            .route("/batches/{id}", web::get().to(batches::get_batch))
            .route("/batches/{id}/cancel", web::post().to(batches::cancel_batch)),
    );
}
