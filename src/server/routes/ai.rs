//! Live inference endpoints (OpenAI compatible)

use std::time::{Duration, Instant};

use actix_web::{web, HttpResponse};
use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use crate::core::error::{GatewayError, Result};
use crate::core::types::{
    ChatRequest, EmbeddingRequest, ModelCard, ModelList, RequestScope,
};
use crate::server::AppState;

const MODELS_TTL: Duration = Duration::from_secs(3600);

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().finish()
}

/// Union of configured models across providers, cached for one hour.
pub async fn list_models(state: web::Data<AppState>) -> Result<HttpResponse> {
    {
        let memo = state.models.read().await;
        if let Some((at, list)) = memo.as_ref() {
            if at.elapsed() < MODELS_TTL {
                return Ok(HttpResponse::Ok().json(list));
            }
        }
    }

    let mut cards = Vec::new();
    for provider in &state.config.providers {
        for model in &provider.models {
            cards.push(ModelCard {
                id: model.name.clone(),
                object: "model".into(),
                created: 0,
                owned_by: provider.name.clone(),
                root: format!("{:?}", provider.driver).to_lowercase(),
                parent: model.alias.join(","),
            });
        }
    }
    let list = ModelList::new(cards);
    *state.models.write().await = Some((Instant::now(), list.clone()));
    Ok(HttpResponse::Ok().json(list))
}

pub async fn embeddings(
    state: web::Data<AppState>,
    req: web::Json<EmbeddingRequest>,
) -> Result<HttpResponse> {
    let mut req = req.into_inner();
    let binding = state.registry.resolve(&req.model).await?;
    debug!(model = %binding.model.name, "embedding");
    req.model = binding.model.name.clone();
    let scope = RequestScope::for_model(binding.model.clone());
    let mut resp = binding.driver.embed(&scope, req).await?;
    resp.object = "list".into();
    resp.model = binding.model.name.clone();
    for (i, e) in resp.data.iter_mut().enumerate() {
        e.object = "embedding".into();
        e.index = i as u32;
    }
    Ok(HttpResponse::Ok().json(resp))
}

pub async fn chat_completions(
    state: web::Data<AppState>,
    req: web::Json<ChatRequest>,
) -> Result<HttpResponse> {
    let mut req = req.into_inner();
    let binding = state.registry.resolve(&req.model).await?;
    debug!(model = %binding.model.name, stream = req.stream, "completion");
    req.model = binding.model.name.clone();
    binding.model.apply_defaults(&mut req);

    let scope = RequestScope::for_model(binding.model.clone());
    let completion = binding.driver.chat(&scope, req).await?;

    let Some(mut rx) = completion.stream else {
        let mut resp = completion.response;
        resp.object = "chat.completion".into();
        resp.model = binding.model.name.clone();
        return Ok(HttpResponse::Ok().json(resp));
    };

    // server-sent events: `data: {json}\n\n`, closed by `data: [DONE]\n`
    let stream = async_stream::stream! {
        while let Some(mut chunk) = rx.recv().await {
            if let Some(error) = chunk.error.take() {
                yield frame(&json!({"error": error}));
                break;
            }
            if chunk.choices.is_empty() && chunk.usage.is_none() {
                continue;
            }
            chunk.object = "chat.completion.chunk".into();
            if chunk.created == 0 {
                chunk.created = chrono::Utc::now().timestamp();
            }
            yield frame(&chunk);
        }
        yield Ok::<_, GatewayError>(Bytes::from_static(b"data: [DONE]\n"));
    };
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"))
        .streaming(stream))
}

fn frame<T: serde::Serialize>(payload: &T) -> std::result::Result<Bytes, GatewayError> {
    let json = serde_json::to_string(payload)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}
