//! Dify driver
//!
//! Dify is a workflow GUI that fronts LLM agents with a chat-messages API.
//! Live chat only; everything else is NotImplemented, so its partitions run
//! through the emulated fall-back.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::Provider;
use crate::core::drivers::{sse_data, Driver};
use crate::core::error::{GatewayError, Result};
use crate::core::types::{
    ApiError, ChatChoice, ChatDelta, ChatMessage, ChatRequest, ChatResponse, Completion,
    EmbeddingRequest, EmbeddingResponse, ModelCard, RequestScope, Role,
};

/// Driver for the Dify chat-messages API.
pub struct Dify {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Dify {
    pub fn new(p: &Provider) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: p.base_url.trim_end_matches('/').to_string(),
            api_key: p.api_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct WireAnswer {
    #[serde(default)]
    answer: String,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    event: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl Driver for Dify {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        Err(GatewayError::NotImplemented)
    }

    async fn embed(&self, _scope: &RequestScope, _req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(GatewayError::NotImplemented)
    }

    async fn chat(&self, _scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        // the workflow owns the conversation; only the latest turn crosses
        let query = req
            .messages
            .last()
            .map(ChatMessage::plain_text)
            .unwrap_or_default();
        let body = json!({
            "inputs": {},
            "query": query,
            "user": req.user.clone().unwrap_or_default(),
            "response_mode": if req.stream { "streaming" } else { "blocking" },
        });
        let request = self
            .client
            .post(format!("{}/chat-messages", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);

        if !req.stream {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(GatewayError::provider(
                    "provider_error",
                    format!("{status}: {body}"),
                ));
            }
            let answer: WireAnswer = resp.json().await?;
            return Ok(Completion::whole(ChatResponse {
                object: "chat.completion".into(),
                created: chrono::Utc::now().timestamp(),
                model: req.model,
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage::text(Role::Assistant, answer.answer),
                    finish_reason: Some("stop".into()),
                }],
                ..Default::default()
            }));
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                    return;
                }
            };
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let _ = tx
                    .send(ChatDelta::failure(ApiError::provider(format!("{status}: {body}"))))
                    .await;
                return;
            }
            let mut events = std::pin::pin!(sse_data(resp));
            while let Some(event) = events.next().await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                        return;
                    }
                };
                let Ok(chunk) = serde_json::from_str::<WireChunk>(&data) else {
                    continue;
                };
                match chunk.event.as_str() {
                    "message" | "agent_message" => {
                        if !chunk.answer.is_empty()
                            && tx.send(ChatDelta::content(chunk.answer)).await.is_err()
                        {
                            return;
                        }
                    }
                    "message_end" => {
                        let _ = tx.send(ChatDelta::finish("stop")).await;
                        return;
                    }
                    "error" => {
                        let _ = tx
                            .send(ChatDelta::failure(ApiError::provider(
                                chunk.message.unwrap_or_else(|| "workflow error".into()),
                            )))
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
            let _ = tx.send(ChatDelta::finish("stop")).await;
        });
        Ok(Completion::streaming(rx))
    }
}
