//! Google Gemini direct driver
//!
//! Live chat and embeddings over the Generative Language REST API. No batch
//! contract: partitions for these models run through the emulated fall-back.

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::Provider;
use crate::core::drivers::google::{
    self, decode_error, Content, GenerateRequest, GenerateResponse, GenerationConfig, Part,
};
use crate::core::drivers::{sse_data, Driver};
use crate::core::error::{GatewayError, Result};
use crate::core::translate;
use crate::core::types::{
    ApiError, ChatDelta, ChatRequest, Completion, ContentPart, Embedding, EmbeddingRequest,
    EmbeddingResponse, MessageContent, ModelCard, RequestScope, Role, Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Driver for the Gemini API.
pub struct Gemini {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Gemini {
    pub fn new(p: &Provider) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: if p.base_url.is_empty() {
                DEFAULT_BASE_URL.to_string()
            } else {
                p.base_url.trim_end_matches('/').to_string()
            },
            api_key: p.api_key.clone(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{model}:{method}?key={}", self.base_url, self.api_key)
    }

    /// Translate a canonical thread; images are fetched and inlined, and only
    /// jpeg and png survive the trip.
    async fn encode(&self, req: &ChatRequest) -> Result<GenerateRequest> {
        translate::validate_thread(&req.messages)?;
        let (system, rest) = translate::split_system(&req.messages);

        let mut contents = Vec::with_capacity(rest.len());
        for (i, msg) in rest.iter().enumerate() {
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = Vec::new();
            match &msg.content {
                Some(MessageContent::Text(text)) => parts.push(Part::text(text)),
                Some(MessageContent::Parts(multi)) => {
                    for part in multi {
                        match part {
                            ContentPart::Text { text } => parts.push(Part::text(text)),
                            ContentPart::ImageUrl { image_url } => {
                                let (mime, bytes) =
                                    translate::fetch_image(&self.client, &image_url.url).await?;
                                if mime != "image/jpeg" && mime != "image/png" {
                                    return Err(GatewayError::UnsupportedMime(mime));
                                }
                                parts.push(Part::inline(
                                    mime,
                                    base64::engine::general_purpose::STANDARD.encode(bytes),
                                ));
                            }
                        }
                    }
                }
                None => {
                    return Err(GatewayError::InvalidRequest(format!("empty message {i}")));
                }
            }
            contents.push(Content {
                role: Some(role.into()),
                parts,
            });
        }

        let config = GenerationConfig::from_request(req);
        Ok(GenerateRequest {
            contents,
            system_instruction: system.map(|s| Content::text(None, s)),
            generation_config: (!config.is_empty()).then_some(config),
        })
    }
}

#[async_trait]
impl Driver for Gemini {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            models: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct Entry {
            name: String,
        }
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let listing: Listing = resp.json().await?;
        Ok(listing
            .models
            .into_iter()
            .map(|m| ModelCard {
                id: m.name.trim_start_matches("models/").to_string(),
                object: "model".into(),
                ..Default::default()
            })
            .collect())
    }

    async fn embed(&self, _scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        #[derive(Deserialize)]
        struct Batch {
            #[serde(default)]
            embeddings: Vec<Values>,
        }
        #[derive(Deserialize)]
        struct Values {
            #[serde(default)]
            values: Vec<f32>,
        }

        let model = format!("models/{}", req.model);
        let requests: Vec<_> = req
            .input
            .texts()
            .iter()
            .map(|text| {
                json!({
                    "model": model,
                    "content": {"parts": [{"text": text}]},
                })
            })
            .collect();
        let resp = self
            .client
            .post(self.model_url(&req.model, "batchEmbedContents"))
            .json(&json!({ "requests": requests }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let batch: Batch = resp.json().await?;
        Ok(EmbeddingResponse {
            object: "list".into(),
            data: batch
                .embeddings
                .into_iter()
                .enumerate()
                .map(|(i, e)| Embedding {
                    object: "embedding".into(),
                    index: i as u32,
                    embedding: e.values,
                })
                .collect(),
            model: req.model,
            usage: None,
        })
    }

    async fn chat(&self, _scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        let body = self.encode(&req).await?;
        if !req.stream {
            let resp = self
                .client
                .post(self.model_url(&req.model, "generateContent"))
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(decode_error(resp).await);
            }
            let generated: GenerateResponse = resp.json().await?;
            return Ok(Completion::whole(google::decode(generated)?));
        }

        let url = format!(
            "{}&alt=sse",
            self.model_url(&req.model, "streamGenerateContent")
        );
        let request = self.client.post(url).json(&body);
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
                let _ = tx.send(ChatDelta::failure(decode_error(resp).await.api_error())).await;
                return;
            }
            let mut total = Usage::default();
            let mut events = std::pin::pin!(sse_data(resp));
            while let Some(event) = events.next().await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                        return;
                    }
                };
                let Ok(chunk) = serde_json::from_str::<GenerateResponse>(&data) else {
                    continue;
                };
                if let Some(meta) = chunk.usage_metadata {
                    total = meta.canonical();
                }
                let Ok(decoded) = google::decode(chunk) else {
                    continue;
                };
                for choice in &decoded.choices {
                    let text = choice.message.plain_text();
                    if !text.is_empty() && tx.send(ChatDelta::content(text)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(ChatDelta::trailer(total)).await;
            let _ = tx.send(ChatDelta::finish("stop")).await;
        });
        Ok(Completion::streaming(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChatMessage;

    #[tokio::test]
    async fn encode_maps_roles_and_system() {
        let d = Gemini::new(&Provider::default());
        let req = ChatRequest {
            model: "gemini-1.5-flash".into(),
            messages: vec![
                ChatMessage::text(Role::System, "short answers"),
                ChatMessage::text(Role::User, "hi"),
                ChatMessage::text(Role::Assistant, "hello"),
                ChatMessage::text(Role::User, "bye"),
            ],
            ..Default::default()
        };
        let wire = d.encode(&req).await.unwrap();
        assert!(wire.system_instruction.is_some());
        let roles: Vec<_> = wire
            .contents
            .iter()
            .map(|c| c.role.clone().unwrap())
            .collect();
        assert_eq!(roles, ["user", "model", "user"]);
    }

    #[tokio::test]
    async fn encode_rejects_double_user() {
        let d = Gemini::new(&Provider::default());
        let req = ChatRequest {
            messages: vec![
                ChatMessage::text(Role::User, "a"),
                ChatMessage::text(Role::User, "b"),
            ],
            ..Default::default()
        };
        assert!(matches!(
            d.encode(&req).await,
            Err(GatewayError::NotAlternating { index: 1 })
        ));
    }
}
