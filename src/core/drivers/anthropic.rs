//! Anthropic driver
//!
//! Live chat against `/v1/messages`; batching is the deferred variant: the
//! upload step holds inputs locally and send issues a single message-batches
//! create call with the whole partition.

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Provider;
use crate::core::drivers::{sse_data, BatchDriver, Driver};
use crate::core::error::{GatewayError, Result};
use crate::core::translate;
use crate::core::types::{
    ApiError, BatchInput, BatchMeta, BatchOutput, BatchPayload, BatchRecord, BatchStatus,
    ChatChoice, ChatDelta, ChatMessage, ChatRequest, ChatResponse, Completion, ContentPart,
    EmbeddingRequest, EmbeddingResponse, MessageContent, ModelCard, PromptTokensDetails,
    RequestScope, Role, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Driver for Anthropic's Messages API.
pub struct Anthropic {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Anthropic {
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

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// Translate a canonical request into Messages API params.
    async fn encode(&self, scope: &RequestScope, req: &ChatRequest) -> Result<Value> {
        translate::validate_thread(&req.messages)?;
        let (system, rest) = translate::split_system(&req.messages);

        let mut messages = Vec::with_capacity(rest.len());
        for msg in rest {
            messages.push(json!({
                "role": msg.role.to_string(),
                "content": self.encode_content(msg).await?,
            }));
        }

        let mut params = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req
                .max_tokens
                .or(scope.model.defaults.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        });
        let obj = params.as_object_mut().expect("object literal");
        if let Some(system) = system {
            obj.insert("system".into(), json!(system));
        }
        if let Some(t) = req.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = req.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(stop) = &req.stop {
            obj.insert("stop_sequences".into(), json!(stop));
        }
        Ok(params)
    }

    async fn encode_content(&self, msg: &ChatMessage) -> Result<Value> {
        let mut blocks = Vec::new();
        match &msg.content {
            Some(MessageContent::Text(text)) => {
                blocks.push(json!({"type": "text", "text": text}));
            }
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            blocks.push(json!({"type": "text", "text": text}));
                        }
                        ContentPart::ImageUrl { image_url } => {
                            let (mime, bytes) =
                                translate::fetch_image(&self.client, &image_url.url).await?;
                            blocks.push(json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": mime,
                                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                                },
                            }));
                        }
                    }
                }
            }
            None => {}
        }
        Ok(Value::Array(blocks))
    }
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

impl WireUsage {
    fn canonical(self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            prompt_tokens_details: self.cache_read_input_tokens.map(|cached| {
                PromptTokensDetails {
                    cached_tokens: Some(cached),
                }
            }),
        }
    }
}

impl WireMessage {
    fn canonical(self) -> ChatResponse {
        let text: String = self
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect();
        ChatResponse {
            id: self.id,
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::text(Role::Assistant, text),
                finish_reason: Some(match self.stop_reason.as_deref() {
                    Some("max_tokens") => "length".into(),
                    _ => "stop".into(),
                }),
            }],
            usage: self.usage.map(WireUsage::canonical),
            system_fingerprint: None,
        }
    }
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    error: WireErrorBody,
}

#[derive(Deserialize, Default)]
struct WireErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

async fn decode_error(resp: reqwest::Response) -> GatewayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<WireError>(&body) {
        Ok(e) if !e.error.message.is_empty() => GatewayError::Provider {
            kind: e.error.kind,
            message: e.error.message,
        },
        _ => GatewayError::provider("provider_error", format!("{status}: {body}")),
    }
}

/// Streaming event payloads the driver cares about.
#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<WireErrorBody>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl Driver for Anthropic {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        Err(GatewayError::NotImplemented)
    }

    async fn embed(&self, _scope: &RequestScope, _req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(GatewayError::NotImplemented)
    }

    async fn chat(&self, scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        let mut params = self.encode(scope, &req).await?;
        if !req.stream {
            let resp = self.post("/v1/messages").json(&params).send().await?;
            if !resp.status().is_success() {
                return Err(decode_error(resp).await);
            }
            let message: WireMessage = resp.json().await?;
            return Ok(Completion::whole(message.canonical()));
        }

        params
            .as_object_mut()
            .expect("object literal")
            .insert("stream".into(), json!(true));
        let request = self.post("/v1/messages").json(&params);
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
            let mut prompt = WireUsage::default();
            let mut output = 0u32;
            let mut events = std::pin::pin!(sse_data(resp));
            while let Some(event) = events.next().await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx
                            .send(ChatDelta::failure(ApiError::provider(e.to_string())))
                            .await;
                        return;
                    }
                };
                let Ok(event) = serde_json::from_str::<WireEvent>(&data) else {
                    continue;
                };
                match event.kind.as_str() {
                    "message_start" => {
                        if let Some(usage) = event.message.and_then(|m| m.usage) {
                            prompt = usage;
                        }
                    }
                    "content_block_delta" => {
                        if let Some(delta) = event.delta {
                            if delta.kind == "text_delta" && !delta.text.is_empty()
                                && tx.send(ChatDelta::content(delta.text)).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(usage) = event.usage {
                            output = usage.output_tokens;
                        }
                    }
                    "message_stop" => {
                        let total = WireUsage {
                            output_tokens: output,
                            ..prompt
                        };
                        let _ = tx.send(ChatDelta::trailer(total.canonical())).await;
                        let _ = tx.send(ChatDelta::finish("stop")).await;
                        return;
                    }
                    "error" => {
                        let e = event.error.unwrap_or_default();
                        let _ = tx
                            .send(ChatDelta::failure(ApiError {
                                message: e.message,
                                kind: e.kind,
                                ..Default::default()
                            }))
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
        });
        Ok(Completion::streaming(rx))
    }
}

#[derive(Deserialize)]
struct WireBatch {
    id: String,
    #[serde(default)]
    processing_status: String,
    #[serde(default)]
    results_url: Option<String>,
}

fn map_status(processing_status: &str) -> BatchStatus {
    match processing_status {
        "in_progress" | "canceling" => BatchStatus::InProgress,
        "ended" => BatchStatus::Completed,
        _ => BatchStatus::Failed,
    }
}

#[derive(Deserialize)]
struct WireResult {
    #[serde(default)]
    custom_id: String,
    result: WireResultBody,
}

#[derive(Deserialize)]
struct WireResultBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[async_trait]
impl BatchDriver for Anthropic {
    fn chunking(&self) -> Option<usize> {
        None
    }

    async fn batch_upload(
        &self,
        _scope: &RequestScope,
        _sub: &mut BatchRecord,
        _inputs: &[BatchInput],
    ) -> Result<()> {
        // inputs are wanted at send time, in one message-batches call
        Err(GatewayError::Deferred)
    }

    async fn batch_send(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let mut requests = Vec::with_capacity(scope.deferred.len());
        for input in &scope.deferred {
            let BatchPayload::Chat(req) = &input.payload else {
                return Err(GatewayError::InvalidRequest(
                    "embeddings cannot be batched on this provider".into(),
                ));
            };
            requests.push(json!({
                "custom_id": input.custom_id,
                "params": self.encode(scope, req).await?,
            }));
        }
        if requests.is_empty() {
            return Err(GatewayError::InvalidRequest("empty batch partition".into()));
        }
        let resp = self
            .post("/v1/messages/batches")
            .json(&json!({ "requests": requests }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let batch: WireBatch = resp.json().await?;
        debug!(job = %batch.id, count = requests.len(), "created message batch");
        sub.meta = BatchMeta::Deferred {
            job_id: Some(batch.id),
            results_url: batch.results_url,
        };
        sub.advance(BatchStatus::InProgress);
        Ok(())
    }

    async fn batch_refresh(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Deferred {
            job_id: Some(job_id),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job id".into()));
        };
        let url = format!("{}/v1/messages/batches/{job_id}", self.base_url);
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let batch: WireBatch = resp.json().await?;
        if batch.results_url.is_some() {
            sub.output_file_id = batch.results_url.clone();
        }
        sub.meta = BatchMeta::Deferred {
            job_id: Some(batch.id),
            results_url: batch.results_url,
        };
        sub.advance(map_status(&batch.processing_status));
        Ok(())
    }

    async fn batch_receive(
        &self,
        _scope: &RequestScope,
        sub: &mut BatchRecord,
    ) -> Result<Vec<BatchOutput>> {
        let BatchMeta::Deferred {
            job_id: Some(job_id),
            results_url,
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job id".into()));
        };
        let url = match results_url {
            Some(url) => url.clone(),
            None => format!("{}/v1/messages/batches/{job_id}/results", self.base_url),
        };
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let text = resp.text().await?;
        let mut outputs = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let result: WireResult = serde_json::from_str(line).map_err(|e| {
                GatewayError::provider("provider_error", format!("result line {i}: {e}"))
            })?;
            let output = match result.result.kind.as_str() {
                "succeeded" => match result.result.message {
                    Some(message) => BatchOutput::chat(result.custom_id, &message.canonical()),
                    None => BatchOutput::failure(
                        result.custom_id,
                        ApiError::provider("succeeded result without a message"),
                    ),
                },
                kind => BatchOutput::failure(
                    result.custom_id,
                    ApiError {
                        message: result
                            .result
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| format!("request {kind}")),
                        kind: "provider_error".into(),
                        ..Default::default()
                    },
                ),
            };
            outputs.push(output);
        }
        Ok(outputs)
    }

    async fn batch_cancel(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Deferred {
            job_id: Some(job_id),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job id".into()));
        };
        let resp = self
            .post(&format!("/v1/messages/batches/{job_id}/cancel"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_cached_tokens() {
        let usage = WireUsage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_input_tokens: Some(60),
        }
        .canonical();
        assert_eq!(usage.total_tokens, 120);
        assert_eq!(
            usage.prompt_tokens_details.unwrap().cached_tokens,
            Some(60)
        );
    }

    #[test]
    fn processing_status_maps_monotone() {
        assert_eq!(map_status("in_progress"), BatchStatus::InProgress);
        assert_eq!(map_status("canceling"), BatchStatus::InProgress);
        assert_eq!(map_status("ended"), BatchStatus::Completed);
    }

    #[tokio::test]
    async fn upload_defers() {
        let d = Anthropic::new(&Provider::default());
        let mut sub = BatchRecord::new("sub");
        let err = d
            .batch_upload(&RequestScope::default(), &mut sub, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Deferred));
        assert!(sub.meta.is_none());
    }

    #[tokio::test]
    async fn encode_carries_system_and_defaults() {
        let d = Anthropic::new(&Provider::default());
        let req = ChatRequest {
            model: "claude-3-5-haiku".into(),
            messages: vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage::text(Role::User, "hi"),
            ],
            ..Default::default()
        };
        let params = d.encode(&RequestScope::default(), &req).await.unwrap();
        assert_eq!(params["system"], "be brief");
        assert_eq!(params["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(params["messages"].as_array().unwrap().len(), 1);
    }
}
