//! OpenAI-compatible driver
//!
//! The most basic kind of driver, because this is the API the gateway
//! emulates. Live calls pass through almost verbatim; batching uses the
//! native Batch API when the provider has one, and otherwise reports
//! `NotImplemented` so the orchestrator falls back to emulation.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Provider;
use crate::core::drivers::{sse_data, BatchDriver, Driver};
use crate::core::error::{GatewayError, Result};
use crate::core::types::{
    ApiError, BatchInput, BatchOutput, BatchRecord, BatchMeta, BatchStatus, ChatDelta,
    ChatRequest, ChatResponse, Completion, EmbeddingRequest, EmbeddingResponse, ModelCard,
    RequestScope,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Driver for OpenAI and any provider speaking its API.
pub struct OpenAi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    /// The provider opted into the native Batch API.
    batch_api: bool,
    /// A custom base URL without the batch flag means an OpenAI-compatible
    /// proxy that likely lacks `/batches`.
    custom_base: bool,
}

impl OpenAi {
    pub fn new(p: &Provider) -> Self {
        let custom_base = !p.base_url.is_empty();
        Self {
            client: reqwest::Client::new(),
            base_url: if custom_base {
                p.base_url.trim_end_matches('/').to_string()
            } else {
                DEFAULT_BASE_URL.to_string()
            },
            api_key: p.api_key.clone(),
            batch_api: p.batch,
            custom_base,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.api_key)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.api_key)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

/// Decode a response, turning non-2xx statuses into provider errors with the
/// upstream's own error type when it carries one.
pub(crate) async fn json_or_error<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => GatewayError::Provider {
            kind: env.error.kind,
            message: env.error.message,
        },
        Err(_) => GatewayError::provider("provider_error", format!("{status}: {body}")),
    })
}

#[derive(Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    data: Vec<ModelCard>,
}

#[derive(Deserialize)]
struct FileEnvelope {
    id: String,
}

#[derive(Deserialize)]
struct JobEnvelope {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
}

fn map_status(status: &str) -> BatchStatus {
    match status {
        "validating" => BatchStatus::Validating,
        "in_progress" | "finalizing" | "cancelling" => BatchStatus::InProgress,
        "completed" => BatchStatus::Completed,
        "expired" => BatchStatus::Expired,
        "cancelled" => BatchStatus::Cancelled,
        _ => BatchStatus::Failed,
    }
}

#[async_trait]
impl Driver for OpenAi {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        let resp = self.get("models").send().await?;
        let list: ListEnvelope = json_or_error(resp).await?;
        Ok(list.data)
    }

    async fn embed(&self, _scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let resp = self.post("embeddings").json(&req).send().await?;
        json_or_error(resp).await
    }

    async fn chat(&self, _scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        if !req.stream {
            let resp = self.post("chat/completions").json(&req).send().await?;
            return Ok(Completion::whole(json_or_error(resp).await?));
        }

        let request = self.post("chat/completions").json(&req);
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
                let err = match json_or_error::<ChatResponse>(resp).await {
                    Err(e) => e.api_error(),
                    Ok(_) => ApiError::provider("unexpected upstream response"),
                };
                let _ = tx.send(ChatDelta::failure(err)).await;
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
                if data == "[DONE]" {
                    return;
                }
                match serde_json::from_str::<ChatDelta>(&data) {
                    Ok(chunk) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                        return;
                    }
                }
            }
        });
        Ok(Completion::streaming(rx))
    }
}

#[async_trait]
impl BatchDriver for OpenAi {
    fn chunking(&self) -> Option<usize> {
        Some(25_000)
    }

    async fn batch_upload(
        &self,
        _scope: &RequestScope,
        sub: &mut BatchRecord,
        inputs: &[BatchInput],
    ) -> Result<()> {
        if self.custom_base && !self.batch_api {
            return Err(GatewayError::NotImplemented);
        }
        let Some(first) = inputs.first() else {
            return Err(GatewayError::InvalidRequest("empty batch partition".into()));
        };
        sub.endpoint = first.url.clone();

        let mut body = Vec::new();
        for input in inputs {
            serde_json::to_writer(&mut body, input)?;
            body.push(b'\n');
        }
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part(
                "file",
                reqwest::multipart::Part::bytes(body)
                    .file_name("batch.jsonl")
                    .mime_str("application/jsonl")
                    .expect("static mime"),
            );
        let resp = self.post("files").multipart(form).send().await?;
        let file: FileEnvelope = json_or_error(resp).await?;
        debug!(file = %file.id, count = inputs.len(), "uploaded batch file");
        sub.input_file_id = Some(file.id.clone());
        sub.meta = BatchMeta::Native {
            input_file_id: Some(file.id),
            job_id: None,
        };
        Ok(())
    }

    async fn batch_send(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let input_file_id = match &sub.meta {
            BatchMeta::Native {
                input_file_id: Some(id),
                ..
            } => id.clone(),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "batch has no uploaded input file".into(),
                ))
            }
        };
        let resp = self
            .post("batches")
            .json(&serde_json::json!({
                "input_file_id": input_file_id,
                "endpoint": sub.endpoint,
                "completion_window": "24h",
            }))
            .send()
            .await?;
        let job: JobEnvelope = json_or_error(resp).await?;
        sub.completion_window = Some("24h".into());
        sub.meta = BatchMeta::Native {
            input_file_id: Some(input_file_id),
            job_id: Some(job.id),
        };
        sub.advance(BatchStatus::InProgress);
        Ok(())
    }

    async fn batch_refresh(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Native {
            job_id: Some(job_id),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job id".into()));
        };
        let resp = self.get(&format!("batches/{job_id}")).send().await?;
        let job: JobEnvelope = json_or_error(resp).await?;
        if job.output_file_id.is_some() {
            sub.output_file_id = job.output_file_id;
        }
        sub.advance(map_status(&job.status));
        Ok(())
    }

    async fn batch_receive(
        &self,
        _scope: &RequestScope,
        sub: &mut BatchRecord,
    ) -> Result<Vec<BatchOutput>> {
        let Some(output_file_id) = &sub.output_file_id else {
            return Err(GatewayError::BatchIncomplete);
        };
        let resp = self
            .get(&format!("files/{output_file_id}/content"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::provider(
                "provider_error",
                format!("{status}: {body}"),
            ));
        }
        let text = resp.text().await?;
        let mut outputs = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let output: BatchOutput = serde_json::from_str(line).map_err(|e| {
                GatewayError::provider("provider_error", format!("output line {i}: {e}"))
            })?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    async fn batch_cancel(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Native {
            job_id: Some(job_id),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job id".into()));
        };
        let resp = self.post(&format!("batches/{job_id}/cancel")).send().await?;
        let job: JobEnvelope = json_or_error(resp).await?;
        sub.advance(map_status(&job.status));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_canonical() {
        assert_eq!(map_status("validating"), BatchStatus::Validating);
        assert_eq!(map_status("finalizing"), BatchStatus::InProgress);
        assert_eq!(map_status("completed"), BatchStatus::Completed);
        assert_eq!(map_status("somethingelse"), BatchStatus::Failed);
    }

    #[test]
    fn proxy_without_batch_flag_is_emulated() {
        let p = Provider {
            base_url: "https://proxy.test/v1".into(),
            ..Default::default()
        };
        let d = OpenAi::new(&p);
        assert!(d.custom_base && !d.batch_api);
    }
}
