//! Batch types
//!
//! A super batch and its sub-batches share one canonical record shape, the
//! OpenAI `Batch` object; the distinction lives in the store (a sub-batch has
//! a parent pointer) and in the metadata variant.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::chat::{ChatRequest, ChatResponse};
use super::embedding::{EmbeddingRequest, EmbeddingResponse};

/// Endpoint path selecting chat completions inside a batch input.
pub const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
/// Endpoint path selecting embeddings inside a batch input.
pub const EMBEDDINGS: &str = "/v1/embeddings";

/// Canonical batch lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchStatus::Validating | BatchStatus::InProgress)
    }

    /// Position in the lifecycle ordering; terminal states share a rank.
    fn rank(self) -> u8 {
        match self {
            BatchStatus::Validating => 0,
            BatchStatus::InProgress => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Provider-side identifiers a driver records on a sub-batch, one variant per
/// batching strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchMeta {
    /// No provider-side state yet (super batches, unsent subs).
    #[default]
    None,
    /// Native upload: provider file + batch job.
    Native {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_file_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    /// Deferred: inputs are held locally until send.
    Deferred {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results_url: Option<String>,
    },
    /// Cloud-native table batch.
    Table {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_table: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_table: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
    },
}

impl BatchMeta {
    pub fn is_none(&self) -> bool {
        matches!(self, BatchMeta::None)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, BatchMeta::Deferred { .. })
    }
}

/// Request tallies on a batch record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

/// Aggregated provider errors, OpenAI list envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchErrors {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub data: Vec<BatchError>,
}

/// One provider error recorded against a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// The canonical batch descriptor persisted as the row body for both super-
/// and sub-batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_window: Option<String>,
    /// Unset until the batch is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,

    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<i64>,

    #[serde(default)]
    pub request_counts: RequestCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<BatchErrors>,
    /// Per-model request counts; populated on super batches.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_counts: BTreeMap<String, u64>,

    #[serde(rename = "metadata", default, skip_serializing_if = "BatchMeta::is_none")]
    pub meta: BatchMeta,
}

impl BatchRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "batch".into(),
            created_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    /// Move to a new status, refusing to backtrack out of a terminal state,
    /// and stamp the matching timestamp.
    pub fn advance(&mut self, status: BatchStatus) {
        if let Some(current) = self.status {
            if current.rank() > status.rank() {
                return;
            }
        }
        self.status = Some(status);
        let now = chrono::Utc::now().timestamp();
        match status {
            BatchStatus::Validating => {}
            BatchStatus::InProgress => {
                self.in_progress_at.get_or_insert(now);
            }
            BatchStatus::Completed => {
                self.completed_at.get_or_insert(now);
            }
            BatchStatus::Failed => {
                self.failed_at.get_or_insert(now);
            }
            BatchStatus::Cancelled => {
                self.cancelled_at.get_or_insert(now);
            }
            BatchStatus::Expired => {
                self.expired_at.get_or_insert(now);
            }
        }
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        let errors = self.errors.get_or_insert_with(|| BatchErrors {
            object: "list".into(),
            data: vec![],
        });
        errors.data.push(BatchError {
            message: message.into(),
            ..Default::default()
        });
    }

    pub fn error_count(&self) -> usize {
        self.errors.as_ref().map_or(0, |e| e.data.len())
    }
}

/// Which request a batch input carries, decided by its URL.
#[derive(Debug, Clone)]
pub enum BatchPayload {
    Chat(ChatRequest),
    Embed(EmbeddingRequest),
}

impl BatchPayload {
    pub fn model(&self) -> &str {
        match self {
            BatchPayload::Chat(r) => &r.model,
            BatchPayload::Embed(r) => &r.model,
        }
    }

}

/// One line of a super-batch JSONL upload: `{custom_id, method, url, body}`.
///
/// The URL selects the endpoint category, and the body is decoded into the
/// matching request; serialization reproduces the wire shape unchanged.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub payload: BatchPayload,
}

impl BatchInput {
    pub fn model(&self) -> &str {
        self.payload.model()
    }

    pub fn chat(custom_id: impl Into<String>, req: ChatRequest) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".into(),
            url: CHAT_COMPLETIONS.into(),
            payload: BatchPayload::Chat(req),
        }
    }

    pub fn embed(custom_id: impl Into<String>, req: EmbeddingRequest) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".into(),
            url: EMBEDDINGS.into(),
            payload: BatchPayload::Embed(req),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawBatchInput {
    #[serde(default)]
    custom_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    url: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    body: serde_json::Value,
}

impl Serialize for BatchInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match &self.payload {
            BatchPayload::Chat(r) => serde_json::to_value(r),
            BatchPayload::Embed(r) => serde_json::to_value(r),
        }
        .map_err(serde::ser::Error::custom)?;
        RawBatchInput {
            custom_id: self.custom_id.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            body,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BatchInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawBatchInput::deserialize(deserializer)?;
        let payload = if raw.url.ends_with("/chat/completions") {
            BatchPayload::Chat(serde_json::from_value(raw.body).map_err(D::Error::custom)?)
        } else if raw.url.ends_with("/embeddings") {
            BatchPayload::Embed(serde_json::from_value(raw.body).map_err(D::Error::custom)?)
        } else {
            return Err(D::Error::custom("neither a chat completion nor an embedding"));
        };
        Ok(BatchInput {
            custom_id: raw.custom_id,
            method: raw.method,
            url: raw.url,
            payload,
        })
    }
}

/// OpenAI-shaped error object carried by outputs and error responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: "invalid_request_error".into(),
            ..Default::default()
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: "provider_error".into(),
            ..Default::default()
        }
    }
}

/// Wrapped response inside a batch output record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// One line of the aggregated JSONL output: `{custom_id, response?, error?}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutput {
    #[serde(default)]
    pub custom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BatchResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl BatchOutput {
    pub fn chat(custom_id: impl Into<String>, response: &ChatResponse) -> Self {
        Self {
            custom_id: custom_id.into(),
            response: Some(BatchResponse {
                status_code: 200,
                request_id: None,
                body: serde_json::to_value(response).unwrap_or_default(),
            }),
            error: None,
        }
    }

    pub fn embedding(custom_id: impl Into<String>, response: &EmbeddingResponse) -> Self {
        Self {
            custom_id: custom_id.into(),
            response: Some(BatchResponse {
                status_code: 200,
                request_id: None,
                body: serde_json::to_value(response).unwrap_or_default(),
            }),
            error: None,
        }
    }

    pub fn failure(custom_id: impl Into<String>, error: ApiError) -> Self {
        Self {
            custom_id: custom_id.into(),
            response: None,
            error: Some(error),
        }
    }
}

/// OpenAI `File` shape returned from the super-batch upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub purpose: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::chat::{ChatMessage, Role};

    #[test]
    fn input_round_trips_wire_shape() {
        let line = r#"{"custom_id":"a","method":"POST","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}}"#;
        let input: BatchInput = serde_json::from_str(line).unwrap();
        assert_eq!(input.custom_id, "a");
        assert_eq!(input.model(), "gpt-4o-mini");
        let back = serde_json::to_string(&input).unwrap();
        let v1: serde_json::Value = serde_json::from_str(line).unwrap();
        let v2: serde_json::Value = serde_json::from_str(&back).unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn input_url_selects_embedding() {
        let line = r#"{"custom_id":"e","url":"/v1/embeddings","body":{"model":"jina-embeddings-v3","input":"hello"}}"#;
        let input: BatchInput = serde_json::from_str(line).unwrap();
        assert!(matches!(input.payload, BatchPayload::Embed(_)));
    }

    #[test]
    fn input_rejects_meat_nor_fish() {
        let line = r#"{"custom_id":"x","url":"/v1/images","body":{}}"#;
        let err = serde_json::from_str::<BatchInput>(line).unwrap_err();
        assert!(err.to_string().contains("neither a chat completion"));
    }

    #[test]
    fn status_advance_is_monotone() {
        let mut b = BatchRecord::new("b");
        b.advance(BatchStatus::InProgress);
        b.advance(BatchStatus::Completed);
        let done_at = b.completed_at;
        b.advance(BatchStatus::InProgress);
        assert_eq!(b.status, Some(BatchStatus::Completed));
        assert_eq!(b.completed_at, done_at);
    }

    #[test]
    fn meta_tag_round_trip() {
        let meta = BatchMeta::Deferred {
            job_id: Some("msgbatch_1".into()),
            results_url: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""kind":"deferred""#));
        let back: BatchMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn output_skips_absent_halves() {
        let out = BatchOutput::chat(
            "a",
            &ChatResponse {
                choices: vec![crate::core::types::ChatChoice {
                    index: 0,
                    message: ChatMessage::text(Role::Assistant, "hello"),
                    finish_reason: Some("stop".into()),
                }],
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&out).unwrap();
        assert!(!json.contains("error"));
        let failed = BatchOutput::failure("b", ApiError::provider("kaput"));
        let json = serde_json::to_string(&failed).unwrap();
        assert!(!json.contains("response"));
    }
}
