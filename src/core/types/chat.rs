//! Chat completion types

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::batch::ApiError;
use super::Usage;

/// Chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Streaming knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// Message role.
///
/// The gateway only routes system/user/assistant; anything else is rejected
/// at translation time rather than at parse time so that the error can name
/// the offending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
        }
    }

    /// Flattened text of the message, multi-part text joined with spaces.
    pub fn plain_text(&self) -> String {
        match &self.content {
            Some(c) => c.to_string(),
            None => String::new(),
        }
    }
}

/// Message content, plain or multi-part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl std::fmt::Display for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageContent::Text(t) => f.write_str(t),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                f.write_str(&texts.join(" "))
            }
        }
    }
}

/// One part of a multi-part message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image reference inside a multi-part message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Chat completion response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

/// One response choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            role: Role::Assistant,
            content: None,
        }
    }
}

/// A chat completion that may be streamed.
///
/// For non-streaming calls `response` is the whole answer and `stream` is
/// `None`. For streaming calls, `stream` carries the chunk channel; the
/// sender side closes it exactly once, after a terminating sentinel — a
/// `stop` finish reason, a usage-only trailer, or an error chunk.
#[derive(Debug)]
pub struct Completion {
    pub response: ChatResponse,
    pub stream: Option<mpsc::Receiver<ChatDelta>>,
}

impl Completion {
    pub fn whole(response: ChatResponse) -> Self {
        Self {
            response,
            stream: None,
        }
    }

    pub fn streaming(rx: mpsc::Receiver<ChatDelta>) -> Self {
        Self {
            response: ChatResponse::default(),
            stream: Some(rx),
        }
    }
}

/// One streamed chunk, in the OpenAI stream-response shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Underlying failure when the chunk terminates the stream with an
    /// `error` finish reason; never serialized.
    #[serde(skip)]
    pub error: Option<ApiError>,
}

impl ChatDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            object: "chat.completion.chunk".into(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    role: Some(Role::Assistant),
                    content: Some(text.into()),
                },
                finish_reason: None,
            }],
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            object: "chat.completion.chunk".into(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta::default(),
                finish_reason: Some(reason.into()),
            }],
            ..Default::default()
        }
    }

    pub fn trailer(usage: Usage) -> Self {
        Self {
            object: "chat.completion.chunk".into(),
            usage: Some(usage),
            ..Default::default()
        }
    }

    pub fn failure(error: ApiError) -> Self {
        let mut d = Self::finish("error");
        d.error = Some(error);
        d
    }

    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.choices
            .iter()
            .any(|c| matches!(c.finish_reason.as_deref(), Some("stop") | Some("error")))
    }
}

/// Streamed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Streamed message fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_round_trip() {
        let msg: ChatMessage = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(msg.plain_text(), "hi");

        let msg: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[
                {"type":"text","text":"what is this"},
                {"type":"image_url","image_url":{"url":"https://x.test/cat.png"}}
            ]}"#,
        )
        .unwrap();
        match msg.content.as_ref().unwrap() {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn unknown_role_parses_for_later_rejection() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"developer","content":"x"}"#).unwrap();
        assert_eq!(msg.role, Role::Unknown);
    }

    #[test]
    fn delta_terminality() {
        assert!(ChatDelta::finish("stop").is_terminal());
        assert!(ChatDelta::failure(ApiError::provider("boom")).is_terminal());
        assert!(!ChatDelta::content("hi").is_terminal());
        assert!(!ChatDelta::trailer(Usage::default()).is_terminal());
    }
}
