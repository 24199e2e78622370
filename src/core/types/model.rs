//! Model list types

use serde::{Deserialize, Serialize};

/// OpenAI `Model` shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
    /// Driver name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,
    /// Comma-joined aliases.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
}

/// OpenAI model list envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn new(data: Vec<ModelCard>) -> Self {
        Self {
            object: "list".into(),
            data,
        }
    }
}
