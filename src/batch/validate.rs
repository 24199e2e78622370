//! Super-batch input validation and partitioning
//!
//! Decodes the uploaded JSONL one request at a time, validates each line,
//! and groups the inputs by resolved model in submission order. Every
//! rejection names its line (`request/{i}`) and custom id.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::error::{GatewayError, Result};
use crate::core::registry::{Binding, DriverRegistry};
use crate::core::translate;
use crate::core::types::{BatchInput, BatchPayload};

/// One model group, bound to its driver.
#[derive(Debug)]
pub struct Partition {
    pub binding: Binding,
    pub inputs: Vec<BatchInput>,
}

impl Partition {
    pub fn model_name(&self) -> &str {
        &self.binding.model.name
    }
}

/// The partitioned super batch, ready for upload.
#[derive(Debug)]
pub struct ValidatedBatch {
    /// One partition per model, in order of first appearance.
    pub partitions: Vec<Partition>,
    pub total: u64,
    pub model_counts: BTreeMap<String, u64>,
}

fn malformed(location: usize, custom_id: &str, message: impl ToString) -> GatewayError {
    GatewayError::Malformed {
        location,
        custom_id: custom_id.to_string(),
        message: message.to_string(),
    }
}

/// Parse and validate a JSONL super batch.
pub async fn parse_and_validate(registry: &DriverRegistry, data: &[u8]) -> Result<ValidatedBatch> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Partition> = HashMap::new();
    let mut total = 0u64;

    let stream = serde_json::Deserializer::from_slice(data).into_iter::<BatchInput>();
    for (i, line) in stream.enumerate() {
        let mut input = line.map_err(|e| malformed(i, "", e))?;

        if input.custom_id.is_empty() {
            return Err(malformed(i, "", "missing custom_id"));
        }
        if !seen_ids.insert(input.custom_id.clone()) {
            return Err(malformed(
                i,
                &input.custom_id,
                format!("duplicate custom_id {:?}", input.custom_id),
            ));
        }
        if !input.method.is_empty() && !input.method.eq_ignore_ascii_case("post") {
            return Err(malformed(i, &input.custom_id, "POST method is required"));
        }
        input.method = "POST".into();

        let alias = input.model().to_string();
        let binding = registry
            .resolve(&alias)
            .await
            .map_err(|e| malformed(i, &input.custom_id, format!("model {alias:?}: {e}")))?;
        let model = &binding.model;

        match &mut input.payload {
            BatchPayload::Chat(req) => {
                if model.embedding {
                    return Err(malformed(
                        i,
                        &input.custom_id,
                        format!("model {alias:?} is not a chat model"),
                    ));
                }
                translate::validate_thread(&req.messages)
                    .map_err(|e| malformed(i, &input.custom_id, e))?;
                req.model = model.name.clone();
            }
            BatchPayload::Embed(req) => {
                if !model.embedding {
                    return Err(malformed(
                        i,
                        &input.custom_id,
                        format!("model {alias:?} is not an embedding model"),
                    ));
                }
                req.model = model.name.clone();
            }
        }

        total += 1;
        let key = model.name.clone();
        match groups.get_mut(&key) {
            Some(partition) => partition.inputs.push(input),
            None => {
                order.push(key.clone());
                groups.insert(
                    key,
                    Partition {
                        binding,
                        inputs: vec![input],
                    },
                );
            }
        }
    }

    if total == 0 {
        return Err(GatewayError::InvalidRequest("no requests to batch".into()));
    }

    let mut partitions = Vec::with_capacity(order.len());
    let mut model_counts = BTreeMap::new();
    for key in order {
        let partition = groups.remove(&key).expect("grouped above");
        model_counts.insert(key, partition.inputs.len() as u64);
        partitions.push(partition);
    }
    Ok(ValidatedBatch {
        partitions,
        total,
        model_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;

    fn registry() -> DriverRegistry {
        let config: Config = serde_yaml::from_str(
            r#"
providers:
  - driver: openai
    name: openai
    batch: true
    models:
      - name: gpt-4o-mini
      - name: text-embedding-3-small
        embedding: true
  - driver: anthropic
    name: anthropic
    models:
      - name: claude-3-5-haiku
"#,
        )
        .unwrap();
        DriverRegistry::new(Arc::new(config))
    }

    fn line(custom_id: &str, model: &str, url: &str) -> String {
        if url.ends_with("/embeddings") {
            format!(
                r#"{{"custom_id":{custom_id:?},"method":"POST","url":{url:?},"body":{{"model":{model:?},"input":"hi"}}}}"#
            )
        } else {
            format!(
                r#"{{"custom_id":{custom_id:?},"method":"POST","url":{url:?},"body":{{"model":{model:?},"messages":[{{"role":"user","content":"hi"}}]}}}}"#
            )
        }
    }

    #[tokio::test]
    async fn groups_by_model_in_submission_order() {
        let reg = registry();
        let jsonl = [
            line("a", "gpt-4o-mini", "/v1/chat/completions"),
            line("b", "claude-3-5-haiku", "/v1/chat/completions"),
            line("c", "gpt-4o-mini", "/v1/chat/completions"),
        ]
        .join("\n");
        let batch = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap();
        assert_eq!(batch.total, 3);
        assert_eq!(batch.partitions.len(), 2);
        assert_eq!(batch.partitions[0].model_name(), "gpt-4o-mini");
        assert_eq!(batch.partitions[0].inputs.len(), 2);
        assert_eq!(batch.partitions[0].inputs[1].custom_id, "c");
        assert_eq!(batch.model_counts["claude-3-5-haiku"], 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_custom_id() {
        let reg = registry();
        let jsonl = [
            line("a", "gpt-4o-mini", "/v1/chat/completions"),
            line("a", "gpt-4o-mini", "/v1/chat/completions"),
        ]
        .join("\n");
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        match err {
            GatewayError::Malformed {
                location,
                custom_id,
                message,
            } => {
                assert_eq!(location, 1);
                assert_eq!(custom_id, "a");
                assert!(message.contains("duplicate custom_id"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_missing_id_and_bad_method() {
        let reg = registry();
        let jsonl = line("", "gpt-4o-mini", "/v1/chat/completions");
        assert!(matches!(
            parse_and_validate(&reg, jsonl.as_bytes()).await,
            Err(GatewayError::Malformed { location: 0, .. })
        ));

        let jsonl = r#"{"custom_id":"a","method":"GET","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}}"#;
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("POST method is required"));
    }

    #[tokio::test]
    async fn rejects_endpoint_kind_mismatch() {
        let reg = registry();
        let jsonl = line("a", "text-embedding-3-small", "/v1/chat/completions");
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("is not a chat model"));

        let jsonl = line("a", "gpt-4o-mini", "/v1/embeddings");
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("is not an embedding model"));
    }

    #[tokio::test]
    async fn rejects_misplaced_system_with_index() {
        let reg = registry();
        let jsonl = r#"{"custom_id":"a","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"},{"role":"system","content":"late"}]}}"#;
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("system message/1 is misplaced"), "{err}");
    }

    #[tokio::test]
    async fn rejects_unknown_model() {
        let reg = registry();
        let jsonl = line("a", "gpt-12-ultra", "/v1/chat/completions");
        let err = parse_and_validate(&reg, jsonl.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("model \"gpt-12-ultra\""));
    }

    #[tokio::test]
    async fn rejects_empty_stream() {
        let reg = registry();
        assert!(matches!(
            parse_and_validate(&reg, b"").await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
