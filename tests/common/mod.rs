//! Shared test fixtures: scripted mock drivers and registry wiring.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use manifold::config::Model;
use manifold::core::drivers::{BatchDriver, Driver};
use manifold::core::registry::{Binding, DriverRegistry};
use manifold::core::types::{
    BatchInput, BatchMeta, BatchOutput, BatchPayload, BatchRecord, BatchStatus, ChatChoice,
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, Completion, Embedding, EmbeddingRequest,
    EmbeddingResponse, ModelCard, RequestScope, Role, Usage,
};
use manifold::{GatewayError, Result};

/// How the mock behaves at `batch_upload`.
#[derive(Clone, Copy, PartialEq)]
pub enum BatchMode {
    /// Accepts the upload and records an input file id.
    Native,
    /// Wants the inputs at send time.
    Deferred,
    /// No batch support; the orchestrator must emulate.
    Refuse,
    /// Upload blows up with a provider error.
    Fail,
}

/// A scripted provider driver.
pub struct MockDriver {
    pub mode: BatchMode,
    /// Status applied by the next `batch_refresh`.
    pub refresh_to: Mutex<BatchStatus>,
    /// Inputs captured at upload (native mode).
    pub uploaded: Mutex<Vec<BatchInput>>,
    /// Inputs captured at send (deferred mode).
    pub sent: Mutex<Vec<BatchInput>>,
    pub live_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl MockDriver {
    pub fn new(mode: BatchMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            refresh_to: Mutex::new(BatchStatus::InProgress),
            uploaded: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            live_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        })
    }

    pub fn script_refresh(&self, status: BatchStatus) {
        *self.refresh_to.lock().unwrap() = status;
    }

    fn usage() -> Usage {
        Usage {
            prompt_tokens: 3,
            completion_tokens: 5,
            total_tokens: 8,
            prompt_tokens_details: None,
        }
    }

    fn answer(model: &str) -> ChatResponse {
        ChatResponse {
            id: "resp-mock".into(),
            object: "chat.completion".into(),
            created: 1,
            model: model.into(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::text(Role::Assistant, "pong"),
                finish_reason: Some("stop".into()),
            }],
            usage: Some(Self::usage()),
            system_fingerprint: None,
        }
    }

    fn outputs(inputs: &[BatchInput]) -> Vec<BatchOutput> {
        inputs
            .iter()
            .map(|input| match &input.payload {
                BatchPayload::Chat(req) => {
                    BatchOutput::chat(&input.custom_id, &Self::answer(&req.model))
                }
                BatchPayload::Embed(req) => BatchOutput::embedding(
                    &input.custom_id,
                    &EmbeddingResponse {
                        object: "list".into(),
                        data: vec![Embedding {
                            object: "embedding".into(),
                            index: 0,
                            embedding: vec![0.1, 0.2],
                        }],
                        model: req.model.clone(),
                        usage: Some(Self::usage()),
                    },
                ),
            })
            .collect()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        Err(GatewayError::NotImplemented)
    }

    async fn embed(&self, _scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        self.live_calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingResponse {
            object: "list".into(),
            data: vec![Embedding {
                object: "embedding".into(),
                index: 0,
                embedding: vec![0.5; 4],
            }],
            model: req.model,
            usage: Some(Self::usage()),
        })
    }

    async fn chat(&self, _scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        self.live_calls.fetch_add(1, Ordering::SeqCst);
        if !req.stream {
            return Ok(Completion::whole(Self::answer(&req.model)));
        }
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(ChatDelta::content("po")).await;
            let _ = tx.send(ChatDelta::content("ng")).await;
            let _ = tx.send(ChatDelta::trailer(Self::usage())).await;
            let _ = tx.send(ChatDelta::finish("stop")).await;
        });
        Ok(Completion::streaming(rx))
    }
}

#[async_trait]
impl BatchDriver for MockDriver {
    fn chunking(&self) -> Option<usize> {
        match self.mode {
            BatchMode::Deferred => None,
            _ => Some(25_000),
        }
    }

    async fn batch_upload(
        &self,
        _scope: &RequestScope,
        sub: &mut BatchRecord,
        inputs: &[BatchInput],
    ) -> Result<()> {
        match self.mode {
            BatchMode::Refuse => Err(GatewayError::NotImplemented),
            BatchMode::Deferred => Err(GatewayError::Deferred),
            BatchMode::Fail => Err(GatewayError::provider("provider_error", "upload exploded")),
            BatchMode::Native => {
                self.uploaded.lock().unwrap().extend_from_slice(inputs);
                sub.input_file_id = Some("file-mock".into());
                sub.meta = BatchMeta::Native {
                    input_file_id: Some("file-mock".into()),
                    job_id: None,
                };
                Ok(())
            }
        }
    }

    async fn batch_send(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            BatchMode::Deferred => {
                if scope.deferred.is_empty() {
                    return Err(GatewayError::InvalidRequest("no deferred inputs".into()));
                }
                self.sent.lock().unwrap().extend_from_slice(&scope.deferred);
                sub.meta = BatchMeta::Deferred {
                    job_id: Some("msgbatch-mock".into()),
                    results_url: None,
                };
            }
            _ => {
                let Some(file) = sub.input_file_id.clone() else {
                    return Err(GatewayError::provider("provider_error", "no input file id"));
                };
                sub.meta = BatchMeta::Native {
                    input_file_id: Some(file),
                    job_id: Some("job-mock".into()),
                };
            }
        }
        sub.advance(BatchStatus::InProgress);
        Ok(())
    }

    async fn batch_refresh(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let status = *self.refresh_to.lock().unwrap();
        if status == BatchStatus::Completed {
            sub.output_file_id = Some("out-mock".into());
        }
        sub.advance(status);
        Ok(())
    }

    async fn batch_receive(
        &self,
        _scope: &RequestScope,
        _sub: &mut BatchRecord,
    ) -> Result<Vec<BatchOutput>> {
        let uploaded = self.uploaded.lock().unwrap();
        if !uploaded.is_empty() {
            return Ok(Self::outputs(&uploaded));
        }
        Ok(Self::outputs(&self.sent.lock().unwrap()))
    }

    async fn batch_cancel(&self, _scope: &RequestScope, _sub: &mut BatchRecord) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register a mock under an alias. `batchable` controls whether the binding
/// exposes the batch half of the contract.
pub fn bind(
    registry: &DriverRegistry,
    alias: &str,
    embedding: bool,
    driver: &Arc<MockDriver>,
    batchable: bool,
) {
    let model = Model {
        name: alias.to_string(),
        embedding,
        batch: batchable,
        ..Default::default()
    };
    registry.insert(
        alias,
        Binding {
            driver: driver.clone(),
            batch: batchable.then(|| driver.clone() as Arc<dyn BatchDriver>),
            model,
        },
    );
}

/// One JSONL chat line.
pub fn chat_line(custom_id: &str, model: &str, content: &str) -> String {
    format!(
        r#"{{"custom_id":{custom_id:?},"method":"POST","url":"/v1/chat/completions","body":{{"model":{model:?},"messages":[{{"role":"user","content":{content:?}}}]}}}}"#
    )
}

/// One JSONL embedding line.
pub fn embed_line(custom_id: &str, model: &str, input: &str) -> String {
    format!(
        r#"{{"custom_id":{custom_id:?},"method":"POST","url":"/v1/embeddings","body":{{"model":{model:?},"input":{input:?}}}}}"#
    )
}
