//! Provider driver contract and adapters
//!
//! A driver executes live inference against one provider. A batch driver
//! additionally implements the five-step batch lifecycle. The two are
//! distinct traits: code that needs batching resolves it explicitly and
//! fails closed instead of silently falling back to live inference.

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;

use crate::core::error::Result;
use crate::core::types::{
    BatchInput, BatchOutput, BatchRecord, Completion, ChatRequest, EmbeddingRequest,
    EmbeddingResponse, ModelCard, RequestScope,
};

mod anthropic;
mod daemon;
mod dify;
mod gemini;
mod google;
mod openai;
mod vertex;

pub use anthropic::Anthropic;
pub use daemon::Daemon;
pub use dify::Dify;
pub use gemini::Gemini;
pub use openai::OpenAi;
pub use vertex::Vertex;

/// A roughly OpenAI-compatible inference backend.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Models the provider reports, or `NotImplemented`.
    async fn list(&self, scope: &RequestScope) -> Result<Vec<ModelCard>>;

    /// Execute an embedding request.
    async fn embed(&self, scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Execute a chat request. Streaming requests return a completion whose
    /// chunk channel terminates with a stop sentinel, an optional usage
    /// trailer, or an error chunk.
    async fn chat(&self, scope: &RequestScope, req: ChatRequest) -> Result<Completion>;
}

/// A driver that supports some variant of the Batch API.
///
/// Drivers mutate the `BatchRecord` argument (status, metadata, output
/// locator) but never touch durable state; persistence belongs to the
/// orchestrator.
#[async_trait]
pub trait BatchDriver: Driver {
    /// Partition size limit, or `None` when the provider takes a whole model
    /// group in one job.
    fn chunking(&self) -> Option<usize>;

    /// Validate and push inputs to the provider side. `Ok` sets the input
    /// locator on the record; `Err(NotImplemented)` asks the orchestrator to
    /// emulate the partition; `Err(Deferred)` asks it to hold the inputs
    /// until send.
    async fn batch_upload(
        &self,
        scope: &RequestScope,
        sub: &mut BatchRecord,
        inputs: &[BatchInput],
    ) -> Result<()>;

    /// Submit the prepared batch. Deferred inputs arrive via
    /// `scope.deferred`. Records the provider job id in metadata.
    async fn batch_send(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()>;

    /// Read provider status into the record. Benign "still running" states
    /// are not errors.
    async fn batch_refresh(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()>;

    /// Fetch and convert provider output to canonical shape, preserving
    /// custom ids and populating usage when reported.
    async fn batch_receive(
        &self,
        scope: &RequestScope,
        sub: &mut BatchRecord,
    ) -> Result<Vec<BatchOutput>>;

    /// Request cancellation; only valid in non-terminal states.
    async fn batch_cancel(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()>;
}

/// Decode a server-sent-event response into its `data:` payloads.
///
/// Terminates on stream end; the `[DONE]` sentinel is passed through for the
/// caller to recognize.
pub(crate) fn sse_data(
    resp: reqwest::Response,
) -> impl Stream<Item = std::result::Result<String, reqwest::Error>> + Send {
    async_stream::stream! {
        let mut body = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim_end();
                        if let Some(data) = line.strip_prefix("data:") {
                            yield Ok(data.trim_start().to_string());
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}
