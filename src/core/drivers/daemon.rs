//! Daemon driver: glorified IPC over HTTP
//!
//! A transparent OpenAI-compatible client for a configured gateway daemon.
//! The registry pings it first and silently falls back to direct driving
//! when nothing answers within the dial timeout.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{DaemonConfig, Provider};
use crate::core::drivers::{Driver, OpenAi};
use crate::core::error::{GatewayError, Result};
use crate::core::types::{
    ChatRequest, Completion, EmbeddingRequest, EmbeddingResponse, ModelCard, RequestScope,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Client driver speaking to a remote gateway daemon.
pub struct Daemon {
    inner: OpenAi,
    base_url: String,
}

impl Daemon {
    pub fn new(d: &DaemonConfig) -> Self {
        let base_url = d.base_url();
        let provider = Provider {
            base_url: base_url.clone(),
            ..Default::default()
        };
        Self {
            inner: OpenAi::new(&provider),
            base_url,
        }
    }

    /// Probe the daemon; errors mean "drive directly instead".
    pub async fn ping(&self) -> Result<()> {
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(DIAL_TIMEOUT)
            .build()?;
        let resp = client.get(format!("{}/ping", self.base_url)).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::provider(
                "provider_error",
                format!("daemon not responding: {}", resp.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for Daemon {
    async fn list(&self, scope: &RequestScope) -> Result<Vec<ModelCard>> {
        self.inner.list(scope).await
    }

    async fn embed(&self, scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        self.inner.embed(scope, req).await
    }

    async fn chat(&self, scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        self.inner.chat(scope, req).await
    }
}
