//! Per-request ambient values
//!
//! Instead of opaque context keys, every driver call receives an explicit
//! scope describing the resolved model and, for deferred batch sends, the
//! inputs the orchestrator loaded from the store.

use crate::config::Model;
use crate::core::types::BatchInput;

/// Ambient values for one driver call.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    /// The resolved model configuration.
    pub model: Model,
    /// Inputs for a deferred `batch_send`; empty otherwise.
    pub deferred: Vec<BatchInput>,
}

impl RequestScope {
    pub fn for_model(model: Model) -> Self {
        Self {
            model,
            deferred: Vec::new(),
        }
    }

    pub fn with_deferred(mut self, inputs: Vec<BatchInput>) -> Self {
        self.deferred = inputs;
        self
    }
}
