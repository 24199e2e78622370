//! Driver registry
//!
//! Resolves a model alias to a driver instance and model configuration. When
//! a remote daemon is configured and answers a ping, a transparent client
//! driver is returned instead of driving the provider directly.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::config::{Config, DriverKind, Model, Provider};
use crate::core::drivers::{Anthropic, BatchDriver, Daemon, Dify, Driver, Gemini, OpenAi, Vertex};
use crate::core::error::{GatewayError, Result};

/// A resolved alias: the driver, its batch half when the driver implements
/// the batch contract, and the model configuration.
#[derive(Clone)]
pub struct Binding {
    pub driver: Arc<dyn Driver>,
    pub batch: Option<Arc<dyn BatchDriver>>,
    pub model: Model,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("batch", &self.batch.is_some())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Alias → driver resolution with a lookup cache.
pub struct DriverRegistry {
    config: Arc<Config>,
    cache: DashMap<String, Binding>,
    /// Probe the configured daemon before direct driving. Off inside the
    /// daemon itself, which would otherwise hairpin into its own listener.
    probe_daemon: bool,
}

impl DriverRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            cache: DashMap::new(),
            probe_daemon: false,
        }
    }

    /// Enable the daemon probe (client-side resolution).
    pub fn with_daemon_probe(mut self) -> Self {
        self.probe_daemon = true;
        self
    }

    /// Resolve an alias to a live driver and model configuration.
    pub async fn resolve(&self, alias: &str) -> Result<Binding> {
        if self.probe_daemon {
            if let Some(d) = &self.config.daemon {
                if !d.daemon_addr.is_empty() {
                    let daemon = Daemon::new(d);
                    if daemon.ping().await.is_ok() {
                        debug!(alias, "resolved via daemon");
                        return Ok(Binding {
                            driver: Arc::new(daemon),
                            batch: None,
                            model: Model {
                                name: alias.to_string(),
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }

        if let Some(hit) = self.cache.get(alias) {
            return Ok(hit.clone());
        }

        let (model, provider) = self.config.lookup(alias).ok_or(GatewayError::NotFound)?;
        let (driver, batch) = construct(provider);
        let binding = Binding {
            driver,
            batch,
            model,
        };
        self.cache.insert(alias.to_string(), binding.clone());
        debug!(alias, model = %binding.model.name, "resolved driver");
        Ok(binding)
    }

    /// Resolve an alias to a batch-capable driver; fails closed with
    /// `NotBatchable` when the driver lacks the batch contract.
    pub async fn resolve_batch(&self, alias: &str) -> Result<(Arc<dyn BatchDriver>, Model)> {
        let binding = self.resolve(alias).await?;
        match binding.batch {
            Some(batch) => Ok((batch, binding.model)),
            None => Err(GatewayError::NotBatchable),
        }
    }

    /// Pre-populate the cache. Resolution is idempotent, so last write wins.
    pub fn insert(&self, alias: impl Into<String>, binding: Binding) {
        self.cache.insert(alias.into(), binding);
    }

    /// Drop all cached lookups (config reload).
    pub fn clear(&self) {
        self.cache.clear();
    }
}

/// Build the concrete driver for a provider, coercing batch-capable drivers
/// into both halves of the contract.
fn construct(provider: &Provider) -> (Arc<dyn Driver>, Option<Arc<dyn BatchDriver>>) {
    match provider.driver {
        DriverKind::Openai => {
            let d = Arc::new(OpenAi::new(provider));
            (d.clone() as Arc<dyn Driver>, Some(d as Arc<dyn BatchDriver>))
        }
        DriverKind::Anthropic => {
            let d = Arc::new(Anthropic::new(provider));
            (d.clone() as Arc<dyn Driver>, Some(d as Arc<dyn BatchDriver>))
        }
        DriverKind::Vertex => {
            let d = Arc::new(Vertex::new(provider));
            (d.clone() as Arc<dyn Driver>, Some(d as Arc<dyn BatchDriver>))
        }
        DriverKind::Gemini => (Arc::new(Gemini::new(provider)) as Arc<dyn Driver>, None),
        DriverKind::Dify => (Arc::new(Dify::new(provider)) as Arc<dyn Driver>, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DriverRegistry {
        let config: Config = serde_yaml::from_str(
            r#"
providers:
  - driver: openai
    name: openai
    batch: true
    models:
      - name: gpt-4o-mini
  - driver: gemini
    name: google
    models:
      - name: gemini-1.5-flash
"#,
        )
        .unwrap();
        DriverRegistry::new(Arc::new(config))
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let reg = registry();
        let a = reg.resolve("gpt-4o-mini").await.unwrap();
        let b = reg.resolve("gpt-4o-mini").await.unwrap();
        assert_eq!(a.model, b.model);
        assert!(Arc::ptr_eq(&a.driver, &b.driver));

        // config reload drops the cache and rebuilds the driver
        reg.clear();
        let c = reg.resolve("gpt-4o-mini").await.unwrap();
        assert_eq!(a.model, c.model);
        assert!(!Arc::ptr_eq(&a.driver, &c.driver));
    }

    #[tokio::test]
    async fn resolve_unknown_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.resolve("nonesuch").await,
            Err(GatewayError::NotFound)
        ));
    }

    #[tokio::test]
    async fn resolve_batch_fails_closed() {
        let reg = registry();
        assert!(reg.resolve_batch("gpt-4o-mini").await.is_ok());
        assert!(matches!(
            reg.resolve_batch("gemini-1.5-flash").await,
            Err(GatewayError::NotBatchable)
        ));
    }
}
