//! Gateway configuration
//!
//! The config file is YAML at `$MANIFOLD_PATH/config.yaml`, with
//! `MANIFOLD_PATH` defaulting to `$HOME/.manifold`. Only the parts the core
//! reads are modeled here; secret management is the keyring's problem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon endpoints (listen side and, for clients, the remote side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonConfig>,

    /// Durable store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upstream inference providers, in resolution order.
    #[serde(default)]
    pub providers: Vec<Provider>,
}

impl Config {
    /// Data directory: `$MANIFOLD_PATH`, or `$HOME/.manifold`.
    pub fn data_dir() -> PathBuf {
        if let Ok(p) = std::env::var("MANIFOLD_PATH") {
            return PathBuf::from(p);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Path::new(&home).join(".manifold")
    }

    /// Load the config file from the data directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::data_dir().join("config.yaml"))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GatewayError::Config(format!("{}: {e}", path.as_ref().display())))?;
        serde_yaml::from_str(&raw).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Find a model by alias across providers.
    ///
    /// A model matches when the alias equals its name, any explicit alias, or
    /// the name with a trailing `-latest` stripped. Models flagged `latest`
    /// get the suffix appended back onto the returned name.
    pub fn lookup(&self, alias: &str) -> Option<(Model, &Provider)> {
        let bare = alias.strip_suffix("-latest").unwrap_or(alias);
        for p in &self.providers {
            for m in &p.models {
                if m.name == bare || m.alias.iter().any(|a| a == bare) {
                    let mut m = m.clone();
                    if m.latest {
                        m.name.push_str("-latest");
                    }
                    return Some((m, p));
                }
            }
        }
        None
    }

    /// Path of the SQLite store.
    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(p) => p.clone(),
            None => Self::data_dir().join("manifold.db3"),
        }
    }
}

/// Daemon addresses. The listen address serves the gateway; the daemon
/// address, when set on a client, is probed before direct driving.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default)]
    pub daemon_addr: String,
}

impl DaemonConfig {
    /// Base URL of the daemon's OpenAI surface, with the wildcard bind
    /// address rewritten to loopback.
    pub fn base_url(&self) -> String {
        let addr = if self.daemon_addr.is_empty() {
            &self.listen_addr
        } else {
            &self.daemon_addr
        };
        let addr = addr.replace("0.0.0.0", "127.0.0.1");
        format!("{}/v1", addr.trim_end_matches('/'))
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path; defaults to `manifold.db3` under the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    4
}

/// Which adapter speaks to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Openai,
    Anthropic,
    Gemini,
    Vertex,
    Dify,
}

/// One upstream provider and the models served through it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    pub driver: DriverKind,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Whether the provider's native batch API may be used.
    #[serde(default)]
    pub batch: bool,
    #[serde(default)]
    pub models: Vec<Model>,

    // Vertex AI
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub bucket: String,
}

/// Per-model configuration carried through the request pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub alias: Vec<String>,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub images: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub batch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,

    #[serde(flatten)]
    pub defaults: DecodingDefaults,
}

/// Optional decoding defaults a model carries; they fill request fields the
/// caller left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodingDefaults {
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
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Model {
    /// Fill unset decoding fields of a chat request from the model defaults.
    pub fn apply_defaults(&self, req: &mut crate::core::types::ChatRequest) {
        let d = &self.defaults;
        if req.max_tokens.is_none() {
            req.max_tokens = d.max_tokens;
        }
        if req.temperature.is_none() {
            req.temperature = d.temperature;
        }
        if req.top_p.is_none() {
            req.top_p = d.top_p;
        }
        if req.frequency_penalty.is_none() {
            req.frequency_penalty = d.frequency_penalty;
        }
        if req.presence_penalty.is_none() {
            req.presence_penalty = d.presence_penalty;
        }
        if req.seed.is_none() {
            req.seed = d.seed;
        }
        if req.stop.is_none() && !d.stop.is_empty() {
            req.stop = Some(d.stop.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        serde_yaml::from_str(
            r#"
providers:
  - driver: openai
    name: openai
    batch: true
    models:
      - name: gpt-4o-mini
        alias: [mini]
  - driver: anthropic
    name: anthropic
    models:
      - name: claude-3-5-haiku
        latest: true
        max_tokens: 2048
"#,
        )
        .unwrap()
    }

    #[test]
    fn lookup_by_name_and_alias() {
        let cfg = config();
        let (m, p) = cfg.lookup("gpt-4o-mini").unwrap();
        assert_eq!(m.name, "gpt-4o-mini");
        assert_eq!(p.name, "openai");
        let (m, _) = cfg.lookup("mini").unwrap();
        assert_eq!(m.name, "gpt-4o-mini");
        assert!(cfg.lookup("gpt-5-maxi").is_none());
    }

    #[test]
    fn lookup_latest_suffix() {
        let cfg = config();
        // the stored name has no suffix; the latest flag appends it back
        let (m, _) = cfg.lookup("claude-3-5-haiku-latest").unwrap();
        assert_eq!(m.name, "claude-3-5-haiku-latest");
        let (m, _) = cfg.lookup("claude-3-5-haiku").unwrap();
        assert_eq!(m.name, "claude-3-5-haiku-latest");
        assert_eq!(m.defaults.max_tokens, Some(2048));
    }

    #[test]
    fn daemon_base_url_rewrites_wildcard() {
        let d = DaemonConfig {
            listen_addr: "http://0.0.0.0:3049".into(),
            daemon_addr: String::new(),
        };
        assert_eq!(d.base_url(), "http://127.0.0.1:3049/v1");
    }
}
