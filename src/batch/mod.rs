//! Batch super-orchestration
//!
//! A super batch is one OpenAI-format JSONL upload mixing models and
//! endpoint categories. The validator partitions it by model, the
//! orchestrator drives each partition through its provider's batch
//! lifecycle, and the drain executes fall-back operations live.

pub mod drain;
pub mod orchestrator;
pub mod validate;

pub use orchestrator::Orchestrator;
pub use validate::{Partition, ValidatedBatch};
