//! Super-batch state machine
//!
//! Owns upload, send, refresh, receive, and cancel. The orchestrator is the
//! only writer of batch state; drivers mutate in-memory records and the
//! store persists them here. Upload and send are transactional: either the
//! whole fan-out lands or none of it does.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::validate::ValidatedBatch;
use crate::core::error::{GatewayError, Result};
use crate::core::registry::DriverRegistry;
use crate::core::types::{
    BatchMeta, BatchRecord, BatchStatus, FileRecord, RequestScope,
};
use crate::storage::{Store, SubFilter};

/// Page size for streaming completed fall-back operations.
const RECEIVE_CHUNK: i64 = 10_000;

/// Drives super batches through their lifecycle.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    registry: Arc<DriverRegistry>,
}

/// Row-level terminal stamps mirroring a record's timestamps. Failure and
/// expiry count as cancellation for bookkeeping purposes.
fn stamps(record: &BatchRecord) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let at = |ts: Option<i64>| ts.and_then(|t| Utc.timestamp_opt(t, 0).single());
    let canceled = record
        .cancelled_at
        .or(record.failed_at)
        .or(record.expired_at);
    (at(canceled), at(record.completed_at))
}

impl Orchestrator {
    pub fn new(store: Store, registry: Arc<DriverRegistry>) -> Self {
        Self { store, registry }
    }

    /// Commit a validated super batch: the super row, one sub-batch per
    /// uploaded partition chunk, and fall-back ops for everything the
    /// providers would not take. Any upload failure other than the
    /// NotImplemented/Deferred control flow aborts the whole transaction.
    pub async fn upload(&self, batch: ValidatedBatch, filename: &str, size: u64) -> Result<FileRecord> {
        let mut super_record = BatchRecord::new(Uuid::new_v4().to_string());
        super_record.completion_window = Some("24h".into());
        super_record.output_file_id = Some(super_record.id.clone());
        super_record.request_counts.total = batch.total;
        super_record.model_counts = batch.model_counts;

        debug!(batch = %super_record.id, partitions = batch.partitions.len(), "upload");

        let mut tx = self.store.begin().await?;
        tx.insert_batch(&super_record.id, None, "", &super_record)
            .await?;

        for partition in &batch.partitions {
            let model = &partition.binding.model;
            let scope = RequestScope::for_model(model.clone());
            let mut implicit = partition.binding.batch.is_none();

            if let Some(bd) = &partition.binding.batch {
                let chunk_size = bd.chunking().unwrap_or(partition.inputs.len().max(1));
                for chunk in partition.inputs.chunks(chunk_size) {
                    let mut sub = BatchRecord::new(Uuid::new_v4().to_string());
                    sub.endpoint = chunk[0].url.clone();
                    sub.request_counts.total = chunk.len() as u64;

                    match bd.batch_upload(&scope, &mut sub, chunk).await {
                        Ok(()) => {
                            tx.insert_batch(&sub.id, Some(&super_record.id), &model.name, &sub)
                                .await?;
                        }
                        // openai-compatible providers without a batch API
                        Err(GatewayError::NotImplemented) => {
                            implicit = true;
                            break;
                        }
                        // providers that want the inputs at send time
                        Err(GatewayError::Deferred) => {
                            if sub.meta.is_none() {
                                sub.meta = BatchMeta::Deferred {
                                    job_id: None,
                                    results_url: None,
                                };
                            }
                            tx.insert_batch(&sub.id, Some(&super_record.id), &model.name, &sub)
                                .await?;
                            for input in chunk {
                                tx.insert_op(&sub.id, &input.custom_id, input, false, true)
                                    .await?;
                            }
                        }
                        Err(e) => {
                            tx.rollback().await?;
                            return Err(e);
                        }
                    }
                }
            }

            if implicit {
                for input in &partition.inputs {
                    tx.insert_op(&super_record.id, &input.custom_id, input, true, false)
                        .await?;
                }
            }
        }
        tx.commit().await?;

        Ok(FileRecord {
            id: super_record.id,
            object: "file".into(),
            bytes: size,
            created_at: super_record.created_at,
            filename: filename.to_string(),
            purpose: "batch".into(),
        })
    }

    /// Submit every sub-batch to its provider. Per-sub failures are recorded
    /// on the super batch and the sub cancelled; the rest proceed. Deferred
    /// sub-batches get their stored inputs back through the request scope
    /// and lose them once the provider owns the job.
    pub async fn send(&self, id: &str) -> Result<BatchRecord> {
        let row = self.store.get_batch(id).await?;
        let mut super_record = row.body;
        if let Some(status) = super_record.status {
            return Err(GatewayError::InvalidRequest(format!(
                "batch {id:?} is already {status}"
            )));
        }

        let subs = self.store.list_sub_batches(id, SubFilter::All).await?;
        if subs.is_empty() && self.store.count_ops(id).await?.total == 0 {
            return Err(GatewayError::InvalidRequest(
                "empty batch content, will not create".into(),
            ));
        }

        // deferred inputs are read before the write transaction opens
        let mut held_inputs = std::collections::HashMap::new();
        for sub_row in &subs {
            if sub_row.body.meta.is_deferred() {
                held_inputs.insert(sub_row.id.clone(), self.store.list_ops(&sub_row.id).await?);
            }
        }

        let mut tx = self.store.begin().await?;
        let mut errored = 0usize;
        for sub_row in &subs {
            let (bd, model) = self.registry.resolve_batch(&sub_row.model).await?;
            let mut sub = sub_row.body.clone();
            let deferred = sub.meta.is_deferred();

            let mut scope = RequestScope::for_model(model);
            if let Some(inputs) = held_inputs.remove(&sub_row.id) {
                scope = scope.with_deferred(inputs);
            }

            match bd.batch_send(&scope, &mut sub).await {
                Ok(()) => {
                    sub.advance(BatchStatus::InProgress);
                    if deferred {
                        // the provider owns the inputs now
                        tx.delete_ops(&sub.id).await?;
                    }
                }
                Err(e) => {
                    warn!(batch = %id, sub = %sub.id, model = %sub_row.model, error = %e, "batch send failed");
                    super_record.push_error(e.to_string());
                    sub.advance(BatchStatus::Cancelled);
                    errored += 1;
                }
            }
            let (canceled_at, completed_at) = stamps(&sub);
            tx.update_batch(&sub.id, &sub, canceled_at, completed_at)
                .await?;
        }

        if !subs.is_empty() && errored == subs.len() {
            super_record.advance(BatchStatus::Failed);
        } else {
            super_record.advance(BatchStatus::InProgress);
        }
        let (canceled_at, completed_at) = stamps(&super_record);
        tx.update_batch(id, &super_record, canceled_at, completed_at)
            .await?;
        tx.commit().await?;
        Ok(super_record)
    }

    /// Poll pending sub-batches and complete the super batch once every
    /// child — sub-batch or fall-back op — is settled.
    pub async fn refresh(&self, id: &str) -> Result<BatchRecord> {
        let row = self.store.get_batch(id).await?;
        let mut super_record = row.body;
        if super_record.status.is_some_and(BatchStatus::is_terminal) {
            return Ok(super_record);
        }

        let subs = self.store.list_sub_batches(id, SubFilter::Pending).await?;
        let mut settled = 0usize;
        for sub_row in &subs {
            let (bd, model) = self.registry.resolve_batch(&sub_row.model).await?;
            let scope = RequestScope::for_model(model);
            let mut sub = sub_row.body.clone();
            bd.batch_refresh(&scope, &mut sub).await?;
            let (canceled_at, completed_at) = stamps(&sub);
            self.store
                .update_batch(&sub.id, &sub, canceled_at, completed_at)
                .await?;
            if sub.status.is_some_and(BatchStatus::is_terminal) {
                settled += 1;
            }
        }

        if settled == subs.len() {
            let ops = self.store.count_ops(id).await?;
            if ops.settled() {
                super_record.advance(BatchStatus::Completed);
            }
        }
        let (canceled_at, completed_at) = stamps(&super_record);
        self.store
            .update_batch(id, &super_record, canceled_at, completed_at)
            .await?;
        Ok(super_record)
    }

    /// Stream the aggregated outputs as JSONL: completed sub-batches first,
    /// then completed fall-back ops in insertion order. Super batches that
    /// produced only errors yield an empty stream.
    pub fn receive(&self, id: String) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        let store = self.store.clone();
        let registry = self.registry.clone();
        async_stream::try_stream! {
            let subs = store.list_sub_batches(&id, SubFilter::Completed).await?;
            for sub_row in subs {
                let Ok((bd, model)) = registry.resolve_batch(&sub_row.model).await else {
                    continue;
                };
                let scope = RequestScope::for_model(model);
                let mut sub = sub_row.body.clone();
                let outputs = match bd.batch_receive(&scope, &mut sub).await {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        warn!(batch = %id, sub = %sub.id, error = %e, "batch receive failed");
                        continue;
                    }
                };
                debug!(batch = %id, sub = %sub.id, outputs = outputs.len(), "received outputs");
                for output in outputs {
                    let mut line = serde_json::to_vec(&output)?;
                    line.push(b'\n');
                    yield Bytes::from(line);
                }
            }

            let mut offset = 0;
            loop {
                let outputs = store.list_completed_ops(&id, RECEIVE_CHUNK, offset).await?;
                if outputs.is_empty() {
                    break;
                }
                offset += outputs.len() as i64;
                for output in outputs {
                    let mut line = serde_json::to_vec(&output)?;
                    line.push(b'\n');
                    yield Bytes::from(line);
                }
            }
        }
    }

    /// Cancel a non-terminal super batch: provider-side cancels for pending
    /// sub-batches, then the fall-back ops, then the super itself. The first
    /// driver failure aborts.
    pub async fn cancel(&self, id: &str) -> Result<BatchRecord> {
        let row = self.store.get_batch(id).await?;
        let mut super_record = row.body;
        if row.completed_at.is_some() || row.canceled_at.is_some() {
            return Err(GatewayError::InvalidRequest(format!(
                "batch {id:?} is already {}",
                super_record
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "settled".into())
            )));
        }

        let subs = self.store.list_sub_batches(id, SubFilter::Pending).await?;
        for sub_row in &subs {
            let (bd, model) = self.registry.resolve_batch(&sub_row.model).await?;
            let scope = RequestScope::for_model(model);
            let mut sub = sub_row.body.clone();
            bd.batch_cancel(&scope, &mut sub).await?;
            sub.advance(BatchStatus::Cancelled);
            let (canceled_at, completed_at) = stamps(&sub);
            self.store
                .update_batch(&sub.id, &sub, canceled_at, completed_at)
                .await?;
        }

        self.store.cancel_ops(id).await?;
        // stamp the row tree idempotently, then persist the super body
        self.store.cancel_batch(id).await?;
        super_record.advance(BatchStatus::Cancelled);
        let (canceled_at, completed_at) = stamps(&super_record);
        self.store
            .update_batch(id, &super_record, canceled_at, completed_at)
            .await?;
        Ok(super_record)
    }
}
