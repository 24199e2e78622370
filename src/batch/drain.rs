//! Emulated drain
//!
//! Fall-back operations marked implicit belong to providers without native
//! batching. A background task drains them through the live chat and embed
//! calls, one super batch at a time, paced by a fixed interval so the load
//! stays inside the provider's live throughput. Transient failures are left
//! for the next pass; permanent ones cancel the op with the error recorded.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::Result;
use crate::core::registry::DriverRegistry;
use crate::core::types::{BatchOutput, BatchPayload, RequestScope};
use crate::storage::{OpRow, Store};

const DRAIN_INTERVAL: Duration = Duration::from_secs(30);
/// Ops taken per super batch per pass.
const DRAIN_PAGE: i64 = 256;

/// Spawn the drain loop.
pub fn spawn(store: Store, registry: Arc<DriverRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(DRAIN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(e) = pass(&store, &registry).await {
                warn!(error = %e, "drain pass failed");
            }
        }
    })
}

/// One pass over every in-progress super batch.
pub async fn pass(store: &Store, registry: &DriverRegistry) -> Result<()> {
    for super_row in store.list_open_supers().await? {
        drain_super(store, registry, &super_row.id).await?;
    }
    Ok(())
}

/// Drain pending implicit ops of one super batch.
pub async fn drain_super(store: &Store, registry: &DriverRegistry, super_id: &str) -> Result<()> {
    let ops = store.list_pending_implicit_ops(super_id, DRAIN_PAGE).await?;
    if ops.is_empty() {
        return Ok(());
    }
    debug!(batch = %super_id, ops = ops.len(), "draining");

    for op in ops {
        match execute(registry, &op).await {
            Ok(output) => store.complete_op(op.id, &output).await?,
            Err(e) if e.is_transient() => {
                debug!(batch = %super_id, op = %op.custom_id, error = %e, "deferring to next pass");
            }
            Err(e) => {
                warn!(batch = %super_id, op = %op.custom_id, error = %e, "op failed");
                store
                    .cancel_op(op.id, &BatchOutput::failure(&op.custom_id, e.api_error()))
                    .await?;
            }
        }
    }
    Ok(())
}

async fn execute(registry: &DriverRegistry, op: &OpRow) -> Result<BatchOutput> {
    let binding = registry.resolve(op.request.model()).await?;
    let scope = RequestScope::for_model(binding.model.clone());
    match &op.request.payload {
        BatchPayload::Chat(req) => {
            let mut req = req.clone();
            req.stream = false;
            binding.model.apply_defaults(&mut req);
            let completion = binding.driver.chat(&scope, req).await?;
            Ok(BatchOutput::chat(&op.custom_id, &completion.response))
        }
        BatchPayload::Embed(req) => {
            let response = binding.driver.embed(&scope, req.clone()).await?;
            Ok(BatchOutput::embedding(&op.custom_id, &response))
        }
    }
}
