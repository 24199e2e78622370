//! Store queries
//!
//! Single-writer transactional bookkeeping over the `batch`, `batch_op`, and
//! `migration` tables. A super batch is a `batch` row with no parent; a
//! sub-batch points at its super. Reads may run concurrently; writers
//! serialize at the transaction boundary.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::core::error::{GatewayError, Result};
use crate::core::types::{BatchInput, BatchOutput, BatchRecord};

/// Handle to the opened store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// A `batch` table row.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub super_id: Option<String>,
    pub model: String,
    pub body: BatchRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// A `batch_op` row, as seen by the emulated drain.
#[derive(Debug, Clone)]
pub struct OpRow {
    pub id: i64,
    pub batch: String,
    pub custom_id: String,
    pub request: BatchInput,
    pub implicit: bool,
    pub deferred: bool,
}

/// Tallies over the fall-back operations of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub total: i64,
    pub completed: i64,
    pub canceled: i64,
}

impl OpCounts {
    /// All ops reached a terminal state.
    pub fn settled(&self) -> bool {
        self.total == self.completed + self.canceled
    }
}

/// Sub-batch listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFilter {
    All,
    /// Neither completed nor canceled.
    Pending,
    Completed,
}

fn decode_row(row: SqliteRow) -> Result<BatchRow> {
    let body: String = row.try_get("body")?;
    Ok(BatchRow {
        id: row.try_get("id")?,
        super_id: row.try_get("super")?,
        model: row.try_get("model")?,
        body: serde_json::from_str(&body)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        canceled_at: row.try_get("canceled_at")?,
    })
}

const BATCH_COLUMNS: &str =
    "id, super, model, body, created_at, updated_at, completed_at, canceled_at";

impl Store {
    pub(crate) fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction whose handle mirrors the write operations.
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Current schema epoch.
    pub async fn epoch(&self) -> Result<i64> {
        let row = sqlx::query("select epoch from migration")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("epoch")?)
    }

    /// Fetch a batch by primary key.
    pub async fn get_batch(&self, id: &str) -> Result<BatchRow> {
        let row = sqlx::query(&format!("select {BATCH_COLUMNS} from batch where id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decode_row(row),
            None => Err(GatewayError::NotFound),
        }
    }

    pub async fn insert_batch(
        &self,
        id: &str,
        super_id: Option<&str>,
        model: &str,
        body: &BatchRecord,
    ) -> Result<()> {
        sqlx::query("insert into batch (id, super, model, body) values (?1, ?2, ?3, ?4)")
            .bind(id)
            .bind(super_id)
            .bind(model)
            .bind(serde_json::to_string(body)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sub-batches of a super batch, ordered by updated-at with nulls first,
    /// then id, so repeated listings are deterministic.
    pub async fn list_sub_batches(&self, super_id: &str, filter: SubFilter) -> Result<Vec<BatchRow>> {
        let predicate = match filter {
            SubFilter::All => "",
            SubFilter::Pending => "and completed_at is null and canceled_at is null",
            SubFilter::Completed => "and completed_at is not null",
        };
        let sql = format!(
            "select {BATCH_COLUMNS} from batch where super = ?1 {predicate} \
             order by updated_at asc nulls first, id asc"
        );
        let rows = sqlx::query(&sql).bind(super_id).fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Persist a batch body and terminal timestamps, bumping updated-at.
    pub async fn update_batch(
        &self,
        id: &str,
        body: &BatchRecord,
        canceled_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "update batch set body = ?1, updated_at = current_timestamp, \
             canceled_at = ?2, completed_at = ?3 where id = ?4",
        )
        .bind(serde_json::to_string(body)?)
        .bind(canceled_at)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp canceled-at on a batch and all of its children, unless already
    /// completed. Idempotent.
    pub async fn cancel_batch(&self, id: &str) -> Result<()> {
        sqlx::query(
            "update batch set canceled_at = current_timestamp \
             where (id = ?1 or super = ?1) and completed_at is null and canceled_at is null",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_op(
        &self,
        batch: &str,
        custom_id: &str,
        request: &BatchInput,
        implicit: bool,
        deferred: bool,
    ) -> Result<()> {
        insert_op(&self.pool, batch, custom_id, request, implicit, deferred).await
    }

    /// All enqueued inputs of a batch, in insertion order.
    pub async fn list_ops(&self, batch: &str) -> Result<Vec<BatchInput>> {
        let rows = sqlx::query("select request from batch_op where batch = ?1 order by id asc")
            .bind(batch)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let request: String = row.try_get("request")?;
                Ok(serde_json::from_str(&request)?)
            })
            .collect()
    }

    pub async fn count_ops(&self, batch: &str) -> Result<OpCounts> {
        let row = sqlx::query(
            "select count(*) as total, count(completed_at) as completed, \
             count(canceled_at) as canceled from batch_op where batch = ?1",
        )
        .bind(batch)
        .fetch_one(&self.pool)
        .await?;
        Ok(OpCounts {
            total: row.try_get("total")?,
            completed: row.try_get("completed")?,
            canceled: row.try_get("canceled")?,
        })
    }

    /// Responses of completed ops, in insertion order, paged.
    pub async fn list_completed_ops(
        &self,
        batch: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BatchOutput>> {
        let rows = sqlx::query(
            "select response from batch_op where batch = ?1 and completed_at is not null \
             order by id asc limit ?2 offset ?3",
        )
        .bind(batch)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let response: Option<String> = row.try_get("response")?;
                Ok(match response {
                    Some(r) => serde_json::from_str(&r)?,
                    None => BatchOutput::default(),
                })
            })
            .collect()
    }

    /// Implicit ops of a super batch still awaiting the drain.
    pub async fn list_pending_implicit_ops(&self, batch: &str, limit: i64) -> Result<Vec<OpRow>> {
        let rows = sqlx::query(
            "select id, batch, custom_id, request, implicit, deferred from batch_op \
             where batch = ?1 and implicit = 1 and completed_at is null and canceled_at is null \
             order by id asc limit ?2",
        )
        .bind(batch)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let request: String = row.try_get("request")?;
                Ok(OpRow {
                    id: row.try_get("id")?,
                    batch: row.try_get("batch")?,
                    custom_id: row.try_get("custom_id")?,
                    request: serde_json::from_str(&request)?,
                    implicit: row.try_get("implicit")?,
                    deferred: row.try_get("deferred")?,
                })
            })
            .collect()
    }

    /// Stamp an op completed and store its response.
    pub async fn complete_op(&self, id: i64, response: &BatchOutput) -> Result<()> {
        sqlx::query(
            "update batch_op set completed_at = current_timestamp, response = ?1 where id = ?2",
        )
        .bind(serde_json::to_string(response)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp an op canceled, recording the failure as its response.
    pub async fn cancel_op(&self, id: i64, response: &BatchOutput) -> Result<()> {
        sqlx::query(
            "update batch_op set canceled_at = current_timestamp, response = ?1 where id = ?2",
        )
        .bind(serde_json::to_string(response)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp every unfinished op of a batch canceled.
    pub async fn cancel_ops(&self, batch: &str) -> Result<()> {
        sqlx::query(
            "update batch_op set canceled_at = current_timestamp \
             where batch = ?1 and completed_at is null and canceled_at is null",
        )
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_ops(&self, batch: &str) -> Result<()> {
        sqlx::query("delete from batch_op where batch = ?1")
            .bind(batch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Super batches still in progress, for the emulated drain.
    pub async fn list_open_supers(&self) -> Result<Vec<BatchRow>> {
        let sql = format!(
            "select {BATCH_COLUMNS} from batch where super is null \
             and json_extract(body, '$.status') = 'in_progress' \
             and completed_at is null and canceled_at is null \
             order by created_at asc, id asc"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }
}

async fn insert_op<'e, E>(
    ex: E,
    batch: &str,
    custom_id: &str,
    request: &BatchInput,
    implicit: bool,
    deferred: bool,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "insert into batch_op (batch, custom_id, request, implicit, deferred) \
         values (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(batch)
    .bind(custom_id)
    .bind(serde_json::to_string(request)?)
    .bind(implicit)
    .bind(deferred)
    .execute(ex)
    .await?;
    Ok(())
}

/// Transaction handle mirroring the store's write operations; commits or
/// rolls back atomically, rolling back on drop.
pub struct StoreTx {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> Result<()> {
        Ok(self.tx.commit().await?)
    }

    pub async fn rollback(self) -> Result<()> {
        Ok(self.tx.rollback().await?)
    }

    pub async fn insert_batch(
        &mut self,
        id: &str,
        super_id: Option<&str>,
        model: &str,
        body: &BatchRecord,
    ) -> Result<()> {
        sqlx::query("insert into batch (id, super, model, body) values (?1, ?2, ?3, ?4)")
            .bind(id)
            .bind(super_id)
            .bind(model)
            .bind(serde_json::to_string(body)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn insert_op(
        &mut self,
        batch: &str,
        custom_id: &str,
        request: &BatchInput,
        implicit: bool,
        deferred: bool,
    ) -> Result<()> {
        insert_op(&mut *self.tx, batch, custom_id, request, implicit, deferred).await
    }

    pub async fn update_batch(
        &mut self,
        id: &str,
        body: &BatchRecord,
        canceled_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "update batch set body = ?1, updated_at = current_timestamp, \
             canceled_at = ?2, completed_at = ?3 where id = ?4",
        )
        .bind(serde_json::to_string(body)?)
        .bind(canceled_at)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn delete_ops(&mut self, batch: &str) -> Result<()> {
        sqlx::query("delete from batch_op where batch = ?1")
            .bind(batch)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BatchStatus, ChatRequest};

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn record(id: &str) -> BatchRecord {
        BatchRecord::new(id)
    }

    fn input(custom_id: &str) -> BatchInput {
        BatchInput::chat(
            custom_id,
            ChatRequest {
                model: "gpt-4o-mini".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn migration_sets_epoch() {
        let s = store().await;
        assert_eq!(s.epoch().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_batch_round_trip() {
        let s = store().await;
        let mut body = record("b1");
        body.advance(BatchStatus::InProgress);
        s.insert_batch("b1", None, "", &body).await.unwrap();
        let row = s.get_batch("b1").await.unwrap();
        assert_eq!(row.body.status, Some(BatchStatus::InProgress));
        assert!(row.super_id.is_none());
        assert!(matches!(
            s.get_batch("nope").await,
            Err(GatewayError::NotFound)
        ));
    }

    #[tokio::test]
    async fn sub_batch_listing_is_deterministic() {
        let s = store().await;
        s.insert_batch("sup", None, "", &record("sup")).await.unwrap();
        s.insert_batch("a", Some("sup"), "m1", &record("a")).await.unwrap();
        s.insert_batch("b", Some("sup"), "m2", &record("b")).await.unwrap();

        // no updates yet: ordered by id
        let subs = s.list_sub_batches("sup", SubFilter::All).await.unwrap();
        assert_eq!(
            subs.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            ["a", "b"]
        );

        // updating "a" moves it after the never-updated "b" (nulls first)
        s.update_batch("a", &record("a"), None, None).await.unwrap();
        let subs = s.list_sub_batches("sup", SubFilter::All).await.unwrap();
        assert_eq!(
            subs.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            ["b", "a"]
        );
    }

    #[tokio::test]
    async fn pending_and_completed_filters() {
        let s = store().await;
        s.insert_batch("sup", None, "", &record("sup")).await.unwrap();
        s.insert_batch("a", Some("sup"), "m", &record("a")).await.unwrap();
        s.insert_batch("b", Some("sup"), "m", &record("b")).await.unwrap();
        s.update_batch("a", &record("a"), None, Some(Utc::now())).await.unwrap();

        let pending = s.list_sub_batches("sup", SubFilter::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        let done = s.list_sub_batches("sup", SubFilter::Completed).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "a");
    }

    #[tokio::test]
    async fn cancel_cascades_but_spares_completed() {
        let s = store().await;
        s.insert_batch("sup", None, "", &record("sup")).await.unwrap();
        s.insert_batch("a", Some("sup"), "m", &record("a")).await.unwrap();
        s.insert_batch("b", Some("sup"), "m", &record("b")).await.unwrap();
        s.update_batch("a", &record("a"), None, Some(Utc::now())).await.unwrap();

        s.cancel_batch("sup").await.unwrap();
        // idempotent
        s.cancel_batch("sup").await.unwrap();

        let row = s.get_batch("a").await.unwrap();
        assert!(row.canceled_at.is_none(), "completed sub must not be touched");
        let row = s.get_batch("b").await.unwrap();
        assert!(row.canceled_at.is_some());
        let row = s.get_batch("sup").await.unwrap();
        assert!(row.canceled_at.is_some());
    }

    #[tokio::test]
    async fn ops_counts_and_paging() {
        let s = store().await;
        s.insert_batch("sup", None, "", &record("sup")).await.unwrap();
        for i in 0..5 {
            s.insert_op("sup", &format!("op-{i}"), &input(&format!("op-{i}")), true, false)
                .await
                .unwrap();
        }
        let pending = s.list_pending_implicit_ops("sup", 100).await.unwrap();
        assert_eq!(pending.len(), 5);

        let out = BatchOutput::failure("op-0", crate::core::types::ApiError::provider("x"));
        s.cancel_op(pending[0].id, &out).await.unwrap();
        for op in &pending[1..] {
            s.complete_op(op.id, &BatchOutput { custom_id: op.custom_id.clone(), ..Default::default() })
                .await
                .unwrap();
        }
        let counts = s.count_ops("sup").await.unwrap();
        assert_eq!(counts, OpCounts { total: 5, completed: 4, canceled: 1 });
        assert!(counts.settled());

        let page = s.list_completed_ops("sup", 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].custom_id, "op-1");
        let page = s.list_completed_ops("sup", 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        let page = s.list_completed_ops("sup", 2, 4).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn deferred_inputs_survive_round_trip() {
        let s = store().await;
        s.insert_batch("sub", None, "m", &record("sub")).await.unwrap();
        let first = input("a");
        s.insert_op("sub", "a", &first, false, true).await.unwrap();
        let back = s.list_ops("sub").await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(
            serde_json::to_value(&back[0]).unwrap(),
            serde_json::to_value(&first).unwrap()
        );
        s.delete_ops("sub").await.unwrap();
        assert!(s.list_ops("sub").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_drop() {
        let s = store().await;
        {
            let mut tx = s.begin().await.unwrap();
            tx.insert_batch("gone", None, "", &record("gone")).await.unwrap();
            tx.rollback().await.unwrap();
        }
        assert!(matches!(
            s.get_batch("gone").await,
            Err(GatewayError::NotFound)
        ));

        let mut tx = s.begin().await.unwrap();
        tx.insert_batch("kept", None, "", &record("kept")).await.unwrap();
        tx.commit().await.unwrap();
        assert!(s.get_batch("kept").await.is_ok());
    }

    #[tokio::test]
    async fn open_supers_by_status() {
        let s = store().await;
        let mut body = record("sup");
        body.advance(BatchStatus::InProgress);
        s.insert_batch("sup", None, "", &body).await.unwrap();
        s.insert_batch("idle", None, "", &record("idle")).await.unwrap();
        let open = s.list_open_supers().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "sup");
    }
}
