//! Vertex AI driver
//!
//! Live chat and embeddings over the Vertex REST endpoints; batching is the
//! cloud-native-table variant: inputs land in a BigQuery table, a batch
//! prediction job writes a `predict-` sibling, and receive pages the output
//! table back out. Inline media is uploaded to a configured bucket under a
//! content-addressed name and the mapping memoised per process.
//!
//! Authentication is a bearer token from the provider credentials; minting
//! it from a service account is the keyring collaborator's job.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Provider;
use crate::core::drivers::google::{
    self, decode_error, Content, GenerateRequest, GenerateResponse, GenerationConfig, Part,
};
use crate::core::drivers::{sse_data, BatchDriver, Driver};
use crate::core::error::{GatewayError, Result};
use crate::core::translate;
use crate::core::types::{
    ApiError, BatchInput, BatchMeta, BatchOutput, BatchPayload, BatchRecord, BatchStatus,
    ChatDelta, ChatRequest, Completion, ContentPart, Embedding, EmbeddingRequest,
    EmbeddingResponse, MessageContent, ModelCard, RequestScope, Role, Usage,
};

/// Rows per BigQuery insertAll call, bounded by the API's payload limits.
const INSERT_CHUNK: usize = 200;
/// Rows per page when reading the output table.
const READ_PAGE: usize = 500;

/// Driver for Vertex AI.
pub struct Vertex {
    client: reqwest::Client,
    token: String,
    project: String,
    region: String,
    dataset: String,
    bucket: String,
    batch_enabled: bool,
    /// media URL → `gs://` URI, for the lifetime of the process
    uploads: DashMap<String, String>,
}

impl Vertex {
    pub fn new(p: &Provider) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: p.api_key.clone(),
            project: p.project.clone(),
            region: p.region.clone(),
            dataset: p.dataset.clone(),
            bucket: p.bucket.clone(),
            batch_enabled: p.batch,
            uploads: DashMap::new(),
        }
    }

    fn api(&self) -> String {
        format!("https://{}-aiplatform.googleapis.com/v1", self.region)
    }

    fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.region)
    }

    fn publisher_model(&self, model: &str) -> String {
        format!("publishers/google/models/{model}")
    }

    fn bigquery(&self) -> String {
        format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/datasets/{}",
            self.project, self.dataset
        )
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        self.client.post(url).bearer_auth(&self.token)
    }

    fn get(&self, url: String) -> reqwest::RequestBuilder {
        self.client.get(url).bearer_auth(&self.token)
    }

    /// Translate a canonical thread; media goes to the bucket, not inline.
    async fn encode(&self, req: &ChatRequest) -> Result<GenerateRequest> {
        translate::validate_thread(&req.messages)?;
        let (system, rest) = translate::split_system(&req.messages);

        let mut contents = Vec::with_capacity(rest.len());
        for msg in rest {
            let role = match msg.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut parts = Vec::new();
            match &msg.content {
                Some(MessageContent::Text(text)) => parts.push(Part::text(text)),
                Some(MessageContent::Parts(multi)) => {
                    for part in multi {
                        match part {
                            ContentPart::Text { text } => parts.push(Part::text(text)),
                            ContentPart::ImageUrl { image_url } => {
                                let (uri, mime) = self.file_upload(&image_url.url).await?;
                                parts.push(Part::file(mime, uri));
                            }
                        }
                    }
                }
                None => {}
            }
            contents.push(Content {
                role: Some(role.into()),
                parts,
            });
        }

        let config = GenerationConfig::from_request(req);
        Ok(GenerateRequest {
            contents,
            system_instruction: system.map(|s| Content::text(None, s)),
            generation_config: (!config.is_empty()).then_some(config),
        })
    }

    /// Upload a media URL to the bucket under its SHA-256 digest, memoising
    /// the mapping. `gs://` URIs pass straight through.
    async fn file_upload(&self, url: &str) -> Result<(String, String)> {
        let mime = translate::mime_from_extension(url).to_string();
        if url.starts_with("gs://") {
            return Ok((url.to_string(), mime));
        }
        if let Some(hit) = self.uploads.get(url) {
            return Ok((hit.value().clone(), mime));
        }

        let resp = self.client.get(url).send().await?.error_for_status()?;
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or(mime);
        let bytes = resp.bytes().await?;

        let digest = hex::encode(Sha256::digest(&bytes));
        let ext = url
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit_once('.'))
            .map(|(_, e)| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let object = format!("{digest}{ext}");

        let stat = self
            .get(format!(
                "https://storage.googleapis.com/storage/v1/b/{}/o/{object}",
                self.bucket
            ))
            .send()
            .await?;
        if stat.status() == reqwest::StatusCode::NOT_FOUND {
            let upload = self
                .post(format!(
                    "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={object}",
                    self.bucket
                ))
                .header(reqwest::header::CONTENT_TYPE, &mime)
                .body(bytes.to_vec())
                .send()
                .await?;
            if !upload.status().is_success() {
                return Err(decode_error(upload).await);
            }
        } else if !stat.status().is_success() {
            return Err(decode_error(stat).await);
        }

        let uri = format!("gs://{}/{object}", self.bucket);
        self.uploads.insert(url.to_string(), uri.clone());
        Ok((uri, mime))
    }

    /// Provider request JSON for one table row.
    async fn encode_row(&self, model: &str, req: &ChatRequest) -> Result<String> {
        let wire = self.encode(req).await?;
        let mut row = json!({
            "model": self.publisher_model(model),
            "contents": wire.contents,
        });
        let obj = row.as_object_mut().expect("object literal");
        if let Some(system) = wire.system_instruction {
            obj.insert("system_instruction".into(), serde_json::to_value(system)?);
        }
        if let Some(config) = wire.generation_config {
            obj.insert("generation_config".into(), serde_json::to_value(config)?);
        }
        Ok(row.to_string())
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/tables/{table}", self.bigquery()))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(decode_error(resp).await);
        }
        Ok(())
    }
}

fn map_state(state: &str) -> BatchStatus {
    match state {
        "JOB_STATE_SUCCEEDED" | "JOB_STATE_PARTIALLY_SUCCEEDED" => BatchStatus::Completed,
        "JOB_STATE_CANCELLED" | "JOB_STATE_CANCELLING" => BatchStatus::Cancelled,
        "JOB_STATE_EXPIRED" => BatchStatus::Expired,
        "JOB_STATE_PENDING" | "JOB_STATE_QUEUED" | "JOB_STATE_RUNNING" | "JOB_STATE_PAUSED"
        | "JOB_STATE_UPDATING" => BatchStatus::InProgress,
        _ => BatchStatus::Failed,
    }
}

#[derive(Deserialize)]
struct WireJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
}

#[async_trait]
impl Driver for Vertex {
    async fn list(&self, _scope: &RequestScope) -> Result<Vec<ModelCard>> {
        Err(GatewayError::NotImplemented)
    }

    async fn embed(&self, _scope: &RequestScope, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        #[derive(Deserialize)]
        struct Predictions {
            #[serde(default)]
            predictions: Vec<Prediction>,
        }
        #[derive(Deserialize)]
        struct Prediction {
            embeddings: PredictionEmbeddings,
        }
        #[derive(Deserialize)]
        struct PredictionEmbeddings {
            #[serde(default)]
            values: Vec<f32>,
            #[serde(default)]
            statistics: Option<Statistics>,
        }
        #[derive(Deserialize)]
        struct Statistics {
            #[serde(default)]
            token_count: u32,
        }

        let instances: Vec<_> = req
            .input
            .texts()
            .iter()
            .map(|text| {
                let mut instance = json!({ "content": text });
                if let Some(task) = &req.task_type {
                    instance["task_type"] = json!(task);
                }
                instance
            })
            .collect();
        let mut parameters = json!({});
        if let Some(d) = req.dimensions {
            parameters["outputDimensionality"] = json!(d);
        }
        let resp = self
            .post(format!(
                "{}/{}/{}:predict",
                self.api(),
                self.parent(),
                self.publisher_model(&req.model)
            ))
            .json(&json!({ "instances": instances, "parameters": parameters }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let predictions: Predictions = resp.json().await?;

        let mut spending = 0u32;
        let data = predictions
            .predictions
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                if let Some(stats) = p.embeddings.statistics {
                    spending += stats.token_count;
                }
                Embedding {
                    object: "embedding".into(),
                    index: i as u32,
                    embedding: p.embeddings.values,
                }
            })
            .collect();
        Ok(EmbeddingResponse {
            object: "list".into(),
            data,
            model: req.model,
            usage: Some(Usage {
                completion_tokens: spending,
                total_tokens: spending,
                ..Default::default()
            }),
        })
    }

    async fn chat(&self, _scope: &RequestScope, req: ChatRequest) -> Result<Completion> {
        let body = self.encode(&req).await?;
        let model = self.publisher_model(&req.model);
        if !req.stream {
            let resp = self
                .post(format!("{}/{}/{model}:generateContent", self.api(), self.parent()))
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(decode_error(resp).await);
            }
            let generated: GenerateResponse = resp.json().await?;
            return Ok(Completion::whole(google::decode(generated)?));
        }

        let request = self
            .post(format!(
                "{}/{}/{model}:streamGenerateContent?alt=sse",
                self.api(),
                self.parent()
            ))
            .json(&body);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                    return;
                }
            };
            if !resp.status().is_success() {
                let _ = tx.send(ChatDelta::failure(decode_error(resp).await.api_error())).await;
                return;
            }
            let mut total = Usage::default();
            let mut events = std::pin::pin!(sse_data(resp));
            while let Some(event) = events.next().await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(ChatDelta::failure(ApiError::provider(e.to_string()))).await;
                        return;
                    }
                };
                let Ok(chunk) = serde_json::from_str::<GenerateResponse>(&data) else {
                    continue;
                };
                if let Some(meta) = chunk.usage_metadata {
                    total = meta.canonical();
                }
                let Ok(decoded) = google::decode(chunk) else {
                    continue;
                };
                for choice in &decoded.choices {
                    let text = choice.message.plain_text();
                    if !text.is_empty() && tx.send(ChatDelta::content(text)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(ChatDelta::trailer(total)).await;
            let _ = tx.send(ChatDelta::finish("stop")).await;
        });
        Ok(Completion::streaming(rx))
    }
}

#[async_trait]
impl BatchDriver for Vertex {
    fn chunking(&self) -> Option<usize> {
        None
    }

    async fn batch_upload(
        &self,
        scope: &RequestScope,
        sub: &mut BatchRecord,
        inputs: &[BatchInput],
    ) -> Result<()> {
        if !self.batch_enabled {
            return Err(GatewayError::NotImplemented);
        }
        if !scope.model.batch {
            return Err(GatewayError::InvalidRequest(format!(
                "model {:?} does not support batching",
                scope.model.name
            )));
        }

        let mut rows = Vec::with_capacity(inputs.len());
        for input in inputs {
            let BatchPayload::Chat(req) = &input.payload else {
                return Err(GatewayError::InvalidRequest(
                    "embeddings are not supported in table batches".into(),
                ));
            };
            rows.push(json!({
                "json": {
                    "custom_id": input.custom_id,
                    "request": self.encode_row(&scope.model.name, req).await?,
                }
            }));
        }

        let table = sub.id.clone();
        let resp = self
            .post(format!("{}/tables", self.bigquery()))
            .json(&json!({
                "tableReference": {
                    "projectId": self.project,
                    "datasetId": self.dataset,
                    "tableId": table,
                },
                "schema": {
                    "fields": [
                        {"name": "custom_id", "type": "STRING"},
                        {"name": "request", "type": "STRING"},
                    ],
                },
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }

        for chunk in rows.chunks(INSERT_CHUNK) {
            debug!(table = %table, rows = chunk.len(), "inserting batch chunk");
            let resp = self
                .post(format!("{}/tables/{table}/insertAll", self.bigquery()))
                .json(&json!({ "rows": chunk }))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(decode_error(resp).await);
            }
        }

        sub.input_file_id = Some(table.clone());
        sub.meta = BatchMeta::Table {
            input_table: Some(table),
            output_table: None,
            job_name: None,
        };
        Ok(())
    }

    async fn batch_send(&self, scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Table {
            input_table: Some(input_table),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no input table".into()));
        };
        let input_table = input_table.clone();
        let output_table = format!("predict-{input_table}");
        let input_uri = format!("bq://{}.{}.{input_table}", self.project, self.dataset);
        let output_uri = format!("bq://{}.{}.{output_table}", self.project, self.dataset);

        let resp = self
            .post(format!("{}/{}/batchPredictionJobs", self.api(), self.parent()))
            .json(&json!({
                "displayName": input_table,
                "model": self.publisher_model(&scope.model.name),
                "inputConfig": {
                    "instancesFormat": "bigquery",
                    "bigquerySource": {"inputUri": input_uri},
                },
                "outputConfig": {
                    "predictionsFormat": "bigquery",
                    "bigqueryDestination": {"outputUri": output_uri},
                },
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let job: WireJob = resp.json().await?;
        debug!(job = %job.name, "created batch prediction job");
        sub.meta = BatchMeta::Table {
            input_table: Some(input_table),
            output_table: Some(output_table),
            job_name: Some(job.name),
        };
        sub.advance(BatchStatus::InProgress);
        Ok(())
    }

    async fn batch_refresh(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Table {
            job_name: Some(job_name),
            output_table,
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job name".into()));
        };
        let resp = self.get(format!("{}/{job_name}", self.api())).send().await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let job: WireJob = resp.json().await?;
        if sub.output_file_id.is_none() {
            sub.output_file_id = output_table.clone();
        }
        sub.advance(map_state(&job.state));
        Ok(())
    }

    async fn batch_receive(
        &self,
        _scope: &RequestScope,
        sub: &mut BatchRecord,
    ) -> Result<Vec<BatchOutput>> {
        let BatchMeta::Table {
            input_table,
            output_table: Some(output_table),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::BatchIncomplete);
        };

        // column order comes from the table schema
        #[derive(Deserialize)]
        struct Table {
            schema: Schema,
        }
        #[derive(Deserialize)]
        struct Schema {
            #[serde(default)]
            fields: Vec<Field>,
        }
        #[derive(Deserialize)]
        struct Field {
            name: String,
        }
        let resp = self
            .get(format!("{}/tables/{output_table}", self.bigquery()))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        let table: Table = resp.json().await?;
        let column = |name: &str| table.schema.fields.iter().position(|f| f.name == name);
        let (Some(id_col), Some(resp_col)) = (column("custom_id"), column("response")) else {
            return Err(GatewayError::provider(
                "provider_error",
                format!("output table {output_table} is missing expected columns"),
            ));
        };

        #[derive(Deserialize)]
        struct Page {
            #[serde(default, rename = "totalRows")]
            total_rows: String,
            #[serde(default)]
            rows: Vec<RowF>,
        }
        #[derive(Deserialize)]
        struct RowF {
            #[serde(default)]
            f: Vec<Cell>,
        }
        #[derive(Deserialize)]
        struct Cell {
            #[serde(default)]
            v: Value,
        }

        let mut outputs = Vec::new();
        let mut index = 0usize;
        loop {
            let resp = self
                .get(format!(
                    "{}/tables/{output_table}/data?startIndex={index}&maxResults={READ_PAGE}",
                    self.bigquery()
                ))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(decode_error(resp).await);
            }
            let page: Page = resp.json().await?;
            let total: usize = page.total_rows.parse().unwrap_or(0);
            for row in &page.rows {
                let cell = |i: usize| row.f.get(i).and_then(|c| c.v.as_str()).unwrap_or_default();
                let custom_id = cell(id_col).to_string();
                let response = cell(resp_col);
                if response.is_empty() {
                    continue;
                }
                let generated: GenerateResponse =
                    serde_json::from_str(response).map_err(|e| {
                        GatewayError::provider(
                            "provider_error",
                            format!("response/{custom_id}: {e}"),
                        )
                    })?;
                let mut decoded = google::decode(generated)?;
                decoded.id = custom_id.clone();
                outputs.push(BatchOutput::chat(custom_id, &decoded));
            }
            index += page.rows.len();
            if index >= total || page.rows.is_empty() {
                break;
            }
        }

        // the predict- table keeps the requests for posterity; the input
        // table is no longer needed once the batch is terminal
        if sub.status == Some(BatchStatus::Completed) {
            if let Some(input_table) = input_table {
                self.delete_table(input_table).await?;
            }
        }
        Ok(outputs)
    }

    async fn batch_cancel(&self, _scope: &RequestScope, sub: &mut BatchRecord) -> Result<()> {
        let BatchMeta::Table {
            job_name: Some(job_name),
            ..
        } = &sub.meta
        else {
            return Err(GatewayError::InvalidRequest("batch has no job name".into()));
        };
        let resp = self
            .post(format!("{}/{job_name}:cancel", self.api()))
            .json(&json!({}))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(decode_error(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_mapping() {
        assert_eq!(map_state("JOB_STATE_SUCCEEDED"), BatchStatus::Completed);
        assert_eq!(map_state("JOB_STATE_PARTIALLY_SUCCEEDED"), BatchStatus::Completed);
        assert_eq!(map_state("JOB_STATE_RUNNING"), BatchStatus::InProgress);
        assert_eq!(map_state("JOB_STATE_CANCELLING"), BatchStatus::Cancelled);
        assert_eq!(map_state("JOB_STATE_EXPIRED"), BatchStatus::Expired);
        assert_eq!(map_state("JOB_STATE_FAILED"), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn upload_without_provider_flag_is_emulated() {
        let v = Vertex::new(&Provider::default());
        let mut sub = BatchRecord::new("sub");
        let err = v
            .batch_upload(&RequestScope::default(), &mut sub, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotImplemented));
    }

    #[tokio::test]
    async fn encode_row_carries_generation_config() {
        let v = Vertex::new(&Provider::default());
        let req = ChatRequest {
            model: "gemini-1.5-flash-002".into(),
            messages: vec![crate::core::types::ChatMessage::text(Role::User, "hi")],
            temperature: Some(0.1),
            ..Default::default()
        };
        let row = v.encode_row("gemini-1.5-flash-002", &req).await.unwrap();
        let parsed: Value = serde_json::from_str(&row).unwrap();
        assert_eq!(
            parsed["model"],
            "publishers/google/models/gemini-1.5-flash-002"
        );
        assert!(parsed["generation_config"]["temperature"].as_f64().is_some());
    }
}
