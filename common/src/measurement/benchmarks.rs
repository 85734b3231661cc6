// Benchmark payloads: one single-shot measurement per benchmark kind

use crate::config::ProbeConfig;
use crate::errors::MeasurementError;
use crate::models::{BenchmarkKind, ServiceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Upper bound for a single benchmark HTTP request (generation can be slow)
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a payload needs to run one benchmark
#[derive(Debug, Clone)]
pub struct BenchmarkContext {
    pub target: String,
    pub task_name: String,
    pub output_path: PathBuf,
    pub parameters: BTreeMap<String, String>,
}

impl BenchmarkContext {
    pub fn param(&self, key: &str) -> Result<&str, MeasurementError> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| MeasurementError::InvalidParameter {
                key: key.to_string(),
                reason: "missing".to_string(),
            })
    }

    pub fn count(&self, key: &str) -> Result<usize, MeasurementError> {
        let raw = self.param(key)?;
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(MeasurementError::InvalidParameter {
                key: key.to_string(),
                reason: format!("expected a positive integer, got '{}'", raw),
            }),
        }
    }

    /// A SQL identifier parameter; only ASCII letters, digits and underscores
    pub fn identifier(&self, key: &str) -> Result<&str, MeasurementError> {
        let raw = self.param(key)?;
        let valid = !raw.is_empty()
            && !raw.starts_with(|c: char| c.is_ascii_digit())
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(raw)
        } else {
            Err(MeasurementError::InvalidParameter {
                key: key.to_string(),
                reason: format!("'{}' is not a valid identifier", raw),
            })
        }
    }
}

/// A benchmark implementation for one service kind
#[async_trait]
pub trait BenchmarkPayload: Send + Sync {
    fn kind(&self) -> BenchmarkKind;

    /// Run against `ctx.target` and return the structured result
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError>;
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Assemble the `metadata` / `configuration` / sections / `summary` document
pub fn benchmark_report(
    kind: BenchmarkKind,
    ctx: &BenchmarkContext,
    started_at: DateTime<Utc>,
    sections: Vec<(&str, Value)>,
    summary: Value,
) -> Value {
    let finished_at = Utc::now();
    let mut report = serde_json::Map::new();
    report.insert(
        "metadata".to_string(),
        json!({
            "benchmark": kind.to_string(),
            "service_kind": kind.service_kind().to_string(),
            "task_name": ctx.task_name,
            "target": ctx.target,
            "result_file": ctx.output_path.display().to_string(),
            "started_at": started_at.to_rfc3339(),
            "finished_at": finished_at.to_rfc3339(),
            "duration_seconds": (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        }),
    );
    report.insert("configuration".to_string(), json!(ctx.parameters));
    for (name, section) in sections {
        report.insert(name.to_string(), section);
    }
    report.insert("summary".to_string(), summary);
    Value::Object(report)
}

fn http_failure(e: reqwest::Error) -> MeasurementError {
    MeasurementError::PayloadFailed(format!("HTTP request failed: {}", e))
}

async fn json_response(response: Result<Response, reqwest::Error>) -> Result<Value, MeasurementError> {
    let response = response
        .and_then(|r| r.error_for_status())
        .map_err(http_failure)?;
    response.json::<Value>().await.map_err(http_failure)
}

// ============================================================================
// Ollama
// ============================================================================

/// Sequential non-streaming generate requests; latency statistics
pub struct OllamaLatencyBenchmark {
    client: Client,
}

impl OllamaLatencyBenchmark {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BenchmarkPayload for OllamaLatencyBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::OllamaLatency
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let model = ctx.param("model")?;
        let prompt = ctx.param("prompt")?;
        let num_requests = ctx.count("num_requests")?;
        let url = format!("{}/api/generate", ServiceKind::Ollama.base_url(&ctx.target));
        let started_at = Utc::now();
        let wall = Instant::now();

        let mut requests = Vec::with_capacity(num_requests);
        let mut latencies = Vec::new();
        let mut last_error = None;
        for index in 0..num_requests {
            let sent = Instant::now();
            let outcome = json_response(
                self.client
                    .post(&url)
                    .json(&json!({ "model": model, "prompt": prompt, "stream": false }))
                    .send()
                    .await,
            )
            .await;
            let latency = sent.elapsed().as_secs_f64();

            match outcome {
                Ok(body) if body.get("response").is_some() => {
                    debug!(request = index + 1, latency, "Request succeeded");
                    latencies.push(latency);
                    requests.push(json!({ "index": index, "latency": latency, "success": true }));
                }
                Ok(_) => {
                    let reason = "response has no 'response' field".to_string();
                    requests.push(json!({ "index": index, "latency": latency, "success": false, "error": reason }));
                    last_error = Some(reason);
                }
                Err(e) => {
                    warn!(request = index + 1, error = %e, "Request failed");
                    requests.push(json!({ "index": index, "latency": latency, "success": false, "error": e.to_string() }));
                    last_error = Some(e.to_string());
                }
            }
        }

        if latencies.is_empty() {
            return Err(MeasurementError::PayloadFailed(format!(
                "No requests were successful (last error: {})",
                last_error.unwrap_or_default()
            )));
        }

        let min = latencies.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;

        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![("requests", Value::Array(requests))],
            json!({
                "total_requests": num_requests,
                "successful_requests": latencies.len(),
                "failed_requests": num_requests - latencies.len(),
                "min_latency": min,
                "max_latency": max,
                "avg_latency": avg,
                "throughput": rate(latencies.len(), wall.elapsed()),
            }),
        ))
    }
}

/// One streaming generate request; time to first token and tokens per second
pub struct OllamaStreamingBenchmark {
    client: Client,
}

impl OllamaStreamingBenchmark {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Incremental newline-delimited JSON decoder for ollama's streaming responses
#[derive(Debug, Default)]
pub struct NdjsonLines {
    pending: Vec<u8>,
}

impl NdjsonLines {
    /// Feed a chunk and return every complete JSON line it finished
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);
        let mut values = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Ok(value) = serde_json::from_slice::<Value>(&line) {
                values.push(value);
            }
        }
        values
    }

    /// Whatever is left once the stream ended without a trailing newline
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.pending);
        serde_json::from_slice(&rest).ok()
    }
}

#[async_trait]
impl BenchmarkPayload for OllamaStreamingBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::OllamaStreaming
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let model = ctx.param("model")?;
        let prompt = ctx.param("prompt")?;
        let url = format!("{}/api/generate", ServiceKind::Ollama.base_url(&ctx.target));
        let started_at = Utc::now();
        let sent = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": model, "prompt": prompt, "stream": true }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_failure)?;

        let mut decoder = NdjsonLines::default();
        let mut first_token: Option<Duration> = None;
        let mut total_tokens = 0usize;
        let mut response_chars = 0usize;
        let mut stream = response.bytes_stream();

        let mut account = |value: &Value| {
            if let Some(text) = value.get("response").and_then(Value::as_str) {
                first_token.get_or_insert_with(|| sent.elapsed());
                total_tokens += 1;
                response_chars += text.len();
            }
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http_failure)?;
            for value in decoder.push(&chunk) {
                account(&value);
            }
        }
        if let Some(value) = decoder.finish() {
            account(&value);
        }

        let total = sent.elapsed();
        let ttft = first_token
            .ok_or_else(|| MeasurementError::PayloadFailed("Did not receive any tokens".to_string()))?;

        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![(
                "stream",
                json!({ "chunks": total_tokens, "response_chars": response_chars }),
            )],
            json!({
                "time_to_first_token": ttft.as_secs_f64(),
                "total_tokens": total_tokens,
                "total_duration": total.as_secs_f64(),
                "tokens_per_second": rate(total_tokens, total),
            }),
        ))
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

async fn connect(probes: &ProbeConfig, target: &str) -> Result<PgPool, MeasurementError> {
    let (host, port) = ServiceKind::Postgres.address(target);
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(probes.request_timeout_seconds))
        .connect(&probes.postgres_url(&host, port))
        .await
        .map_err(|e| MeasurementError::PayloadFailed(format!("Failed to connect to PostgreSQL: {}", e)))
}

fn sql_failure(e: sqlx::Error) -> MeasurementError {
    MeasurementError::PayloadFailed(format!("Query failed: {}", e))
}

/// Bulk insert then full read of a scratch table; rows per second for each
pub struct PostgresThroughputBenchmark {
    probes: ProbeConfig,
}

impl PostgresThroughputBenchmark {
    pub fn new(probes: &ProbeConfig) -> Self {
        Self {
            probes: probes.clone(),
        }
    }

    async fn measure(&self, pool: &PgPool, table: &str, rows: usize) -> Result<(Value, Value), MeasurementError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, data TEXT)",
            table
        ))
        .execute(pool)
        .await
        .map_err(sql_failure)?;

        let insert = format!("INSERT INTO {} (data) VALUES ($1)", table);
        let started = Instant::now();
        let mut tx = pool.begin().await.map_err(sql_failure)?;
        for i in 0..rows {
            sqlx::query(&insert)
                .bind(format!("This is row {}", i))
                .execute(&mut *tx)
                .await
                .map_err(sql_failure)?;
        }
        tx.commit().await.map_err(sql_failure)?;
        let write_duration = started.elapsed();

        let started = Instant::now();
        let read = sqlx::query(&format!("SELECT * FROM {}", table))
            .fetch_all(pool)
            .await
            .map_err(sql_failure)?;
        let read_duration = started.elapsed();

        Ok((
            json!({
                "operation": "write",
                "rows": rows,
                "duration": write_duration.as_secs_f64(),
                "throughput": rate(rows, write_duration),
            }),
            json!({
                "operation": "read",
                "rows": read.len(),
                "duration": read_duration.as_secs_f64(),
                "throughput": rate(read.len(), read_duration),
            }),
        ))
    }
}

#[async_trait]
impl BenchmarkPayload for PostgresThroughputBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::PostgresThroughput
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let table = ctx.identifier("table_name")?;
        let rows = ctx.count("rows")?;
        let started_at = Utc::now();
        let pool = connect(&self.probes, &ctx.target).await?;

        let measured = self.measure(&pool, table, rows).await;
        if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&pool)
            .await
        {
            warn!(table = %table, error = %e, "Failed to drop benchmark table");
        }
        pool.close().await;
        let (write, read) = measured?;

        let summary = json!({
            "rows": rows,
            "write_throughput": write["throughput"],
            "read_throughput": read["throughput"],
            "throughput": write["throughput"],
        });
        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![("write", write), ("read", read)],
            summary,
        ))
    }
}

/// Many small explicit transactions; transactions per second
pub struct PostgresTransactionBenchmark {
    probes: ProbeConfig,
}

const TRANSACTION_TABLE: &str = "aif_transaction_test";

impl PostgresTransactionBenchmark {
    pub fn new(probes: &ProbeConfig) -> Self {
        Self {
            probes: probes.clone(),
        }
    }

    async fn measure(&self, pool: &PgPool, transactions: usize) -> Result<Duration, MeasurementError> {
        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {} (id INT)", TRANSACTION_TABLE))
            .execute(pool)
            .await
            .map_err(sql_failure)?;

        let insert = format!("INSERT INTO {} (id) VALUES ($1)", TRANSACTION_TABLE);
        let started = Instant::now();
        for i in 0..transactions {
            let mut tx = pool.begin().await.map_err(sql_failure)?;
            sqlx::query(&insert)
                .bind(i as i32)
                .execute(&mut *tx)
                .await
                .map_err(sql_failure)?;
            tx.commit().await.map_err(sql_failure)?;
        }
        Ok(started.elapsed())
    }
}

#[async_trait]
impl BenchmarkPayload for PostgresTransactionBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::PostgresTransaction
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let transactions = ctx.count("transactions")?;
        let started_at = Utc::now();
        let pool = connect(&self.probes, &ctx.target).await?;

        let measured = self.measure(&pool, transactions).await;
        if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS {}", TRANSACTION_TABLE))
            .execute(&pool)
            .await
        {
            warn!(error = %e, "Failed to drop transaction table");
        }
        pool.close().await;
        let duration = measured?;
        let tps = rate(transactions, duration);

        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![(
                "transactions",
                json!({
                    "operation": "transaction",
                    "transactions": transactions,
                    "duration": duration.as_secs_f64(),
                }),
            )],
            json!({
                "transactions": transactions,
                "duration": duration.as_secs_f64(),
                "transactions_per_second": tps,
                "throughput": tps,
            }),
        ))
    }
}

// ============================================================================
// Chroma
// ============================================================================

/// Thin client for the chroma v1 collection API
struct ChromaCollections {
    client: Client,
    base_url: String,
}

impl ChromaCollections {
    fn new(client: &Client, target: &str) -> Self {
        Self {
            client: client.clone(),
            base_url: ServiceKind::Chroma.base_url(target),
        }
    }

    async fn get_or_create(&self, name: &str) -> Result<String, MeasurementError> {
        let body = json_response(
            self.client
                .post(format!("{}/api/v1/collections", self.base_url))
                .json(&json!({ "name": name, "get_or_create": true }))
                .send()
                .await,
        )
        .await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MeasurementError::PayloadFailed("Collection response has no id".to_string()))
    }

    async fn call(&self, collection_id: &str, op: &str, body: Value) -> Result<Value, MeasurementError> {
        json_response(
            self.client
                .post(format!("{}/api/v1/collections/{}/{}", self.base_url, collection_id, op))
                .json(&body)
                .send()
                .await,
        )
        .await
    }

    async fn delete(&self, name: &str) {
        let result = self
            .client
            .delete(format!("{}/api/v1/collections/{}", self.base_url, name))
            .send()
            .await;
        if let Err(e) = result {
            warn!(collection = %name, error = %e, "Failed to delete benchmark collection");
        }
    }
}

fn document_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("id_{}", i)).collect()
}

fn embeddings(n: usize) -> Vec<[f64; 3]> {
    (0..n)
        .map(|i| {
            let v = i as f64 / 10.0;
            [v, v, v]
        })
        .collect()
}

/// Add then fetch N documents; documents per second for each
pub struct ChromaThroughputBenchmark {
    client: Client,
}

impl ChromaThroughputBenchmark {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn measure(
        &self,
        chroma: &ChromaCollections,
        name: &str,
        documents: usize,
    ) -> Result<(Value, Value), MeasurementError> {
        let id = chroma.get_or_create(name).await?;
        let ids = document_ids(documents);
        let texts: Vec<String> = (0..documents).map(|i| format!("This is document {}", i)).collect();

        let started = Instant::now();
        chroma
            .call(
                &id,
                "add",
                json!({ "ids": ids, "documents": texts, "embeddings": embeddings(documents) }),
            )
            .await?;
        let write_duration = started.elapsed();

        let started = Instant::now();
        let fetched = chroma.call(&id, "get", json!({ "ids": ids })).await?;
        let read_duration = started.elapsed();
        let read = fetched
            .get("ids")
            .and_then(Value::as_array)
            .map_or(0, |ids| ids.len());

        Ok((
            json!({
                "operation": "write",
                "documents": documents,
                "duration": write_duration.as_secs_f64(),
                "throughput": rate(documents, write_duration),
            }),
            json!({
                "operation": "read",
                "documents": read,
                "duration": read_duration.as_secs_f64(),
                "throughput": rate(read, read_duration),
            }),
        ))
    }
}

#[async_trait]
impl BenchmarkPayload for ChromaThroughputBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::ChromaThroughput
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let name = ctx.param("collection_name")?;
        let documents = ctx.count("documents")?;
        let started_at = Utc::now();
        let chroma = ChromaCollections::new(&self.client, &ctx.target);

        let measured = self.measure(&chroma, name, documents).await;
        chroma.delete(name).await;
        let (write, read) = measured?;

        let summary = json!({
            "documents": documents,
            "write_throughput": write["throughput"],
            "read_throughput": read["throughput"],
            "throughput": write["throughput"],
        });
        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![("write", write), ("read", read)],
            summary,
        ))
    }
}

/// Nearest-neighbour query latency against a populated collection
pub struct ChromaQueryBenchmark {
    client: Client,
}

impl ChromaQueryBenchmark {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn measure(
        &self,
        chroma: &ChromaCollections,
        name: &str,
        documents: usize,
        n_results: usize,
    ) -> Result<(Duration, usize), MeasurementError> {
        let id = chroma.get_or_create(name).await?;
        chroma
            .call(
                &id,
                "add",
                json!({ "ids": document_ids(documents), "embeddings": embeddings(documents) }),
            )
            .await?;

        let started = Instant::now();
        let result = chroma
            .call(
                &id,
                "query",
                json!({ "query_embeddings": [[0.5, 0.5, 0.5]], "n_results": n_results }),
            )
            .await?;
        let duration = started.elapsed();

        let returned = result
            .get("ids")
            .and_then(Value::as_array)
            .and_then(|batches| batches.first())
            .and_then(Value::as_array)
            .map_or(0, |ids| ids.len());
        Ok((duration, returned))
    }
}

#[async_trait]
impl BenchmarkPayload for ChromaQueryBenchmark {
    fn kind(&self) -> BenchmarkKind {
        BenchmarkKind::ChromaQuery
    }

    #[instrument(skip(self, ctx), fields(target = %ctx.target))]
    async fn run(&self, ctx: &BenchmarkContext) -> Result<Value, MeasurementError> {
        let name = ctx.param("collection_name")?;
        let documents = ctx.count("documents")?;
        let n_results = ctx.count("n_results")?;
        let started_at = Utc::now();
        let chroma = ChromaCollections::new(&self.client, &ctx.target);

        let measured = self.measure(&chroma, name, documents, n_results).await;
        chroma.delete(name).await;
        let (duration, returned) = measured?;

        Ok(benchmark_report(
            self.kind(),
            ctx,
            started_at,
            vec![(
                "query",
                json!({
                    "operation": "query",
                    "documents_in_collection": documents,
                    "n_results": n_results,
                    "returned": returned,
                    "duration": duration.as_secs_f64(),
                }),
            )],
            json!({
                "documents_in_collection": documents,
                "n_results": n_results,
                "avg_latency": duration.as_secs_f64(),
            }),
        ))
    }
}

/// One payload per benchmark kind, built once at start-up
pub fn build_payloads(probes: &ProbeConfig) -> Result<HashMap<BenchmarkKind, Arc<dyn BenchmarkPayload>>, MeasurementError> {
    let client = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| MeasurementError::PayloadFailed(format!("Failed to create HTTP client: {}", e)))?;

    let payloads = BenchmarkKind::ALL
        .into_iter()
        .map(|kind| {
            let payload: Arc<dyn BenchmarkPayload> = match kind {
                BenchmarkKind::OllamaLatency => Arc::new(OllamaLatencyBenchmark::new(client.clone())),
                BenchmarkKind::OllamaStreaming => Arc::new(OllamaStreamingBenchmark::new(client.clone())),
                BenchmarkKind::PostgresThroughput => Arc::new(PostgresThroughputBenchmark::new(probes)),
                BenchmarkKind::PostgresTransaction => Arc::new(PostgresTransactionBenchmark::new(probes)),
                BenchmarkKind::ChromaThroughput => Arc::new(ChromaThroughputBenchmark::new(client.clone())),
                BenchmarkKind::ChromaQuery => Arc::new(ChromaQueryBenchmark::new(client.clone())),
            };
            (kind, payload)
        })
        .collect();
    info!("Benchmark payloads registered");
    Ok(payloads)
}
