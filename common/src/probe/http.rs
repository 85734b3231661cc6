// HTTP readiness checks: ollama generate round trip and chroma collection round trip

use crate::config::ProbeConfig;
use crate::errors::ProbeError;
use crate::models::ServiceKind;
use crate::probe::{wait_until_ready, ReadinessCheck};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama2";
pub const DEFAULT_OLLAMA_PROMPT: &str = "In one short sentence, what is a supercomputer?";

const CHROMA_PROBE_COLLECTION: &str = "aif_readiness_probe";
const CHROMA_PROBE_DOCUMENT_ID: &str = "aif_probe_1";

pub(crate) fn build_client(timeout: Duration) -> Result<Client, ProbeError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Http(format!("Failed to create HTTP client: {}", e)))
}

/// Fail on transport errors and non-2xx statuses, then decode the JSON body
async fn json_body<T: DeserializeOwned>(response: Result<Response, reqwest::Error>) -> Result<T, ProbeError> {
    let response = response.map_err(|e| ProbeError::Http(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::UnexpectedResponse(format!("HTTP status {}", status)));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ProbeError::UnexpectedResponse(format!("Invalid JSON body: {}", e)))
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// Whether an ollama tag list entry names `model` (`llama2` matches `llama2:latest`)
pub fn model_matches(entry: &str, model: &str) -> bool {
    entry == model
        || entry
            .strip_prefix(model)
            .is_some_and(|rest| rest.starts_with(':'))
}

/// OllamaCheck waits for the model to be listed, then sends one generate request
/// and requires a `response` field in the answer
pub struct OllamaCheck {
    client: Client,
    model: String,
    prompt: String,
    slow_start_budget: Duration,
    slow_start_poll: Duration,
}

impl OllamaCheck {
    pub fn new(
        model: impl Into<String>,
        prompt: impl Into<String>,
        request_timeout: Duration,
        slow_start_budget: Duration,
        slow_start_poll: Duration,
    ) -> Result<Self, ProbeError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            model: model.into(),
            prompt: prompt.into(),
            slow_start_budget,
            slow_start_poll,
        })
    }

    pub fn from_config(probes: &ProbeConfig, params: &BTreeMap<String, String>) -> Result<Self, ProbeError> {
        Self::new(
            params
                .get("model")
                .map(String::as_str)
                .unwrap_or(DEFAULT_OLLAMA_MODEL),
            params
                .get("prompt")
                .map(String::as_str)
                .unwrap_or(DEFAULT_OLLAMA_PROMPT),
            Duration::from_secs(probes.request_timeout_seconds),
            Duration::from_secs(probes.slow_start_budget_seconds),
            Duration::from_secs(probes.slow_start_poll_seconds),
        )
    }

    async fn model_available(&self, base_url: &str) -> Result<(), ProbeError> {
        let tags: TagsResponse = json_body(
            self.client
                .get(format!("{}/api/tags", base_url))
                .send()
                .await,
        )
        .await?;

        if tags.models.iter().any(|m| model_matches(&m.name, &self.model)) {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedResponse(format!(
                "Model '{}' not loaded yet",
                self.model
            )))
        }
    }
}

#[async_trait]
impl ReadinessCheck for OllamaCheck {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Ollama
    }

    #[instrument(skip(self), fields(model = %self.model))]
    async fn try_check(&self, target: &str) -> Result<(), ProbeError> {
        let base_url = ServiceKind::Ollama.base_url(target);

        wait_until_ready("ollama model", self.slow_start_budget, self.slow_start_poll, || {
            self.model_available(&base_url)
        })
        .await?;

        let body: GenerateResponse = json_body(
            self.client
                .post(format!("{}/api/generate", base_url))
                .json(&json!({
                    "model": self.model,
                    "prompt": self.prompt,
                    "stream": false,
                }))
                .send()
                .await,
        )
        .await?;

        match body.response {
            Some(text) => {
                debug!(chars = text.len(), "Ollama generated a response");
                Ok(())
            }
            None => Err(ProbeError::UnexpectedResponse(
                "Generate response has no 'response' field".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
}

/// ChromaCheck waits for the heartbeat, then creates a scratch collection, adds a
/// document, queries it back and deletes the collection
pub struct ChromaCheck {
    client: Client,
    slow_start_budget: Duration,
    slow_start_poll: Duration,
}

impl ChromaCheck {
    pub fn new(
        request_timeout: Duration,
        slow_start_budget: Duration,
        slow_start_poll: Duration,
    ) -> Result<Self, ProbeError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            slow_start_budget,
            slow_start_poll,
        })
    }

    pub fn from_config(probes: &ProbeConfig) -> Result<Self, ProbeError> {
        Self::new(
            Duration::from_secs(probes.request_timeout_seconds),
            Duration::from_secs(probes.slow_start_budget_seconds),
            Duration::from_secs(probes.slow_start_poll_seconds),
        )
    }

    async fn heartbeat(&self, base_url: &str) -> Result<(), ProbeError> {
        let _: serde_json::Value = json_body(
            self.client
                .get(format!("{}/api/v1/heartbeat", base_url))
                .send()
                .await,
        )
        .await?;
        Ok(())
    }

    async fn round_trip(&self, base_url: &str) -> Result<(), ProbeError> {
        let collection: CollectionResponse = json_body(
            self.client
                .post(format!("{}/api/v1/collections", base_url))
                .json(&json!({ "name": CHROMA_PROBE_COLLECTION, "get_or_create": true }))
                .send()
                .await,
        )
        .await?;

        let _: serde_json::Value = json_body(
            self.client
                .post(format!("{}/api/v1/collections/{}/add", base_url, collection.id))
                .json(&json!({
                    "ids": [CHROMA_PROBE_DOCUMENT_ID],
                    "embeddings": [[1.5, 2.9, 3.4]],
                    "documents": ["Readiness probe document."],
                }))
                .send()
                .await,
        )
        .await?;

        let query: QueryResponse = json_body(
            self.client
                .post(format!("{}/api/v1/collections/{}/query", base_url, collection.id))
                .json(&json!({ "query_embeddings": [[1.5, 2.9, 3.4]], "n_results": 1 }))
                .send()
                .await,
        )
        .await?;

        let found = query
            .ids
            .iter()
            .flatten()
            .any(|id| id == CHROMA_PROBE_DOCUMENT_ID);
        if !found {
            return Err(ProbeError::UnexpectedResponse(
                "Query did not return the probe document".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadinessCheck for ChromaCheck {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Chroma
    }

    #[instrument(skip(self))]
    async fn try_check(&self, target: &str) -> Result<(), ProbeError> {
        let base_url = ServiceKind::Chroma.base_url(target);

        wait_until_ready("chroma heartbeat", self.slow_start_budget, self.slow_start_poll, || {
            self.heartbeat(&base_url)
        })
        .await?;

        let outcome = self.round_trip(&base_url).await;

        // Always drop the scratch collection, even after a failed round trip
        let cleanup = self
            .client
            .delete(format!("{}/api/v1/collections/{}", base_url, CHROMA_PROBE_COLLECTION))
            .send()
            .await;
        if let Err(e) = cleanup {
            debug!(error = %e, "Failed to delete probe collection");
        }

        outcome
    }
}
