// Keywatch Engine — Embedding Client
//
// Calls the embedding server to produce vector representations of message
// text. Used by the semantic matcher as the second cascade stage.
//
// The server is an operational dependency, not a correctness one: when it is
// unreachable, subscriptions fall back to lexical-only matching. A health
// probe result is cached for ~60 s so a chronically-down server does not
// stall every message with a connect timeout.

use crate::atoms::constants::EMBEDDING_HEALTH_TTL_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Cached outcome of the most recent reachability check.
struct HealthProbe {
    reachable: bool,
    checked_at: Instant,
}

/// Embedding client — POSTs text, receives a vector.
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    health: Mutex<Option<HealthProbe>>,
}

impl EmbeddingClient {
    pub fn new(base_url: &str) -> Self {
        EmbeddingClient {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            health: Mutex::new(None),
        }
    }

    /// Get the embedding vector for a text string.
    /// On transport failure the server is marked unreachable for the health
    /// interval, so subsequent messages skip the semantic stage cheaply.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/embed", self.base_url);
        let body = json!({ "text": text });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| {
                self.mark_unreachable();
                EngineError::Embedding(format!("server not reachable at {}: {}", self.base_url, e))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Embedding(format!("embed {} — {}", status, text)));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Embedding(format!("embed response: {}", e)))?;

        let embedding = v["embedding"]
            .as_array()
            .ok_or_else(|| EngineError::Embedding("no 'embedding' array in response".into()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vec.is_empty() {
            return Err(EngineError::Embedding("empty embedding vector".into()));
        }

        debug!("[embedding] Embedded {} chars into {} dims", text.len(), vec.len());
        Ok(vec)
    }

    /// Check whether the embedding server is reachable, with the result
    /// cached for the health interval.
    pub async fn is_reachable(&self) -> bool {
        {
            let cached = self.health.lock();
            if let Some(probe) = cached.as_ref() {
                if probe.checked_at.elapsed() < Duration::from_secs(EMBEDDING_HEALTH_TTL_SECS) {
                    return probe.reachable;
                }
            }
        }

        let url = format!("{}/health", self.base_url);
        let reachable = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };

        if reachable {
            info!("[embedding] Server reachable at {}", self.base_url);
        } else {
            warn!(
                "[embedding] Server unreachable at {} — lexical-only for {}s",
                self.base_url, EMBEDDING_HEALTH_TTL_SECS
            );
        }
        *self.health.lock() = Some(HealthProbe { reachable, checked_at: Instant::now() });
        reachable
    }

    /// Cache unreachability without waiting for the next probe. Called when
    /// an embed request itself fails at the transport level.
    pub fn mark_unreachable(&self) {
        *self.health.lock() = Some(HealthProbe { reachable: false, checked_at: Instant::now() });
    }
}
