// Keywatch Engine — Verifier Client
//
// Third cascade stage: asks the external language-model service for a
// structured verdict on whether a message matches a subscription. Two entry
// points: `verify` for the live pipeline, `verify_many` for the batched
// retrospective scan.
//
// The transport retries with exponential backoff on retryable statuses and
// respects Retry-After. The response parser is deliberately tolerant —
// models wrap JSON in code fences and prose, and a lightly-malformed body
// should degrade to "no match", not to an error.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{IncomingMessage, Subscription};
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

// ── Verdict transport tuning ───────────────────────────────────────────────

/// How many times one verdict request may hit the wire before the pipeline
/// hears about the failure (and weighs its lexical-score fallback).
const VERDICT_MAX_ATTEMPTS: u32 = 4;

/// First re-request delay; each further one doubles, up to the cap. Half a
/// second keeps a transient LLM-gateway hiccup cheaper than a dropped
/// candidate, while the cap stops a long outage from pinning a pipeline
/// invocation for minutes.
const VERDICT_BACKOFF_FLOOR: Duration = Duration::from_millis(500);
const VERDICT_BACKOFF_CEIL: Duration = Duration::from_secs(20);

/// Longest server-requested pause (Retry-After) that is honored.
const VERDICT_RETRY_AFTER_CEIL: Duration = Duration::from_secs(60);

/// Structured verdict from the verifier service.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub is_match: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Free prose. The engine never interprets it — it is carried into
    /// notifications verbatim.
    pub reason: String,
    /// Subset of enumerated items in the message text the verifier considers
    /// matches; used to present only the relevant bullets.
    pub matched_items: Vec<String>,
    /// Analogous subset of the media list.
    pub matched_photo_indices: Vec<usize>,
}

impl Verdict {
    /// The verdict used when a response body cannot be parsed at all.
    fn no_match() -> Self {
        Verdict {
            is_match: false,
            confidence: 0.0,
            reason: String::new(),
            matched_items: vec![],
            matched_photo_indices: vec![],
        }
    }
}

/// The verdict capability the pipeline consumes. `VerifierClient` is the
/// production implementation; tests substitute fakes.
#[async_trait::async_trait]
pub trait VerdictProvider: Send + Sync {
    async fn verify(&self, message: &IncomingMessage, sub: &Subscription) -> EngineResult<Verdict>;

    async fn verify_many(
        &self,
        messages: &[&IncomingMessage],
        sub: &Subscription,
    ) -> EngineResult<HashMap<usize, Verdict>>;
}

/// Verifier client — holds the endpoint and bearer token.
pub struct VerifierClient {
    client: reqwest::Client,
    base_url: String,
    /// Token wrapped in Zeroizing<> — automatically zeroed from RAM on drop.
    token: Zeroizing<String>,
}

impl VerifierClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        // Verdicts can legitimately take a while on a loaded model, hence
        // the generous overall timeout next to a tight connect timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|e| {
                warn!("[verifier] Client builder failed ({}) — using defaults", e);
                reqwest::Client::new()
            });
        VerifierClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Zeroizing::new(token.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl VerdictProvider for VerifierClient {
    /// Single verdict for one (subscription × message) pair.
    async fn verify(&self, message: &IncomingMessage, sub: &Subscription) -> EngineResult<Verdict> {
        let body = json!({
            "query": sub.query,
            "description": sub.description,
            "keywords": sub.keywords,
            "negative_keywords": sub.negative_keywords,
            "message": {
                "text": message.text,
                "media": message.media.iter().map(|m| json!({
                    "index": m.index,
                    "mime": m.mime,
                    "width": m.width,
                    "height": m.height,
                })).collect::<Vec<_>>(),
            },
        });

        let raw = self.post_with_retry("/verify", &body).await?;
        let verdict = match extract_json(&raw) {
            Some(v) => verdict_from_value(&v),
            None => {
                warn!("[verifier] Unparseable response for sub {} msg {} — treating as no match",
                    sub.id, message.id);
                Verdict::no_match()
            }
        };
        debug!(
            "[verifier] sub {} msg {} → match={} conf={:.2}",
            sub.id, message.id, verdict.is_match, verdict.confidence
        );
        Ok(verdict)
    }

    /// Batched verdicts: one subscription against many messages. Returns a
    /// map from the caller's message index to the verdict; indices the
    /// server omits or mangles are simply absent.
    async fn verify_many(
        &self,
        messages: &[&IncomingMessage],
        sub: &Subscription,
    ) -> EngineResult<HashMap<usize, Verdict>> {
        let body = json!({
            "query": sub.query,
            "description": sub.description,
            "keywords": sub.keywords,
            "negative_keywords": sub.negative_keywords,
            "messages": messages.iter().enumerate().map(|(i, m)| json!({
                "index": i,
                "text": m.text,
            })).collect::<Vec<_>>(),
        });

        let raw = self.post_with_retry("/verify/batch", &body).await?;
        let parsed = match extract_json(&raw) {
            Some(v) => v,
            None => {
                warn!("[verifier] Unparseable batch response for sub {} — treating all as no match", sub.id);
                return Ok(HashMap::new());
            }
        };

        // Accept either a bare array or { "results": [...] }.
        let items = parsed["results"]
            .as_array()
            .cloned()
            .or_else(|| parsed.as_array().cloned())
            .unwrap_or_default();

        let mut verdicts = HashMap::new();
        for (position, item) in items.iter().enumerate() {
            let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(position);
            if index < messages.len() {
                verdicts.insert(index, verdict_from_value(item));
            }
        }
        debug!("[verifier] Batch for sub {}: {}/{} verdicts", sub.id, verdicts.len(), messages.len());
        Ok(verdicts)
    }
}

impl VerifierClient {
    /// POST one verdict request, re-sending on transient failures up to
    /// `VERDICT_MAX_ATTEMPTS` total tries. Non-retryable statuses fail fast
    /// so the pipeline can move to its lexical-score fallback immediately.
    async fn post_with_retry(&self, path: &str, body: &Value) -> EngineResult<String> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 1..=VERDICT_MAX_ATTEMPTS {
            let outcome = self
                .client
                .post(&url)
                .bearer_auth(self.token.as_str())
                .json(body)
                .send()
                .await;

            let (failure, retry_after) = match outcome {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .await
                        .map_err(|e| EngineError::Verifier(format!("read body: {}", e)));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = retry_after_hint(resp.headers());
                    let text = resp.text().await.unwrap_or_default();
                    if !status_is_transient(status) {
                        return Err(EngineError::Verifier(format!("HTTP {} — {}", status, text)));
                    }
                    (format!("HTTP {}", status), retry_after)
                }
                Err(e) => (format!("transport: {}", e), None),
            };

            if attempt == VERDICT_MAX_ATTEMPTS {
                return Err(EngineError::Verifier(format!(
                    "{} (gave up after {} attempts)",
                    failure, attempt
                )));
            }
            let delay = verdict_backoff(attempt, retry_after);
            warn!(
                "[verifier] {} — attempt {}/{}, next try in {}ms",
                failure,
                attempt,
                VERDICT_MAX_ATTEMPTS,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
        unreachable!("retry loop returns on the final attempt")
    }
}

// ── Retry classification & backoff ─────────────────────────────────────────

/// Whether a verdict request is worth re-sending: rate limiting, request
/// timeouts, any server-side failure, and 529 (the "overloaded" code some
/// LLM gateways emit outside the standard range).
fn status_is_transient(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
        || status.as_u16() == 529
}

/// Integer-seconds Retry-After, when the server sent one. The HTTP-date
/// form is ignored — the computed backoff covers that case.
fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Pause before re-sending attempt `attempt + 1`: doubling from the floor,
/// clamped to the ceiling, stretched to a (bounded) server-requested wait,
/// plus up to 20% of clock-derived spread so a burst of failing candidates
/// does not retry in lockstep.
fn verdict_backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let doubled = VERDICT_BACKOFF_FLOOR.saturating_mul(1 << attempt.saturating_sub(1).min(10));
    let mut delay = doubled.min(VERDICT_BACKOFF_CEIL);
    if let Some(requested) = retry_after {
        delay = delay.max(requested.min(VERDICT_RETRY_AFTER_CEIL));
    }
    delay + backoff_spread(delay)
}

/// 0–20% of the delay, seeded from the clock's sub-second bits. Enough to
/// fan out simultaneous retries without a rand dependency.
fn backoff_spread(delay: Duration) -> Duration {
    let window_ms = (delay.as_millis() / 5) as u64;
    if window_ms == 0 {
        return Duration::ZERO;
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_micros() as u64;
    Duration::from_millis(seed % (window_ms + 1))
}

// ── Tolerant JSON extraction ───────────────────────────────────────────────

/// Pull a JSON value out of a model response. Accepts a clean body, a
/// code-fenced block, or JSON embedded in surrounding prose; returns `None`
/// only when no bracketed substring parses.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // 1. Direct parse of the whole body.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    // 2. Code fence: take the content between the first ``` line and the
    //    closing ```, stripping an optional language tag.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(v);
            }
        }
    }

    // 3. Outermost object / array substring.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}

/// Recover a verdict from a loosely-shaped JSON object. Field names vary
/// across model outputs; absent or mistyped fields degrade to the no-match
/// defaults rather than erroring.
pub fn verdict_from_value(v: &Value) -> Verdict {
    let is_match = v["is_match"]
        .as_bool()
        .or_else(|| v["match"].as_bool())
        .or_else(|| v["matched"].as_bool())
        .or_else(|| v["is_match"].as_str().map(|s| s.eq_ignore_ascii_case("true")))
        .unwrap_or(false);

    let confidence = v["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);

    let reason = v["reason"]
        .as_str()
        .or_else(|| v["explanation"].as_str())
        .unwrap_or("")
        .to_string();

    let matched_items = v["matched_items"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|i| i.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default();

    let matched_photo_indices = v["matched_photo_indices"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|i| i.as_u64().map(|n| n as usize)).collect())
        .unwrap_or_default();

    Verdict { is_match, confidence, reason, matched_items, matched_photo_indices }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bare_json() {
        let v = extract_json(r#"{"is_match": true, "confidence": 0.9}"#).unwrap();
        assert_eq!(v["is_match"], true);
    }

    #[test]
    fn extract_code_fenced_json() {
        let raw = "Here is my answer:\n```json\n{\"is_match\": false}\n```\nHope that helps!";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["is_match"], false);
    }

    #[test]
    fn extract_json_with_surrounding_prose() {
        let raw = "The verdict is {\"is_match\": true, \"confidence\": 0.75} as requested.";
        let v = extract_json(raw).unwrap();
        assert_eq!(v["confidence"], 0.75);
    }

    #[test]
    fn extract_array_with_trailing_text() {
        let raw = "[{\"index\": 0, \"is_match\": true}] -- end of output";
        let v = extract_json(raw).unwrap();
        assert!(v.is_array());
    }

    #[test]
    fn extract_garbage_is_none() {
        assert!(extract_json("no json here at all").is_none());
        assert!(extract_json("").is_none());
        assert!(extract_json("{broken: json").is_none());
    }

    #[test]
    fn verdict_tolerates_alternate_field_names() {
        let v: Value = serde_json::from_str(r#"{"match": true, "explanation": "fits"}"#).unwrap();
        let verdict = verdict_from_value(&v);
        assert!(verdict.is_match);
        assert_eq!(verdict.reason, "fits");
    }

    #[test]
    fn verdict_clamps_confidence() {
        let v: Value = serde_json::from_str(r#"{"is_match": true, "confidence": 3.2}"#).unwrap();
        assert_eq!(verdict_from_value(&v).confidence, 1.0);
    }

    #[test]
    fn verdict_missing_fields_default_to_no_match() {
        let v: Value = serde_json::from_str(r#"{"something": "else"}"#).unwrap();
        let verdict = verdict_from_value(&v);
        assert!(!verdict.is_match);
        assert!(verdict.matched_items.is_empty());
        assert!(verdict.matched_photo_indices.is_empty());
    }

    #[test]
    fn verdict_reads_matched_subsets() {
        let v: Value = serde_json::from_str(
            r#"{"is_match": true, "matched_items": ["iPhone 15 Pro"], "matched_photo_indices": [0, 2]}"#,
        )
        .unwrap();
        let verdict = verdict_from_value(&v);
        assert_eq!(verdict.matched_items, vec!["iPhone 15 Pro"]);
        assert_eq!(verdict.matched_photo_indices, vec![0, 2]);
    }

    // ── Retry policy ───────────────────────────────────────────────────────

    #[test]
    fn transient_statuses_cover_gateway_failures() {
        let transient = [429u16, 408, 500, 502, 503, 529];
        for code in transient {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert!(status_is_transient(status), "{} should be re-sent", code);
        }
        // A rejected request will be rejected again — do not re-send.
        let terminal = [200u16, 400, 401, 403, 404, 422];
        for code in terminal {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert!(!status_is_transient(status), "{} should fail fast", code);
        }
    }

    #[test]
    fn backoff_doubles_to_the_ceiling() {
        // Each delay is its exponential floor plus at most 20% spread.
        let within = |d: Duration, floor_ms: u64| {
            let ms = d.as_millis() as u64;
            ms >= floor_ms && ms <= floor_ms + floor_ms / 5
        };
        assert!(within(verdict_backoff(1, None), 500));
        assert!(within(verdict_backoff(2, None), 1_000));
        assert!(within(verdict_backoff(3, None), 2_000));
        // Far past the doubling range the ceiling holds.
        assert!(within(verdict_backoff(12, None), 20_000));
    }

    #[test]
    fn retry_after_stretches_the_backoff_within_bounds() {
        // A server wait longer than the computed delay wins...
        let stretched = verdict_backoff(1, Some(Duration::from_secs(30)));
        assert!(stretched >= Duration::from_secs(30));
        // ...but an abusive one is clamped to the honor ceiling (+spread).
        let clamped = verdict_backoff(1, Some(Duration::from_secs(600)));
        assert!(clamped <= Duration::from_secs(72));
        // A zero hint never shrinks the delay below the exponential floor.
        let floored = verdict_backoff(2, Some(Duration::ZERO));
        assert!(floored >= Duration::from_secs(1));
    }

    #[test]
    fn retry_after_hint_reads_integer_seconds_only() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after_hint(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, reqwest::header::HeaderValue::from_static("7"));
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(retry_after_hint(&headers), None);
    }

    // ── Transport, driven end-to-end against a stub server ─────────────────

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve the scripted responses one connection at a time, then report
    /// how many requests actually arrived.
    async fn spawn_stub_verifier(
        responses: Vec<(u16, String)>,
    ) -> (std::net::SocketAddr, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let mut request = vec![0u8; 16_384];
                let _ = socket.read(&mut request).await;
                let reason = match status {
                    200 => "OK",
                    400 => "Bad Request",
                    503 => "Service Unavailable",
                    _ => "Stubbed",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                served += 1;
            }
            served
        });
        (addr, handle)
    }

    fn listing_message() -> IncomingMessage {
        IncomingMessage {
            id: 5,
            group_id: 100,
            group_name: "market".into(),
            group_handle: None,
            topic_id: None,
            topic_title: None,
            text: "Продаю iPhone 15 Pro Max 256gb".into(),
            display_text: "Продаю iPhone 15 Pro Max 256gb".into(),
            media: vec![],
            sender_id: 7,
            sender_name: "anna".into(),
            sender_handle: None,
            date: 1_700_000_000,
        }
    }

    fn listing_sub() -> Subscription {
        Subscription {
            id: 1,
            user_id: 10,
            query: "продаю iphone 15 pro".into(),
            keywords: vec!["iphone".into(), "15".into(), "pro".into()],
            negative_keywords: vec![],
            description: "sale of iPhone 15 Pro".into(),
            embeddings: vec![],
            active: true,
            group_ids: vec![100],
        }
    }

    #[tokio::test]
    async fn verify_retries_past_a_gateway_hiccup() {
        let verdict_body = r#"{"is_match": true, "confidence": 0.84, "reason": "fits"}"#;
        let (addr, requests) = spawn_stub_verifier(vec![
            (503, "{}".to_string()),
            (200, verdict_body.to_string()),
        ])
        .await;

        let client = VerifierClient::new(&format!("http://{}", addr), "test-token");
        let verdict = client.verify(&listing_message(), &listing_sub()).await.unwrap();
        assert!(verdict.is_match);
        assert!((verdict.confidence - 0.84).abs() < 1e-9);
        // The 503 was re-sent, the 200 was not.
        assert_eq!(requests.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn verify_fails_fast_on_a_client_error() {
        let (addr, requests) =
            spawn_stub_verifier(vec![(400, r#"{"error": "malformed subscription"}"#.to_string())])
                .await;

        let client = VerifierClient::new(&format!("http://{}", addr), "test-token");
        let err = client.verify(&listing_message(), &listing_sub()).await.unwrap_err();
        assert!(matches!(err, EngineError::Verifier(_)));
        // No retry for a request the server rejected outright.
        assert_eq!(requests.await.unwrap(), 1);
    }
}
