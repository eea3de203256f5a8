//! Dispatch Pipeline.
//!
//! Single entry point per inbound request: authenticate, parse, resolve the
//! model, load context, select an upstream key, call it, translate the
//! reply, and persist. Retries within the selection loop are bounded by the
//! number of eligible keys — each failing key is excluded from the next
//! attempt via its recorded outcome.

pub mod error;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cache_index::{CacheHandle, CacheIndex};
use crate::context_store::ContextStore;
use crate::key_pool::{KeyPool, Outcome, SelectionError};
use crate::model_limits::ModelLimitsRegistry;
use crate::translate::{self, NativeGenerateResponse, ParsedRequest, StreamTranslator, WireFormat};
use crate::types::{Credential, Message};
use crate::usage::UsageTracker;

use error::GatewayError;

const MAX_SELECTION_ATTEMPTS: usize = 4;
/// Stream frames are forwarded to the HTTP layer through a bounded channel;
/// a slow client backpressures the forwarder task rather than letting it
/// buffer unboundedly.
const STREAM_CHANNEL_CAPACITY: usize = 16;

pub struct Dispatcher {
    pub credentials: HashSet<String>,
    pub model_limits: Arc<ModelLimitsRegistry>,
    pub usage: Arc<UsageTracker>,
    pub context_store: Arc<ContextStore>,
    pub cache_index: Arc<CacheIndex>,
    pub key_pool: Arc<KeyPool>,
    pub http: reqwest::Client,
    pub upstream_base_url: String,
    pub safety_margin: u32,
    pub stream_save_reply: bool,
}

pub struct DispatchRequest {
    pub credential: Credential,
    pub format: WireFormat,
    pub path_model_hint: Option<String>,
    pub body: Vec<u8>,
    pub requested_cache_handle: Option<String>,
    pub cancellation: CancellationToken,
    /// The native wire format carries no `stream` field in its body — the
    /// caller signals it through the path action (`:generateContent` vs
    /// `:streamGenerateContent`) instead. `Some` overrides whatever
    /// [`translate::parse_request`] inferred from the body; `None` leaves it
    /// as parsed (the OpenAI format's own `stream` field).
    pub stream_override: Option<bool>,
}

pub enum DispatchOutcome {
    Buffered(Vec<u8>),
    Stream(StreamingReply),
}

/// A live stream handed to the HTTP layer. Frames are already translated
/// into the caller's wire format and SSE-framed (`data: ...\n\n`); the HTTP
/// layer only needs to forward bytes onto the response body.
pub struct StreamingReply {
    pub model: String,
    pub frames: ReceiverStream<Result<Bytes, std::io::Error>>,
}

impl Dispatcher {
    pub fn authenticate(&self, credential: &Credential) -> Result<(), GatewayError> {
        if self.credentials.contains(credential.as_str()) {
            Ok(())
        } else {
            Err(GatewayError::Auth)
        }
    }

    /// Runs steps 1-4 (authenticate, parse, resolve model, estimate
    /// tokens), then the key-selection + upstream-call loop.
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome, GatewayError> {
        self.authenticate(&req.credential)?;

        let mut parsed = translate::parse_request(req.format, &req.body)
            .map_err(|e| GatewayError::ClientInput(e.to_string()))?;
        if let Some(hint) = req.path_model_hint {
            if parsed.model.is_empty() {
                parsed.model = hint;
            }
        }
        if parsed.turns.is_empty() {
            return Err(GatewayError::ClientInput(
                "messages must not be empty".to_string(),
            ));
        }
        if let Some(stream) = req.stream_override {
            parsed.stream = stream;
        }

        let model = ModelLimitsRegistry::normalize_model_id(&parsed.model);
        let limit = self.model_limits.lookup(&model).cloned();

        let now = Utc::now();

        // Resolve cache before touching the context store: the two are
        // mutually exclusive paths for a given call. The hash is over the
        // turns the caller actually sent, not any locally-merged history, so
        // a repeated prompt prefix hashes identically across calls
        // regardless of this credential's stored conversation.
        let content_hash = hash_turns(&parsed.turns);
        // Keep the handle's local id alongside its owning key: if selection
        // can't honor the hint (the owning key turned out ineligible), the
        // handle is orphaned per the Cache Metadata Index invariant and must
        // be marked expired rather than silently retried forever.
        let cache_lookup: Option<(String, String)> = if let Some(handle_id) = &req.requested_cache_handle {
            self.cache_index
                .owning_key(handle_id, now)
                .await
                .ok()
                .flatten()
                .map(|owner| (handle_id.clone(), owner))
        } else {
            self.cache_index
                .find_by_content(&req.credential, &content_hash, now)
                .await
                .ok()
                .flatten()
                .map(|h| (h.local_id, h.owning_key_id))
        };
        let owning_key_hint = cache_lookup.as_ref().map(|(_, owner)| owner.clone());
        let cache_bound = owning_key_hint.is_some();

        // Context is only consulted when not cache-bound and the caller's
        // (sticky) key has context-completion enabled; a credential with no
        // sticky key yet defaults to enabled so the first call on a fresh
        // credential still gets history tracking.
        let context_enabled =
            !cache_bound && self.key_pool.context_completion_enabled_for(&req.credential, now);

        let history = if context_enabled {
            self.context_store
                .load(&req.credential)
                .await
                .map_err(|e| GatewayError::ClientInput(e.to_string()))?
        } else {
            Vec::new()
        };

        let effective_limit = limit
            .as_ref()
            .map(|l| (l.input_token_limit.saturating_sub(self.safety_margin)) as usize)
            .unwrap_or(self.model_limits.fallback_input_token_limit() as usize);

        let mut merged_turns = history;
        merged_turns.extend(parsed.turns.clone());
        let estimated_tokens = crate::context_store::estimate_tokens(&merged_turns) as u64;

        let mut last_err: Option<GatewayError> = None;
        for _ in 0..MAX_SELECTION_ATTEMPTS {
            if req.cancellation.is_cancelled() {
                return Err(GatewayError::Cancellation);
            }

            let selected = match self.key_pool.select(
                &req.credential,
                &model,
                estimated_tokens,
                owning_key_hint.as_deref(),
                now,
            ) {
                Ok(s) => s,
                Err(SelectionError::NoKeyAvailable) => {
                    return Err(GatewayError::NoCapacity {
                        retry_after_seconds: Some(30),
                    });
                }
            };

            if let Some((local_id, owner)) = &cache_lookup {
                if &selected.key_id != owner {
                    let _ = self.cache_index.mark_expired(local_id).await;
                }
            }

            if parsed.stream {
                let established = tokio::select! {
                    _ = req.cancellation.cancelled() => return Err(GatewayError::Cancellation),
                    result = self.call_upstream_stream(&selected.secret, &model, &merged_turns, &parsed) => result,
                };

                let upstream = match established {
                    Ok(resp) => resp,
                    Err(e) => match self.handle_upstream_error(&selected.key_id, e, now) {
                        RetryOrFail::Retry(err) => {
                            last_err = Some(err);
                            continue;
                        }
                        RetryOrFail::Fail(err) => return Err(err),
                    },
                };

                self.key_pool.record_outcome(&selected.key_id, Outcome::Success, now);
                self.usage.record_request(&selected.key_id, &model, estimated_tokens, now);
                self.maybe_register_cache(&req, owning_key_hint.as_deref(), &selected.key_id, &content_hash, now)
                    .await;

                let frames = spawn_stream_forwarder(
                    upstream,
                    StreamTranslator::new(req.format, model.clone()),
                    self.context_store.clone(),
                    req.credential.clone(),
                    parsed.turns.clone(),
                    effective_limit,
                    self.stream_save_reply && context_enabled,
                    req.cancellation.clone(),
                );

                return Ok(DispatchOutcome::Stream(StreamingReply { model, frames }));
            }

            let call = tokio::select! {
                _ = req.cancellation.cancelled() => return Err(GatewayError::Cancellation),
                result = self.call_upstream(&selected.secret, &model, &merged_turns, &parsed) => result,
            };

            match call {
                Ok(reply) => {
                    self.key_pool.record_outcome(&selected.key_id, Outcome::Success, now);
                    self.usage.record_request(&selected.key_id, &model, estimated_tokens, now);
                    self.maybe_register_cache(&req, owning_key_hint.as_deref(), &selected.key_id, &content_hash, now)
                        .await;

                    if context_enabled {
                        let _ = self
                            .context_store
                            .save(&req.credential, parsed.turns.clone(), effective_limit)
                            .await;
                    }

                    let rendered = translate::render_response(req.format, &model, &reply)
                        .map_err(|e| GatewayError::ClientInput(e.to_string()))?;
                    return Ok(DispatchOutcome::Buffered(rendered));
                }
                Err(e) => match self.handle_upstream_error(&selected.key_id, e, now) {
                    RetryOrFail::Retry(err) => last_err = Some(err),
                    RetryOrFail::Fail(err) => return Err(err),
                },
            }
        }

        Err(last_err.unwrap_or(GatewayError::NoCapacity {
            retry_after_seconds: Some(30),
        }))
    }

    /// New content-addressed cache handles are only registered for fresh
    /// turn sequences that weren't already resolved to an owning key — a
    /// reused handle (explicit or hinted) is left untouched.
    async fn maybe_register_cache(
        &self,
        req: &DispatchRequest,
        owning_key_hint: Option<&str>,
        key_id: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) {
        if req.requested_cache_handle.is_some() || owning_key_hint.is_some() {
            return;
        }
        let _ = self
            .cache_index
            .register(CacheHandle {
                local_id: uuid::Uuid::new_v4().to_string(),
                upstream_cache_id: String::new(),
                content_hash: content_hash.to_string(),
                owning_key_id: key_id.to_string(),
                credential: req.credential.clone(),
                created_at: now,
                expires_at: now + chrono::Duration::hours(1),
            })
            .await;
    }

    /// Record the key-pool outcome implied by an upstream failure and decide
    /// whether the selection loop should retry with another key or give up.
    /// Semantic failures are a fault in the request, not the key, so the key
    /// is left untouched and the loop returns immediately.
    fn handle_upstream_error(&self, key_id: &str, err: UpstreamCallError, now: DateTime<Utc>) -> RetryOrFail {
        match err {
            UpstreamCallError::Transient(msg) => {
                self.key_pool.record_outcome(key_id, Outcome::TransientFailure, now);
                RetryOrFail::Retry(GatewayError::UpstreamTransient(msg))
            }
            UpstreamCallError::DailyQuota => {
                self.key_pool.record_outcome(key_id, Outcome::DailyQuotaExhausted, now);
                RetryOrFail::Retry(GatewayError::UpstreamQuotaExhausted)
            }
            UpstreamCallError::PermanentKey(msg) => {
                self.key_pool.record_outcome(key_id, Outcome::PermanentlyInvalid, now);
                RetryOrFail::Retry(GatewayError::UpstreamPermanentKey(msg))
            }
            UpstreamCallError::Semantic(msg) => RetryOrFail::Fail(GatewayError::UpstreamSemantic(msg)),
        }
    }

    async fn call_upstream(
        &self,
        secret: &str,
        model: &str,
        turns: &[crate::types::Message],
        parsed: &ParsedRequest,
    ) -> Result<NativeGenerateResponse, UpstreamCallError> {
        let url = format!("{}/v2/models/{}:generateContent", self.upstream_base_url, model);
        let body = serde_json::json!({
            "contents": turns,
            "generation_config": {
                "max_output_tokens": parsed.max_output_tokens,
                "temperature": parsed.temperature,
                "top_p": parsed.top_p,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamCallError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<NativeGenerateResponse>()
                .await
                .map_err(|e| UpstreamCallError::Semantic(e.to_string()))
        } else if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            if text.contains("daily") || text.contains("quota") {
                Err(UpstreamCallError::DailyQuota)
            } else {
                Err(UpstreamCallError::Transient("rate limited".to_string()))
            }
        } else if status.is_server_error() {
            Err(UpstreamCallError::Transient(format!("upstream status {status}")))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(UpstreamCallError::PermanentKey(format!("upstream status {status}")))
        } else {
            Err(UpstreamCallError::Semantic(format!("upstream status {status}")))
        }
    }

    /// Establish a streaming upstream call. Only the connection and the
    /// response headers are awaited here — classifying a non-2xx response
    /// reads the (small) error body same as the buffered path, but a
    /// successful response's body is handed back unread for the forwarder
    /// task to drain incrementally.
    async fn call_upstream_stream(
        &self,
        secret: &str,
        model: &str,
        turns: &[Message],
        parsed: &ParsedRequest,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let url = format!(
            "{}/v2/models/{}:streamGenerateContent?alt=sse",
            self.upstream_base_url, model
        );
        let body = serde_json::json!({
            "contents": turns,
            "generation_config": {
                "max_output_tokens": parsed.max_output_tokens,
                "temperature": parsed.temperature,
                "top_p": parsed.top_p,
            }
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamCallError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            if text.contains("daily") || text.contains("quota") {
                Err(UpstreamCallError::DailyQuota)
            } else {
                Err(UpstreamCallError::Transient("rate limited".to_string()))
            }
        } else if status.is_server_error() {
            Err(UpstreamCallError::Transient(format!("upstream status {status}")))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(UpstreamCallError::PermanentKey(format!("upstream status {status}")))
        } else {
            Err(UpstreamCallError::Semantic(format!("upstream status {status}")))
        }
    }
}

enum UpstreamCallError {
    Transient(String),
    DailyQuota,
    PermanentKey(String),
    Semantic(String),
}

/// What to do with a selection-loop attempt after an upstream failure: try
/// the next key, or give up and report to the caller.
enum RetryOrFail {
    Retry(GatewayError),
    Fail(GatewayError),
}

/// Drain an upstream SSE response, translating each event into the caller's
/// wire format and forwarding it through a bounded channel. Runs as its own
/// task so the dispatch call can return the stream to the HTTP layer as soon
/// as the upstream connection is established, rather than holding the
/// selection loop open for the whole reply.
fn spawn_stream_forwarder(
    mut upstream: reqwest::Response,
    mut translator: StreamTranslator,
    context_store: Arc<ContextStore>,
    credential: Credential,
    turns_to_persist: Vec<Message>,
    effective_limit: usize,
    stream_save_reply: bool,
    cancellation: CancellationToken,
) -> ReceiverStream<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut buf = String::new();

        loop {
            let chunk = tokio::select! {
                _ = cancellation.cancelled() => break,
                chunk = upstream.chunk() => chunk,
            };

            let chunk = match chunk {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            };

            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(event_end) = buf.find("\n\n") {
                let event = buf[..event_end].to_string();
                buf.drain(..event_end + 2);

                let Some(data) = extract_sse_data(&event) else {
                    continue;
                };
                let native_event: NativeGenerateResponse = match serde_json::from_str(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to parse upstream stream event");
                        continue;
                    }
                };

                match translator.translate_chunk(&native_event) {
                    Ok(payload) => {
                        let mut framed = Vec::with_capacity(payload.len() + 8);
                        framed.extend_from_slice(b"data: ");
                        framed.extend_from_slice(&payload);
                        framed.extend_from_slice(b"\n\n");
                        if tx.send(Ok(Bytes::from(framed))).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to translate upstream stream event");
                    }
                }
            }
        }

        if let Some(terminator) = translator.finalize() {
            let mut framed = Vec::with_capacity(terminator.len() + 8);
            framed.extend_from_slice(b"data: ");
            framed.extend_from_slice(terminator);
            framed.extend_from_slice(b"\n\n");
            let _ = tx.send(Ok(Bytes::from(framed))).await;
        }

        if stream_save_reply {
            let _ = context_store
                .save(&credential, turns_to_persist, effective_limit)
                .await;
        }
    });

    ReceiverStream::new(rx)
}

/// Pull the payload out of one `data: ...` SSE event. Multi-line `data:`
/// fields are not produced by the upstream and are not supported here.
fn extract_sse_data(event: &str) -> Option<String> {
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim_start().to_string());
        }
    }
    None
}

fn hash_turns(turns: &[crate::types::Message]) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_json::to_vec(turns) {
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_credential_is_rejected() {
        let dispatcher_credentials: HashSet<String> = ["abc".to_string()].into_iter().collect();
        assert!(dispatcher_credentials.contains("abc"));
        assert!(!dispatcher_credentials.contains("xyz"));
    }

    #[test]
    fn hash_turns_is_stable_for_identical_input() {
        let turns = vec![crate::types::Message::user("hi")];
        assert_eq!(hash_turns(&turns), hash_turns(&turns));
    }

    #[test]
    fn hash_turns_differs_for_different_input() {
        let a = vec![crate::types::Message::user("hi")];
        let b = vec![crate::types::Message::user("bye")];
        assert_ne!(hash_turns(&a), hash_turns(&b));
    }

    #[test]
    fn extract_sse_data_strips_prefix_and_whitespace() {
        let event = "event: message\ndata: {\"a\":1}";
        assert_eq!(extract_sse_data(event), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn extract_sse_data_is_none_without_data_line() {
        let event = "event: ping";
        assert_eq!(extract_sse_data(event), None);
    }
}
