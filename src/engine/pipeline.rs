// Keywatch Engine — Processing Pipeline
//
// Per-message state machine:
//   1. keep group-chat posts only (no DMs, channels, service events)
//   2. album fragments: first one claims and fetches the whole album
//   3. URL-only posts are enriched or skipped
//   4. look up the group's subscriptions
//   5. cascade each subscription: lexical → semantic; persist rejections
//   6. sort surviving candidates by lexical score
//   7. bucket the competitor count
//   8. per candidate: in-flight lock → ledger checks → verifier → dispatch
//
// The in-flight lock set is the only correctness guard against two
// concurrent invocations for the same (subscription, message, group) both
// passing the ledger check. Acquisition is non-blocking and the guard
// releases on drop, so every exit path — including errors — unlocks.

use crate::atoms::constants::{RESCAN_VERIFIER_CAP, VERIFIER_FALLBACK_LEXICAL_SCORE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AnalysisVerdict, IncomingMessage, MatchAnalysis, Subscription};
use crate::engine::albums::merge_fragments;
use crate::engine::dispatch::{assemble_payload, bucket_competitors, Dispatcher};
use crate::engine::enrich::EnrichOutcome;
use crate::engine::lexical::{self, TextProfile};
use crate::engine::messages::CachedMessage;
use crate::engine::semantic;
use crate::engine::state::EngineState;
use crate::engine::upstream::{ChatKind, UpstreamClient, UpstreamEvent, UpstreamMessage};
use crate::engine::verifier::{Verdict, VerdictProvider};
use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

// ── In-flight lock set ─────────────────────────────────────────────────────

pub type InflightKey = (i64, i64, i64);

/// Process-wide set of (subscription, message, group) triples currently
/// being verified. `try_acquire` never waits: a held key means another
/// pipeline invocation owns the pair and this one skips it.
pub struct InflightSet {
    inner: Arc<Mutex<HashSet<InflightKey>>>,
}

impl InflightSet {
    pub fn new() -> Self {
        InflightSet { inner: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub fn try_acquire(&self, key: InflightKey) -> Option<InflightGuard> {
        let mut set = self.inner.lock();
        if set.contains(&key) {
            return None;
        }
        set.insert(key);
        Some(InflightGuard { set: Arc::clone(&self.inner), key })
    }

    pub fn contains(&self, key: &InflightKey) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for InflightSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the key on drop — the unconditional-release path.
pub struct InflightGuard {
    set: Arc<Mutex<HashSet<InflightKey>>>,
    key: InflightKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

// ── Cascade stage outcome ──────────────────────────────────────────────────

/// Uniform result of the pre-verifier stages for one pair. The pipeline
/// iterates stages in order instead of nesting conditionals.
enum StageOutcome {
    Candidate { lexical_score: f64, semantic_score: Option<f64> },
    Rejected(MatchAnalysis),
}

// ── Pipeline ───────────────────────────────────────────────────────────────

pub struct Pipeline {
    state: Arc<EngineState>,
    upstream: Arc<dyn UpstreamClient>,
    dispatcher: Arc<Dispatcher>,
}

impl Pipeline {
    pub fn new(
        state: Arc<EngineState>,
        upstream: Arc<dyn UpstreamClient>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Pipeline { state, upstream, dispatcher }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamClient> {
        &self.upstream
    }

    /// Entry point for the upstream connection's callbacks.
    pub async fn handle_event(&self, event: UpstreamEvent) -> EngineResult<()> {
        match event {
            UpstreamEvent::NewMessage(msg) => self.process_message(msg).await,
            UpstreamEvent::MessageEdited { group_id, message_id, text } => {
                // Edits only refresh the cache; the original match record is
                // preserved and the pipeline does not re-run.
                self.state.messages.update_text(group_id, message_id, &text);
                Ok(())
            }
            UpstreamEvent::MessagesDeleted { group_id, message_ids } => {
                // Prior notifications are not retracted.
                self.state.messages.remove(group_id, &message_ids);
                Ok(())
            }
        }
    }

    /// Run one message through the full cascade. Shared by the live event
    /// path and history backfill.
    pub async fn process_message(&self, raw: UpstreamMessage) -> EngineResult<()> {
        if raw.chat_kind != ChatKind::Group || raw.is_service {
            return Ok(());
        }

        // Album handling: the first fragment claims the album id and pulls
        // the complete group; every other fragment exits here.
        let raw = match raw.album_id.clone() {
            Some(album_id) => {
                if !self.state.albums.claim(&album_id) {
                    return Ok(());
                }
                self.assemble_album(raw, &album_id).await
            }
            None => raw,
        };

        // Cache the original text for retrospective scans before enrichment
        // swaps the matching text.
        self.state.messages.add(
            raw.group_id,
            CachedMessage {
                id: raw.id,
                text: raw.text.clone(),
                sender_id: raw.sender_id,
                sender_name: raw.sender_name.clone(),
                date: raw.date,
                topic_id: raw.topic_id,
            },
        );

        let mut incoming = to_incoming(&raw);

        match self.state.enricher.enrich(&incoming.text).await {
            EnrichOutcome::NotUrlOnly => {}
            EnrichOutcome::Enriched(text) => {
                debug!("[pipeline] Enriched URL-only message {} with {} chars", incoming.id, text.len());
                incoming.text = text;
            }
            EnrichOutcome::Skip => {
                info!("[pipeline] Skipping URL-only message {} with no fetchable content", incoming.id);
                return Ok(());
            }
        }

        let subs = self.state.subs.get(incoming.group_id)?;
        if subs.is_empty() {
            return Ok(());
        }

        // Cascade every subscription; persist rejections immediately,
        // collect survivors.
        let profile = TextProfile::new(&incoming.text);
        let mut candidates: Vec<(&Subscription, f64, Option<f64>)> = Vec::new();
        for sub in subs.iter() {
            match self.evaluate(&profile, &incoming, sub).await {
                StageOutcome::Candidate { lexical_score, semantic_score } => {
                    candidates.push((sub, lexical_score, semantic_score));
                }
                StageOutcome::Rejected(analysis) => {
                    self.state.store.record_analysis(&analysis)?;
                }
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let distinct_users: HashSet<i64> = candidates.iter().map(|(s, _, _)| s.user_id).collect();
        let competitor_count = bucket_competitors(distinct_users.len());

        debug!(
            "[pipeline] Message {} in group {}: {} candidates, {} users",
            incoming.id,
            incoming.group_id,
            candidates.len(),
            distinct_users.len()
        );

        for (sub, lexical_score, semantic_score) in candidates {
            if let Err(e) = self
                .verify_candidate(&incoming, sub, lexical_score, semantic_score, competitor_count)
                .await
            {
                error!(
                    "[pipeline] Candidate (sub {}, msg {}) failed: {}",
                    sub.id, incoming.id, e
                );
            }
        }
        Ok(())
    }

    /// Fetch and merge an album's fragments. Falls back to the triggering
    /// fragment when the fetch fails.
    async fn assemble_album(&self, fragment: UpstreamMessage, album_id: &str) -> UpstreamMessage {
        match self.upstream.get_message_group(fragment.group_id, album_id).await {
            Ok(fragments) if !fragments.is_empty() => {
                let (text, media) = merge_fragments(&fragments);
                let mut base = fragments
                    .into_iter()
                    .min_by_key(|f| f.id)
                    .unwrap_or(fragment);
                base.text = text;
                base.media = media;
                base
            }
            Ok(_) => fragment,
            Err(e) => {
                warn!("[pipeline] Album {} fetch failed — using single fragment: {}", album_id, e);
                fragment
            }
        }
    }

    /// Pre-verifier cascade for one pair: lexical first, then semantic only
    /// when the lexical stage rejected on score and embeddings exist.
    async fn evaluate(
        &self,
        profile: &TextProfile,
        incoming: &IncomingMessage,
        sub: &Subscription,
    ) -> StageOutcome {
        let lex = lexical::evaluate(profile, sub, self.state.config.lexical_threshold);

        if let Some(phrase) = lex.rejected_phrase {
            return StageOutcome::Rejected(MatchAnalysis::rejected(
                sub.id,
                incoming.id,
                incoming.group_id,
                AnalysisVerdict::RejectedNegative,
                lex.score,
                None,
                Some(phrase),
            ));
        }
        if lex.passed {
            return StageOutcome::Candidate { lexical_score: lex.score, semantic_score: None };
        }

        match semantic::evaluate(
            &self.state.embedding,
            &incoming.text,
            sub,
            self.state.config.semantic_positive_threshold,
            self.state.config.semantic_negative_threshold,
        )
        .await
        {
            None => StageOutcome::Rejected(MatchAnalysis::rejected(
                sub.id,
                incoming.id,
                incoming.group_id,
                AnalysisVerdict::RejectedNgram,
                lex.score,
                None,
                None,
            )),
            Some(sem) if sem.passed => {
                StageOutcome::Candidate { lexical_score: lex.score, semantic_score: Some(sem.score) }
            }
            Some(sem) => StageOutcome::Rejected(MatchAnalysis::rejected(
                sub.id,
                incoming.id,
                incoming.group_id,
                AnalysisVerdict::RejectedSemantic,
                lex.score,
                Some(sem.score),
                sem.blocking_keyword,
            )),
        }
    }

    /// The per-candidate section: lock, ledger, verifier, outcome.
    async fn verify_candidate(
        &self,
        incoming: &IncomingMessage,
        sub: &Subscription,
        lexical_score: f64,
        semantic_score: Option<f64>,
        competitor_count: i64,
    ) -> EngineResult<()> {
        let key = (sub.id, incoming.id, incoming.group_id);
        let Some(_guard) = self.state.inflight.try_acquire(key) else {
            debug!("[pipeline] Pair {:?} already in flight — skipping", key);
            return Ok(());
        };
        // _guard releases the key on every return below, error or not.

        if self.state.store.is_analysis_matched(sub.id, incoming.id, incoming.group_id)? {
            return Ok(());
        }
        // A user already notified for this message through another
        // subscription gets no second notification, but the pair still
        // receives its own analysis record.
        let user_notified =
            self.state.store.is_notified(sub.user_id, incoming.id, incoming.group_id)?;

        match self.state.verifier.verify(incoming, sub).await {
            Ok(verdict) if verdict.is_match => {
                self.finish_match(
                    incoming,
                    sub,
                    lexical_score,
                    semantic_score,
                    verdict,
                    user_notified,
                    competitor_count,
                )
                .await
            }
            Ok(verdict) => {
                self.state.store.record_analysis(&MatchAnalysis {
                    subscription_id: sub.id,
                    message_id: incoming.id,
                    group_id: incoming.group_id,
                    verdict: AnalysisVerdict::RejectedVerifier,
                    lexical_score,
                    semantic_score,
                    verifier_confidence: Some(verdict.confidence),
                    verifier_reason: if verdict.reason.is_empty() {
                        None
                    } else {
                        Some(verdict.reason)
                    },
                    rejection_keyword: None,
                    notified_at: None,
                })?;
                Ok(())
            }
            Err(e) => {
                if lexical_score > VERIFIER_FALLBACK_LEXICAL_SCORE {
                    warn!(
                        "[pipeline] Verifier unavailable for (sub {}, msg {}) — high lexical score {:.2}, matching anyway: {}",
                        sub.id, incoming.id, lexical_score, e
                    );
                    let verdict = Verdict {
                        is_match: true,
                        confidence: lexical_score.min(1.0),
                        reason: "high lexical score".to_string(),
                        matched_items: vec![],
                        matched_photo_indices: vec![],
                    };
                    self.finish_match(
                        incoming,
                        sub,
                        lexical_score,
                        semantic_score,
                        verdict,
                        user_notified,
                        competitor_count,
                    )
                    .await
                } else {
                    debug!(
                        "[pipeline] Verifier unavailable for (sub {}, msg {}): {}",
                        sub.id, incoming.id, e
                    );
                    self.state.store.record_analysis(&MatchAnalysis::rejected(
                        sub.id,
                        incoming.id,
                        incoming.group_id,
                        AnalysisVerdict::RejectedVerifier,
                        lexical_score,
                        semantic_score,
                        None,
                    ))?;
                    Ok(())
                }
            }
        }
    }

    /// Record a confirmed match and, unless the user was already notified
    /// through another subscription, persist media and dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn finish_match(
        &self,
        incoming: &IncomingMessage,
        sub: &Subscription,
        lexical_score: f64,
        semantic_score: Option<f64>,
        verdict: Verdict,
        user_notified: bool,
        competitor_count: i64,
    ) -> EngineResult<()> {
        let mut analysis = MatchAnalysis {
            subscription_id: sub.id,
            message_id: incoming.id,
            group_id: incoming.group_id,
            verdict: AnalysisVerdict::Matched,
            lexical_score,
            semantic_score,
            verifier_confidence: Some(verdict.confidence),
            verifier_reason: if verdict.reason.is_empty() {
                None
            } else {
                Some(verdict.reason.clone())
            },
            rejection_keyword: None,
            notified_at: None,
        };

        if user_notified {
            debug!(
                "[pipeline] User {} already notified for msg {} — recording match only",
                sub.user_id, incoming.id
            );
            self.state.store.record_analysis(&analysis)?;
            return Ok(());
        }

        analysis.notified_at = Some(Utc::now().to_rfc3339());
        self.state.store.record_analysis(&analysis)?;
        self.state.store.mark_notified(sub.user_id, incoming.id, incoming.group_id)?;

        let excerpt: String = incoming.display_text.chars().take(200).collect();
        self.state.store.record_match(sub.user_id, incoming.group_id, incoming.id, &excerpt)?;

        // Media persistence degrades, never blocks the notification.
        for item in &incoming.media {
            match self.upstream.download_media(incoming.group_id, incoming.id, item).await {
                Ok(buffer) => {
                    if let Err(e) =
                        self.state.media.write_media(incoming.id, incoming.group_id, item.index, &buffer)
                    {
                        warn!("[pipeline] Media write failed for msg {}: {}", incoming.id, e);
                    }
                }
                Err(e) => {
                    warn!("[pipeline] Media download failed for msg {}: {}", incoming.id, e);
                }
            }
        }

        let notification = assemble_payload(incoming, sub, &verdict, competitor_count);
        let immediate = self.dispatcher.dispatch(notification).await?;
        info!(
            "[pipeline] Matched sub {} × msg {} (user {}, {})",
            sub.id,
            incoming.id,
            sub.user_id,
            if immediate { "delivered" } else { "delayed" }
        );
        Ok(())
    }

    // ── Retrospective scan ─────────────────────────────────────────────────

    /// Re-search a ready group's cached messages for one subscription.
    /// Candidates are sorted by lexical score and capped before the batched
    /// verifier call — the cost-control bound. Returns the match count.
    pub async fn retrospective_scan(&self, group_id: i64, sub: &Subscription) -> EngineResult<usize> {
        if !self.state.messages.is_ready(group_id) {
            return Err(EngineError::Other(format!(
                "group {} history not ready for retrospective scan",
                group_id
            )));
        }

        let cached = self.state.messages.get_messages(group_id);
        let (group_name, group_handle) = self
            .state
            .store
            .group_info(group_id)?
            .unwrap_or_else(|| (format!("group {}", group_id), None));

        let mut candidates: Vec<(IncomingMessage, f64, Option<f64>)> = Vec::new();
        for msg in &cached {
            let incoming = IncomingMessage {
                id: msg.id,
                group_id,
                group_name: group_name.clone(),
                group_handle: group_handle.clone(),
                topic_id: msg.topic_id,
                topic_title: None,
                text: msg.text.clone(),
                display_text: msg.text.clone(),
                media: vec![],
                sender_id: msg.sender_id,
                sender_name: msg.sender_name.clone(),
                sender_handle: None,
                date: msg.date,
            };
            let profile = TextProfile::new(&incoming.text);
            match self.evaluate(&profile, &incoming, sub).await {
                StageOutcome::Candidate { lexical_score, semantic_score } => {
                    candidates.push((incoming, lexical_score, semantic_score));
                }
                StageOutcome::Rejected(analysis) => {
                    self.state.store.record_analysis(&analysis)?;
                }
            }
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        if candidates.len() > RESCAN_VERIFIER_CAP {
            info!(
                "[pipeline] Retrospective scan group {}: capping {} candidates to {}",
                group_id,
                candidates.len(),
                RESCAN_VERIFIER_CAP
            );
            candidates.truncate(RESCAN_VERIFIER_CAP);
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        let refs: Vec<&IncomingMessage> = candidates.iter().map(|(m, _, _)| m).collect();
        let verdicts = self.state.verifier.verify_many(&refs, sub).await?;

        let mut matched = 0usize;
        for (i, (incoming, lexical_score, semantic_score)) in candidates.iter().enumerate() {
            let Some(verdict) = verdicts.get(&i) else { continue };
            let key = (sub.id, incoming.id, incoming.group_id);
            let Some(_guard) = self.state.inflight.try_acquire(key) else { continue };

            if self.state.store.is_analysis_matched(sub.id, incoming.id, group_id)? {
                continue;
            }
            if verdict.is_match {
                let user_notified =
                    self.state.store.is_notified(sub.user_id, incoming.id, group_id)?;
                self.finish_match(
                    incoming,
                    sub,
                    *lexical_score,
                    *semantic_score,
                    verdict.clone(),
                    user_notified,
                    0,
                )
                .await?;
                matched += 1;
            } else {
                self.state.store.record_analysis(&MatchAnalysis {
                    subscription_id: sub.id,
                    message_id: incoming.id,
                    group_id,
                    verdict: AnalysisVerdict::RejectedVerifier,
                    lexical_score: *lexical_score,
                    semantic_score: *semantic_score,
                    verifier_confidence: Some(verdict.confidence),
                    verifier_reason: if verdict.reason.is_empty() {
                        None
                    } else {
                        Some(verdict.reason.clone())
                    },
                    rejection_keyword: None,
                    notified_at: None,
                })?;
            }
        }
        info!(
            "[pipeline] Retrospective scan group {} sub {}: {} matched of {} candidates",
            group_id,
            sub.id,
            matched,
            refs.len()
        );
        Ok(matched)
    }
}

/// Build the pipeline's normalized message from a raw upstream one.
fn to_incoming(raw: &UpstreamMessage) -> IncomingMessage {
    IncomingMessage {
        id: raw.id,
        group_id: raw.group_id,
        group_name: raw.group_name.clone(),
        group_handle: raw.group_handle.clone(),
        topic_id: raw.topic_id,
        topic_title: raw.topic_title.clone(),
        text: raw.text.clone(),
        display_text: raw.text.clone(),
        media: raw.media.clone(),
        sender_id: raw.sender_id,
        sender_name: raw.sender_name.clone(),
        sender_handle: raw.sender_handle.clone(),
        date: raw.date,
    }
}
