// Keywatch Engine — History Backfill
//
// Replays each monitored group's recent history through the same pipeline
// the live path uses, so archived posts get the same cascade, the same
// ledger, the same dedup. Rate-limited by a deterministic inter-group
// delay; resilient through three regimes:
//   flood wait  → sleep the server-specified seconds, same attempt
//   transient   → exponential backoff (2s → 2min), ≤10 attempts,
//                 session re-created between attempts
//   fatal       → skip the group, keep going
//
// The incremental cursor (highest replayed message id, persisted per
// group) makes restarts cheap: iter_history resumes past it, so a message
// already in the ledger is never replayed. A cancelled backfill keeps its
// cached messages but does not mark the group ready.

use crate::atoms::constants::{
    BACKFILL_BACKOFF_BASE_SECS, BACKFILL_BACKOFF_CAP_SECS, BACKFILL_INTER_GROUP_DELAY_SECS,
    BACKFILL_MAX_ATTEMPTS, BACKFILL_TOPIC_MESSAGE_LIMIT,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::pipeline::Pipeline;
use crate::engine::upstream::{UpstreamClient, UpstreamError, UpstreamMessage};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct BackfillStats {
    pub groups_completed: usize,
    pub groups_skipped: usize,
    pub messages_replayed: usize,
}

/// Backfill every group in the union of subscription group lists. Honors
/// the stop signal at every suspension point.
pub async fn run(pipeline: &Pipeline, stop: &Arc<AtomicBool>) -> EngineResult<BackfillStats> {
    let groups = pipeline.state().store.all_subscribed_groups()?;
    info!("[backfill] Starting for {} groups", groups.len());

    let mut stats = BackfillStats::default();
    for group_id in groups {
        if stop.load(Ordering::Relaxed) {
            info!("[backfill] Stop signal received — aborting");
            break;
        }

        match backfill_group_with_retry(pipeline, group_id, stop).await {
            Ok(replayed) => {
                pipeline.state().messages.mark_ready(group_id);
                pipeline.state().store.record_backfill_stats(group_id, replayed as i64)?;
                stats.groups_completed += 1;
                stats.messages_replayed += replayed;
                info!("[backfill] Group {} done: {} messages replayed", group_id, replayed);
            }
            Err(e) => {
                warn!("[backfill] Group {} skipped: {}", group_id, e);
                stats.groups_skipped += 1;
            }
        }

        tokio::time::sleep(Duration::from_secs(BACKFILL_INTER_GROUP_DELAY_SECS)).await;
    }

    let (cached_groups, cached_messages) = pipeline.state().messages.stats();
    info!(
        "[backfill] Finished: {} groups completed, {} skipped, {} messages replayed; cache holds {} messages across {} groups",
        stats.groups_completed, stats.groups_skipped, stats.messages_replayed, cached_messages, cached_groups
    );
    Ok(stats)
}

/// Retry shell around one group's replay.
async fn backfill_group_with_retry(
    pipeline: &Pipeline,
    group_id: i64,
    stop: &Arc<AtomicBool>,
) -> EngineResult<usize> {
    let mut attempt: u32 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(EngineError::Other("backfill cancelled".into()));
        }

        match backfill_group(pipeline, group_id, stop).await {
            Ok(replayed) => return Ok(replayed),
            Err(EngineError::Upstream(UpstreamError::FloodWait(secs))) => {
                // Server-directed wait: sleep exactly that long, do not
                // consume an attempt.
                warn!("[backfill] Group {}: flood wait {}s", group_id, secs);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            Err(EngineError::Upstream(e)) if e.is_transient() => {
                attempt += 1;
                if attempt >= BACKFILL_MAX_ATTEMPTS {
                    return Err(EngineError::Other(format!(
                        "group {}: gave up after {} attempts: {}",
                        group_id, attempt, e
                    )));
                }
                let delay = transient_backoff_secs(attempt);
                warn!(
                    "[backfill] Group {}: transient error ({}) — retry {} in {}s with fresh session",
                    group_id, e, attempt, delay
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;

                // Re-create the upstream session between attempts.
                if let Err(destroy_err) = pipeline.upstream().destroy_session().await {
                    warn!("[backfill] Session destroy failed: {}", destroy_err);
                }
                if let Err(start_err) = pipeline.upstream().start_session().await {
                    warn!("[backfill] Session restart failed: {}", start_err);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff for transient errors: base 2s, doubling, capped at
/// two minutes. `attempt` is 1-based.
fn transient_backoff_secs(attempt: u32) -> u64 {
    (BACKFILL_BACKOFF_BASE_SECS << (attempt - 1).min(16)).min(BACKFILL_BACKOFF_CAP_SECS)
}

/// One pass over a group's history. Forum groups iterate per-topic with a
/// per-topic bound; flat groups pull one window.
async fn backfill_group(
    pipeline: &Pipeline,
    group_id: i64,
    stop: &Arc<AtomicBool>,
) -> EngineResult<usize> {
    let upstream = pipeline.upstream();
    let store = &pipeline.state().store;

    let chat = upstream.get_chat(group_id).await?;
    store.upsert_group(chat.id, &chat.name, chat.handle.as_deref(), chat.is_forum)?;

    let cursor = store.group_cursor(group_id)?;
    let limit = pipeline.state().config.backfill_message_limit;

    let mut replayed = 0usize;
    if chat.is_forum {
        let topics = upstream.iter_forum_topics(group_id).await?;
        info!("[backfill] Group {} is a forum with {} topics", group_id, topics.len());
        for topic in topics {
            if stop.load(Ordering::Relaxed) {
                return Err(EngineError::Other("backfill cancelled".into()));
            }
            let messages = upstream
                .iter_history(group_id, Some(topic.id), cursor, BACKFILL_TOPIC_MESSAGE_LIMIT)
                .await?;
            replayed += replay_messages(pipeline, group_id, messages, stop).await?;
        }
    } else {
        let messages = upstream.iter_history(group_id, None, cursor, limit).await?;
        replayed += replay_messages(pipeline, group_id, messages, stop).await?;
    }
    Ok(replayed)
}

/// Feed archived messages through the pipeline, advancing the cursor after
/// each one so a restart never repeats work.
async fn replay_messages(
    pipeline: &Pipeline,
    group_id: i64,
    messages: Vec<UpstreamMessage>,
    stop: &Arc<AtomicBool>,
) -> EngineResult<usize> {
    let mut count = 0usize;
    for message in messages {
        if stop.load(Ordering::Relaxed) {
            return Err(EngineError::Other("backfill cancelled".into()));
        }
        let message_id = message.id;
        if let Err(e) = pipeline.process_message(message).await {
            warn!("[backfill] Message {} in group {} failed: {}", message_id, group_id, e);
        }
        pipeline.state().store.set_group_cursor(group_id, message_id)?;
        count += 1;
    }
    Ok(count)
}
