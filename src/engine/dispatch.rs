// Keywatch Engine — Notification Dispatcher
//
// Every candidate match either goes out immediately or is held in a delayed
// queue; the choice belongs to a pluggable `DeliveryPolicy`. The sink that
// actually sends the notification is equally abstract — the engine core
// produces payloads, external surfaces consume them.
//
// Payload assembly: when the verifier extracted a matched-item subset, the
// notification shows only those bullets instead of the full post; media is
// filtered to the matched-photo subset when it is a proper subset.

use crate::atoms::constants::{COMPETITOR_BUCKET, DISPATCH_DELAY_HOLD_SECS, DISPATCH_RELEASE_TICK_SECS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{IncomingMessage, Notification, Subscription};
use crate::engine::verifier::Verdict;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Policy & sink seams ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct DeliveryDecision {
    pub should_delay: bool,
    pub has_priority_competition: bool,
}

/// Decides, per (user, message, group), whether delivery waits.
#[async_trait]
pub trait DeliveryPolicy: Send + Sync {
    async fn decide(&self, user_id: i64, message_id: i64, group_id: i64) -> DeliveryDecision;
}

/// Default policy: deliver everything immediately.
pub struct ImmediateDelivery;

#[async_trait]
impl DeliveryPolicy for ImmediateDelivery {
    async fn decide(&self, _user_id: i64, _message_id: i64, _group_id: i64) -> DeliveryDecision {
        DeliveryDecision { should_delay: false, has_priority_competition: false }
    }
}

/// External surface that renders and sends a notification to the user.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> EngineResult<()>;
}

// ── Dispatcher ─────────────────────────────────────────────────────────────

struct DelayedNotification {
    notification: Notification,
    release_at: Instant,
}

pub struct Dispatcher {
    policy: Arc<dyn DeliveryPolicy>,
    sink: Arc<dyn NotificationSink>,
    queue: Mutex<VecDeque<DelayedNotification>>,
    hold: Duration,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn DeliveryPolicy>, sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_hold(policy, sink, Duration::from_secs(DISPATCH_DELAY_HOLD_SECS))
    }

    pub fn with_hold(
        policy: Arc<dyn DeliveryPolicy>,
        sink: Arc<dyn NotificationSink>,
        hold: Duration,
    ) -> Self {
        Dispatcher { policy, sink, queue: Mutex::new(VecDeque::new()), hold }
    }

    /// Route one notification through the priority policy. Returns true
    /// when it was delivered immediately, false when enqueued.
    pub async fn dispatch(&self, notification: Notification) -> EngineResult<bool> {
        let decision = self
            .policy
            .decide(notification.user_id, notification.message_id, notification.group_id)
            .await;

        if decision.should_delay {
            debug!(
                "[dispatch] Delaying notification for user {} (competition={})",
                notification.user_id, decision.has_priority_competition
            );
            self.queue
                .lock()
                .push_back(DelayedNotification { notification, release_at: Instant::now() + self.hold });
            return Ok(false);
        }

        self.sink.deliver(&notification).await?;
        Ok(true)
    }

    /// Deliver every queued notification whose hold has expired.
    pub async fn release_due(&self) -> EngineResult<usize> {
        let due: Vec<Notification> = {
            let mut queue = self.queue.lock();
            let now = Instant::now();
            let mut due = Vec::new();
            while queue.front().is_some_and(|d| d.release_at <= now) {
                due.push(queue.pop_front().unwrap().notification);
            }
            due
        };

        let mut delivered = 0;
        for notification in due {
            match self.sink.deliver(&notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "[dispatch] Delayed delivery failed for user {}: {}",
                    notification.user_id, e
                ),
            }
        }
        if delivered > 0 {
            info!("[dispatch] Released {} delayed notifications", delivered);
        }
        Ok(delivered)
    }

    /// Drain loop for delayed notifications. Runs until the stop signal.
    pub async fn run_release_loop(&self, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(DISPATCH_RELEASE_TICK_SECS)).await;
            if let Err(e) = self.release_due().await {
                warn!("[dispatch] Release pass failed: {}", e);
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

// ── Payload assembly ───────────────────────────────────────────────────────

/// Build the user-visible payload for one matched candidate.
pub fn assemble_payload(
    message: &IncomingMessage,
    sub: &Subscription,
    verdict: &Verdict,
    competitor_count: i64,
) -> Notification {
    let text = if verdict.matched_items.is_empty() {
        message.display_text.clone()
    } else {
        verdict
            .matched_items
            .iter()
            .map(|item| format!("• {}", item))
            .collect::<Vec<_>>()
            .join("\n")
    };

    // Filter media only when the verifier picked a proper subset; an empty
    // or full selection keeps everything.
    let media = if !verdict.matched_photo_indices.is_empty()
        && verdict.matched_photo_indices.len() < message.media.len()
    {
        message
            .media
            .iter()
            .filter(|m| verdict.matched_photo_indices.contains(&m.index))
            .cloned()
            .collect()
    } else {
        message.media.clone()
    };

    Notification {
        user_id: sub.user_id,
        group_name: message.group_name.clone(),
        group_handle: message.group_handle.clone(),
        message_id: message.id,
        group_id: message.group_id,
        text,
        media,
        verifier_reason: if verdict.reason.is_empty() { None } else { Some(verdict.reason.clone()) },
        subscription_query: sub.query.clone(),
        competitor_count,
    }
}

/// Round a distinct-user count to the nearest multiple of five. A single
/// interested user reads as zero competition; for small multi-user counts
/// the bucketed value is preserved even when rounding lands on zero.
pub fn bucket_competitors(distinct_users: usize) -> i64 {
    if distinct_users <= 1 {
        return 0;
    }
    let n = distinct_users as i64;
    ((n + COMPETITOR_BUCKET / 2) / COMPETITOR_BUCKET) * COMPETITOR_BUCKET
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MediaItem;

    struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink { delivered: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> EngineResult<()> {
            self.delivered.lock().push(notification.clone());
            Ok(())
        }
    }

    struct AlwaysDelay;

    #[async_trait]
    impl DeliveryPolicy for AlwaysDelay {
        async fn decide(&self, _u: i64, _m: i64, _g: i64) -> DeliveryDecision {
            DeliveryDecision { should_delay: true, has_priority_competition: true }
        }
    }

    fn message_with_media(count: usize) -> IncomingMessage {
        IncomingMessage {
            id: 5,
            group_id: 100,
            group_name: "market".into(),
            group_handle: Some("market_msk".into()),
            topic_id: None,
            topic_title: None,
            text: "Продаю iPhone 15 Pro и чехол".into(),
            display_text: "Продаю iPhone 15 Pro и чехол".into(),
            media: (0..count)
                .map(|i| MediaItem {
                    index: i,
                    mime: "image/jpeg".into(),
                    width: None,
                    height: None,
                    file_ref: format!("f{}", i),
                })
                .collect(),
            sender_id: 7,
            sender_name: "anna".into(),
            sender_handle: None,
            date: 1_700_000_000,
        }
    }

    fn sample_sub() -> Subscription {
        Subscription {
            id: 1,
            user_id: 10,
            query: "iphone 15 pro".into(),
            keywords: vec!["iphone".into()],
            negative_keywords: vec![],
            description: String::new(),
            embeddings: vec![],
            active: true,
            group_ids: vec![100],
        }
    }

    fn verdict(items: Vec<&str>, photos: Vec<usize>) -> Verdict {
        Verdict {
            is_match: true,
            confidence: 0.9,
            reason: "fits the query".into(),
            matched_items: items.into_iter().map(String::from).collect(),
            matched_photo_indices: photos,
        }
    }

    #[test]
    fn payload_uses_bullets_when_items_matched() {
        let n = assemble_payload(&message_with_media(0), &sample_sub(), &verdict(vec!["iPhone 15 Pro"], vec![]), 5);
        assert_eq!(n.text, "• iPhone 15 Pro");
        assert_eq!(n.verifier_reason.as_deref(), Some("fits the query"));
        assert_eq!(n.competitor_count, 5);
    }

    #[test]
    fn payload_falls_back_to_original_text() {
        let n = assemble_payload(&message_with_media(0), &sample_sub(), &verdict(vec![], vec![]), 0);
        assert_eq!(n.text, "Продаю iPhone 15 Pro и чехол");
    }

    #[test]
    fn media_filtered_only_on_proper_subset() {
        // Proper subset: filter.
        let n = assemble_payload(&message_with_media(3), &sample_sub(), &verdict(vec![], vec![0, 2]), 0);
        assert_eq!(n.media.iter().map(|m| m.index).collect::<Vec<_>>(), vec![0, 2]);

        // Full selection: keep everything.
        let n = assemble_payload(&message_with_media(2), &sample_sub(), &verdict(vec![], vec![0, 1]), 0);
        assert_eq!(n.media.len(), 2);

        // Empty selection: keep everything.
        let n = assemble_payload(&message_with_media(2), &sample_sub(), &verdict(vec![], vec![]), 0);
        assert_eq!(n.media.len(), 2);
    }

    #[test]
    fn competitor_bucketing() {
        assert_eq!(bucket_competitors(0), 0);
        assert_eq!(bucket_competitors(1), 0);
        assert_eq!(bucket_competitors(2), 0);
        assert_eq!(bucket_competitors(3), 5);
        assert_eq!(bucket_competitors(7), 5);
        assert_eq!(bucket_competitors(8), 10);
        assert_eq!(bucket_competitors(12), 10);
        assert_eq!(bucket_competitors(13), 15);
    }

    #[tokio::test]
    async fn immediate_policy_delivers_now() {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::new(Arc::new(ImmediateDelivery), sink.clone());
        let n = assemble_payload(&message_with_media(0), &sample_sub(), &verdict(vec![], vec![]), 0);
        assert!(dispatcher.dispatch(n).await.unwrap());
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(dispatcher.queued_len(), 0);
    }

    #[tokio::test]
    async fn delay_policy_enqueues_then_releases() {
        let sink = RecordingSink::new();
        let dispatcher =
            Dispatcher::with_hold(Arc::new(AlwaysDelay), sink.clone(), Duration::from_millis(0));
        let n = assemble_payload(&message_with_media(0), &sample_sub(), &verdict(vec![], vec![]), 0);
        assert!(!dispatcher.dispatch(n).await.unwrap());
        assert_eq!(dispatcher.queued_len(), 1);
        assert!(sink.delivered.lock().is_empty());

        let released = dispatcher.release_due().await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(dispatcher.queued_len(), 0);
    }
}
