// Keywatch Engine — Message Cache
//
// In-memory per-group store of the minimal fields the retrospective scan
// needs. Driven by the upstream new/edit/delete callbacks; a group becomes
// "ready" once its history backfill completes, and only ready groups are
// eligible for retrospective scans.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;

/// The slice of a message the retrospective scan cares about.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub id: i64,
    pub text: String,
    pub sender_id: i64,
    pub sender_name: String,
    pub date: i64,
    pub topic_id: Option<i64>,
}

#[derive(Default)]
struct GroupMessages {
    messages: HashMap<i64, CachedMessage>,
    ready: bool,
}

/// Process-wide recent-message cache, one bucket per group.
pub struct MessageCache {
    groups: Mutex<HashMap<i64, GroupMessages>>,
}

impl MessageCache {
    pub fn new() -> Self {
        MessageCache { groups: Mutex::new(HashMap::new()) }
    }

    pub fn add(&self, group_id: i64, message: CachedMessage) {
        let mut groups = self.groups.lock();
        groups.entry(group_id).or_default().messages.insert(message.id, message);
    }

    /// Edit callback: replace the cached text. The original match record is
    /// preserved — edits do not re-enter the pipeline.
    pub fn update_text(&self, group_id: i64, message_id: i64, text: &str) {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(&group_id) {
            if let Some(msg) = group.messages.get_mut(&message_id) {
                msg.text = text.to_string();
            }
        }
    }

    /// Delete callback. Prior notifications are not retracted.
    pub fn remove(&self, group_id: i64, message_ids: &[i64]) {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(&group_id) {
            for id in message_ids {
                group.messages.remove(id);
            }
        }
    }

    /// All cached messages for a group, unordered.
    pub fn get_messages(&self, group_id: i64) -> Vec<CachedMessage> {
        let groups = self.groups.lock();
        groups
            .get(&group_id)
            .map(|g| g.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Set after history backfill completes for the group. An aborted
    /// backfill leaves cached messages but never sets this.
    pub fn mark_ready(&self, group_id: i64) {
        let mut groups = self.groups.lock();
        groups.entry(group_id).or_default().ready = true;
        debug!("[messages] Group {} marked ready", group_id);
    }

    pub fn is_ready(&self, group_id: i64) -> bool {
        self.groups.lock().get(&group_id).map(|g| g.ready).unwrap_or(false)
    }

    /// (group count, total cached messages) — emitted with backfill stats.
    pub fn stats(&self) -> (usize, usize) {
        let groups = self.groups.lock();
        let total = groups.values().map(|g| g.messages.len()).sum();
        (groups.len(), total)
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, text: &str) -> CachedMessage {
        CachedMessage {
            id,
            text: text.into(),
            sender_id: 7,
            sender_name: "anna".into(),
            date: 1_700_000_000,
            topic_id: None,
        }
    }

    #[test]
    fn add_update_delete_roundtrip() {
        let cache = MessageCache::new();
        cache.add(100, msg(1, "original"));
        cache.update_text(100, 1, "edited");
        assert_eq!(cache.get_messages(100)[0].text, "edited");

        cache.remove(100, &[1]);
        assert!(cache.get_messages(100).is_empty());
    }

    #[test]
    fn update_of_unknown_message_is_noop() {
        let cache = MessageCache::new();
        cache.update_text(100, 42, "whatever");
        assert!(cache.get_messages(100).is_empty());
    }

    #[test]
    fn ready_flag_defaults_false() {
        let cache = MessageCache::new();
        cache.add(100, msg(1, "hi"));
        assert!(!cache.is_ready(100));
        cache.mark_ready(100);
        assert!(cache.is_ready(100));
        assert!(!cache.is_ready(200));
    }

    #[test]
    fn stats_count_groups_and_messages() {
        let cache = MessageCache::new();
        cache.add(100, msg(1, "a"));
        cache.add(100, msg(2, "b"));
        cache.add(200, msg(1, "c"));
        assert_eq!(cache.stats(), (2, 3));
    }
}
