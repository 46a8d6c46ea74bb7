// Keywatch Engine — Album Assembler
//
// A single logical post can arrive as several upstream fragments sharing an
// album identifier, interleaved within a short window. The first observed
// fragment claims the album and triggers one fetch of the complete group;
// every later fragment is dropped. Claims are evicted after a fixed window.

use crate::atoms::constants::ALBUM_WINDOW_SECS;
use crate::atoms::types::MediaItem;
use crate::engine::upstream::UpstreamMessage;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks which album ids have already entered the pipeline.
pub struct AlbumAssembler {
    seen: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl AlbumAssembler {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(ALBUM_WINDOW_SECS))
    }

    pub fn with_window(window: Duration) -> Self {
        AlbumAssembler { seen: Mutex::new(HashMap::new()), window }
    }

    /// Claim an album id. Returns true exactly once per id per window — the
    /// caller that gets `true` fetches and processes the whole album, every
    /// other fragment exits the pipeline.
    pub fn claim(&self, album_id: &str) -> bool {
        let mut seen = self.seen.lock();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        if seen.contains_key(album_id) {
            debug!("[albums] Dropping extra fragment for album {}", album_id);
            return false;
        }
        seen.insert(album_id.to_string(), now);
        true
    }
}

impl Default for AlbumAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a fetched album into one text + media list. The caption may sit on
/// any fragment — the first non-empty one wins; media is concatenated in
/// fragment order and re-indexed.
pub fn merge_fragments(fragments: &[UpstreamMessage]) -> (String, Vec<MediaItem>) {
    let text = fragments
        .iter()
        .map(|f| f.text.trim())
        .find(|t| !t.is_empty())
        .unwrap_or("")
        .to_string();

    let mut media = Vec::new();
    for fragment in fragments {
        for item in &fragment.media {
            media.push(MediaItem { index: media.len(), ..item.clone() });
        }
    }
    (text, media)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::upstream::test_support::plain_message;

    #[test]
    fn first_claim_wins_rest_drop() {
        let assembler = AlbumAssembler::new();
        assert!(assembler.claim("album-a"));
        assert!(!assembler.claim("album-a"));
        assert!(!assembler.claim("album-a"));
        assert!(assembler.claim("album-b"));
    }

    #[test]
    fn claims_evict_after_window() {
        let assembler = AlbumAssembler::with_window(Duration::from_millis(0));
        assert!(assembler.claim("album-a"));
        // Zero window: the claim is already stale on the next fragment.
        assert!(assembler.claim("album-a"));
    }

    #[test]
    fn merge_takes_first_nonempty_caption_and_all_media() {
        let mut first = plain_message(1, 100, "");
        first.media = vec![MediaItem {
            index: 0,
            mime: "image/jpeg".into(),
            width: Some(800),
            height: Some(600),
            file_ref: "f1".into(),
        }];
        let mut second = plain_message(2, 100, "Продаю велосипед");
        second.media = vec![MediaItem {
            index: 0,
            mime: "image/jpeg".into(),
            width: None,
            height: None,
            file_ref: "f2".into(),
        }];
        let mut third = plain_message(3, 100, "");
        third.media = vec![MediaItem {
            index: 0,
            mime: "image/png".into(),
            width: None,
            height: None,
            file_ref: "f3".into(),
        }];

        let (text, media) = merge_fragments(&[first, second, third]);
        assert_eq!(text, "Продаю велосипед");
        assert_eq!(media.len(), 3);
        // Re-indexed in fragment order.
        assert_eq!(media[0].file_ref, "f1");
        assert_eq!(media[1].file_ref, "f2");
        assert_eq!(media[2].file_ref, "f3");
        assert_eq!(media.iter().map(|m| m.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
