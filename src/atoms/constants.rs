// ── Keywatch Atoms: Constants ──────────────────────────────────────────────
// All tunable thresholds, weights, and windows for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Lexical matching ───────────────────────────────────────────────────────
// A (subscription × message) pair passes the lexical stage when its combined
// score clears LEXICAL_THRESHOLD. The combined score is an equal mix of the
// keyword score and the description score; each of those is itself a
// weighted blend — see engine/lexical.rs.
pub const LEXICAL_THRESHOLD: f64 = 0.15;

/// A single keyword counts as "covered" when this fraction of its character
/// trigrams appears in the message trigram set.
pub const KEYWORD_COVERAGE_THRESHOLD: f64 = 0.7;

/// Negative phrases reject at a stricter coverage bar than positive keywords
/// match, so a morphological variant still trips them but a loose scatter of
/// shared trigrams does not.
pub const NEGATIVE_COVERAGE_THRESHOLD: f64 = 0.85;

/// Keyword score = BINARY_COVERAGE_WEIGHT · (fraction of keywords covered)
///               + SOFT_COVERAGE_WEIGHT  · (mean per-keyword coverage).
pub const BINARY_COVERAGE_WEIGHT: f64 = 0.7;
pub const SOFT_COVERAGE_WEIGHT: f64 = 0.3;

/// Description score = DESC_TRIGRAM_WEIGHT · trigram Jaccard
///                   + DESC_BIGRAM_WEIGHT  · word-bigram Jaccard.
pub const DESC_TRIGRAM_WEIGHT: f64 = 0.3;
pub const DESC_BIGRAM_WEIGHT: f64 = 0.7;

/// When the verifier transport fails, a candidate whose lexical score
/// exceeds this bar is treated as matched anyway.
pub const VERIFIER_FALLBACK_LEXICAL_SCORE: f64 = 0.7;

// ── Semantic matching ──────────────────────────────────────────────────────
/// The pair passes when the sum of positive-keyword cosine similarities
/// reaches this value.
pub const SEMANTIC_POSITIVE_THRESHOLD: f64 = 0.6;

/// The pair is rejected when any negative-keyword cosine similarity
/// exceeds this value.
pub const SEMANTIC_NEGATIVE_THRESHOLD: f64 = 0.65;

/// How long a failed embedding-server health probe is believed. While the
/// server is considered unreachable, subscriptions fall back to lexical-only.
pub const EMBEDDING_HEALTH_TTL_SECS: u64 = 60;

// ── Caches & windows ───────────────────────────────────────────────────────
/// Per-group subscription cache entry lifetime. Popular groups see hundreds
/// of messages per minute; a per-message store query is unacceptable.
pub const SUBSCRIPTION_CACHE_TTL_SECS: u64 = 60;

/// An album id stays in the assembler's seen-table this long. Fragments of
/// one album arrive within ~2 s; 30 s absorbs upstream retries.
pub const ALBUM_WINDOW_SECS: u64 = 30;

// ── URL enrichment ─────────────────────────────────────────────────────────
/// A message is "URL-only" when, after removing URLs, fewer than this many
/// characters of content remain.
pub const URL_ONLY_MAX_RESIDUE_CHARS: usize = 10;

/// At most this many URLs are fetched per message.
pub const ENRICH_MAX_URLS: usize = 2;

/// Per-fetch timeout and extracted-text cap.
pub const ENRICH_FETCH_TIMEOUT_SECS: u64 = 10;
pub const ENRICH_MAX_TEXT_CHARS: usize = 8_000;

// ── History backfill ───────────────────────────────────────────────────────
/// How many most-recent messages are replayed per group.
pub const BACKFILL_MESSAGE_LIMIT: usize = 1_000;

/// Per-topic bound for forum-structured groups.
pub const BACKFILL_TOPIC_MESSAGE_LIMIT: usize = 200;

/// Deterministic inter-group delay — the backfill's own rate limit.
pub const BACKFILL_INTER_GROUP_DELAY_SECS: u64 = 2;

/// Transient-error retry: exponential backoff base and cap, bounded attempts.
/// Flood-wait errors sleep the server-specified duration instead and do not
/// consume an attempt.
pub const BACKFILL_BACKOFF_BASE_SECS: u64 = 2;
pub const BACKFILL_BACKOFF_CAP_SECS: u64 = 120;
pub const BACKFILL_MAX_ATTEMPTS: u32 = 10;

// ── Retrospective scan ─────────────────────────────────────────────────────
/// Cost control: at most this many sorted candidates reach the batched
/// verifier in one scan.
pub const RESCAN_VERIFIER_CAP: usize = 10;

// ── Notification dispatch ──────────────────────────────────────────────────
/// Competitor counts are bucketed to multiples of this.
pub const COMPETITOR_BUCKET: i64 = 5;

/// How long a delayed notification is held before release, and how often
/// the release loop wakes to drain due entries.
pub const DISPATCH_DELAY_HOLD_SECS: u64 = 60;
pub const DISPATCH_RELEASE_TICK_SECS: u64 = 5;
