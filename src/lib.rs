// Keywatch — keyword-subscription engine for group chats.
//
// Users register natural-language queries; the engine delivers exactly-once
// notifications whenever a new group message matches. The embedding
// application supplies an upstream chat client (the `UpstreamClient` trait),
// a delivery policy, and a notification sink; everything else — the
// cascade, the caches, the dedup ledger, history backfill — lives here.
//
// Wiring: build an `EngineConfig` (usually `EngineConfig::from_env()`),
// construct `EngineState`, wrap a `Dispatcher` around your policy and sink,
// and hand all three to `Pipeline::new`. Feed upstream events into
// `Pipeline::handle_event` and run `engine::backfill::run` alongside.

// ── Keywatch Atoms (constants, error types, data model) ────────────────────
pub mod atoms;

// ── Keywatch Engine ────────────────────────────────────────────────────────
pub mod engine;
