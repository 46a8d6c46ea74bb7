// ── Keywatch Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Upstream, Verifier…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • The upstream chat client has its own error taxonomy (`UpstreamError` in
//     engine/upstream.rs) nested here under the `Upstream` variant, because
//     the backfill retry policy branches on its shape.
//   • No variant carries secret material (tokens, credentials) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Upstream chat client failure (flood wait, invalid channel, transport…).
    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::engine::upstream::UpstreamError),

    /// Verifier service HTTP or API-level failure.
    #[error("Verifier error: {0}")]
    Verifier(String),

    /// Embedding server HTTP or API-level failure.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Engine configuration is invalid or missing. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` and `.ok_or("…")` on `Result<T, String>` shapes without
// boilerplate conversions at every call site.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;
