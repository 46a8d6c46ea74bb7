// Keywatch Engine — Upstream Chat Client Abstraction
//
// The engine never speaks the chat protocol itself. It consumes this
// capability set, implemented by the embedding application (a real client
// bridge in production, fakes in tests). Events arrive through
// `Engine::handle_event`; per-connection ordering is the caller's contract.
//
// The error taxonomy matters operationally: history backfill branches on
// flood waits (sleep the server-specified time, no attempt consumed) versus
// other transient errors (exponential backoff + session re-creation) versus
// fatal ones (skip the group).

use crate::atoms::types::MediaItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error taxonomy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Server-imposed rate limit: wait this many seconds before retrying.
    #[error("flood wait {0}s")]
    FloodWait(u64),

    /// The channel/group is invalid or temporarily inaccessible.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// Network-level failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Unrecoverable failure (bad credentials, banned session…).
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// Whether the backfill retry loop should keep trying this group.
    /// Flood waits are transient too, but callers special-case them to
    /// honor the server-specified delay.
    pub fn is_transient(&self) -> bool {
        !matches!(self, UpstreamError::Fatal(_))
    }
}

// ── Wire-adjacent types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Group,
    Channel,
    Direct,
}

/// One raw upstream fragment, before album assembly and enrichment.
#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub id: i64,
    pub group_id: i64,
    pub group_name: String,
    pub group_handle: Option<String>,
    pub chat_kind: ChatKind,
    /// Join/leave/pin and similar service events carry no matchable content.
    pub is_service: bool,
    /// Present when this fragment belongs to a grouped post.
    pub album_id: Option<String>,
    pub text: String,
    pub media: Vec<MediaItem>,
    pub sender_id: i64,
    pub sender_name: String,
    pub sender_handle: Option<String>,
    pub topic_id: Option<i64>,
    pub topic_title: Option<String>,
    /// Unix timestamp (seconds).
    pub date: i64,
}

#[derive(Debug, Clone)]
pub struct ForumTopic {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ChatInfo {
    pub id: i64,
    pub name: String,
    pub handle: Option<String>,
    pub kind: ChatKind,
    pub is_forum: bool,
}

/// Downloaded media bytes plus the metadata the media store persists.
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// What the upstream connection delivers to the engine.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    NewMessage(UpstreamMessage),
    MessageEdited { group_id: i64, message_id: i64, text: String },
    MessagesDeleted { group_id: i64, message_ids: Vec<i64> },
}

// ── Capability set ─────────────────────────────────────────────────────────

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Establish the session (may prompt for interactive login in a real
    /// implementation). Called at startup and between backfill attempts.
    async fn start_session(&self) -> Result<(), UpstreamError>;

    async fn destroy_session(&self) -> Result<(), UpstreamError>;

    /// Fetch every fragment of a grouped post in one call.
    async fn get_message_group(
        &self,
        group_id: i64,
        album_id: &str,
    ) -> Result<Vec<UpstreamMessage>, UpstreamError>;

    /// Up to `limit` archived messages with id greater than `min_id`
    /// (oldest first). `topic_id` scopes forum-structured groups.
    async fn iter_history(
        &self,
        group_id: i64,
        topic_id: Option<i64>,
        min_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UpstreamMessage>, UpstreamError>;

    async fn iter_forum_topics(&self, group_id: i64) -> Result<Vec<ForumTopic>, UpstreamError>;

    async fn iter_dialogs(&self) -> Result<Vec<ChatInfo>, UpstreamError>;

    async fn get_chat(&self, group_id: i64) -> Result<ChatInfo, UpstreamError>;

    /// Whether the given user is currently a member of the chat.
    async fn get_chat_member(&self, group_id: i64, user_id: i64) -> Result<bool, UpstreamError>;

    /// Join by public handle or invite link.
    async fn join_chat(&self, handle: &str) -> Result<ChatInfo, UpstreamError>;

    /// Download one attachment as an in-memory buffer.
    async fn download_media(
        &self,
        group_id: i64,
        message_id: i64,
        media: &MediaItem,
    ) -> Result<MediaBuffer, UpstreamError>;
}

// ── Test helpers ───────────────────────────────────────────────────────────
