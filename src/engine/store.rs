// Keywatch Engine — Persistent Store
//
// SQLite via rusqlite, one connection behind a parking_lot mutex, WAL mode.
// Holds everything that must survive a restart:
//   • subscription + group + user registries (fed by the admin surface)
//   • per-keyword embedding vectors, versioned by keyword revision
//   • the dedup ledger: per-pair analyses and per-user notified records
//   • flat match records for backward-compatible external consumers
//
// Ledger writes are idempotent by construction (INSERT OR IGNORE on
// composite primary keys); a duplicate insert is a no-op, never an error.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{AnalysisVerdict, KeywordEmbedding, MatchAnalysis, Subscription};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Default database location under the home directory.
pub fn default_db_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    let dir = home.join(".keywatch");
    std::fs::create_dir_all(&dir).ok();
    dir.join("engine.db")
}

/// Thread-safe database wrapper.
pub struct EngineStore {
    conn: Mutex<Connection>,
}

impl EngineStore {
    /// Open (or create) the engine database and initialize tables.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[store] Opening engine store at {:?}", path);
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        // WAL for better concurrent read performance; harmless in memory.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                query TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                keywords_json TEXT NOT NULL DEFAULT '[]',
                negative_keywords_json TEXT NOT NULL DEFAULT '[]',
                active INTEGER NOT NULL DEFAULT 1,
                keyword_revision INTEGER NOT NULL DEFAULT 0,
                embedded_revision INTEGER NOT NULL DEFAULT -1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS subscription_groups (
                subscription_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                PRIMARY KEY (subscription_id, group_id)
            );

            CREATE INDEX IF NOT EXISTS idx_subscription_groups_group
                ON subscription_groups(group_id);

            CREATE TABLE IF NOT EXISTS keyword_embeddings (
                subscription_id INTEGER NOT NULL,
                keyword TEXT NOT NULL,
                negative INTEGER NOT NULL DEFAULT 0,
                vector BLOB NOT NULL,
                PRIMARY KEY (subscription_id, keyword, negative)
            );

            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                handle TEXT,
                is_forum INTEGER NOT NULL DEFAULT 0,
                last_seen_message_id INTEGER,
                backfilled_at TEXT,
                backfill_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                handle TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS analyses (
                subscription_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                verdict TEXT NOT NULL,
                lexical_score REAL NOT NULL DEFAULT 0,
                semantic_score REAL,
                verifier_confidence REAL,
                verifier_reason TEXT,
                rejection_keyword TEXT,
                notified_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (subscription_id, message_id, group_id)
            );

            CREATE INDEX IF NOT EXISTS idx_analyses_message
                ON analyses(group_id, message_id);

            CREATE TABLE IF NOT EXISTS notified (
                user_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                notified_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, message_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                excerpt TEXT NOT NULL DEFAULT '',
                matched_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;

        Ok(EngineStore { conn: Mutex::new(conn) })
    }

    // ── Subscription registry ──────────────────────────────────────────────

    /// Insert or update a subscription. Enforces the positive/negative
    /// disjointness invariant and bumps the keyword revision when the
    /// keyword set changes, which invalidates stored embeddings.
    pub fn upsert_subscription(&self, sub: &Subscription) -> EngineResult<()> {
        for kw in &sub.keywords {
            if sub.negative_keywords.iter().any(|n| n == kw) {
                return Err(EngineError::Config(format!(
                    "subscription {}: keyword '{}' is both positive and negative",
                    sub.id, kw
                )));
            }
        }

        let keywords_json = serde_json::to_string(&sub.keywords)?;
        let negatives_json = serde_json::to_string(&sub.negative_keywords)?;
        let conn = self.conn.lock();

        let existing: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT keywords_json, negative_keywords_json, keyword_revision
                 FROM subscriptions WHERE id = ?1",
                params![sub.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let revision = match &existing {
            Some((old_kw, old_neg, rev)) if *old_kw == keywords_json && *old_neg == negatives_json => *rev,
            Some((_, _, rev)) => rev + 1,
            None => 0,
        };

        conn.execute(
            "INSERT INTO subscriptions
                 (id, user_id, query, description, keywords_json, negative_keywords_json,
                  active, keyword_revision, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                 user_id = excluded.user_id,
                 query = excluded.query,
                 description = excluded.description,
                 keywords_json = excluded.keywords_json,
                 negative_keywords_json = excluded.negative_keywords_json,
                 active = excluded.active,
                 keyword_revision = excluded.keyword_revision,
                 updated_at = datetime('now')",
            params![
                sub.id,
                sub.user_id,
                sub.query,
                sub.description,
                keywords_json,
                negatives_json,
                sub.active as i64,
                revision,
            ],
        )?;

        conn.execute(
            "DELETE FROM subscription_groups WHERE subscription_id = ?1",
            params![sub.id],
        )?;
        for group_id in &sub.group_ids {
            conn.execute(
                "INSERT OR IGNORE INTO subscription_groups (subscription_id, group_id)
                 VALUES (?1, ?2)",
                params![sub.id, group_id],
            )?;
        }
        Ok(())
    }

    pub fn set_subscription_active(&self, id: i64, active: bool) -> EngineResult<()> {
        self.conn.lock().execute(
            "UPDATE subscriptions SET active = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![id, active as i64],
        )?;
        Ok(())
    }

    /// Active subscriptions applying to a group, embeddings included.
    pub fn subscriptions_for_group(&self, group_id: i64) -> EngineResult<Vec<Subscription>> {
        let ids: Vec<i64> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT s.id FROM subscriptions s
                 JOIN subscription_groups sg ON sg.subscription_id = s.id
                 WHERE sg.group_id = ?1 AND s.active = 1
                 ORDER BY s.id",
            )?;
            let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };

        let mut subs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(sub) = self.load_subscription(id)? {
                subs.push(sub);
            }
        }
        Ok(subs)
    }

    /// The union of every subscription's group ids — the backfill work list.
    pub fn all_subscribed_groups(&self) -> EngineResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT sg.group_id FROM subscription_groups sg
             JOIN subscriptions s ON s.id = sg.subscription_id
             WHERE s.active = 1 ORDER BY sg.group_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }

    pub fn load_subscription(&self, id: i64) -> EngineResult<Option<Subscription>> {
        let conn = self.conn.lock();
        let base: Option<(i64, String, String, String, String, i64)> = conn
            .query_row(
                "SELECT user_id, query, description, keywords_json, negative_keywords_json, active
                 FROM subscriptions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, query, description, keywords_json, negatives_json, active)) = base else {
            return Ok(None);
        };

        let group_ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT group_id FROM subscription_groups WHERE subscription_id = ?1 ORDER BY group_id",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };

        let embeddings: Vec<KeywordEmbedding> = {
            let mut stmt = conn.prepare(
                "SELECT keyword, negative, vector FROM keyword_embeddings
                 WHERE subscription_id = ?1 ORDER BY keyword",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                let keyword: String = row.get(0)?;
                let negative: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                Ok(KeywordEmbedding {
                    keyword,
                    negative: negative != 0,
                    vector: bytes_to_f32_vec(&blob),
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(Some(Subscription {
            id,
            user_id,
            query,
            keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
            negative_keywords: serde_json::from_str(&negatives_json).unwrap_or_default(),
            description,
            embeddings,
            active: active != 0,
            group_ids,
        }))
    }

    /// Store embedding vectors for a subscription's current keyword
    /// revision. Returns false (and writes nothing) when that revision is
    /// already embedded — embeddings are generated exactly once per
    /// keyword-set revision.
    pub fn save_keyword_embeddings(
        &self,
        subscription_id: i64,
        embeddings: &[KeywordEmbedding],
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let (keyword_revision, embedded_revision): (i64, i64) = conn.query_row(
            "SELECT keyword_revision, embedded_revision FROM subscriptions WHERE id = ?1",
            params![subscription_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if embedded_revision == keyword_revision {
            debug!(
                "[store] Sub {} revision {} already embedded — skipping",
                subscription_id, keyword_revision
            );
            return Ok(false);
        }

        conn.execute(
            "DELETE FROM keyword_embeddings WHERE subscription_id = ?1",
            params![subscription_id],
        )?;
        for emb in embeddings {
            conn.execute(
                "INSERT OR REPLACE INTO keyword_embeddings (subscription_id, keyword, negative, vector)
                 VALUES (?1, ?2, ?3, ?4)",
                params![subscription_id, emb.keyword, emb.negative as i64, f32_vec_to_bytes(&emb.vector)],
            )?;
        }
        conn.execute(
            "UPDATE subscriptions SET embedded_revision = keyword_revision WHERE id = ?1",
            params![subscription_id],
        )?;
        Ok(true)
    }

    // ── Group & user registries ────────────────────────────────────────────

    pub fn upsert_group(&self, id: i64, name: &str, handle: Option<&str>, is_forum: bool) -> EngineResult<()> {
        self.conn.lock().execute(
            "INSERT INTO groups (id, name, handle, is_forum) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name, handle = excluded.handle, is_forum = excluded.is_forum",
            params![id, name, handle, is_forum as i64],
        )?;
        Ok(())
    }

    /// Display name and handle for notifications and scans.
    pub fn group_info(&self, id: i64) -> EngineResult<Option<(String, Option<String>)>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT name, handle FROM groups WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// The highest message id already replayed for a group, if any.
    pub fn group_cursor(&self, group_id: i64) -> EngineResult<Option<i64>> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT last_seen_message_id FROM groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    /// Advance the backfill cursor. Never moves backwards.
    pub fn set_group_cursor(&self, group_id: i64, message_id: i64) -> EngineResult<()> {
        self.conn.lock().execute(
            "UPDATE groups SET last_seen_message_id = MAX(COALESCE(last_seen_message_id, 0), ?2)
             WHERE id = ?1",
            params![group_id, message_id],
        )?;
        Ok(())
    }

    pub fn record_backfill_stats(&self, group_id: i64, replayed: i64) -> EngineResult<()> {
        self.conn.lock().execute(
            "UPDATE groups SET backfilled_at = datetime('now'),
                 backfill_count = backfill_count + ?2
             WHERE id = ?1",
            params![group_id, replayed],
        )?;
        Ok(())
    }

    pub fn upsert_user(&self, id: i64, handle: Option<&str>) -> EngineResult<()> {
        self.conn.lock().execute(
            "INSERT INTO users (id, handle) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET handle = excluded.handle",
            params![id, handle],
        )?;
        Ok(())
    }

    // ── Dedup ledger: analyses ─────────────────────────────────────────────

    /// Write one analysis record. Idempotent: the first write for a pair
    /// wins, later ones are no-ops.
    pub fn record_analysis(&self, analysis: &MatchAnalysis) -> EngineResult<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO analyses
                 (subscription_id, message_id, group_id, verdict, lexical_score,
                  semantic_score, verifier_confidence, verifier_reason,
                  rejection_keyword, notified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                analysis.subscription_id,
                analysis.message_id,
                analysis.group_id,
                analysis.verdict.as_str(),
                analysis.lexical_score,
                analysis.semantic_score,
                analysis.verifier_confidence,
                analysis.verifier_reason,
                analysis.rejection_keyword,
                analysis.notified_at,
            ],
        )?;
        Ok(())
    }

    /// There exists a "matched" analysis for this pair.
    pub fn is_analysis_matched(&self, subscription_id: i64, message_id: i64, group_id: i64) -> EngineResult<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM analyses
             WHERE subscription_id = ?1 AND message_id = ?2 AND group_id = ?3
               AND verdict = 'matched'",
            params![subscription_id, message_id, group_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_analysis(
        &self,
        subscription_id: i64,
        message_id: i64,
        group_id: i64,
    ) -> EngineResult<Option<MatchAnalysis>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT verdict, lexical_score, semantic_score, verifier_confidence,
                        verifier_reason, rejection_keyword, notified_at
                 FROM analyses
                 WHERE subscription_id = ?1 AND message_id = ?2 AND group_id = ?3",
                params![subscription_id, message_id, group_id],
                |row| {
                    let verdict_str: String = row.get(0)?;
                    Ok(MatchAnalysis {
                        subscription_id,
                        message_id,
                        group_id,
                        verdict: AnalysisVerdict::parse(&verdict_str)
                            .unwrap_or(AnalysisVerdict::RejectedVerifier),
                        lexical_score: row.get(1)?,
                        semantic_score: row.get(2)?,
                        verifier_confidence: row.get(3)?,
                        verifier_reason: row.get(4)?,
                        rejection_keyword: row.get(5)?,
                        notified_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Every analysis written for one message, ordered by subscription.
    pub fn analyses_for_message(&self, group_id: i64, message_id: i64) -> EngineResult<Vec<MatchAnalysis>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT subscription_id, verdict, lexical_score, semantic_score,
                    verifier_confidence, verifier_reason, rejection_keyword, notified_at
             FROM analyses WHERE group_id = ?1 AND message_id = ?2
             ORDER BY subscription_id",
        )?;
        let rows = stmt.query_map(params![group_id, message_id], |row| {
            let verdict_str: String = row.get(1)?;
            Ok(MatchAnalysis {
                subscription_id: row.get(0)?,
                message_id,
                group_id,
                verdict: AnalysisVerdict::parse(&verdict_str)
                    .unwrap_or(AnalysisVerdict::RejectedVerifier),
                lexical_score: row.get(2)?,
                semantic_score: row.get(3)?,
                verifier_confidence: row.get(4)?,
                verifier_reason: row.get(5)?,
                rejection_keyword: row.get(6)?,
                notified_at: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Dedup ledger: per-user notifications ───────────────────────────────

    /// Record that a user was notified for a message. Idempotent.
    pub fn mark_notified(&self, user_id: i64, message_id: i64, group_id: i64) -> EngineResult<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO notified (user_id, message_id, group_id) VALUES (?1, ?2, ?3)",
            params![user_id, message_id, group_id],
        )?;
        Ok(())
    }

    /// This user was already notified for this message through any
    /// subscription.
    pub fn is_notified(&self, user_id: i64, message_id: i64, group_id: i64) -> EngineResult<bool> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM notified
             WHERE user_id = ?1 AND message_id = ?2 AND group_id = ?3",
            params![user_id, message_id, group_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Match records (external consumers) ─────────────────────────────────

    pub fn record_match(&self, user_id: i64, group_id: i64, message_id: i64, excerpt: &str) -> EngineResult<()> {
        self.conn.lock().execute(
            "INSERT INTO matches (user_id, group_id, message_id, excerpt) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, group_id, message_id, excerpt],
        )?;
        Ok(())
    }

    pub fn match_count(&self) -> EngineResult<i64> {
        Ok(self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM matches", [], |row| row.get(0))?)
    }
}

// ── f32 vector blob helpers ────────────────────────────────────────────────

pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
