// engine/state.rs — Shared engine state: explicitly-constructed services
// wired together once and passed by reference through the pipeline entry
// point. Tests substitute fakes at the trait seams (upstream client,
// delivery policy, notification sink); everything here is concrete.

use crate::atoms::error::EngineResult;
use crate::atoms::types::EngineConfig;
use crate::engine::albums::AlbumAssembler;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::enrich::UrlEnricher;
use crate::engine::media::MediaStore;
use crate::engine::messages::MessageCache;
use crate::engine::pipeline::InflightSet;
use crate::engine::store::{default_db_path, EngineStore};
use crate::engine::subs::SubscriptionCache;
use crate::engine::verifier::{VerdictProvider, VerifierClient};
use log::info;
use std::sync::Arc;

/// Process-wide engine services. One instance per process; shared mutable
/// state (caches, in-flight locks, album table, embedding health) lives
/// inside the individual services behind short mutexes.
pub struct EngineState {
    pub store: Arc<EngineStore>,
    pub subs: SubscriptionCache,
    pub messages: MessageCache,
    pub albums: AlbumAssembler,
    pub inflight: InflightSet,
    pub embedding: EmbeddingClient,
    pub verifier: Arc<dyn VerdictProvider>,
    pub enricher: UrlEnricher,
    pub media: MediaStore,
    pub config: EngineConfig,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let db_path = config.db_path.clone().unwrap_or_else(default_db_path);
        let store = Arc::new(EngineStore::open(&db_path)?);
        Ok(Self::with_store(config, store))
    }

    /// Wire services around an existing store (tests use in-memory stores).
    pub fn with_store(config: EngineConfig, store: Arc<EngineStore>) -> Self {
        info!("[engine] Initializing services (media root {:?})", config.media_root);
        EngineState {
            subs: SubscriptionCache::new(Arc::clone(&store)),
            messages: MessageCache::new(),
            albums: AlbumAssembler::new(),
            inflight: InflightSet::new(),
            embedding: EmbeddingClient::new(&config.embedding_url),
            verifier: Arc::new(VerifierClient::new(&config.verifier_url, &config.verifier_token)),
            enricher: UrlEnricher::new(),
            media: MediaStore::new(&config.media_root),
            store,
            config,
        }
    }
}
