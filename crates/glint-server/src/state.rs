//! Shared application state.
//!
//! The model clients are constructed once in `main` and passed down here so
//! tests can substitute fakes; nothing in the server reaches for globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info};

use glint_agent::{ConversationMemory, LanguageModel, SpeechSynthesis, SpeechToText};
use glint_core::OrchestratorConfig;

struct ParkedMemory {
    memory: ConversationMemory,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub config: OrchestratorConfig,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn SpeechSynthesis>,
    active_connections: Arc<AtomicUsize>,
    /// Memory records of recently disconnected clients, retained for the
    /// reconnect grace period keyed by connection id.
    parked: Arc<Mutex<HashMap<String, ParkedMemory>>>,
}

impl AppState {
    pub fn new(
        config: OrchestratorConfig,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesis>,
    ) -> Self {
        Self {
            config,
            stt,
            llm,
            tts,
            active_connections: Arc::new(AtomicUsize::new(0)),
            parked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve the connection id and memory for a new socket. A client
    /// presenting the id of a connection that dropped within the grace period
    /// gets its conversation memory back.
    pub async fn adopt_connection(
        &self,
        requested: Option<String>,
    ) -> (String, ConversationMemory) {
        if let Some(id) = requested {
            let reclaimed = {
                let mut parked = self.parked.lock().await;
                parked
                    .remove(&id)
                    .filter(|entry| entry.expires_at > Instant::now())
            };
            if let Some(entry) = reclaimed {
                info!(connection_id = %id, turns = entry.memory.turn_count(), "re-attached conversation memory");
                return (id, entry.memory);
            }
            return (id, self.fresh_memory());
        }
        (uuid::Uuid::new_v4().to_string(), self.fresh_memory())
    }

    /// Retain a disconnected client's memory for the grace period.
    pub async fn park_memory(&self, connection_id: String, memory: ConversationMemory) {
        let grace = self.config.reconnect_grace();
        let expires_at = Instant::now() + grace;
        self.parked.lock().await.insert(
            connection_id.clone(),
            ParkedMemory { memory, expires_at },
        );
        let parked = Arc::clone(&self.parked);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut map = parked.lock().await;
            let expired = map
                .get(&connection_id)
                .is_some_and(|entry| entry.expires_at <= Instant::now());
            if expired {
                map.remove(&connection_id);
                debug!(connection_id = %connection_id, "reconnect grace expired, memory freed");
            }
        });
    }

    fn fresh_memory(&self) -> ConversationMemory {
        ConversationMemory::new(
            Arc::clone(&self.llm),
            self.config.memory_max_tokens,
            self.config.summarize_wait(),
        )
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }
}
