// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `Store` contract (§6) and an in-memory reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use sol_core::{
    DeliveryAttempt, Evidence, OutputEnvelope, ThreadMementoLatest, TraceEvent, Transmission,
    TransmissionStatus, Usage,
};
use sol_lattice::MemoryHit;
use uuid::Uuid;

/// The topology guard record returned by `GET /internal/topology` (§6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopologyKey {
    pub topology_key: String,
    pub created_at_ms: i64,
    pub created_by: String,
    pub db_path: String,
}

/// Minimum operations the orchestrator needs from persistence (§6).
/// Implementations must serialize writes for a single thread id ("single
/// writer per thread", §1/§5); the in-memory implementation satisfies this
/// by guarding everything with one lock.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_transmission(&self, transmission: Transmission) -> anyhow::Result<()>;
    async fn update_transmission_status(
        &self,
        id: Uuid,
        status: TransmissionStatus,
        status_code: u16,
        retryable: bool,
        error_code: Option<String>,
    ) -> anyhow::Result<()>;
    async fn update_transmission_policy(
        &self,
        id: Uuid,
        policy: sol_core::NotificationPolicy,
    ) -> anyhow::Result<()>;
    async fn set_transmission_output_envelope(
        &self,
        id: Uuid,
        envelope: OutputEnvelope,
    ) -> anyhow::Result<()>;
    async fn set_chat_result(&self, id: Uuid, assistant_text: String) -> anyhow::Result<()>;
    async fn append_delivery_attempt(&self, attempt: DeliveryAttempt) -> anyhow::Result<()>;
    async fn record_usage(&self, usage: Usage) -> anyhow::Result<()>;
    async fn append_trace_event(&self, trace_run_id: Uuid, event: TraceEvent) -> anyhow::Result<()>;
    async fn get_trace_events(&self, trace_run_id: Uuid, limit: usize) -> anyhow::Result<Vec<TraceEvent>>;
    async fn get_trace_summary(&self, trace_run_id: Uuid) -> anyhow::Result<Option<String>>;
    async fn save_evidence(&self, transmission_id: Uuid, evidence: Evidence) -> anyhow::Result<()>;
    async fn search_memory_artifacts_lexical(
        &self,
        user_id: &str,
        terms: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<MemoryHit>>;
    async fn search_memory_artifacts_vector(
        &self,
        user_id: &str,
        embedding: &[f32],
        limit: usize,
        max_distance: Option<f64>,
    ) -> anyhow::Result<Vec<MemoryHit>>;
    async fn get_thread_memento_latest(&self, thread_id: &str) -> anyhow::Result<Option<ThreadMementoLatest>>;
    async fn upsert_thread_memento_latest(
        &self,
        thread_id: &str,
        memento: ThreadMementoLatest,
    ) -> anyhow::Result<()>;
    async fn ensure_topology_key_primary(&self, db_path: &str) -> anyhow::Result<TopologyKey>;
}

#[derive(Default)]
struct InMemoryState {
    transmissions: HashMap<Uuid, Transmission>,
    envelopes: HashMap<Uuid, OutputEnvelope>,
    chat_results: HashMap<Uuid, String>,
    delivery_attempts: Vec<DeliveryAttempt>,
    usage: Vec<Usage>,
    traces: HashMap<Uuid, Vec<TraceEvent>>,
    evidence: HashMap<Uuid, Evidence>,
    mementos: HashMap<String, ThreadMementoLatest>,
    memory_artifacts: HashMap<String, Vec<MemoryHit>>,
    topology: Option<TopologyKey>,
}

/// Process-local reference `Store`, guarded by a single `RwLock` so writes
/// to the same thread id are serialized regardless of caller concurrency,
/// matching the "single-writer per thread" assumption in §1/§5.
pub struct InMemoryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(InMemoryState::default()) }
    }

    /// Seed lexical/vector search results for a user (test/demo helper).
    pub fn seed_memory_artifacts(&self, user_id: &str, hits: Vec<MemoryHit>) {
        self.state.write().unwrap().memory_artifacts.insert(user_id.to_string(), hits);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_transmission(&self, transmission: Transmission) -> anyhow::Result<()> {
        self.state.write().unwrap().transmissions.insert(transmission.id, transmission);
        Ok(())
    }

    async fn update_transmission_status(
        &self,
        id: Uuid,
        status: TransmissionStatus,
        status_code: u16,
        retryable: bool,
        error_code: Option<String>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(t) = state.transmissions.get_mut(&id) {
            t.status = status;
            t.status_code = status_code;
            t.retryable = retryable;
            t.error_code = error_code;
        }
        Ok(())
    }

    async fn update_transmission_policy(
        &self,
        id: Uuid,
        policy: sol_core::NotificationPolicy,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(t) = state.transmissions.get_mut(&id) {
            t.notification_policy = policy;
        }
        Ok(())
    }

    async fn set_transmission_output_envelope(&self, id: Uuid, envelope: OutputEnvelope) -> anyhow::Result<()> {
        self.state.write().unwrap().envelopes.insert(id, envelope);
        Ok(())
    }

    async fn set_chat_result(&self, id: Uuid, assistant_text: String) -> anyhow::Result<()> {
        self.state.write().unwrap().chat_results.insert(id, assistant_text);
        Ok(())
    }

    async fn append_delivery_attempt(&self, attempt: DeliveryAttempt) -> anyhow::Result<()> {
        self.state.write().unwrap().delivery_attempts.push(attempt);
        Ok(())
    }

    async fn record_usage(&self, usage: Usage) -> anyhow::Result<()> {
        self.state.write().unwrap().usage.push(usage);
        Ok(())
    }

    async fn append_trace_event(&self, trace_run_id: Uuid, event: TraceEvent) -> anyhow::Result<()> {
        self.state.write().unwrap().traces.entry(trace_run_id).or_default().push(event);
        Ok(())
    }

    async fn get_trace_events(&self, trace_run_id: Uuid, limit: usize) -> anyhow::Result<Vec<TraceEvent>> {
        let state = self.state.read().unwrap();
        Ok(state
            .traces
            .get(&trace_run_id)
            .map(|events| events.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_trace_summary(&self, trace_run_id: Uuid) -> anyhow::Result<Option<String>> {
        let state = self.state.read().unwrap();
        Ok(state.traces.get(&trace_run_id).map(|events| format!("{} events", events.len())))
    }

    async fn save_evidence(&self, transmission_id: Uuid, evidence: Evidence) -> anyhow::Result<()> {
        self.state.write().unwrap().evidence.insert(transmission_id, evidence);
        Ok(())
    }

    async fn search_memory_artifacts_lexical(
        &self,
        user_id: &str,
        terms: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<MemoryHit>> {
        let state = self.state.read().unwrap();
        let Some(hits) = state.memory_artifacts.get(user_id) else {
            return Ok(vec![]);
        };
        Ok(hits
            .iter()
            .filter(|h| terms.iter().any(|t| h.summary.to_lowercase().contains(t)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_memory_artifacts_vector(
        &self,
        user_id: &str,
        _embedding: &[f32],
        limit: usize,
        _max_distance: Option<f64>,
    ) -> anyhow::Result<Vec<MemoryHit>> {
        let state = self.state.read().unwrap();
        Ok(state
            .memory_artifacts
            .get(user_id)
            .map(|hits| hits.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_thread_memento_latest(&self, thread_id: &str) -> anyhow::Result<Option<ThreadMementoLatest>> {
        Ok(self.state.read().unwrap().mementos.get(thread_id).cloned())
    }

    async fn upsert_thread_memento_latest(
        &self,
        thread_id: &str,
        memento: ThreadMementoLatest,
    ) -> anyhow::Result<()> {
        self.state.write().unwrap().mementos.insert(thread_id.to_string(), memento);
        Ok(())
    }

    async fn ensure_topology_key_primary(&self, db_path: &str) -> anyhow::Result<TopologyKey> {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = &state.topology {
            return Ok(existing.clone());
        }
        let key = TopologyKey {
            topology_key: Uuid::new_v4().to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
            created_by: "sol-runtime".to_string(),
            db_path: db_path.to_string(),
        };
        state.topology = Some(key.clone());
        Ok(key)
    }
}
