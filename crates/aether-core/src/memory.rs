// Memory store
//
// Layered, tagged, importance-weighted records persisted through KvStore and
// cached in memory for scoring. Recall ranks by a weighted sum of token
// overlap, importance, recency, and access frequency; expired records score
// zero and are excluded until the sweeper removes them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::{KernelError, Result};
use crate::events::KernelEvent;
use crate::kv::KvStore;
use crate::types::Pid;

const NS_MEMORY: &str = "memory";
const NS_PROFILE: &str = "profile";

/// Memory layer; determines the recency half-life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    /// Events that happened
    Episodic,
    /// Facts about the world
    Semantic,
    /// How to do things
    Procedural,
    /// About other agents
    Social,
}

impl MemoryLayer {
    /// Recency half-life in days. Procedural knowledge decays slowest.
    pub fn half_life_days(&self) -> f64 {
        match self {
            MemoryLayer::Procedural => 90.0,
            MemoryLayer::Semantic => 30.0,
            MemoryLayer::Episodic => 14.0,
            MemoryLayer::Social => 7.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(MemoryLayer::Episodic),
            "semantic" => Some(MemoryLayer::Semantic),
            "procedural" => Some(MemoryLayer::Procedural),
            "social" => Some(MemoryLayer::Social),
            _ => None,
        }
    }
}

/// One stored memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub agent_uid: String,
    pub layer: MemoryLayer,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f64,
    #[serde(default)]
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pid: Option<Pid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<Uuid>,
}

/// Input for storing a new memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub agent_uid: String,
    pub layer: MemoryLayer,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_pid: Option<Pid>,
    #[serde(default)]
    pub related_ids: Vec<Uuid>,
}

fn default_importance() -> f64 {
    0.5
}

/// Derived per-agent profile; recomputable, never authoritative
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_uid: String,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub total_steps: u64,
    pub avg_quality_rating: f64,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentProfile {
    fn new(agent_uid: &str, now: DateTime<Utc>) -> Self {
        Self {
            agent_uid: agent_uid.to_string(),
            total_tasks: 0,
            successful_tasks: 0,
            total_steps: 0,
            avg_quality_rating: 0.0,
            expertise: Vec::new(),
            personality_traits: Vec::new(),
            first_seen: now,
            last_active: now,
        }
    }
}

/// Scoring weights for recall; the tie-break order is fixed by contract
/// (`last_accessed` desc, then `id` asc) but the weights are tunable.
#[derive(Debug, Clone, Copy)]
pub struct RecallWeights {
    pub overlap: f64,
    pub importance: f64,
    pub recency: f64,
    pub access: f64,
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            overlap: 0.5,
            importance: 0.2,
            recency: 0.2,
            access: 0.1,
        }
    }
}

/// The memory store
pub struct MemoryStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    weights: RecallWeights,
    cache: RwLock<HashMap<Uuid, MemoryRecord>>,
}

impl MemoryStore {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, bus: EventBus) -> Self {
        Self {
            kv,
            clock,
            bus,
            weights: RecallWeights::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load persisted records into the cache. Call once at boot.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.kv.list(NS_MEMORY).await?;
        let mut cache = self.cache.write().await;
        for (key, value) in rows {
            match serde_json::from_value::<MemoryRecord>(value) {
                Ok(record) => {
                    cache.insert(record.id, record);
                }
                Err(e) => warn!(%key, error = %e, "skipping undecodable memory record"),
            }
        }
        Ok(cache.len())
    }

    /// Number of cached records
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Store a new record; returns its id and emits `memory.stored`.
    pub async fn store(&self, input: NewMemory) -> Result<Uuid> {
        if !(0.0..=1.0).contains(&input.importance) {
            return Err(KernelError::invalid("importance must be within [0, 1]"));
        }
        let now = self.clock.now();
        let record = MemoryRecord {
            id: Uuid::now_v7(),
            agent_uid: input.agent_uid,
            layer: input.layer,
            content: input.content,
            tags: input.tags,
            importance: input.importance,
            access_count: 0,
            created_at: now,
            last_accessed: now,
            expires_at: input.expires_at,
            source_pid: input.source_pid,
            related_ids: input.related_ids,
        };
        self.persist(&record).await?;
        self.cache.write().await.insert(record.id, record.clone());
        self.bus.publish(KernelEvent::MemoryStored {
            id: record.id,
            agent_uid: record.agent_uid.clone(),
            layer: record.layer,
            timestamp: now,
        });
        Ok(record.id)
    }

    /// Fetch one record by id (no access bump)
    pub async fn get(&self, id: Uuid) -> Option<MemoryRecord> {
        self.cache.read().await.get(&id).cloned()
    }

    /// Top-k recall for an agent.
    ///
    /// Bumps `access_count` and refreshes `last_accessed` on every returned
    /// record, then persists the touched records.
    pub async fn recall(
        &self,
        agent_uid: &str,
        query: &str,
        k: usize,
        layer: Option<MemoryLayer>,
    ) -> Result<Vec<MemoryRecord>> {
        let now = self.clock.now();
        let query_tokens = tokenize(query);

        let mut scored: Vec<(f64, MemoryRecord)> = {
            let cache = self.cache.read().await;
            cache
                .values()
                .filter(|r| r.agent_uid == agent_uid)
                .filter(|r| layer.map_or(true, |l| r.layer == l))
                .filter(|r| !is_expired(r, now))
                .map(|r| (self.score(r, &query_tokens, now), r.clone()))
                .collect()
        };

        scored.sort_by(|(sa, ra), (sb, rb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(rb.last_accessed.cmp(&ra.last_accessed))
                .then(ra.id.cmp(&rb.id))
        });
        scored.truncate(k);

        let mut results = Vec::with_capacity(scored.len());
        let mut cache = self.cache.write().await;
        for (_, mut record) in scored {
            record.access_count += 1;
            record.last_accessed = now;
            self.persist(&record).await?;
            cache.insert(record.id, record.clone());
            results.push(record);
        }
        Ok(results)
    }

    /// Remove a record; emits `memory.forgotten` when it existed.
    pub async fn forget(&self, id: Uuid) -> Result<bool> {
        let removed = self.cache.write().await.remove(&id);
        match removed {
            Some(record) => {
                self.kv.delete(NS_MEMORY, &id.to_string()).await?;
                self.bus.publish(KernelEvent::MemoryForgotten {
                    id,
                    agent_uid: record.agent_uid,
                    timestamp: self.clock.now(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Convenience used by the agent loop when assembling the system prompt
    pub async fn memories_for_context(
        &self,
        agent_uid: &str,
        goal: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.recall(agent_uid, goal, k, None).await
    }

    /// Remove records past their `expires_at`. Returns how many were swept.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired: Vec<Uuid> = {
            let cache = self.cache.read().await;
            cache
                .values()
                .filter(|r| is_expired(r, now))
                .map(|r| r.id)
                .collect()
        };
        for id in &expired {
            self.cache.write().await.remove(id);
            self.kv.delete(NS_MEMORY, &id.to_string()).await?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired memories");
        }
        Ok(expired.len())
    }

    /// Derived profile for an agent uid
    pub async fn get_profile(&self, agent_uid: &str) -> Result<Option<AgentProfile>> {
        match self.kv.get(NS_PROFILE, agent_uid).await? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Fold one completed run into the agent's profile.
    /// Invoked after every `agent.completed`.
    pub async fn record_completion(
        &self,
        agent_uid: &str,
        role: &str,
        success: bool,
        steps: usize,
    ) -> Result<AgentProfile> {
        let now = self.clock.now();
        let mut profile = self
            .get_profile(agent_uid)
            .await?
            .unwrap_or_else(|| AgentProfile::new(agent_uid, now));

        profile.total_tasks += 1;
        if success {
            profile.successful_tasks += 1;
            let role = role.to_lowercase();
            if !role.is_empty() && !profile.expertise.contains(&role) {
                profile.expertise.push(role);
            }
        }
        profile.total_steps += steps as u64;
        profile.avg_quality_rating = profile.successful_tasks as f64 / profile.total_tasks as f64;
        profile.last_active = now;

        let value =
            serde_json::to_value(&profile).map_err(|e| KernelError::storage(e.to_string()))?;
        self.kv.put(NS_PROFILE, agent_uid, value).await?;
        Ok(profile)
    }

    async fn persist(&self, record: &MemoryRecord) -> Result<()> {
        let value: Value =
            serde_json::to_value(record).map_err(|e| KernelError::storage(e.to_string()))?;
        self.kv.put(NS_MEMORY, &record.id.to_string(), value).await
    }

    fn score(&self, record: &MemoryRecord, query_tokens: &[String], now: DateTime<Utc>) -> f64 {
        let overlap = token_overlap(query_tokens, &record.content, &record.tags);
        let age_days = (now - record.created_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = (-age_days * std::f64::consts::LN_2 / record.layer.half_life_days()).exp();
        let access = (1.0 + record.access_count as f64).ln();

        self.weights.overlap * overlap
            + self.weights.importance * record.importance
            + self.weights.recency * recency
            + self.weights.access * access
    }
}

fn is_expired(record: &MemoryRecord, now: DateTime<Utc>) -> bool {
    record.expires_at.is_some_and(|at| at <= now)
}

/// Lowercased alphanumeric tokens
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of query tokens present in the content or tags
fn token_overlap(query_tokens: &[String], content: &str, tags: &[String]) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let content_tokens: std::collections::HashSet<String> =
        tokenize(content).into_iter().collect();
    let tag_tokens: std::collections::HashSet<String> = tags
        .iter()
        .flat_map(|t| tokenize(t))
        .collect();
    let hits = query_tokens
        .iter()
        .filter(|t| content_tokens.contains(*t) || tag_tokens.contains(*t))
        .count();
    hits as f64 / query_tokens.len() as f64
}
