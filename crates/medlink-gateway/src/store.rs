//! Signaling relay store.
//!
//! Holds, per session id, at most one offer, at most one answer and an
//! append-only list of candidates. Records are created by the first write,
//! removed by an explicit `clear`, and otherwise expire once they have been
//! idle for the configured TTL so a reused id never sees stale signaling data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use medlink_common::helpers::is_valid_session_id;
use medlink_common::{IceCandidate, Role, SessionDescription};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

pub const MAX_SDP_BYTES: usize = 32 * 1024;
pub const MAX_CANDIDATE_BYTES: usize = 4096;

/// Shortest idle lifetime a record may be configured with.
pub const MIN_TTL: Duration = Duration::from_secs(30);

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_SESSION_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Idle lifetime of a record after its last write.
    pub ttl: Duration,
    /// Maximum number of session records held at once.
    pub max_sessions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_sessions: DEFAULT_SESSION_LIMIT,
        }
    }
}

impl StoreConfig {
    /// Applies the TTL floor and a minimum of one session.
    pub fn new(ttl: Duration, max_sessions: usize) -> Self {
        Self {
            ttl: ttl.max(MIN_TTL),
            max_sessions: max_sessions.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("empty payload")]
    EmptyPayload,
    #[error("payload too large ({size} bytes, limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("signaling session limit reached ({limit})")]
    SessionLimit { limit: usize },
}

#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub from: Option<Role>,
    pub candidate: IceCandidate,
}

#[derive(Debug)]
pub struct SignalingRecord {
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub candidates: Vec<CandidateEntry>,
    pub created_at: Instant,
    pub last_write: Instant,
}

impl SignalingRecord {
    fn new(now: Instant) -> Self {
        Self {
            offer: None,
            answer: None,
            candidates: Vec::new(),
            created_at: now,
            last_write: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.last_write) >= ttl
    }
}

/// Shared handle to the relay store. Cloning shares the same records.
#[derive(Clone)]
pub struct SignalingStore {
    records: Arc<RwLock<HashMap<String, SignalingRecord>>>,
    config: StoreConfig,
}

impl Default for SignalingStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl SignalingStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    /// Overwrites the offer slot.
    pub async fn put_offer(
        &self,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<(), StoreError> {
        check_size(offer.sdp.len(), MAX_SDP_BYTES)?;
        self.write(session_id, |record| record.offer = Some(offer))
            .await
    }

    /// Overwrites the answer slot.
    pub async fn put_answer(
        &self,
        session_id: &str,
        answer: SessionDescription,
    ) -> Result<(), StoreError> {
        check_size(answer.sdp.len(), MAX_SDP_BYTES)?;
        self.write(session_id, |record| record.answer = Some(answer))
            .await
    }

    /// Appends a candidate; entries are never reordered or dropped before `clear`.
    pub async fn append_candidate(
        &self,
        session_id: &str,
        from: Option<Role>,
        candidate: IceCandidate,
    ) -> Result<(), StoreError> {
        check_size(candidate.candidate.len(), MAX_CANDIDATE_BYTES)?;
        self.write(session_id, |record| {
            record.candidates.push(CandidateEntry { from, candidate })
        })
        .await
    }

    pub async fn offer(&self, session_id: &str) -> Option<SessionDescription> {
        self.read(session_id, |record| record.offer.clone())
            .await
            .flatten()
    }

    pub async fn answer(&self, session_id: &str) -> Option<SessionDescription> {
        self.read(session_id, |record| record.answer.clone())
            .await
            .flatten()
    }

    /// Candidates in submission order, optionally only those submitted by `from`.
    pub async fn candidates(&self, session_id: &str, from: Option<Role>) -> Vec<IceCandidate> {
        self.read(session_id, |record| {
            record
                .candidates
                .iter()
                .filter(|entry| match from {
                    Some(role) => entry.from == Some(role),
                    None => true,
                })
                .map(|entry| entry.candidate.clone())
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Removes all three slots of a session. Idempotent; returns whether a
    /// record existed.
    pub async fn clear(&self, session_id: &str) -> bool {
        let removed = self.records.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "signaling record cleared");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Drops expired records. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, record| !record.is_expired(now, ttl));
        before - guard.len()
    }

    async fn write<F>(&self, session_id: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SignalingRecord),
    {
        if !is_valid_session_id(session_id) {
            return Err(StoreError::InvalidSessionId);
        }

        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut guard = self.records.write().await;

        // A record that outlived its TTL is replaced, never extended.
        if guard
            .get(session_id)
            .is_some_and(|record| record.is_expired(now, ttl))
        {
            guard.remove(session_id);
        }

        if !guard.contains_key(session_id) {
            // New sessions are refused at the limit; live ones are never evicted.
            if guard.len() >= self.config.max_sessions {
                guard.retain(|_, record| !record.is_expired(now, ttl));
            }
            if guard.len() >= self.config.max_sessions {
                return Err(StoreError::SessionLimit {
                    limit: self.config.max_sessions,
                });
            }
            guard.insert(session_id.to_string(), SignalingRecord::new(now));
        }

        if let Some(record) = guard.get_mut(session_id) {
            apply(record);
            record.last_write = now;
        }
        Ok(())
    }

    async fn read<T, F>(&self, session_id: &str, view: F) -> Option<T>
    where
        F: FnOnce(&SignalingRecord) -> T,
    {
        let now = Instant::now();
        let guard = self.records.read().await;
        guard
            .get(session_id)
            .filter(|record| !record.is_expired(now, self.config.ttl))
            .map(view)
    }
}

fn check_size(size: usize, limit: usize) -> Result<(), StoreError> {
    if size == 0 {
        return Err(StoreError::EmptyPayload);
    }
    if size > limit {
        return Err(StoreError::PayloadTooLarge { size, limit });
    }
    Ok(())
}
