//! Interfaces the orchestrator consumes, plus in-memory and no-op implementations.

use crate::model::{Particle, ParticleId, TraitRecord, TraitVector, WorldSnapshot};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Failures reported by a particle or trait store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend is temporarily unreachable; the call may succeed if retried.
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("particle {0} not found")]
    NotFound(ParticleId),
    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure reported by an event sink or broadcast hook.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sink failure: {0}")]
pub struct SinkError(pub String);

/// Durable home of particles between ticks.
pub trait ParticleStore: Send {
    /// Particles still taking part in the simulation (Active or Decaying).
    fn load_active(&mut self) -> Result<Vec<Particle>, StoreError>;
    /// Every particle, terminal ones included.
    fn load_all(&mut self) -> Result<Vec<Particle>, StoreError>;
    /// Upsert one particle.
    fn save(&mut self, particle: &Particle) -> Result<(), StoreError>;
    /// Insert a new particle, returning its id.
    fn create(&mut self, particle: Particle) -> Result<ParticleId, StoreError>;
}

/// Versioned trait vectors keyed by particle.
pub trait TraitStore: Send {
    fn latest_for(&mut self, id: ParticleId) -> Result<Option<TraitVector>, StoreError>;
    /// Append a new version for `id`.
    fn save_traits(
        &mut self,
        id: ParticleId,
        traits: &TraitVector,
        recorded_at: DateTime<Utc>,
    ) -> Result<TraitRecord, StoreError>;
}

/// Fire-and-forget notification channel.
pub trait EventSink: Send {
    fn publish(&mut self, event_type: &str, payload: &Value) -> Result<(), SinkError>;
}

/// Called once at the end of every tick.
pub trait CacheRefreshHook: Send {
    fn invalidate_active_particles_view(&mut self);
}

/// Best-effort snapshot fan-out.
pub trait BroadcastHook: Send {
    fn push_snapshot(&mut self, snapshot: &WorldSnapshot) -> Result<(), SinkError>;
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&mut self, _event_type: &str, _payload: &Value) -> Result<(), SinkError> {
        Ok(())
    }
}

impl CacheRefreshHook for NullSink {
    fn invalidate_active_particles_view(&mut self) {}
}

impl BroadcastHook for NullSink {
    fn push_snapshot(&mut self, _snapshot: &WorldSnapshot) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    order: Vec<ParticleId>,
    particles: HashMap<ParticleId, Particle>,
    traits: HashMap<ParticleId, Vec<TraitRecord>>,
    pending_failures: usize,
}

/// Shared in-memory particle and trait store. Clones see the same data.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Permanent("memory store lock poisoned".into()))
    }

    /// Lock and consume one injected failure, if any are pending.
    fn guard(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        let mut inner = self.lock()?;
        if inner.pending_failures > 0 {
            inner.pending_failures -= 1;
            return Err(StoreError::Transient("injected failure".into()));
        }
        Ok(inner)
    }

    /// Make the next `count` operations fail with a transient error.
    pub fn inject_failures(&self, count: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pending_failures = count;
        }
    }

    /// Current copy of a particle.
    #[must_use]
    pub fn particle(&self, id: ParticleId) -> Option<Particle> {
        self.inner.lock().ok()?.particles.get(&id).cloned()
    }

    /// Every stored trait version for `id`, oldest first.
    #[must_use]
    pub fn trait_history(&self, id: ParticleId) -> Vec<TraitRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.traits.get(&id).cloned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.order.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ParticleStore for MemoryStore {
    fn load_active(&mut self) -> Result<Vec<Particle>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.particles.get(id))
            .filter(|p| p.state.is_live())
            .cloned()
            .collect())
    }

    fn load_all(&mut self) -> Result<Vec<Particle>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.particles.get(id))
            .cloned()
            .collect())
    }

    fn save(&mut self, particle: &Particle) -> Result<(), StoreError> {
        let mut inner = self.guard()?;
        if !inner.particles.contains_key(&particle.id) {
            inner.order.push(particle.id);
        }
        inner.particles.insert(particle.id, particle.clone());
        Ok(())
    }

    fn create(&mut self, particle: Particle) -> Result<ParticleId, StoreError> {
        let id = particle.id;
        self.save(&particle)?;
        Ok(id)
    }
}

impl TraitStore for MemoryStore {
    fn latest_for(&mut self, id: ParticleId) -> Result<Option<TraitVector>, StoreError> {
        let inner = self.guard()?;
        Ok(inner
            .traits
            .get(&id)
            .and_then(|history| history.last())
            .map(|record| record.traits))
    }

    fn save_traits(
        &mut self,
        id: ParticleId,
        traits: &TraitVector,
        recorded_at: DateTime<Utc>,
    ) -> Result<TraitRecord, StoreError> {
        let mut inner = self.guard()?;
        let history = inner.traits.entry(id).or_default();
        let version = history.last().map_or(1, |record| record.version + 1);
        let record = TraitRecord {
            particle_id: id,
            version,
            traits: traits.clamped(),
            recorded_at,
        };
        history.push(record);
        Ok(record)
    }
}

#[derive(Debug, Default)]
struct RecorderInner {
    events: Vec<(String, Value)>,
    snapshots: Vec<WorldSnapshot>,
    invalidations: usize,
}

/// Sink that remembers everything it receives. Clones share the recording.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<RecorderInner>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .map(|inner| inner.events.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<WorldSnapshot> {
        self.inner
            .lock()
            .map(|inner| inner.snapshots.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.inner.lock().map(|inner| inner.invalidations).unwrap_or(0)
    }

    /// Events with the given type label.
    #[must_use]
    pub fn events_of(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(kind, _)| kind == event_type)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&mut self, event_type: &str, payload: &Value) -> Result<(), SinkError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SinkError("recording sink lock poisoned".into()))?;
        inner.events.push((event_type.to_string(), payload.clone()));
        Ok(())
    }
}

impl CacheRefreshHook for RecordingSink {
    fn invalidate_active_particles_view(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.invalidations += 1;
        }
    }
}

impl BroadcastHook for RecordingSink {
    fn push_snapshot(&mut self, snapshot: &WorldSnapshot) -> Result<(), SinkError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SinkError("recording sink lock poisoned".into()))?;
        inner.snapshots.push(snapshot.clone());
        Ok(())
    }
}

/// Bounded retry with doubling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max_backoff);
        }
        delay.min(self.max_backoff)
    }
}

/// Store wrapper that retries transient failures at the collaborator boundary.
#[derive(Debug, Clone)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn retry<T>(
        &mut self,
        operation: &'static str,
        mut call: impl FnMut(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match call(&mut self.inner) {
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff_for(attempt);
                    warn!(operation, attempt, ?delay, error = %err, "retrying store call");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl<S: ParticleStore> ParticleStore for RetryingStore<S> {
    fn load_active(&mut self) -> Result<Vec<Particle>, StoreError> {
        self.retry("load_active", |store| store.load_active())
    }

    fn load_all(&mut self) -> Result<Vec<Particle>, StoreError> {
        self.retry("load_all", |store| store.load_all())
    }

    fn save(&mut self, particle: &Particle) -> Result<(), StoreError> {
        self.retry("save", |store| store.save(particle))
    }

    fn create(&mut self, particle: Particle) -> Result<ParticleId, StoreError> {
        self.retry("create", |store| store.create(particle.clone()))
    }
}

impl<S: TraitStore> TraitStore for RetryingStore<S> {
    fn latest_for(&mut self, id: ParticleId) -> Result<Option<TraitVector>, StoreError> {
        self.retry("latest_for", |store| store.latest_for(id))
    }

    fn save_traits(
        &mut self,
        id: ParticleId,
        traits: &TraitVector,
        recorded_at: DateTime<Utc>,
    ) -> Result<TraitRecord, StoreError> {
        self.retry("save_traits", |store| store.save_traits(id, traits, recorded_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParticleState, Position};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn particle(n: u128) -> Particle {
        Particle::at(ParticleId(Uuid::from_u128(n)), Position::new(1.0, 1.0), now())
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[test]
    fn load_active_excludes_terminal_particles() {
        let mut store = MemoryStore::new();
        store.create(particle(1)).expect("create");
        let mut merged = particle(2);
        merged.state = ParticleState::Merged;
        store.create(merged).expect("create");
        let mut decaying = particle(3);
        decaying.state = ParticleState::Decaying;
        store.create(decaying).expect("create");
        let active = store.load_active().expect("load");
        assert_eq!(active.len(), 2);
        assert_eq!(store.load_all().expect("load").len(), 3);
    }

    #[test]
    fn trait_versions_increase() {
        let mut store = MemoryStore::new();
        let id = ParticleId(Uuid::from_u128(5));
        assert_eq!(store.latest_for(id), Ok(None));
        let first = store
            .save_traits(id, &TraitVector::uniform(0.2), now())
            .expect("save");
        let second = store
            .save_traits(id, &TraitVector::uniform(0.7), now())
            .expect("save");
        assert_eq!((first.version, second.version), (1, 2));
        assert_eq!(store.latest_for(id), Ok(Some(TraitVector::uniform(0.7))));
        assert_eq!(store.trait_history(id).len(), 2);
    }

    #[test]
    fn retry_recovers_from_transient_failures() {
        let memory = MemoryStore::new();
        memory.inject_failures(2);
        let mut store = RetryingStore::new(memory.clone(), fast_policy());
        store.save(&particle(1)).expect("third attempt succeeds");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let memory = MemoryStore::new();
        memory.inject_failures(5);
        let mut store = RetryingStore::new(memory.clone(), fast_policy());
        let err = store.save(&particle(1)).expect_err("exhausted");
        assert!(err.is_transient());
        assert!(memory.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(50));
    }

    #[test]
    fn recording_sink_shares_state_between_clones() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer
            .publish("particle.split", &serde_json::json!({"source": "x"}))
            .expect("publish");
        writer.invalidate_active_particles_view();
        assert_eq!(sink.events_of("particle.split").len(), 1);
        assert_eq!(sink.invalidations(), 1);
    }
}
