//! Tick orchestration around the pure engine: load, advance, persist, publish.

use crate::arena::WorldArena;
use crate::collaborators::{
    BroadcastHook, CacheRefreshHook, EventSink, NullSink, ParticleStore, StoreError, TraitStore,
};
use crate::config::{ConfigError, UniverseConfig};
use crate::engine::{TickEngine, TickFault};
use crate::interaction::InteractionOutcome;
use crate::model::{Particle, ParticleId, Tick, TraitVector, UserId, WorldSnapshot};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{info, warn};

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum UniverseError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("a tick is already in progress")]
    TickInProgress,
}

/// Single in-flight tick guard shared between the orchestrator and control surfaces.
#[derive(Debug, Clone, Default)]
pub struct TickGate {
    busy: Arc<AtomicBool>,
}

impl TickGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or `None` while another tick holds it.
    #[must_use]
    pub fn try_acquire(&self) -> Option<TickPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the gate when dropped.
#[derive(Debug)]
pub struct TickPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Result of one orchestrated tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub snapshot: WorldSnapshot,
    pub interactions: Vec<InteractionOutcome>,
    pub events_published: usize,
    pub faults: Vec<TickFault>,
    /// Particles dropped at load time because their traits could not be read.
    pub load_failures: usize,
    pub persist_failures: usize,
}

/// Owns the engine and its collaborators and runs ticks one at a time.
pub struct Universe {
    engine: TickEngine,
    particles: Box<dyn ParticleStore>,
    traits: Box<dyn TraitStore>,
    events: Box<dyn EventSink>,
    cache: Box<dyn CacheRefreshHook>,
    broadcast: Box<dyn BroadcastHook>,
    gate: TickGate,
    history: VecDeque<WorldSnapshot>,
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("engine", &self.engine)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Universe {
    /// Validate `config` and wire the required stores. Sinks default to no-ops.
    pub fn new(
        config: UniverseConfig,
        particles: Box<dyn ParticleStore>,
        traits: Box<dyn TraitStore>,
    ) -> Result<Self, UniverseError> {
        let engine = TickEngine::new(config)?;
        Ok(Self::with_engine(engine, particles, traits))
    }

    /// Wrap a pre-built engine.
    pub fn with_engine(
        engine: TickEngine,
        particles: Box<dyn ParticleStore>,
        traits: Box<dyn TraitStore>,
    ) -> Self {
        let capacity = engine.config().history_capacity;
        Self {
            engine,
            particles,
            traits,
            events: Box::new(NullSink),
            cache: Box::new(NullSink),
            broadcast: Box::new(NullSink),
            gate: TickGate::new(),
            history: VecDeque::with_capacity(capacity),
        }
    }

    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events = sink;
    }

    pub fn set_cache_hook(&mut self, hook: Box<dyn CacheRefreshHook>) {
        self.cache = hook;
    }

    pub fn set_broadcast(&mut self, hook: Box<dyn BroadcastHook>) {
        self.broadcast = hook;
    }

    /// Handle to the in-flight guard, for control surfaces that must not overlap a tick.
    #[must_use]
    pub fn gate(&self) -> TickGate {
        self.gate.clone()
    }

    #[must_use]
    pub fn config(&self) -> &UniverseConfig {
        self.engine.config()
    }

    /// Last completed tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.engine.tick()
    }

    /// Continue numbering after an archived tick. Never moves the counter backwards.
    pub fn resume_from(&mut self, last: Tick) {
        if last > self.engine.tick() {
            info!(tick = last.0, "resuming tick numbering");
            self.engine.set_last_tick(last);
        }
    }

    /// Apply a new configuration at the next tick boundary.
    pub fn update_config(&mut self, config: UniverseConfig) -> Result<(), UniverseError> {
        let capacity = config.history_capacity;
        self.engine.update_config(config)?;
        while self.history.len() > capacity {
            self.history.pop_front();
        }
        Ok(())
    }

    /// Iterate over retained snapshots, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &WorldSnapshot> {
        self.history.iter()
    }

    #[must_use]
    pub fn latest_snapshot(&self) -> Option<&WorldSnapshot> {
        self.history.back()
    }

    /// Spawn `count` random particles with random traits and store them.
    pub fn seed_particles(
        &mut self,
        count: usize,
        owner: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ParticleId>, UniverseError> {
        let world_size = self.engine.config().world_size;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let rng = self.engine.rng();
            let particle = Particle::spawn(owner, rng, world_size, now);
            let traits = TraitVector::random(rng);
            let id = self.particles.create(particle)?;
            self.traits.save_traits(id, &traits, now)?;
            ids.push(id);
        }
        info!(count, "seeded particles");
        Ok(ids)
    }

    /// Run one tick stamped with the current wall-clock time.
    pub fn run_tick(&mut self) -> Result<TickOutcome, UniverseError> {
        self.run_tick_at(Utc::now())
    }

    /// Run one tick as of `now`.
    pub fn run_tick_at(&mut self, now: DateTime<Utc>) -> Result<TickOutcome, UniverseError> {
        let _permit = self.gate.try_acquire().ok_or(UniverseError::TickInProgress)?;

        let (mut arena, load_failures) = self.load_arena()?;
        let report = self.engine.advance(&mut arena, now);
        let persist_failures = self.persist(&arena, report.snapshot.tick, now);

        let mut events_published = 0;
        for event in &report.events {
            match self.events.publish(event.event_type(), &event.payload()) {
                Ok(()) => events_published += 1,
                Err(err) => {
                    warn!(tick = report.snapshot.tick.0, event = event.event_type(), error = %err, "event publish failed");
                }
            }
        }

        let mut snapshot = report.snapshot;
        snapshot.faults += load_failures;
        if self.history.len() >= self.engine.config().history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot.clone());

        self.cache.invalidate_active_particles_view();
        if let Err(err) = self.broadcast.push_snapshot(&snapshot) {
            warn!(tick = snapshot.tick.0, error = %err, "snapshot broadcast failed");
        }

        info!(
            tick = snapshot.tick.0,
            active = snapshot.active_count,
            mean_energy = snapshot.mean_energy,
            interactions = snapshot.interaction_count,
            faults = snapshot.faults,
            "tick complete"
        );
        Ok(TickOutcome {
            snapshot,
            interactions: report.interactions,
            events_published,
            faults: report.faults,
            load_failures,
            persist_failures,
        })
    }

    fn load_arena(&mut self) -> Result<(WorldArena, usize), UniverseError> {
        let loaded = self.particles.load_active()?;
        let mut entries = Vec::with_capacity(loaded.len());
        let mut failures = 0;
        for particle in loaded {
            match self.traits.latest_for(particle.id) {
                Ok(traits) => entries.push((particle, traits)),
                Err(err) => {
                    warn!(particle = %particle.id, error = %err, "trait lookup failed; skipping particle this tick");
                    failures += 1;
                }
            }
        }
        Ok((WorldArena::from_loaded(entries), failures))
    }

    fn persist(&mut self, arena: &WorldArena, tick: Tick, now: DateTime<Utc>) -> usize {
        let mut failures = 0;
        for (key, entry) in arena.dirty_entries() {
            let id = entry.particle.id;
            let saved = if arena.is_spawned(key) {
                self.particles.create(entry.particle.clone()).map(|_| ())
            } else {
                self.particles.save(&entry.particle)
            };
            if let Err(err) = saved {
                warn!(tick = tick.0, particle = %id, error = %err, "particle save failed");
                failures += 1;
                continue;
            }
            if entry.traits_changed
                && let Some(traits) = entry.traits.as_ref()
                && let Err(err) = self.traits.save_traits(id, traits, now)
            {
                warn!(tick = tick.0, particle = %id, error = %err, "trait save failed");
                failures += 1;
            }
        }
        failures
    }
}
