//! The pure tick function: arena in, mutated arena plus report out.

use crate::arena::{ParticleKey, WorldArena};
use crate::config::{ConfigError, UniverseConfig};
use crate::events::EngineEvent;
use crate::interaction::{InteractionError, InteractionKind, InteractionOutcome, Participant, Survivor, resolve_pair};
use crate::lifecycle::{Transition, apply_decay, try_fission};
use crate::model::{
    MAX_ENERGY, ParticleFault, ParticleId, ParticleState, Position, Tick, WorldSnapshot,
    validate_traits,
};
use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};
use universe_index::{IndexError, NeighborhoodIndex, Torus, UniformGridIndex};

/// A recoverable problem isolated to one particle or pair.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TickFault {
    #[error(transparent)]
    Particle(#[from] ParticleFault),
    #[error(transparent)]
    Interaction(#[from] InteractionError),
    #[error("neighbor index rebuild failed: {0}")]
    Index(#[from] IndexError),
}

/// Everything a tick produced besides the mutated arena.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: WorldSnapshot,
    pub interactions: Vec<InteractionOutcome>,
    pub events: Vec<EngineEvent>,
    pub faults: Vec<TickFault>,
}

#[derive(Debug, Default)]
struct TickCounters {
    merges: usize,
    fissions: usize,
    expirations: usize,
}

struct Movement {
    key: ParticleKey,
    position: Position,
    energy: f64,
}

/// Deterministic tick driver. Owns the RNG and the neighbor index but no particles.
pub struct TickEngine {
    config: UniverseConfig,
    torus: Torus,
    index: Box<dyn NeighborhoodIndex + Send>,
    rng: SmallRng,
    tick: Tick,
}

impl std::fmt::Debug for TickEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickEngine")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl TickEngine {
    /// Validate `config` and build an engine backed by a uniform grid index.
    pub fn new(config: UniverseConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let torus = torus_for(&config)?;
        let index = UniformGridIndex::new(config.interaction_radius, torus)
            .map_err(|_| ConfigError::Invalid("interaction_radius cannot size the grid index"))?;
        Self::with_index(config, Box::new(index))
    }

    /// Build an engine with a caller-supplied neighbor index.
    pub fn with_index(
        config: UniverseConfig,
        index: Box<dyn NeighborhoodIndex + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let torus = torus_for(&config)?;
        let rng = config.seeded_rng();
        Ok(Self {
            config,
            torus,
            index,
            rng,
            tick: Tick::zero(),
        })
    }

    /// Continue numbering after `last`; the next tick will be `last + 1`.
    #[must_use]
    pub fn with_last_tick(mut self, last: Tick) -> Self {
        self.tick = last;
        self
    }

    pub fn set_last_tick(&mut self, last: Tick) {
        self.tick = last;
    }

    /// Last completed tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    #[must_use]
    pub const fn torus(&self) -> &Torus {
        &self.torus
    }

    /// Borrow the engine RNG, e.g. for seeding particles reproducibly.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Swap in a new configuration between ticks. World size is fixed for the engine's lifetime.
    pub fn update_config(&mut self, config: UniverseConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if config.world_size != self.config.world_size {
            return Err(ConfigError::Invalid("world_size cannot change at runtime"));
        }
        if config.interaction_radius != self.config.interaction_radius {
            let index = UniformGridIndex::new(config.interaction_radius, self.torus)
                .map_err(|_| ConfigError::Invalid("interaction_radius cannot size the grid index"))?;
            self.index = Box::new(index);
        }
        self.config = config;
        Ok(())
    }

    /// Run one tick over `arena`.
    pub fn advance(&mut self, arena: &mut WorldArena, now: DateTime<Utc>) -> TickReport {
        let tick = self.tick.next();
        let mut faults = Vec::new();
        let mut events = Vec::new();
        let mut counters = TickCounters::default();

        let faulted = self.stage_validate(arena, &mut faults);
        self.stage_movement(arena, &faulted, now);
        self.stage_lifecycle(arena, &faulted, tick, now, &mut events, &mut counters);
        let interactions =
            self.stage_interactions(arena, &faulted, tick, now, &mut events, &mut faults, &mut counters);

        let snapshot = summarize(arena, tick, now, interactions.len(), &counters, faults.len());
        self.tick = tick;
        debug!(
            tick = tick.0,
            active = snapshot.active_count,
            interactions = snapshot.interaction_count,
            faults = faults.len(),
            "tick advanced"
        );
        TickReport {
            snapshot,
            interactions,
            events,
            faults,
        }
    }

    fn stage_validate(&self, arena: &WorldArena, faults: &mut Vec<TickFault>) -> HashSet<ParticleKey> {
        let mut faulted = HashSet::new();
        for (key, entry) in arena.iter() {
            if entry.particle.state.is_terminal() {
                continue;
            }
            let checked = entry.particle.validate(self.config.world_size).and_then(|()| {
                entry
                    .traits
                    .as_ref()
                    .map_or(Ok(()), |traits| validate_traits(entry.particle.id, traits))
            });
            if let Err(fault) = checked {
                warn!(particle = %entry.particle.id, %fault, "skipping particle for this tick");
                faults.push(fault.into());
                faulted.insert(key);
            }
        }
        faulted
    }

    fn stage_movement(&self, arena: &mut WorldArena, faulted: &HashSet<ParticleKey>, now: DateTime<Utc>) {
        let torus = self.torus;
        let cost = self.config.movement_energy_cost;
        let inputs: Vec<_> = arena
            .iter()
            .filter(|(key, entry)| entry.particle.state.is_live() && !faulted.contains(key))
            .map(|(key, entry)| (key, entry.particle.position, entry.particle.velocity, entry.particle.energy))
            .collect();

        let results: Vec<Movement> = inputs
            .par_iter()
            .map(|&(key, position, velocity, energy)| Movement {
                key,
                position: Position::new(
                    torus.wrap(position.x + velocity.vx),
                    torus.wrap(position.y + velocity.vy),
                ),
                energy: (energy - velocity.speed() * cost).clamp(0.0, MAX_ENERGY),
            })
            .collect();

        for movement in results {
            if let Some(entry) = arena.get_mut(movement.key) {
                entry.particle.position = movement.position;
                entry.particle.energy = movement.energy;
                entry.particle.updated_at = now;
                arena.mark_dirty(movement.key);
            }
        }
    }

    fn stage_lifecycle(
        &mut self,
        arena: &mut WorldArena,
        faulted: &HashSet<ParticleKey>,
        tick: Tick,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
        counters: &mut TickCounters,
    ) {
        let keys: Vec<ParticleKey> = arena.keys().collect();
        for key in keys {
            if faulted.contains(&key) || arena.is_spawned(key) {
                continue;
            }
            let Some(entry) = arena.get_mut(key) else {
                continue;
            };
            if entry.particle.state.is_terminal() {
                continue;
            }
            if let Some(transition) = apply_decay(&mut entry.particle, &self.config.lifecycle, now) {
                if transition.to == ParticleState::Expired {
                    counters.expirations += 1;
                }
                events.push(EngineEvent::StateChanged { tick, transition });
            }
            arena.mark_dirty(key);

            let Some(entry) = arena.get(key) else {
                continue;
            };
            let Some(traits) = entry.traits else {
                continue;
            };
            let Some(plan) = try_fission(
                &entry.particle,
                &traits,
                &self.config.lifecycle,
                &self.torus,
                self.config.max_axis_velocity,
                &mut self.rng,
                now,
            ) else {
                continue;
            };

            let parent = plan.parent;
            let children = plan.child_ids();
            if let Some(entry) = arena.get_mut(key) {
                entry.particle.state = ParticleState::Expired;
                entry.particle.updated_at = now;
            }
            for (child, child_traits) in plan.children {
                arena.spawn(child, child_traits);
            }
            counters.fissions += 1;
            debug!(tick = tick.0, %parent, "particle split");
            events.push(EngineEvent::StateChanged {
                tick,
                transition: Transition {
                    id: parent,
                    from: ParticleState::Active,
                    to: ParticleState::Expired,
                },
            });
            events.push(EngineEvent::Split {
                tick,
                source: parent,
                children,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_interactions(
        &mut self,
        arena: &mut WorldArena,
        faulted: &HashSet<ParticleKey>,
        tick: Tick,
        now: DateTime<Utc>,
        events: &mut Vec<EngineEvent>,
        faults: &mut Vec<TickFault>,
        counters: &mut TickCounters,
    ) -> Vec<InteractionOutcome> {
        let candidates: Vec<ParticleKey> = arena
            .iter()
            .filter(|(key, entry)| {
                entry.particle.state == ParticleState::Active
                    && entry.traits.is_some()
                    && !faulted.contains(key)
            })
            .map(|(key, _)| key)
            .collect();
        let positions: Vec<(f64, f64)> = candidates
            .iter()
            .filter_map(|&key| arena.get(key).map(|entry| entry.particle.position.as_tuple()))
            .collect();
        if let Err(err) = self.index.rebuild(&positions) {
            warn!(tick = tick.0, error = %err, "neighbor index rebuild failed; skipping interactions");
            faults.push(err.into());
            return Vec::new();
        }

        let radius = self.config.interaction_radius;
        let mut resolved: HashSet<(ParticleId, ParticleId)> = HashSet::new();
        let mut outcomes = Vec::new();
        for (i, &key_a) in candidates.iter().enumerate() {
            for j in self.index.collect_neighbors(i, radius) {
                if j <= i {
                    continue;
                }
                let key_b = candidates[j];
                let Some([a, b]) = arena.pair_mut(key_a, key_b) else {
                    continue;
                };
                if a.particle.state != ParticleState::Active || b.particle.state != ParticleState::Active {
                    continue;
                }
                let pair = ordered_pair(a.particle.id, b.particle.id);
                if !resolved.insert(pair) {
                    continue;
                }
                // Merges earlier in the tick may have moved a survivor out of range.
                if self
                    .torus
                    .distance(a.particle.position.as_tuple(), b.particle.position.as_tuple())
                    > radius
                {
                    continue;
                }
                let (Some(traits_a), Some(traits_b)) = (a.traits.as_ref(), b.traits.as_ref()) else {
                    continue;
                };
                let resolution = match resolve_pair(
                    &self.config,
                    &self.torus,
                    Participant {
                        particle: &a.particle,
                        traits: traits_a,
                    },
                    Participant {
                        particle: &b.particle,
                        traits: traits_b,
                    },
                    now,
                ) {
                    Ok(resolution) => resolution,
                    Err(err) => {
                        warn!(tick = tick.0, error = %err, "interaction skipped");
                        faults.push(err.into());
                        continue;
                    }
                };

                a.particle = resolution.first;
                b.particle = resolution.second;
                if let Some((survivor, traits)) = resolution.merged {
                    let (kept, absorbed) = match survivor {
                        Survivor::First => (a, b),
                        Survivor::Second => (b, a),
                    };
                    kept.traits = Some(traits);
                    kept.traits_changed = true;
                    counters.merges += 1;
                    events.push(EngineEvent::StateChanged {
                        tick,
                        transition: Transition {
                            id: absorbed.particle.id,
                            from: ParticleState::Active,
                            to: ParticleState::Merged,
                        },
                    });
                }
                debug_assert!(
                    resolution.outcome.kind == InteractionKind::Merge || resolution.merged.is_none()
                );
                arena.mark_dirty(key_a);
                arena.mark_dirty(key_b);
                events.push(EngineEvent::Interaction {
                    tick,
                    outcome: resolution.outcome,
                });
                outcomes.push(resolution.outcome);
            }
        }
        outcomes
    }
}

fn torus_for(config: &UniverseConfig) -> Result<Torus, ConfigError> {
    Torus::new(config.world_size).map_err(|_| ConfigError::Invalid("world_size must be positive"))
}

fn ordered_pair(a: ParticleId, b: ParticleId) -> (ParticleId, ParticleId) {
    if a <= b { (a, b) } else { (b, a) }
}

fn summarize(
    arena: &WorldArena,
    tick: Tick,
    now: DateTime<Utc>,
    interaction_count: usize,
    counters: &TickCounters,
    faults: usize,
) -> WorldSnapshot {
    let (active_count, total_energy) = arena
        .iter()
        .filter(|(_, entry)| entry.particle.state == ParticleState::Active)
        .fold((0usize, 0.0f64), |(count, energy), (_, entry)| {
            (count + 1, energy + entry.particle.energy)
        });
    let mean_energy = if active_count > 0 {
        total_energy / active_count as f64
    } else {
        0.0
    };
    WorldSnapshot {
        tick,
        recorded_at: now,
        active_count,
        mean_energy,
        interaction_count,
        merges: counters.merges,
        fissions: counters.fissions,
        expirations: counters.expirations,
        faults,
    }
}
