//! Core types and tick pipeline for the universe simulation.
//!
//! A tick loads every live particle into a [`WorldArena`], moves them on the torus,
//! evaluates decay and fission, resolves pairwise interactions between nearby Active
//! particles and hands the mutated arena back to the stores. [`TickEngine`] is the
//! pure part; [`Universe`] wires it to the collaborators.

pub mod arena;
pub mod collaborators;
pub mod compatibility;
pub mod config;
pub mod engine;
pub mod events;
pub mod interaction;
pub mod lifecycle;
pub mod model;
pub mod universe;

pub use arena::{ParticleEntry, ParticleKey, WorldArena};
pub use collaborators::{
    BroadcastHook, CacheRefreshHook, EventSink, MemoryStore, NullSink, ParticleStore,
    RecordingSink, RetryPolicy, RetryingStore, SinkError, StoreError, TraitStore,
};
pub use compatibility::{score, score_with};
pub use config::{
    CompatibilityWeights, ConfigError, InteractionThresholds, InteractionTuning, LifecycleConfig,
    UniverseConfig,
};
pub use engine::{TickEngine, TickFault, TickReport};
pub use events::EngineEvent;
pub use interaction::{InteractionError, InteractionKind, InteractionOutcome, classify};
pub use lifecycle::{FissionPlan, Transition};
pub use model::{
    MAX_ENERGY, Particle, ParticleFault, ParticleId, ParticleState, Position, Tick, TraitKind,
    TraitRecord, TraitVector, UserId, Velocity, WorldSnapshot,
};
pub use universe::{TickGate, TickOutcome, TickPermit, Universe, UniverseError};
pub use universe_index::{BruteForceIndex, NeighborhoodIndex, Torus, UniformGridIndex};
