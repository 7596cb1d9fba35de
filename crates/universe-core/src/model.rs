//! Particle, trait vector and snapshot records.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound for particle energy.
pub const MAX_ENERGY: f64 = 100.0;

/// Opaque, stable particle identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ParticleId(pub Uuid);

impl ParticleId {
    /// Draw an id from the supplied generator so seeded runs stay reproducible.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        Self(Uuid::from_u128(rng.random::<u128>()))
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Owning user reference. Never interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// High level simulation clock (ticks processed since the first snapshot).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Position on the toroidal plane.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub const fn as_tuple(self) -> (f64, f64) {
        (self.x, self.y)
    }
}

/// Per-tick displacement.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
}

impl Velocity {
    #[must_use]
    pub const fn new(vx: f64, vy: f64) -> Self {
        Self { vx, vy }
    }

    /// Magnitude of the velocity vector.
    #[must_use]
    pub fn speed(self) -> f64 {
        self.vx.hypot(self.vy)
    }

    /// Clamp each axis independently to `[-limit, limit]`.
    #[must_use]
    pub fn clamp_axes(self, limit: f64) -> Self {
        Self {
            vx: self.vx.clamp(-limit, limit),
            vy: self.vy.clamp(-limit, limit),
        }
    }
}

/// Lifecycle state of a particle. `Expired` and `Merged` are terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticleState {
    #[default]
    Active,
    Decaying,
    Expired,
    Merged,
}

impl ParticleState {
    /// Terminal states never re-enter per-tick processing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Merged)
    }

    /// Active or Decaying.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !self.is_terminal()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Decaying => "decaying",
            Self::Expired => "expired",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when parsing an unknown state label.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown particle state `{0}`")]
pub struct UnknownState(pub String);

impl FromStr for ParticleState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "decaying" => Ok(Self::Decaying),
            "expired" => Ok(Self::Expired),
            "merged" => Ok(Self::Merged),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Names of the five personality traits, used in fault reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraitKind {
    Curiosity,
    SocialAffinity,
    Aggression,
    Stability,
    GrowthPotential,
}

/// Five-scalar personality fingerprint, each component in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TraitVector {
    pub curiosity: f64,
    pub social_affinity: f64,
    pub aggression: f64,
    pub stability: f64,
    pub growth_potential: f64,
}

impl Default for TraitVector {
    fn default() -> Self {
        Self::uniform(0.5)
    }
}

impl TraitVector {
    /// Build a vector, clamping every component into `[0, 1]`.
    #[must_use]
    pub fn new(
        curiosity: f64,
        social_affinity: f64,
        aggression: f64,
        stability: f64,
        growth_potential: f64,
    ) -> Self {
        Self {
            curiosity,
            social_affinity,
            aggression,
            stability,
            growth_potential,
        }
        .clamped()
    }

    #[must_use]
    pub fn uniform(value: f64) -> Self {
        Self::new(value, value, value, value, value)
    }

    /// Sample every trait uniformly from `[0, 1)`.
    pub fn random(rng: &mut dyn RngCore) -> Self {
        Self::new(
            rng.random::<f64>(),
            rng.random::<f64>(),
            rng.random::<f64>(),
            rng.random::<f64>(),
            rng.random::<f64>(),
        )
    }

    /// Copy with each component clamped into `[0, 1]`. NaN collapses to 0.
    #[must_use]
    pub fn clamped(self) -> Self {
        fn clamp01(value: f64) -> f64 {
            if value.is_nan() {
                0.0
            } else {
                value.clamp(0.0, 1.0)
            }
        }
        Self {
            curiosity: clamp01(self.curiosity),
            social_affinity: clamp01(self.social_affinity),
            aggression: clamp01(self.aggression),
            stability: clamp01(self.stability),
            growth_potential: clamp01(self.growth_potential),
        }
    }

    fn components(&self) -> [(TraitKind, f64); 5] {
        [
            (TraitKind::Curiosity, self.curiosity),
            (TraitKind::SocialAffinity, self.social_affinity),
            (TraitKind::Aggression, self.aggression),
            (TraitKind::Stability, self.stability),
            (TraitKind::GrowthPotential, self.growth_potential),
        ]
    }

    /// Returns the first component outside `[0, 1]`, if any.
    #[must_use]
    pub fn out_of_range(&self) -> Option<(TraitKind, f64)> {
        self.components()
            .into_iter()
            .find(|(_, value)| !(0.0..=1.0).contains(value))
    }

    /// Fission instability: `aggression * (1 - stability)`.
    #[must_use]
    pub fn instability(&self) -> f64 {
        self.aggression * (1.0 - self.stability)
    }
}

/// A trait vector stamped with its position in a particle's trait history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TraitRecord {
    pub particle_id: ParticleId,
    pub version: u64,
    pub traits: TraitVector,
    pub recorded_at: DateTime<Utc>,
}

/// Per-entity invariant violations. The offending particle is skipped for the tick.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum ParticleFault {
    #[error("particle {id}: {field} is not finite")]
    NonFinite { id: ParticleId, field: &'static str },
    #[error("particle {id}: position ({x}, {y}) lies outside the world")]
    OutOfWorld { id: ParticleId, x: f64, y: f64 },
    #[error("particle {id}: energy {energy} outside [0, 100]")]
    EnergyOutOfRange { id: ParticleId, energy: f64 },
    #[error("particle {id}: mass {mass} must be positive")]
    NonPositiveMass { id: ParticleId, mass: f64 },
    #[error("particle {id}: trait {kind:?} = {value} outside [0, 1]")]
    TraitOutOfRange {
        id: ParticleId,
        kind: TraitKind,
        value: f64,
    },
}

/// A simulated personality-bearing entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub owner: UserId,
    pub position: Position,
    pub velocity: Velocity,
    pub mass: f64,
    pub energy: f64,
    pub state: ParticleState,
    pub decay_level: u32,
    pub last_input_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Particle {
    /// Fresh Active particle at a uniformly random position with zero velocity and full energy.
    pub fn spawn(
        owner: UserId,
        rng: &mut dyn RngCore,
        world_size: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let x = rng.random_range(0.0..world_size);
        let y = rng.random_range(0.0..world_size);
        let mut particle = Self::at(ParticleId::random(rng), Position::new(x, y), now);
        particle.owner = owner;
        particle
    }

    /// Active particle at `position` with default kinematics. Mostly useful for tests and seeding.
    #[must_use]
    pub fn at(id: ParticleId, position: Position, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner: UserId::default(),
            position,
            velocity: Velocity::default(),
            mass: 1.0,
            energy: MAX_ENERGY,
            state: ParticleState::Active,
            decay_level: 0,
            last_input_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record user input. A decaying particle becomes active again.
    pub fn record_input(&mut self, now: DateTime<Utc>) {
        self.last_input_at = Some(now);
        if self.state == ParticleState::Decaying {
            self.state = ParticleState::Active;
            self.decay_level = 0;
        }
        self.updated_at = now;
    }

    /// Time since the last input, falling back to the creation time.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_input_at.unwrap_or(self.created_at)
    }

    /// Check the kinematic invariants against a world of side `world_size`.
    pub fn validate(&self, world_size: f64) -> Result<(), ParticleFault> {
        let id = self.id;
        for (field, value) in [
            ("position.x", self.position.x),
            ("position.y", self.position.y),
            ("velocity.vx", self.velocity.vx),
            ("velocity.vy", self.velocity.vy),
            ("mass", self.mass),
            ("energy", self.energy),
        ] {
            if !value.is_finite() {
                return Err(ParticleFault::NonFinite { id, field });
            }
        }
        let in_world = |v: f64| (0.0..world_size).contains(&v);
        if !in_world(self.position.x) || !in_world(self.position.y) {
            return Err(ParticleFault::OutOfWorld {
                id,
                x: self.position.x,
                y: self.position.y,
            });
        }
        if !(0.0..=MAX_ENERGY).contains(&self.energy) {
            return Err(ParticleFault::EnergyOutOfRange {
                id,
                energy: self.energy,
            });
        }
        if self.mass <= 0.0 {
            return Err(ParticleFault::NonPositiveMass {
                id,
                mass: self.mass,
            });
        }
        Ok(())
    }
}

/// Check that every trait scalar of `particle`'s vector lies in `[0, 1]`.
pub fn validate_traits(id: ParticleId, traits: &TraitVector) -> Result<(), ParticleFault> {
    match traits.out_of_range() {
        Some((kind, value)) => Err(ParticleFault::TraitOutOfRange { id, kind, value }),
        None => Ok(()),
    }
}

/// Immutable per-tick summary used for external reporting only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub tick: Tick,
    pub recorded_at: DateTime<Utc>,
    pub active_count: usize,
    pub mean_energy: f64,
    pub interaction_count: usize,
    pub merges: usize,
    pub fissions: usize,
    pub expirations: usize,
    pub faults: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn trait_vector_clamps_on_construction() {
        let traits = TraitVector::new(-0.5, 1.5, 0.3, f64::NAN, 1.0);
        assert_eq!(traits.curiosity, 0.0);
        assert_eq!(traits.social_affinity, 1.0);
        assert_eq!(traits.aggression, 0.3);
        assert_eq!(traits.stability, 0.0);
        assert!(traits.out_of_range().is_none());
    }

    #[test]
    fn raw_out_of_range_traits_are_reported() {
        let traits = TraitVector {
            aggression: 1.2,
            ..TraitVector::default()
        };
        let id = ParticleId::default();
        assert_eq!(
            validate_traits(id, &traits),
            Err(ParticleFault::TraitOutOfRange {
                id,
                kind: TraitKind::Aggression,
                value: 1.2
            })
        );
    }

    #[test]
    fn spawn_produces_active_particle_inside_world() {
        let mut rng = SmallRng::seed_from_u64(3);
        let particle = Particle::spawn(UserId::default(), &mut rng, 1000.0, epoch());
        assert_eq!(particle.state, ParticleState::Active);
        assert_eq!(particle.decay_level, 0);
        assert_eq!(particle.velocity, Velocity::default());
        assert_eq!(particle.energy, MAX_ENERGY);
        assert!(particle.validate(1000.0).is_ok());
    }

    #[test]
    fn seeded_ids_are_reproducible() {
        let a = ParticleId::random(&mut SmallRng::seed_from_u64(9));
        let b = ParticleId::random(&mut SmallRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn validate_flags_each_invariant() {
        let mut p = Particle::at(ParticleId::default(), Position::new(10.0, 10.0), epoch());
        p.energy = 101.0;
        assert!(matches!(
            p.validate(1000.0),
            Err(ParticleFault::EnergyOutOfRange { .. })
        ));
        p.energy = 50.0;
        p.position.x = 1000.0;
        assert!(matches!(
            p.validate(1000.0),
            Err(ParticleFault::OutOfWorld { .. })
        ));
        p.position.x = 5.0;
        p.velocity.vy = f64::INFINITY;
        assert!(matches!(
            p.validate(1000.0),
            Err(ParticleFault::NonFinite {
                field: "velocity.vy",
                ..
            })
        ));
    }

    #[test]
    fn input_reactivates_decaying_particle() {
        let mut p = Particle::at(ParticleId::default(), Position::new(1.0, 1.0), epoch());
        p.state = ParticleState::Decaying;
        p.decay_level = 40;
        p.record_input(epoch() + Duration::hours(1));
        assert_eq!(p.state, ParticleState::Active);
        assert_eq!(p.decay_level, 0);
    }

    #[test]
    fn state_labels_roundtrip() {
        for state in [
            ParticleState::Active,
            ParticleState::Decaying,
            ParticleState::Expired,
            ParticleState::Merged,
        ] {
            assert_eq!(state.as_str().parse::<ParticleState>(), Ok(state));
        }
        assert!("gone".parse::<ParticleState>().is_err());
    }
}
