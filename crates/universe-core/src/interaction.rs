//! Classification of compatibility scores and the effects of each interaction.

use crate::compatibility::score_with;
use crate::config::{InteractionThresholds, UniverseConfig};
use crate::model::{MAX_ENERGY, Particle, ParticleId, ParticleState, Position, TraitVector, Velocity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use universe_index::Torus;

/// Closed set of pairwise interaction outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Merge,
    Bond,
    Attract,
    Repel,
}

impl InteractionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Bond => "bond",
            Self::Attract => "attract",
            Self::Repel => "repel",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient record of one resolved pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InteractionOutcome {
    pub first: ParticleId,
    pub second: ParticleId,
    pub kind: InteractionKind,
    /// Score for Merge/Bond/Attract, `1 - score` for Repel.
    pub strength: f64,
}

/// A pair whose effects could not be applied.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InteractionError {
    #[error("{kind} between {first} and {second} produced non-finite state")]
    NonFinite {
        first: ParticleId,
        second: ParticleId,
        kind: InteractionKind,
    },
    #[error("particle {0} cannot interact with itself")]
    SelfPair(ParticleId),
}

/// Map a score onto its band.
#[must_use]
pub fn classify(score: f64, thresholds: &InteractionThresholds) -> InteractionKind {
    if score >= thresholds.merge {
        InteractionKind::Merge
    } else if score >= thresholds.bond {
        InteractionKind::Bond
    } else if score >= thresholds.attract {
        InteractionKind::Attract
    } else {
        InteractionKind::Repel
    }
}

/// Strength reported for an outcome.
#[must_use]
pub fn strength(kind: InteractionKind, score: f64) -> f64 {
    match kind {
        InteractionKind::Repel => 1.0 - score,
        _ => score,
    }
}

/// One side of a pair: the particle plus its current traits.
#[derive(Debug, Clone, Copy)]
pub struct Participant<'a> {
    pub particle: &'a Particle,
    pub traits: &'a TraitVector,
}

/// Which member of a pair survived a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Survivor {
    First,
    Second,
}

/// Post-interaction copies of both particles, ready to be committed.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: InteractionOutcome,
    pub first: Particle,
    pub second: Particle,
    /// Set for merges: the survivor and its new trait vector.
    pub merged: Option<(Survivor, TraitVector)>,
}

/// Score, classify and apply one pair's effects without touching the originals.
pub fn resolve_pair(
    config: &UniverseConfig,
    torus: &Torus,
    a: Participant<'_>,
    b: Participant<'_>,
    now: DateTime<Utc>,
) -> Result<Resolution, InteractionError> {
    if a.particle.id == b.particle.id {
        return Err(InteractionError::SelfPair(a.particle.id));
    }
    let score = score_with(&config.weights, a.traits, b.traits);
    let kind = classify(score, &config.thresholds);
    let outcome = InteractionOutcome {
        first: a.particle.id,
        second: b.particle.id,
        kind,
        strength: strength(kind, score),
    };

    let mut first = a.particle.clone();
    let mut second = b.particle.clone();
    let mut merged = None;
    match kind {
        InteractionKind::Merge => {
            let survivor = if second.mass > first.mass {
                Survivor::Second
            } else {
                Survivor::First
            };
            let traits = match survivor {
                Survivor::First => {
                    merge_into(torus, &mut first, &mut second);
                    merged_traits(config, a.traits, b.traits)
                }
                Survivor::Second => {
                    merge_into(torus, &mut second, &mut first);
                    merged_traits(config, b.traits, a.traits)
                }
            };
            merged = Some((survivor, traits));
        }
        InteractionKind::Bond => bond(config, &mut first, &mut second),
        InteractionKind::Attract => {
            let (ux, uy, _) = bearing(torus, &first, &second);
            let push = config.interaction.attract_force * outcome.strength;
            first.velocity = Velocity::new(first.velocity.vx + ux * push, first.velocity.vy + uy * push)
                .clamp_axes(config.max_axis_velocity);
        }
        InteractionKind::Repel => {
            let (ux, uy, distance) = bearing(torus, &first, &second);
            let push = config.interaction.repel_force * outcome.strength / distance.max(1.0);
            first.velocity = Velocity::new(first.velocity.vx - ux * push, first.velocity.vy - uy * push)
                .clamp_axes(config.max_axis_velocity);
            second.velocity = Velocity::new(second.velocity.vx + ux * push, second.velocity.vy + uy * push)
                .clamp_axes(config.max_axis_velocity);
        }
    }
    first.updated_at = now;
    second.updated_at = now;

    if !is_finite(&first) || !is_finite(&second) {
        return Err(InteractionError::NonFinite {
            first: outcome.first,
            second: outcome.second,
            kind,
        });
    }
    Ok(Resolution {
        outcome,
        first,
        second,
        merged,
    })
}

/// Unit vector along the shortest toroidal displacement from `from` to `to`, plus its length.
fn bearing(torus: &Torus, from: &Particle, to: &Particle) -> (f64, f64, f64) {
    let (dx, dy) = torus.delta(from.position.as_tuple(), to.position.as_tuple());
    let distance = dx.hypot(dy);
    if distance <= f64::EPSILON {
        (1.0, 0.0, 0.0)
    } else {
        (dx / distance, dy / distance, distance)
    }
}

fn merge_into(torus: &Torus, target: &mut Particle, source: &mut Particle) {
    let total = target.mass + source.mass;
    let share = source.mass / total;
    let (dx, dy) = torus.delta(target.position.as_tuple(), source.position.as_tuple());
    target.position = Position::new(
        torus.wrap(target.position.x + dx * share),
        torus.wrap(target.position.y + dy * share),
    );
    target.velocity = Velocity::new(
        (target.velocity.vx * target.mass + source.velocity.vx * source.mass) / total,
        (target.velocity.vy * target.mass + source.velocity.vy * source.mass) / total,
    );
    target.mass = total;
    target.energy = (target.energy + source.energy).min(MAX_ENERGY);
    source.state = ParticleState::Merged;
}

fn merged_traits(config: &UniverseConfig, target: &TraitVector, source: &TraitVector) -> TraitVector {
    let mean = |x: f64, y: f64| (x + y) / 2.0;
    TraitVector::new(
        mean(target.curiosity, source.curiosity),
        mean(target.social_affinity, source.social_affinity),
        mean(target.aggression, source.aggression),
        (target.stability + config.interaction.merge_stability_boost).min(1.0),
        mean(target.growth_potential, source.growth_potential),
    )
}

fn bond(config: &UniverseConfig, first: &mut Particle, second: &mut Particle) {
    let own = config.interaction.bond_self_weight;
    let avg = Velocity::new(
        (first.velocity.vx + second.velocity.vx) / 2.0,
        (first.velocity.vy + second.velocity.vy) / 2.0,
    );
    for particle in [first, second] {
        particle.velocity = Velocity::new(
            own * particle.velocity.vx + (1.0 - own) * avg.vx,
            own * particle.velocity.vy + (1.0 - own) * avg.vy,
        )
        .clamp_axes(config.max_axis_velocity);
        particle.energy = (particle.energy + config.interaction.bond_energy_gain).clamp(0.0, MAX_ENERGY);
    }
}

fn is_finite(p: &Particle) -> bool {
    p.position.x.is_finite()
        && p.position.y.is_finite()
        && p.velocity.vx.is_finite()
        && p.velocity.vy.is_finite()
        && p.mass.is_finite()
        && p.energy.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn particle(n: u128, x: f64, y: f64) -> Particle {
        Particle::at(ParticleId(Uuid::from_u128(n)), Position::new(x, y), now())
    }

    fn torus() -> Torus {
        Torus::new(1000.0).expect("torus")
    }

    #[test]
    fn classification_bands() {
        let t = InteractionThresholds::default();
        assert_eq!(classify(1.0, &t), InteractionKind::Merge);
        assert_eq!(classify(0.85, &t), InteractionKind::Merge);
        assert_eq!(classify(0.849, &t), InteractionKind::Bond);
        assert_eq!(classify(0.65, &t), InteractionKind::Bond);
        assert_eq!(classify(0.5, &t), InteractionKind::Attract);
        assert_eq!(classify(0.4999, &t), InteractionKind::Repel);
        assert_eq!(classify(0.0, &t), InteractionKind::Repel);
    }

    #[test]
    fn thresholds_are_configurable() {
        let t = InteractionThresholds {
            merge: 0.7,
            bond: 0.7,
            attract: 0.3,
        };
        assert_eq!(classify(0.71, &t), InteractionKind::Merge);
        assert_eq!(classify(0.5, &t), InteractionKind::Attract);
    }

    #[test]
    fn repel_strength_inverts_score() {
        assert!((strength(InteractionKind::Repel, 0.2) - 0.8).abs() < 1e-12);
        assert_eq!(strength(InteractionKind::Bond, 0.7), 0.7);
    }

    #[test]
    fn merge_keeps_heavier_particle_and_averages_kinematics() {
        let config = UniverseConfig::default();
        let mut a = particle(1, 100.0, 100.0);
        a.energy = 70.0;
        a.velocity = Velocity::new(1.0, 0.0);
        let mut b = particle(2, 110.0, 100.0);
        b.mass = 3.0;
        b.energy = 60.0;
        b.velocity = Velocity::new(-1.0, 0.0);
        let traits = TraitVector::new(0.9, 0.9, 0.1, 0.9, 0.9);
        let res = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &traits },
            Participant { particle: &b, traits: &traits },
            now(),
        )
        .expect("resolve");
        assert_eq!(res.outcome.kind, InteractionKind::Merge);
        let (survivor, merged) = res.merged.expect("merge traits");
        assert_eq!(survivor, Survivor::Second);
        assert_eq!(res.first.state, ParticleState::Merged);
        assert_eq!(res.second.state, ParticleState::Active);
        assert_eq!(res.second.mass, 4.0);
        assert_eq!(res.second.energy, 100.0);
        assert!((res.second.position.x - 107.5).abs() < 1e-9);
        assert!((res.second.velocity.vx - (-0.5)).abs() < 1e-9);
        assert!((merged.stability - 1.0).abs() < 1e-9);
        assert!((merged.curiosity - 0.9).abs() < 1e-9);
    }

    #[test]
    fn merge_across_seam_stays_in_world() {
        let config = UniverseConfig::default();
        let a = particle(1, 998.0, 10.0);
        let b = particle(2, 4.0, 10.0);
        let traits = TraitVector::uniform(0.9);
        let res = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &traits },
            Participant { particle: &b, traits: &traits },
            now(),
        )
        .expect("resolve");
        assert_eq!(res.merged.map(|(s, _)| s), Some(Survivor::First));
        assert!((res.first.position.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bond_aligns_velocities_and_adds_energy() {
        let config = UniverseConfig::default();
        let mut a = particle(1, 0.0, 0.0);
        a.velocity = Velocity::new(2.0, 0.0);
        a.energy = 50.0;
        let mut b = particle(2, 10.0, 0.0);
        b.velocity = Velocity::new(0.0, 2.0);
        b.energy = 100.0;
        let ta = TraitVector::new(0.5, 0.5, 0.5, 0.5, 0.5);
        let tb = TraitVector::new(0.0, 0.5, 0.5, 0.5, 0.0);
        let res = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &ta },
            Participant { particle: &b, traits: &tb },
            now(),
        )
        .expect("resolve");
        // 0.1 + 0.3 + 0.2 + 0.075 + 0.075
        assert_eq!(res.outcome.kind, InteractionKind::Bond);
        assert!((res.first.velocity.vx - 1.3).abs() < 1e-9);
        assert!((res.first.velocity.vy - 0.7).abs() < 1e-9);
        assert!((res.second.velocity.vx - 0.7).abs() < 1e-9);
        assert_eq!(res.first.energy, 51.0);
        assert_eq!(res.second.energy, 100.0);
    }

    #[test]
    fn attract_pulls_only_the_first_particle() {
        let mut config = UniverseConfig::default();
        config.thresholds = InteractionThresholds {
            merge: 1.0,
            bond: 1.0,
            attract: 0.0,
        };
        let a = particle(1, 995.0, 500.0);
        let b = particle(2, 5.0, 500.0);
        let t = TraitVector::uniform(0.5);
        let res = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &t },
            Participant { particle: &b, traits: &t },
            now(),
        )
        .expect("resolve");
        assert_eq!(res.outcome.kind, InteractionKind::Attract);
        assert!(res.first.velocity.vx > 0.0, "bearing follows the seam");
        assert_eq!(res.second.velocity, Velocity::default());
    }

    #[test]
    fn repel_pushes_both_apart_and_clamps() {
        let config = UniverseConfig::default();
        let a = particle(1, 100.0, 100.0);
        let b = particle(2, 100.5, 100.0);
        let ta = TraitVector::new(0.1, 0.1, 0.9, 0.1, 0.1);
        let tb = TraitVector::new(0.9, 0.9, 0.1, 0.9, 0.9);
        let res = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &ta },
            Participant { particle: &b, traits: &tb },
            now(),
        )
        .expect("resolve");
        assert_eq!(res.outcome.kind, InteractionKind::Repel);
        assert!(res.first.velocity.vx < 0.0);
        assert!(res.second.velocity.vx > 0.0);
        assert!(res.first.velocity.vx >= -config.max_axis_velocity);
        assert!(res.second.velocity.vx <= config.max_axis_velocity);
        assert_eq!(res.first.state, ParticleState::Active);
        assert_eq!(res.second.state, ParticleState::Active);
    }

    #[test]
    fn self_pairs_are_rejected() {
        let config = UniverseConfig::default();
        let a = particle(1, 0.0, 0.0);
        let t = TraitVector::default();
        let err = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &t },
            Participant { particle: &a, traits: &t },
            now(),
        )
        .expect_err("self pair");
        assert_eq!(err, InteractionError::SelfPair(a.id));
    }

    #[test]
    fn non_finite_results_are_reported() {
        let config = UniverseConfig::default();
        let mut a = particle(1, 0.0, 0.0);
        a.velocity.vx = f64::NAN;
        let b = particle(2, 1.0, 0.0);
        let t = TraitVector::uniform(0.5);
        let err = resolve_pair(
            &config,
            &torus(),
            Participant { particle: &a, traits: &t },
            Participant { particle: &b, traits: &t },
            now(),
        )
        .expect_err("nan velocity");
        assert!(matches!(err, InteractionError::NonFinite { .. }));
    }
}
