//! Per-particle decay progression and fission.

use crate::config::LifecycleConfig;
use crate::model::{Particle, ParticleId, ParticleState, Position, TraitVector, Velocity};
use chrono::{DateTime, Utc};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use universe_index::Torus;

/// A state change observed during evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    pub id: ParticleId,
    pub from: ParticleState,
    pub to: ParticleState,
}

/// Advance decay for an inactive particle.
///
/// Active or Decaying particles idle for longer than the inactivity threshold gain one
/// decay step and become Decaying; reaching the expiry level expires them in the same pass.
/// Returns the transition when the state changed.
pub fn apply_decay(
    particle: &mut Particle,
    config: &LifecycleConfig,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if particle.state.is_terminal() {
        return None;
    }
    if particle.idle_for(now) <= config.inactivity_threshold() {
        return None;
    }
    let from = particle.state;
    particle.decay_level = particle.decay_level.saturating_add(config.decay_step);
    particle.state = if particle.decay_level >= config.expiry_level {
        ParticleState::Expired
    } else {
        ParticleState::Decaying
    };
    particle.updated_at = now;
    (from != particle.state).then_some(Transition {
        id: particle.id,
        from,
        to: particle.state,
    })
}

/// Deterministic part of the fission check; the stochastic draw happens in [`try_fission`].
#[must_use]
pub fn fission_candidate(particle: &Particle, traits: &TraitVector, config: &LifecycleConfig) -> bool {
    particle.state == ParticleState::Active
        && particle.mass >= config.fission_min_mass
        && particle.energy >= config.fission_min_energy
        && traits.instability() > config.instability_threshold
}

/// Two children replacing a fissioned parent.
#[derive(Debug, Clone)]
pub struct FissionPlan {
    pub parent: ParticleId,
    pub children: [(Particle, TraitVector); 2],
}

impl FissionPlan {
    #[must_use]
    pub fn child_ids(&self) -> [ParticleId; 2] {
        [self.children[0].0.id, self.children[1].0.id]
    }
}

/// Roll for fission and, on success, synthesise the two children.
///
/// The generator is only consumed for candidates so that seeded runs stay stable when
/// unrelated particles are added.
pub fn try_fission(
    particle: &Particle,
    traits: &TraitVector,
    config: &LifecycleConfig,
    torus: &Torus,
    max_axis_velocity: f64,
    rng: &mut dyn RngCore,
    now: DateTime<Utc>,
) -> Option<FissionPlan> {
    if !fission_candidate(particle, traits, config) {
        return None;
    }
    if rng.random::<f64>() >= config.fission_probability {
        return None;
    }
    let volatile = TraitVector::new(
        traits.curiosity,
        traits.social_affinity - config.trait_skew,
        traits.aggression + config.trait_skew,
        traits.stability - config.trait_skew,
        traits.growth_potential,
    );
    let settled = TraitVector::new(
        traits.curiosity,
        traits.social_affinity + config.trait_skew,
        traits.aggression - config.trait_skew,
        traits.stability + config.trait_skew,
        traits.growth_potential,
    );
    let energy = particle.energy * (1.0 - config.fission_energy_loss) / 2.0;
    let mut child = |traits: TraitVector| {
        let jitter = config.spawn_jitter;
        let kick = config.velocity_jitter;
        let position = Position::new(
            torus.wrap(particle.position.x + rng.random_range(-jitter..=jitter)),
            torus.wrap(particle.position.y + rng.random_range(-jitter..=jitter)),
        );
        let mut spawned = Particle::at(ParticleId::random(rng), position, now);
        spawned.owner = particle.owner;
        spawned.velocity = Velocity::new(
            particle.velocity.vx + rng.random_range(-kick..=kick),
            particle.velocity.vy + rng.random_range(-kick..=kick),
        )
        .clamp_axes(max_axis_velocity);
        spawned.mass = particle.mass / 2.0;
        spawned.energy = energy;
        spawned.last_input_at = particle.last_input_at;
        (spawned, traits)
    };
    let first = child(volatile);
    let second = child(settled);
    Some(FissionPlan {
        parent: particle.id,
        children: [first, second],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::{SeedableRng, rngs::SmallRng};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn particle() -> Particle {
        Particle::at(ParticleId(Uuid::from_u128(7)), Position::new(500.0, 500.0), now())
    }

    fn torus() -> Torus {
        Torus::new(1000.0).expect("torus")
    }

    fn unstable() -> TraitVector {
        TraitVector::new(0.5, 0.5, 0.95, 0.1, 0.5)
    }

    #[test]
    fn recent_input_leaves_particle_alone() {
        let mut p = particle();
        p.last_input_at = Some(now() - Duration::hours(2));
        assert_eq!(apply_decay(&mut p, &LifecycleConfig::default(), now()), None);
        assert_eq!(p.decay_level, 0);
        assert_eq!(p.state, ParticleState::Active);
    }

    #[test]
    fn inactivity_starts_decay() {
        let mut p = particle();
        p.last_input_at = Some(now() - Duration::hours(25));
        let transition = apply_decay(&mut p, &LifecycleConfig::default(), now());
        assert_eq!(
            transition,
            Some(Transition {
                id: p.id,
                from: ParticleState::Active,
                to: ParticleState::Decaying
            })
        );
        assert_eq!(p.decay_level, 10);
    }

    #[test]
    fn longest_threshold_never_decays() {
        let config = LifecycleConfig {
            inactivity_threshold_secs: i64::MAX / 1000,
            ..LifecycleConfig::default()
        };
        let mut p = particle();
        p.last_input_at = Some(now() - Duration::days(365 * 100));
        assert_eq!(apply_decay(&mut p, &config, now()), None);
        assert_eq!(p.state, ParticleState::Active);
    }

    #[test]
    fn decay_reaches_expiry_in_one_pass() {
        let mut p = particle();
        p.last_input_at = Some(now() - Duration::hours(30));
        p.decay_level = 90;
        let transition = apply_decay(&mut p, &LifecycleConfig::default(), now());
        assert!(p.decay_level >= 100);
        assert_eq!(p.state, ParticleState::Expired);
        assert_eq!(transition.map(|t| t.to), Some(ParticleState::Expired));
    }

    #[test]
    fn ten_inactive_passes_expire_a_fresh_particle() {
        let config = LifecycleConfig::default();
        let mut p = particle();
        p.last_input_at = None;
        p.created_at = now() - Duration::hours(48);
        for _ in 0..9 {
            apply_decay(&mut p, &config, now());
            assert_eq!(p.state, ParticleState::Decaying);
        }
        apply_decay(&mut p, &config, now());
        assert_eq!(p.state, ParticleState::Expired);
        assert_eq!(apply_decay(&mut p, &config, now()), None);
        assert_eq!(p.decay_level, 100);
    }

    #[test]
    fn candidate_requires_mass_energy_and_instability() {
        let config = LifecycleConfig::default();
        let mut p = particle();
        p.mass = 2.0;
        p.energy = 40.0;
        assert!(fission_candidate(&p, &unstable(), &config));
        assert!(!fission_candidate(&p, &TraitVector::uniform(0.5), &config));
        p.mass = 1.9;
        assert!(!fission_candidate(&p, &unstable(), &config));
        p.mass = 4.0;
        p.energy = 39.0;
        assert!(!fission_candidate(&p, &unstable(), &config));
        p.energy = 80.0;
        p.state = ParticleState::Decaying;
        assert!(!fission_candidate(&p, &unstable(), &config));
    }

    #[test]
    fn fission_splits_mass_and_diverges_traits() {
        let config = LifecycleConfig {
            fission_probability: 1.0,
            ..LifecycleConfig::default()
        };
        let mut p = particle();
        p.mass = 4.0;
        p.energy = 80.0;
        p.velocity = Velocity::new(1.0, -1.0);
        let mut rng = SmallRng::seed_from_u64(11);
        let plan = try_fission(&p, &unstable(), &config, &torus(), 5.0, &mut rng, now())
            .expect("fission");
        assert_eq!(plan.parent, p.id);
        let [(a, ta), (b, tb)] = &plan.children;
        assert_ne!(a.id, b.id);
        for child in [a, b] {
            assert_eq!(child.mass, 2.0);
            assert!((child.energy - 36.0).abs() < 1e-9);
            assert_eq!(child.state, ParticleState::Active);
            assert_eq!(child.owner, p.owner);
            assert!(torus().distance(child.position.as_tuple(), p.position.as_tuple()) <= 5.0 * 2f64.sqrt());
            assert!((child.velocity.vx - 1.0).abs() <= 0.5);
        }
        assert!(ta.aggression > tb.aggression);
        assert!(ta.stability < tb.stability);
        assert!(ta.social_affinity < tb.social_affinity);
        assert!(ta.out_of_range().is_none() && tb.out_of_range().is_none());
        assert_eq!(ta.aggression, 1.0);
    }

    #[test]
    fn zero_probability_never_splits() {
        let config = LifecycleConfig {
            fission_probability: 0.0,
            ..LifecycleConfig::default()
        };
        let mut p = particle();
        p.mass = 4.0;
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            assert!(try_fission(&p, &unstable(), &config, &torus(), 5.0, &mut rng, now()).is_none());
        }
    }

    #[test]
    fn fission_near_the_edge_wraps_children() {
        let config = LifecycleConfig {
            fission_probability: 1.0,
            spawn_jitter: 20.0,
            ..LifecycleConfig::default()
        };
        let mut p = particle();
        p.position = Position::new(0.5, 999.5);
        p.mass = 2.0;
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..50 {
            let plan = try_fission(&p, &unstable(), &config, &torus(), 5.0, &mut rng, now())
                .expect("fission");
            for (child, _) in &plan.children {
                assert!(child.validate(1000.0).is_ok());
            }
        }
    }
}
