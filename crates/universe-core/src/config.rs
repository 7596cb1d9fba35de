//! Static and runtime-tunable engine configuration.

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use universe_index::MAX_CELLS_PER_AXIS;

/// Longest accepted scheduler cadence.
pub const MAX_TICK_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Errors raised while validating configuration. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Weights applied to the five compatibility terms. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompatibilityWeights {
    pub curiosity: f64,
    pub social_affinity: f64,
    pub aggression: f64,
    pub stability: f64,
    pub growth_potential: f64,
}

impl Default for CompatibilityWeights {
    fn default() -> Self {
        Self {
            curiosity: 0.20,
            social_affinity: 0.30,
            aggression: 0.20,
            stability: 0.15,
            growth_potential: 0.15,
        }
    }
}

impl CompatibilityWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.curiosity + self.social_affinity + self.aggression + self.stability + self.growth_potential
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            self.curiosity,
            self.social_affinity,
            self.aggression,
            self.stability,
            self.growth_potential,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(
                "compatibility weights must be finite and non-negative",
            ));
        }
        if (self.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid("compatibility weights must sum to 1"));
        }
        Ok(())
    }
}

/// Lower bounds of the Merge, Bond and Attract bands. Anything below `attract` repels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractionThresholds {
    pub merge: f64,
    pub bond: f64,
    pub attract: f64,
}

impl Default for InteractionThresholds {
    fn default() -> Self {
        Self {
            merge: 0.85,
            bond: 0.65,
            attract: 0.50,
        }
    }
}

impl InteractionThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = 0.0 <= self.attract
            && self.attract <= self.bond
            && self.bond <= self.merge
            && self.merge <= 1.0;
        if !ordered {
            return Err(ConfigError::Invalid(
                "interaction thresholds must satisfy 0 <= attract <= bond <= merge <= 1",
            ));
        }
        Ok(())
    }
}

/// Magnitudes applied by the interaction effects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractionTuning {
    /// Share of a bonded particle's own velocity kept after alignment.
    pub bond_self_weight: f64,
    /// Energy granted to each bonded particle.
    pub bond_energy_gain: f64,
    /// Velocity change per unit strength applied by Attract.
    pub attract_force: f64,
    /// Repel impulse per unit strength at unit distance; falls off as 1/distance.
    pub repel_force: f64,
    /// Stability bonus carried by the merged trait vector.
    pub merge_stability_boost: f64,
}

impl Default for InteractionTuning {
    fn default() -> Self {
        Self {
            bond_self_weight: 0.3,
            bond_energy_gain: 1.0,
            attract_force: 0.5,
            repel_force: 10.0,
            merge_stability_boost: 0.1,
        }
    }
}

impl InteractionTuning {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.bond_self_weight) {
            return Err(ConfigError::Invalid("bond_self_weight must lie in [0, 1]"));
        }
        let magnitudes = [
            self.bond_energy_gain,
            self.attract_force,
            self.repel_force,
            self.merge_stability_boost,
        ];
        if magnitudes.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(ConfigError::Invalid(
                "interaction magnitudes must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Decay and fission parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds without input before a particle starts decaying.
    pub inactivity_threshold_secs: i64,
    pub decay_step: u32,
    pub expiry_level: u32,
    pub fission_min_mass: f64,
    pub fission_min_energy: f64,
    pub instability_threshold: f64,
    pub fission_probability: f64,
    /// Fraction of the parent's energy lost during fission.
    pub fission_energy_loss: f64,
    /// Maximum positional offset of a fission child on each axis.
    pub spawn_jitter: f64,
    /// Maximum velocity perturbation of a fission child on each axis.
    pub velocity_jitter: f64,
    /// Amount each child's traits are pushed away from the parent's.
    pub trait_skew: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_secs: 24 * 60 * 60,
            decay_step: 10,
            expiry_level: 100,
            fission_min_mass: 2.0,
            fission_min_energy: 40.0,
            instability_threshold: 0.6,
            fission_probability: 0.2,
            fission_energy_loss: 0.1,
            spawn_jitter: 5.0,
            velocity_jitter: 0.5,
            trait_skew: 0.15,
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.inactivity_threshold_secs < 0
            || chrono::Duration::try_seconds(self.inactivity_threshold_secs).is_none()
        {
            return Err(ConfigError::Invalid(
                "inactivity_threshold_secs must be non-negative and representable as a duration",
            ));
        }
        if self.decay_step == 0 {
            return Err(ConfigError::Invalid("decay_step must be non-zero"));
        }
        if self.expiry_level == 0 {
            return Err(ConfigError::Invalid("expiry_level must be non-zero"));
        }
        let unit = 0.0..=1.0;
        if !unit.contains(&self.fission_probability)
            || !unit.contains(&self.fission_energy_loss)
            || !unit.contains(&self.instability_threshold)
            || !unit.contains(&self.trait_skew)
        {
            return Err(ConfigError::Invalid(
                "fission probability, energy loss, instability threshold and trait skew must lie in [0, 1]",
            ));
        }
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !(self.fission_min_mass.is_finite() && self.fission_min_mass > 0.0)
            || !non_negative(self.fission_min_energy)
            || !non_negative(self.spawn_jitter)
            || !non_negative(self.velocity_jitter)
        {
            return Err(ConfigError::Invalid(
                "fission mass must be positive and energy/jitter finite and non-negative",
            ));
        }
        Ok(())
    }

    /// Inactivity threshold as a chrono duration.
    #[must_use]
    pub fn inactivity_threshold(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.inactivity_threshold_secs).unwrap_or(chrono::Duration::MAX)
    }
}

/// Static configuration for a universe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UniverseConfig {
    /// Side length of the square toroidal world.
    pub world_size: f64,
    /// Radius within which Active pairs interact.
    pub interaction_radius: f64,
    /// Per-axis velocity limit applied after interactions.
    pub max_axis_velocity: f64,
    /// Energy drained per unit of speed during movement.
    pub movement_energy_cost: f64,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Number of snapshots retained in memory.
    pub history_capacity: usize,
    /// Cadence of the background scheduler.
    pub tick_interval_ms: u64,
    pub weights: CompatibilityWeights,
    pub thresholds: InteractionThresholds,
    pub interaction: InteractionTuning,
    pub lifecycle: LifecycleConfig,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            world_size: 1000.0,
            interaction_radius: 50.0,
            max_axis_velocity: 5.0,
            movement_energy_cost: 0.01,
            rng_seed: None,
            history_capacity: 256,
            tick_interval_ms: 1000,
            weights: CompatibilityWeights::default(),
            thresholds: InteractionThresholds::default(),
            interaction: InteractionTuning::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl UniverseConfig {
    /// Reject configurations that must never reach a running engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.world_size.is_finite() || self.world_size <= 0.0 {
            return Err(ConfigError::Invalid("world_size must be positive"));
        }
        if !self.interaction_radius.is_finite() || self.interaction_radius <= 0.0 {
            return Err(ConfigError::Invalid("interaction_radius must be positive"));
        }
        if self.interaction_radius >= self.world_size / 2.0 {
            return Err(ConfigError::Invalid(
                "interaction_radius must be smaller than half the world size",
            ));
        }
        if self.world_size / self.interaction_radius > MAX_CELLS_PER_AXIS as f64 {
            return Err(ConfigError::Invalid(
                "interaction_radius is too small relative to world_size",
            ));
        }
        if !self.max_axis_velocity.is_finite() || self.max_axis_velocity <= 0.0 {
            return Err(ConfigError::Invalid("max_axis_velocity must be positive"));
        }
        if !self.movement_energy_cost.is_finite() || self.movement_energy_cost < 0.0 {
            return Err(ConfigError::Invalid(
                "movement_energy_cost must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be non-zero"));
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms > MAX_TICK_INTERVAL_MS {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be between 1 ms and one day",
            ));
        }
        self.weights.validate()?;
        self.thresholds.validate()?;
        self.interaction.validate()?;
        self.lifecycle.validate()
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(UniverseConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_negative_radius() {
        let config = UniverseConfig {
            interaction_radius: -1.0,
            ..UniverseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_radius_spanning_half_the_world() {
        let config = UniverseConfig {
            interaction_radius: 500.0,
            ..UniverseConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = UniverseConfig::default();
        config.thresholds.bond = 0.9;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(
                "interaction thresholds must satisfy 0 <= attract <= bond <= merge <= 1"
            ))
        );
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let mut config = UniverseConfig::default();
        config.weights.social_affinity = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_probability_outside_unit_interval() {
        let mut config = UniverseConfig::default();
        config.lifecycle.fission_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inactivity_threshold_beyond_duration_range() {
        let mut config = UniverseConfig::default();
        config.lifecycle.inactivity_threshold_secs = i64::MAX;
        assert!(config.validate().is_err());

        config.lifecycle.inactivity_threshold_secs = -1;
        assert!(config.validate().is_err());

        config.lifecycle.inactivity_threshold_secs = i64::MAX / 1000;
        assert!(config.validate().is_ok());
        assert!(config.lifecycle.inactivity_threshold() > chrono::Duration::days(365));
    }

    #[test]
    fn rejects_tick_interval_longer_than_a_day() {
        let mut config = UniverseConfig {
            tick_interval_ms: MAX_TICK_INTERVAL_MS + 1,
            ..UniverseConfig::default()
        };
        assert!(config.validate().is_err());

        config.tick_interval_ms = u64::MAX;
        assert!(config.validate().is_err());

        config.tick_interval_ms = MAX_TICK_INTERVAL_MS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_radius_too_small_for_the_grid() {
        let mut config = UniverseConfig {
            interaction_radius: 1e-4,
            ..UniverseConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(
                "interaction_radius is too small relative to world_size"
            ))
        );

        config.interaction_radius = config.world_size / MAX_CELLS_PER_AXIS as f64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_finite_jitter() {
        let mut config = UniverseConfig::default();
        config.lifecycle.spawn_jitter = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = UniverseConfig::default();
        config.lifecycle.velocity_jitter = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: UniverseConfig =
            serde_json::from_str(r#"{"interaction_radius": 25.0, "thresholds": {"merge": 0.9}}"#)
                .expect("parse");
        assert_eq!(config.interaction_radius, 25.0);
        assert_eq!(config.thresholds.merge, 0.9);
        assert_eq!(config.thresholds.bond, 0.65);
        assert_eq!(config.world_size, 1000.0);
        assert!(config.validate().is_ok());
    }
}
