//! Pure trait-vector compatibility scoring.

use crate::config::CompatibilityWeights;
use crate::model::TraitVector;

/// Score two trait vectors with the default weights.
#[must_use]
pub fn score(a: &TraitVector, b: &TraitVector) -> f64 {
    score_with(&CompatibilityWeights::default(), a, b)
}

/// Weighted compatibility in `[0, 1]`. Commutative in `a` and `b`.
#[must_use]
pub fn score_with(weights: &CompatibilityWeights, a: &TraitVector, b: &TraitVector) -> f64 {
    let similarity = |x: f64, y: f64| 1.0 - (x - y).abs();
    let total = similarity(a.curiosity, b.curiosity) * weights.curiosity
        + similarity(a.social_affinity, b.social_affinity) * weights.social_affinity
        + similarity(a.aggression, b.aggression) * weights.aggression
        + (a.stability + b.stability) / 2.0 * weights.stability
        + similarity(a.growth_potential, b.growth_potential) * weights.growth_potential;
    if total.is_nan() { 0.0 } else { total.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::SmallRng};

    const EPS: f64 = 1e-6;

    #[test]
    fn identical_high_stability_vectors_score_one() {
        let t = TraitVector::uniform(1.0);
        assert!((score(&t, &t) - 1.0).abs() < EPS);
    }

    #[test]
    fn opposite_vectors_score_zero() {
        let a = TraitVector::new(0.0, 0.0, 0.0, 0.0, 0.0);
        let b = TraitVector::new(1.0, 1.0, 1.0, 0.0, 1.0);
        assert!(score(&a, &b).abs() < EPS);
    }

    #[test]
    fn weighted_terms_match_fixture() {
        let a = TraitVector::new(0.9, 0.9, 0.1, 0.9, 0.9);
        let b = TraitVector::new(0.1, 0.1, 0.9, 0.1, 0.1);
        // 0.2*0.2 + 0.2*0.3 + 0.2*0.2 + 0.5*0.15 + 0.2*0.15
        let expected = 0.04 + 0.06 + 0.04 + 0.075 + 0.03;
        assert!((score(&a, &b) - expected).abs() < EPS);
        assert!(score(&a, &b) < 0.5);
    }

    #[test]
    fn merge_fixture_clears_merge_band() {
        let t = TraitVector::new(0.9, 0.9, 0.1, 0.9, 0.9);
        // 0.2 + 0.3 + 0.2 + 0.9*0.15 + 0.15
        assert!((score(&t, &t) - 0.985).abs() < EPS);
    }

    #[test]
    fn symmetric_and_bounded_over_random_vectors() {
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
        for _ in 0..2_000 {
            let a = TraitVector::random(&mut rng);
            let b = TraitVector::random(&mut rng);
            let ab = score(&a, &b);
            let ba = score(&b, &a);
            assert_eq!(ab, ba);
            assert!((0.0..=1.0).contains(&ab));
        }
    }

    #[test]
    fn custom_weights_are_honoured() {
        let weights = CompatibilityWeights {
            curiosity: 1.0,
            social_affinity: 0.0,
            aggression: 0.0,
            stability: 0.0,
            growth_potential: 0.0,
        };
        let a = TraitVector::new(0.25, 0.0, 1.0, 0.0, 0.0);
        let b = TraitVector::new(0.75, 1.0, 0.0, 1.0, 1.0);
        assert!((score_with(&weights, &a, &b) - 0.5).abs() < EPS);
    }
}
