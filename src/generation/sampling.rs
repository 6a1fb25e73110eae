//! Token sampling for autoregressive generation
//!
//! A [`Sampler`] owns the random stream for one generation call, so that a
//! fixed seed reproduces identical token sequences across the whole cascade.
//! Temperature zero is rejected rather than coerced; callers that want argmax
//! decoding use [`Sampler::greedy`] explicitly.

use std::collections::HashSet;

use anyhow::{bail, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Categorical sampler over logits slices.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler seeded for one generation call.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample one token id from `logits` scaled by `1/temperature`.
    ///
    /// When `restrict_to` is given, every position outside the set is masked
    /// to `-inf` before normalizing, so the returned index is always a member
    /// of the set. The input slice is never mutated.
    pub fn sample(
        &mut self,
        logits: &[f32],
        temperature: f64,
        restrict_to: Option<&HashSet<usize>>,
    ) -> Result<usize> {
        let probs = probabilities(logits, temperature, restrict_to)?;
        self.sample_from_probs(&probs)
    }

    /// Draw one index from an already-normalized distribution.
    pub(crate) fn sample_from_probs(&mut self, probs: &[f32]) -> Result<usize> {
        let dist = WeightedIndex::new(probs)
            .map_err(|e| anyhow::anyhow!("degenerate sampling distribution: {e}"))?;
        Ok(dist.sample(&mut self.rng))
    }

    /// Argmax decoding. The explicit alternative to `temperature == 0`.
    pub fn greedy(&self, logits: &[f32]) -> Result<usize> {
        let Some((idx, _)) = logits.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1))
        else {
            bail!("cannot take argmax of empty logits");
        };
        Ok(idx)
    }
}

/// Temperature-scaled, optionally restricted categorical distribution.
///
/// Softmax is computed stably (max subtracted before exponentiating). All
/// failure modes here are configuration errors and reported as such.
pub(crate) fn probabilities(
    logits: &[f32],
    temperature: f64,
    restrict_to: Option<&HashSet<usize>>,
) -> Result<Vec<f32>> {
    if logits.is_empty() {
        bail!("cannot sample from empty logits");
    }
    if temperature <= 0.0 {
        bail!(
            "sampling temperature must be positive, got {temperature}; \
             use greedy decoding for argmax"
        );
    }
    if let Some(allowed) = restrict_to {
        if allowed.is_empty() {
            bail!("sampling restriction set is empty");
        }
    }

    let inv_temp = (1.0 / temperature) as f32;
    let scaled: Vec<f32> = logits
        .iter()
        .enumerate()
        .map(|(i, &x)| match restrict_to {
            Some(allowed) if !allowed.contains(&i) => f32::NEG_INFINITY,
            _ => x * inv_temp,
        })
        .collect();

    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        bail!("all candidate logits are -inf after masking");
    }

    let exp: Vec<f32> = scaled.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    if !(sum > 0.0 && sum.is_finite()) {
        bail!("sampling distribution does not normalize (sum = {sum})");
    }

    Ok(exp.iter().map(|&x| x / sum).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_draws() {
        let logits = vec![0.5f32; 16];
        let mut a = Sampler::new(7);
        let mut b = Sampler::new(7);
        for _ in 0..32 {
            let x = a.sample(&logits, 0.7, None).unwrap();
            let y = b.sample(&logits, 0.7, None).unwrap();
            assert_eq!(x, y);
        }
    }

    #[test]
    fn test_sample_stays_within_vocab() {
        let logits = vec![0.0f32; 10];
        let mut sampler = Sampler::new(1);
        for _ in 0..100 {
            let idx = sampler.sample(&logits, 1.0, None).unwrap();
            assert!(idx < 10);
        }
    }

    #[test]
    fn test_restriction_is_honored() {
        let logits: Vec<f32> = (0..20).map(|i| i as f32).collect();
        let allowed: HashSet<usize> = [3, 7, 11].into_iter().collect();
        let mut sampler = Sampler::new(42);
        for _ in 0..200 {
            let idx = sampler.sample(&logits, 0.7, Some(&allowed)).unwrap();
            assert!(allowed.contains(&idx));
        }
    }

    #[test]
    fn test_zero_temperature_is_rejected() {
        let logits = vec![1.0f32, 2.0];
        let mut sampler = Sampler::new(0);
        assert!(sampler.sample(&logits, 0.0, None).is_err());
        assert!(sampler.sample(&logits, -0.5, None).is_err());
    }

    #[test]
    fn test_empty_restriction_is_rejected() {
        let logits = vec![1.0f32, 2.0];
        let allowed = HashSet::new();
        let mut sampler = Sampler::new(0);
        assert!(sampler.sample(&logits, 1.0, Some(&allowed)).is_err());
    }

    #[test]
    fn test_all_masked_is_rejected() {
        let logits = vec![f32::NEG_INFINITY; 8];
        let mut sampler = Sampler::new(0);
        assert!(sampler.sample(&logits, 1.0, None).is_err());
    }

    #[test]
    fn test_peaked_logits_dominate() {
        let mut logits = vec![0.0f32; 50];
        logits[17] = 20.0;
        let mut sampler = Sampler::new(9);
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits, 0.7, None).unwrap(), 17);
        }
    }

    #[test]
    fn test_greedy() {
        let sampler = Sampler::new(0);
        let logits = vec![1.0f32, 5.0, 2.0, 4.9];
        assert_eq!(sampler.greedy(&logits).unwrap(), 1);
        assert!(sampler.greedy(&[]).is_err());
    }

    #[test]
    fn test_probabilities_normalize() {
        let logits = vec![1.0f32, 2.0, 3.0];
        let probs = probabilities(&logits, 0.7, None).unwrap();
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_probabilities_do_not_mutate_input() {
        let logits = vec![1.0f32, 2.0, 3.0];
        let before = logits.clone();
        let _ = probabilities(&logits, 0.5, None).unwrap();
        assert_eq!(logits, before);
    }
}
