//! Key/value cache lifecycle for one generation call
//!
//! A [`CacheManager`] owns one [`KvCache`] per model layer plus a logical
//! step counter. It belongs to exactly one stage invocation and is dropped
//! with the call; independent calls never share a cache.

use anyhow::{bail, Result};
use candle_core::Tensor;

/// Sequence axis of cached key/value tensors (`[batch, heads, seq, head_dim]`).
const SEQ_DIM: usize = 2;

/// Accumulated key/value tensors for a single layer.
#[derive(Default)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self { k: None, v: None }
    }

    /// Append new key steps and return the full accumulated keys.
    pub fn update_k(&mut self, k: &Tensor) -> Result<Tensor> {
        let k = if let Some(prev_k) = &self.k {
            Tensor::cat(&[prev_k, k], SEQ_DIM)?
        } else {
            k.clone()
        };
        self.k = Some(k.clone());
        Ok(k)
    }

    /// Append new value steps and return the full accumulated values.
    pub fn update_v(&mut self, v: &Tensor) -> Result<Tensor> {
        let v = if let Some(prev_v) = &self.v {
            Tensor::cat(&[prev_v, v], SEQ_DIM)?
        } else {
            v.clone()
        };
        self.v = Some(v.clone());
        Ok(v)
    }

    /// Number of accumulated steps in this layer.
    pub fn seq_len(&self) -> Result<usize> {
        match &self.k {
            Some(k) => Ok(k.dim(SEQ_DIM)?),
            None => Ok(0),
        }
    }

    fn truncate_to_last(&mut self, n: usize) -> Result<()> {
        if let Some(k) = &self.k {
            let len = k.dim(SEQ_DIM)?;
            if len > n {
                self.k = Some(k.narrow(SEQ_DIM, len - n, n)?);
            }
        }
        if let Some(v) = &self.v {
            let len = v.dim(SEQ_DIM)?;
            if len > n {
                self.v = Some(v.narrow(SEQ_DIM, len - n, n)?);
            }
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Per-stage cache: one [`KvCache`] per layer and a logical length.
///
/// With caching disabled the tensors are never populated and the length stays
/// zero; stages then resubmit the full growing context each step, which must
/// produce identical tokens for identical random draws.
pub struct CacheManager {
    layers: Vec<KvCache>,
    enabled: bool,
    len: usize,
}

impl CacheManager {
    pub fn new(num_layers: usize, enabled: bool) -> Self {
        Self {
            layers: (0..num_layers).map(|_| KvCache::new()).collect(),
            enabled,
            len: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Logical number of cached steps.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Mutable access for the model forward to fold new steps into a layer.
    pub fn layer_mut(&mut self, idx: usize) -> &mut KvCache {
        &mut self.layers[idx]
    }

    /// Advance the logical length after a forward that cached `steps` new
    /// steps. Exactly one step per generated token; prefill appends its full
    /// prime length at once.
    pub fn append(&mut self, steps: usize) -> Result<()> {
        if !self.enabled {
            bail!("cannot append to a disabled cache");
        }
        self.len += steps;
        for layer in &self.layers {
            let got = layer.seq_len()?;
            if got != self.len {
                bail!(
                    "cache layer holds {got} steps but {} were appended",
                    self.len
                );
            }
        }
        Ok(())
    }

    /// Keep only the most recent `n` steps in every layer.
    ///
    /// No-op when the current length is at most `n`; remaining steps keep
    /// their original order. Never fails on the no-op path.
    pub fn truncate_to_last(&mut self, n: usize) -> Result<()> {
        if self.len <= n {
            return Ok(());
        }
        for layer in &mut self.layers {
            layer.truncate_to_last(n)?;
        }
        self.len = n;
        Ok(())
    }

    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn step_tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, 1, values.len(), 1), &Device::Cpu).unwrap()
    }

    fn cached_values(cache: &mut CacheManager) -> Vec<f32> {
        let k = cache.layer_mut(0).k.as_ref().unwrap();
        k.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_append_grows_one_step_per_token() {
        let mut cache = CacheManager::new(1, true);
        for i in 0..5 {
            let t = step_tensor(&[i as f32]);
            cache.layer_mut(0).update_k(&t).unwrap();
            cache.layer_mut(0).update_v(&t).unwrap();
            cache.append(1).unwrap();
            assert_eq!(cache.len(), i + 1);
        }
    }

    #[test]
    fn test_truncate_is_noop_below_threshold() {
        let mut cache = CacheManager::new(1, true);
        let t = step_tensor(&[1.0, 2.0, 3.0]);
        cache.layer_mut(0).update_k(&t).unwrap();
        cache.layer_mut(0).update_v(&t).unwrap();
        cache.append(3).unwrap();

        cache.truncate_to_last(3).unwrap();
        assert_eq!(cache.len(), 3);
        cache.truncate_to_last(10).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cached_values(&mut cache), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_truncate_keeps_tail_in_order() {
        let mut cache = CacheManager::new(2, true);
        for layer in 0..2 {
            let t = step_tensor(&[0.0, 1.0, 2.0, 3.0, 4.0]);
            cache.layer_mut(layer).update_k(&t).unwrap();
            cache.layer_mut(layer).update_v(&t).unwrap();
        }
        cache.append(5).unwrap();

        cache.truncate_to_last(2).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cached_values(&mut cache), vec![3.0, 4.0]);
    }

    #[test]
    fn test_truncate_then_append_continues() {
        let mut cache = CacheManager::new(1, true);
        let t = step_tensor(&[1.0, 2.0, 3.0]);
        cache.layer_mut(0).update_k(&t).unwrap();
        cache.layer_mut(0).update_v(&t).unwrap();
        cache.append(3).unwrap();
        cache.truncate_to_last(2).unwrap();

        let t = step_tensor(&[4.0]);
        cache.layer_mut(0).update_k(&t).unwrap();
        cache.layer_mut(0).update_v(&t).unwrap();
        cache.append(1).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cached_values(&mut cache), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_disabled_cache_rejects_append() {
        let mut cache = CacheManager::new(1, false);
        assert!(!cache.enabled());
        assert!(cache.append(1).is_err());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cache = CacheManager::new(1, true);
        let t = step_tensor(&[1.0, 2.0]);
        cache.layer_mut(0).update_k(&t).unwrap();
        cache.layer_mut(0).update_v(&t).unwrap();
        cache.append(2).unwrap();

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.layer_mut(0).seq_len().unwrap(), 0);
    }
}
