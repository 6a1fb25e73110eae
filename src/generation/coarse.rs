//! Coarse acoustic token generation (semantic tokens to coarse codebooks)
//!
//! The coarse model consumes one flat token stream in which the parallel
//! codebooks are interleaved round-robin: codebook 0 at even offsets,
//! codebook 1 at odd offsets for the two-codebook case. Codebook `n`
//! occupies the id range `[semantic_vocab_size + n * codebook_size,
//! semantic_vocab_size + (n + 1) * codebook_size)` within the shared
//! vocabulary.
//!
//! Generation is bounded: every `sliding_window_len` tokens, or whenever the
//! conditioning grows past `max_coarse_history`, the context and cache are
//! truncated to the most recent `max_coarse_history` entries. That keeps the
//! per-step cost proportional to the history window rather than the total
//! output length.

use std::collections::HashSet;

use anyhow::{bail, ensure, Result};
use tracing::debug;

use crate::generation::cache::CacheManager;
use crate::generation::sampling::Sampler;
use crate::generation::semantic::forward_step;
use crate::models::{AutoregressiveModel, CoarseConfig};
use crate::GenerationOptions;

/// Interleave parallel codebook rows into one flat stream.
///
/// Row `n` is offset by `n * codebook_size` so the rows land in disjoint id
/// ranges; time step `t` of row `n` ends up at flat position
/// `t * n_rows + n`. All rows must have equal length.
pub fn interleave_codebooks(rows: &[Vec<u32>], codebook_size: usize) -> Result<Vec<u32>> {
    let Some(first) = rows.first() else {
        bail!("cannot interleave zero codebooks");
    };
    let len = first.len();
    for (n, row) in rows.iter().enumerate() {
        ensure!(
            row.len() == len,
            "codebook {n} has length {} but codebook 0 has {len}",
            row.len()
        );
        if let Some(&bad) = row.iter().find(|&&t| t as usize >= codebook_size) {
            bail!("codebook {n} entry {bad} is outside the codebook size {codebook_size}");
        }
    }

    let mut flat = Vec::with_capacity(len * rows.len());
    for t in 0..len {
        for (n, row) in rows.iter().enumerate() {
            flat.push(row[t] + (n * codebook_size) as u32);
        }
    }
    Ok(flat)
}

/// Split a flat interleaved stream back into codebook rows, removing the
/// per-row offsets. The exact inverse of [`interleave_codebooks`].
pub fn deinterleave_codebooks(
    flat: &[u32],
    n_codebooks: usize,
    codebook_size: usize,
) -> Result<Vec<Vec<u32>>> {
    ensure!(n_codebooks > 0, "cannot de-interleave zero codebooks");
    ensure!(
        flat.len() % n_codebooks == 0,
        "flat stream length {} is not a multiple of the codebook count {n_codebooks}",
        flat.len()
    );

    let len = flat.len() / n_codebooks;
    let mut rows = vec![Vec::with_capacity(len); n_codebooks];
    for (pos, &token) in flat.iter().enumerate() {
        let n = pos % n_codebooks;
        let lo = (n * codebook_size) as u32;
        let hi = ((n + 1) * codebook_size) as u32;
        ensure!(
            (lo..hi).contains(&token),
            "flat position {pos} holds {token}, outside codebook {n}'s range {lo}..{hi}"
        );
        rows[n].push(token - lo);
    }
    Ok(rows)
}

/// Drives windowed coarse token generation against an opaque model.
pub struct CoarseStage<'a, M: AutoregressiveModel> {
    model: &'a M,
    config: &'a CoarseConfig,
}

impl<'a, M: AutoregressiveModel> CoarseStage<'a, M> {
    pub fn new(model: &'a M, config: &'a CoarseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    /// Generate coarse tokens conditioned on a semantic sequence.
    ///
    /// Returns `n_codebooks` rows of equal length; the length is the
    /// deterministic rate-ratio function of the semantic length.
    pub fn generate(
        &self,
        semantic_tokens: &[u32],
        opts: &GenerationOptions,
        sampler: &mut Sampler,
    ) -> Result<Vec<Vec<u32>>> {
        let cfg = self.config;
        if opts.sliding_window_len == 0 {
            bail!("sliding_window_len must be positive");
        }
        if opts.max_coarse_history < cfg.n_codebooks {
            bail!(
                "max_coarse_history {} is smaller than one interleaved frame ({} codebooks)",
                opts.max_coarse_history,
                cfg.n_codebooks
            );
        }
        if let Some(&bad) = semantic_tokens
            .iter()
            .find(|&&t| t as usize >= cfg.semantic_vocab_size)
        {
            bail!(
                "semantic token {bad} is outside the semantic vocabulary {}",
                cfg.semantic_vocab_size
            );
        }

        let n_steps = cfg.step_count(semantic_tokens.len());
        if n_steps == 0 {
            return Ok(vec![Vec::new(); cfg.n_codebooks]);
        }

        let mut context = self.prime_context(semantic_tokens, opts)?;
        let mut cache = CacheManager::new(self.model.num_layers(), opts.use_kv_cache);

        // One restriction set per codebook, in round-robin order.
        let allowed: Vec<HashSet<usize>> = (0..cfg.n_codebooks)
            .map(|n| {
                let lo = cfg.semantic_vocab_size + n * cfg.codebook_size;
                (lo..lo + cfg.codebook_size).collect()
            })
            .collect();

        let mut flat = Vec::with_capacity(n_steps);
        for step in 0..n_steps {
            opts.ensure_active()?;

            let logits = forward_step(self.model, &context, &mut cache)?;
            if logits.len() < cfg.min_logits_len() {
                bail!(
                    "coarse logits length {} cannot index the codebook ranges (need {})",
                    logits.len(),
                    cfg.min_logits_len()
                );
            }

            let codebook = step % cfg.n_codebooks;
            let next =
                sampler.sample(&logits, opts.temperature, Some(&allowed[codebook]))? as u32;

            // Truncate while context and cache cover the same forwarded
            // positions; the freshly sampled token is pushed afterwards and
            // enters the cache on the next forward.
            let generated = step + 1;
            if generated % opts.sliding_window_len == 0 || context.len() > opts.max_coarse_history
            {
                if context.len() > opts.max_coarse_history {
                    context.drain(..context.len() - opts.max_coarse_history);
                }
                cache.truncate_to_last(opts.max_coarse_history)?;
            }

            flat.push(next);
            context.push(next);
        }

        let rows = self.split_output(&flat)?;
        debug!(
            steps = n_steps,
            frames = rows[0].len(),
            "coarse stage done"
        );
        Ok(rows)
    }

    /// Build the initial conditioning: semantic window, infer marker, then
    /// the tail of the interleaved voice-prompt coarse history.
    fn prime_context(
        &self,
        semantic_tokens: &[u32],
        opts: &GenerationOptions,
    ) -> Result<Vec<u32>> {
        let cfg = self.config;
        let voice = opts.voice.as_ref();

        let history_semantic = voice.map(|v| v.semantic.as_slice()).unwrap_or(&[]);
        let max_semantic_history =
            (opts.max_coarse_history as f64 / cfg.semantic_to_coarse_ratio()).floor() as usize;
        let window_start = history_semantic.len().saturating_sub(max_semantic_history);

        let mut context: Vec<u32> = history_semantic[window_start..]
            .iter()
            .chain(semantic_tokens)
            .take(cfg.semantic_window_len)
            .copied()
            .collect();
        context.resize(cfg.semantic_window_len, cfg.semantic_pad_token);
        context.push(cfg.infer_token);

        if let Some(coarse_history) = voice.map(|v| &v.coarse).filter(|c| !c.is_empty()) {
            ensure!(
                coarse_history.len() == cfg.n_codebooks,
                "voice prompt supplies {} coarse codebooks, stage expects {}",
                coarse_history.len(),
                cfg.n_codebooks
            );
            let flat = interleave_codebooks(coarse_history, cfg.codebook_size)?;
            let mut tail_len = flat.len().min(opts.max_coarse_history);
            tail_len -= tail_len % cfg.n_codebooks;
            context.extend(
                flat[flat.len() - tail_len..]
                    .iter()
                    .map(|&t| t + cfg.semantic_vocab_size as u32),
            );
        }
        Ok(context)
    }

    /// De-interleave the generated flat stream, removing the shared semantic
    /// offset first. A shape or range violation here is a propagation
    /// failure and reported rather than handed to the fine stage.
    fn split_output(&self, flat: &[u32]) -> Result<Vec<Vec<u32>>> {
        let cfg = self.config;
        let rel: Vec<u32> = flat
            .iter()
            .map(|&t| {
                let t = t as usize;
                ensure!(
                    t >= cfg.semantic_vocab_size,
                    "generated coarse token {t} lies inside the semantic id range"
                );
                Ok((t - cfg.semantic_vocab_size) as u32)
            })
            .collect::<Result<_>>()?;
        deinterleave_codebooks(&rel, cfg.n_codebooks, cfg.codebook_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_two_codebooks() {
        let rows = vec![vec![0, 1, 2], vec![3, 4, 5]];
        let flat = interleave_codebooks(&rows, 10).unwrap();
        // codebook 0 at even positions, codebook 1 (offset 10) at odd
        assert_eq!(flat, vec![0, 13, 1, 14, 2, 15]);
    }

    #[test]
    fn test_interleave_roundtrip() {
        for n_codebooks in [1usize, 2, 4] {
            let rows: Vec<Vec<u32>> = (0..n_codebooks)
                .map(|n| (0..6).map(|t| ((n * 7 + t * 3) % 16) as u32).collect())
                .collect();
            let flat = interleave_codebooks(&rows, 16).unwrap();
            let back = deinterleave_codebooks(&flat, n_codebooks, 16).unwrap();
            assert_eq!(back, rows);
        }
    }

    #[test]
    fn test_interleave_rejects_ragged_rows() {
        let rows = vec![vec![0, 1, 2], vec![3, 4]];
        assert!(interleave_codebooks(&rows, 10).is_err());
    }

    #[test]
    fn test_interleave_rejects_out_of_range_values() {
        let rows = vec![vec![0, 11]];
        assert!(interleave_codebooks(&rows, 10).is_err());
    }

    #[test]
    fn test_deinterleave_rejects_partial_frames() {
        let flat = vec![0, 10, 1];
        assert!(deinterleave_codebooks(&flat, 2, 10).is_err());
    }

    #[test]
    fn test_deinterleave_rejects_misplaced_ids() {
        // position 1 belongs to codebook 1 (range 10..20) but holds 3
        let flat = vec![0, 3];
        assert!(deinterleave_codebooks(&flat, 2, 10).is_err());
    }

    #[test]
    fn test_deinterleave_empty_stream() {
        let rows = deinterleave_codebooks(&[], 2, 10).unwrap();
        assert_eq!(rows, vec![Vec::<u32>::new(), Vec::new()]);
    }
}
