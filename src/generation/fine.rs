//! Fine acoustic token refinement (coarse codebooks to the full stack)
//!
//! Unlike the earlier stages there is no token-by-token loop: the fine model
//! predicts a whole block of time positions for one codebook per forward
//! pass. Blocks of `block_len` positions advance by `fill_len`; the leading
//! positions of each later block are already-predicted context, so blocks
//! run in order. Per-position sampling uses the shared sampler when a fine
//! temperature is supplied and explicit argmax otherwise. No cache is
//! involved.

use anyhow::{bail, ensure, Result};
use candle_core::Tensor;
use tracing::debug;

use crate::generation::sampling::Sampler;
use crate::models::{FineConfig, FineModel};
use crate::GenerationOptions;

/// Drives blockwise fine refinement against an opaque single-pass model.
pub struct FineStage<'a, M: FineModel> {
    model: &'a M,
    config: &'a FineConfig,
}

impl<'a, M: FineModel> FineStage<'a, M> {
    pub fn new(model: &'a M, config: &'a FineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    /// Fill in the remaining codebooks for a coarse token stack.
    ///
    /// `coarse` must hold exactly `n_coarse_codebooks` rows of equal length
    /// with values inside the codebook range. Returns the full stack of
    /// `n_fine_codebooks` rows with the same length.
    pub fn generate(
        &self,
        coarse: &[Vec<u32>],
        opts: &GenerationOptions,
        sampler: &mut Sampler,
    ) -> Result<Vec<Vec<u32>>> {
        let cfg = self.config;
        self.check_input(coarse)?;

        let len = coarse[0].len();
        if len == 0 {
            return Ok(vec![Vec::new(); cfg.n_fine_codebooks]);
        }

        // Time-major working buffer, padded on the right up to one block.
        // `codebook_size` is the pad value for every position not yet
        // predicted.
        let pad = cfg.codebook_size as u32;
        let padded_len = len.max(cfg.block_len);
        let mut buffer = vec![vec![pad; cfg.n_fine_codebooks]; padded_len];
        for (t, frame) in buffer.iter_mut().take(len).enumerate() {
            for (n, row) in coarse.iter().enumerate() {
                frame[n] = row[t];
            }
        }

        let n_blocks = if padded_len <= cfg.block_len {
            1
        } else {
            (padded_len - cfg.block_len).div_ceil(cfg.fill_len) + 1
        };

        for block in 0..n_blocks {
            opts.ensure_active()?;

            let start = (block * cfg.fill_len).min(padded_len - cfg.block_len);
            let fill_start = (block * cfg.fill_len).min(padded_len - cfg.fill_len);
            let rel_fill_start = fill_start - start;

            for codebook in cfg.n_coarse_codebooks..cfg.n_fine_codebooks {
                let codes = self.block_tensor(&buffer, start)?;
                let logits = self.model.forward(codebook, &codes)?;
                let (rows, vocab) = logits.dims2()?;
                ensure!(
                    rows == cfg.block_len && vocab >= cfg.codebook_size,
                    "fine logits shape ({rows}, {vocab}) does not cover a ({}, {}) block",
                    cfg.block_len,
                    cfg.codebook_size
                );

                let logits: Vec<Vec<f32>> = logits.to_vec2()?;
                for pos in rel_fill_start..cfg.block_len {
                    let relevant = &logits[pos][..cfg.codebook_size];
                    let token = match opts.fine_temperature {
                        Some(temperature) => sampler.sample(relevant, temperature, None)?,
                        None => sampler.greedy(relevant)?,
                    };
                    buffer[start + pos][codebook] = token as u32;
                }
            }
        }

        let mut rows = vec![Vec::with_capacity(len); cfg.n_fine_codebooks];
        for frame in buffer.iter().take(len) {
            for (n, row) in rows.iter_mut().enumerate() {
                row.push(frame[n]);
            }
        }
        debug!(frames = len, blocks = n_blocks, "fine stage done");
        Ok(rows)
    }

    fn check_input(&self, coarse: &[Vec<u32>]) -> Result<()> {
        let cfg = self.config;
        if coarse.len() != cfg.n_coarse_codebooks {
            bail!(
                "fine stage received {} coarse codebooks, expected {}",
                coarse.len(),
                cfg.n_coarse_codebooks
            );
        }
        let len = coarse[0].len();
        for (n, row) in coarse.iter().enumerate() {
            ensure!(
                row.len() == len,
                "coarse codebook {n} has length {}, codebook 0 has {len}",
                row.len()
            );
            if let Some(&bad) = row.iter().find(|&&t| t as usize >= cfg.codebook_size) {
                bail!(
                    "coarse codebook {n} entry {bad} is outside the codebook size {}",
                    cfg.codebook_size
                );
            }
        }
        Ok(())
    }

    /// One `(1, block_len, n_fine_codebooks)` slice of the working buffer.
    fn block_tensor(&self, buffer: &[Vec<u32>], start: usize) -> Result<Tensor> {
        let cfg = self.config;
        let mut flat = Vec::with_capacity(cfg.block_len * cfg.n_fine_codebooks);
        for frame in &buffer[start..start + cfg.block_len] {
            flat.extend_from_slice(frame);
        }
        Ok(Tensor::from_vec(
            flat,
            (1, cfg.block_len, cfg.n_fine_codebooks),
            self.model.device(),
        )?)
    }
}
