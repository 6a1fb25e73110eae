//! Semantic token generation (text context to semantic tokens)
//!
//! The stage assembles a fixed-length prompt context (offset text tokens,
//! voice history, infer marker), then samples one semantic token per step
//! until the stop sentinel. The pad sentinel doubles as end-of-sequence, and
//! ids beyond it (a padded classifier head) are masked out before sampling.

use std::collections::HashSet;

use anyhow::{bail, Result};
use candle_core::Tensor;
use tracing::debug;

use crate::generation::cache::CacheManager;
use crate::generation::sampling::{probabilities, Sampler};
use crate::models::{AutoregressiveModel, SemanticConfig};
use crate::GenerationOptions;

/// Semantic stage result.
#[derive(Debug)]
pub struct SemanticOutput {
    /// Generated semantic tokens, stop sentinel excluded.
    pub tokens: Vec<u32>,
    /// The encoded input context, kept for diagnostics.
    pub encoded_text: Vec<u32>,
}

/// Drives token-by-token semantic generation against an opaque model.
pub struct SemanticStage<'a, M: AutoregressiveModel> {
    model: &'a M,
    config: &'a SemanticConfig,
}

impl<'a, M: AutoregressiveModel> SemanticStage<'a, M> {
    pub fn new(model: &'a M, config: &'a SemanticConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    /// Build the fixed-length prompt context from raw tokenizer ids and an
    /// optional voice prompt.
    ///
    /// Layout: `text_context_len` offset text tokens (truncated, right-padded
    /// with the text pad sentinel), `history_context_len` voice-history
    /// tokens (right-padded with the semantic pad sentinel), then the infer
    /// marker.
    pub fn encode_context(
        &self,
        text_tokens: &[u32],
        voice_semantic: Option<&[u32]>,
    ) -> Vec<u32> {
        let cfg = self.config;

        let mut context: Vec<u32> = text_tokens
            .iter()
            .take(cfg.text_context_len)
            .map(|&t| t + cfg.text_encoding_offset)
            .collect();
        context.resize(cfg.text_context_len, cfg.text_pad_token);

        let history = voice_semantic.unwrap_or(&[]);
        let tail_start = history.len().saturating_sub(cfg.history_context_len);
        context.extend_from_slice(&history[tail_start..]);
        context.resize(
            cfg.text_context_len + cfg.history_context_len,
            cfg.pad_token,
        );

        context.push(cfg.infer_token);
        context
    }

    /// Generate semantic tokens for an encoded text prompt.
    pub fn generate(
        &self,
        text_tokens: &[u32],
        opts: &GenerationOptions,
        sampler: &mut Sampler,
    ) -> Result<SemanticOutput> {
        let cfg = self.config;
        let voice_semantic = opts.voice.as_ref().map(|v| v.semantic.as_slice());
        let encoded = self.encode_context(text_tokens, voice_semantic);

        let mut context = encoded.clone();
        let mut cache = CacheManager::new(self.model.num_layers(), opts.use_kv_cache);

        // Ordinary vocabulary plus the pad sentinel; everything else
        // (padded classifier head) is masked before sampling.
        let mut allowed: HashSet<usize> = (0..cfg.vocab_size).collect();
        allowed.insert(cfg.pad_token as usize);
        let eos = cfg.pad_token;

        let mut tokens = Vec::new();
        let mut stopped = false;
        for _ in 0..cfg.max_steps {
            opts.ensure_active()?;

            let logits = forward_step(self.model, &context, &mut cache)?;
            if logits.len() < cfg.min_logits_len() {
                bail!(
                    "semantic logits length {} cannot index the stop sentinel {}",
                    logits.len(),
                    eos
                );
            }

            let probs = probabilities(&logits, opts.temperature, Some(&allowed))?;
            if let Some(min_eos_p) = opts.min_eos_p {
                if f64::from(probs[eos as usize]) >= min_eos_p {
                    stopped = true;
                    break;
                }
            }

            let next = sampler.sample_from_probs(&probs)? as u32;
            if next == eos {
                stopped = true;
                break;
            }

            tokens.push(next);
            context.push(next);
        }

        if !stopped {
            bail!(
                "semantic stage hit the {} step cap without emitting the stop sentinel",
                cfg.max_steps
            );
        }

        debug!(
            generated = tokens.len(),
            context = encoded.len(),
            "semantic stage done"
        );
        Ok(SemanticOutput {
            tokens,
            encoded_text: encoded,
        })
    }
}

/// One model forward: newest tokens only when the cache carries the rest,
/// the full context otherwise.
pub(crate) fn forward_step<M: AutoregressiveModel>(
    model: &M,
    context: &[u32],
    cache: &mut CacheManager,
) -> Result<Vec<f32>> {
    let new = if cache.enabled() {
        &context[cache.len()..]
    } else {
        context
    };
    if new.is_empty() {
        bail!("model forward requires at least one new token");
    }

    let tokens = Tensor::new(new, model.device())?.unsqueeze(0)?;
    let logits = model.forward(&tokens, cache)?;
    if cache.enabled() {
        cache.append(new.len())?;
    }
    Ok(logits.flatten_all()?.to_vec1::<f32>()?)
}
