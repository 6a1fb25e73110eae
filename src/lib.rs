//! # bark-tts
//!
//! Generation control logic for a Bark-style text-to-audio token cascade:
//! text is encoded to semantic tokens, semantic tokens to coarse acoustic
//! tokens, and coarse tokens are refined into the full fine codebook stack.
//! The trained networks themselves stay behind the forward traits in
//! [`models`]; this crate owns the sampling, cache lifecycle, windowing and
//! stage hand-off contracts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bark_tts::{CascadeConfig, GenerationOptions, Pipeline};
//!
//! let config = CascadeConfig::default();
//! let pipeline = Pipeline::new(&semantic_model, &coarse_model, &fine_model,
//!                              &tokenizer, &config)?;
//! let output = pipeline.generate("Hello, world!", &GenerationOptions::default())?;
//! // output.fine is the (n_codebooks, len) stack the vocoder consumes
//! ```
//!
//! A fixed seed reproduces identical token sequences; caches and samplers
//! are created fresh per call, so concurrent calls share nothing but the
//! read-only models.

pub mod generation;
pub mod models;
pub mod tokenizer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use candle_core::{Device, Tensor};
use tracing::debug;

pub use generation::{
    CacheManager, CoarseStage, FineStage, KvCache, Sampler, SemanticOutput, SemanticStage,
};
pub use models::{AutoregressiveModel, CascadeConfig, FineModel};
pub use tokenizer::{TextEncoder, TextTokenizer};

/// Optional fixed-length prefixes carried over from a reference voice.
#[derive(Debug, Clone, Default)]
pub struct VoicePrompt {
    /// Semantic history, consumed by the semantic and coarse stages.
    pub semantic: Vec<u32>,
    /// Coarse history as codebook rows of equal length.
    pub coarse: Vec<Vec<u32>>,
}

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Sampling temperature for the semantic and coarse stages. Must be
    /// positive; greedy decoding is not expressed as temperature zero.
    pub temperature: f64,
    /// Fine stage temperature; `None` selects argmax refinement.
    pub fine_temperature: Option<f64>,
    /// Early-stop threshold on the semantic stop-sentinel probability.
    pub min_eos_p: Option<f64>,
    /// Incremental key/value caching. Disabling it recomputes over the full
    /// context each step and must produce identical tokens.
    pub use_kv_cache: bool,
    /// Cap on the coarse conditioning length, in flat tokens.
    pub max_coarse_history: usize,
    /// Coarse re-truncation granularity, in flat tokens.
    pub sliding_window_len: usize,
    /// Seed for the call's random stream.
    pub seed: u64,
    /// Optional voice prefixes.
    pub voice: Option<VoicePrompt>,
    /// Cooperative cancellation, checked between generation steps.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            fine_temperature: Some(0.5),
            min_eos_p: Some(0.2),
            use_kv_cache: true,
            max_coarse_history: 630,
            sliding_window_len: 60,
            seed: 0,
            voice: None,
            cancel: None,
        }
    }
}

impl GenerationOptions {
    /// Fail the call if cancellation was requested.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                bail!("generation cancelled");
            }
        }
        Ok(())
    }
}

/// Full cascade result.
#[derive(Debug)]
pub struct CascadeOutput {
    /// Semantic stage output, including the encoded text diagnostics.
    pub semantic: SemanticOutput,
    /// Coarse codebook rows, shape `(n_coarse, len)`.
    pub coarse: Vec<Vec<u32>>,
    /// Full codebook stack, shape `(n_fine, len)`; this is what the vocoder
    /// consumes.
    pub fine: Vec<Vec<u32>>,
}

impl CascadeOutput {
    /// The fine stack as a `(n_codebooks, len)` u32 tensor.
    pub fn fine_tensor(&self, device: &Device) -> Result<Tensor> {
        let rows = self.fine.len();
        let len = self.fine.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<u32> = self.fine.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (rows, len), device)?)
    }
}

/// The three-stage cascade behind one entry point.
///
/// Holds references to the opaque stage models and validated configs; every
/// [`generate`](Pipeline::generate) call gets a fresh sampler and fresh
/// caches.
pub struct Pipeline<'a, S, C, F, T>
where
    S: AutoregressiveModel,
    C: AutoregressiveModel,
    F: FineModel,
    T: TextEncoder,
{
    semantic: SemanticStage<'a, S>,
    coarse: CoarseStage<'a, C>,
    fine: FineStage<'a, F>,
    tokenizer: &'a T,
    config: &'a CascadeConfig,
}

impl<'a, S, C, F, T> Pipeline<'a, S, C, F, T>
where
    S: AutoregressiveModel,
    C: AutoregressiveModel,
    F: FineModel,
    T: TextEncoder,
{
    /// Wire the stages together. Configuration errors surface here, before
    /// any generation call.
    pub fn new(
        semantic_model: &'a S,
        coarse_model: &'a C,
        fine_model: &'a F,
        tokenizer: &'a T,
        config: &'a CascadeConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            semantic: SemanticStage::new(semantic_model, &config.semantic)?,
            coarse: CoarseStage::new(coarse_model, &config.coarse)?,
            fine: FineStage::new(fine_model, &config.fine)?,
            tokenizer,
            config,
        })
    }

    /// Run the full cascade for one text prompt.
    pub fn generate(&self, text: &str, opts: &GenerationOptions) -> Result<CascadeOutput> {
        let mut sampler = Sampler::new(opts.seed);

        let text_tokens = self.tokenizer.encode(text)?;
        debug!(tokens = text_tokens.len(), "text encoded");

        let semantic = self.semantic.generate(&text_tokens, opts, &mut sampler)?;
        let coarse = self.coarse.generate(&semantic.tokens, opts, &mut sampler)?;

        // Re-check the hand-off before refinement; a length that disagrees
        // with the interleave arithmetic must not reach the fine stage.
        let expected =
            self.config.coarse.step_count(semantic.tokens.len()) / self.config.coarse.n_codebooks;
        ensure!(
            coarse.len() == self.config.coarse.n_codebooks
                && coarse.iter().all(|row| row.len() == expected),
            "coarse output shape does not match the semantic length arithmetic"
        );

        let fine = self.fine.generate(&coarse, opts, &mut sampler)?;
        Ok(CascadeOutput {
            semantic,
            coarse,
            fine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_default() {
        let opts = GenerationOptions::default();
        assert!((opts.temperature - 0.7).abs() < 1e-6);
        assert_eq!(opts.fine_temperature, Some(0.5));
        assert_eq!(opts.min_eos_p, Some(0.2));
        assert!(opts.use_kv_cache);
        assert_eq!(opts.max_coarse_history, 630);
        assert_eq!(opts.sliding_window_len, 60);
        assert!(opts.voice.is_none());
    }

    #[test]
    fn test_ensure_active() {
        let mut opts = GenerationOptions::default();
        assert!(opts.ensure_active().is_ok());

        let flag = Arc::new(AtomicBool::new(false));
        opts.cancel = Some(flag.clone());
        assert!(opts.ensure_active().is_ok());

        flag.store(true, Ordering::Relaxed);
        assert!(opts.ensure_active().is_err());
    }

    #[test]
    fn test_fine_tensor_shape() {
        let output = CascadeOutput {
            semantic: SemanticOutput {
                tokens: vec![],
                encoded_text: vec![],
            },
            coarse: vec![],
            fine: vec![vec![1, 2, 3], vec![4, 5, 6]],
        };
        let tensor = output.fine_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3]);
        let values: Vec<u32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
    }
}
