//! Stage configurations for the generation cascade
//!
//! Sentinel ids and codebook counts are fields of per-stage immutable
//! configs rather than process-wide constants, so concurrent calls stay
//! independent. Defaults are the Bark values; everything can be overridden
//! from a JSON file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Semantic stage: text tokens to semantic tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    /// Ordinary semantic vocabulary size.
    #[serde(default = "default_semantic_vocab_size")]
    pub vocab_size: usize,

    /// Pad sentinel, one past the ordinary vocabulary. Doubles as the
    /// end-of-sequence marker during generation.
    #[serde(default = "default_semantic_pad_token")]
    pub pad_token: u32,

    /// Offset added to raw tokenizer ids to move them into the text region
    /// of the shared input vocabulary.
    #[serde(default = "default_text_encoding_offset")]
    pub text_encoding_offset: u32,

    /// Pad sentinel for the fixed-length text context.
    #[serde(default = "default_text_pad_token")]
    pub text_pad_token: u32,

    /// Marker appended after the text and history contexts.
    #[serde(default = "default_semantic_infer_token")]
    pub infer_token: u32,

    /// Fixed length of the encoded text context.
    #[serde(default = "default_context_len")]
    pub text_context_len: usize,

    /// Fixed length of the voice-history context.
    #[serde(default = "default_context_len")]
    pub history_context_len: usize,

    /// Hard cap on generated steps. Exceeding it without a stop sentinel is
    /// a fatal generation failure, not a truncation.
    #[serde(default = "default_semantic_max_steps")]
    pub max_steps: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_semantic_vocab_size(),
            pad_token: default_semantic_pad_token(),
            text_encoding_offset: default_text_encoding_offset(),
            text_pad_token: default_text_pad_token(),
            infer_token: default_semantic_infer_token(),
            text_context_len: default_context_len(),
            history_context_len: default_context_len(),
            max_steps: default_semantic_max_steps(),
        }
    }
}

impl SemanticConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            bail!("semantic vocab_size must be positive");
        }
        if (self.pad_token as usize) < self.vocab_size {
            bail!(
                "semantic pad sentinel {} collides with the ordinary vocabulary (size {})",
                self.pad_token,
                self.vocab_size
            );
        }
        if self.text_context_len == 0 || self.history_context_len == 0 {
            bail!("semantic context lengths must be positive");
        }
        if self.max_steps == 0 {
            bail!("semantic max_steps must be positive");
        }
        Ok(())
    }

    /// Minimum logits length able to index every sentinel this stage samples.
    pub fn min_logits_len(&self) -> usize {
        self.vocab_size.max(self.pad_token as usize + 1)
    }
}

/// Coarse stage: semantic tokens to interleaved coarse acoustic tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoarseConfig {
    /// Parallel coarse codebooks, interleaved round-robin in the flat stream.
    #[serde(default = "default_n_coarse_codebooks")]
    pub n_codebooks: usize,

    /// Entries per codebook; codebook `n` occupies the id range
    /// `[semantic_vocab_size + n * codebook_size, semantic_vocab_size + (n + 1) * codebook_size)`.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Size of the semantic id range preceding the codebook ranges.
    #[serde(default = "default_semantic_vocab_size")]
    pub semantic_vocab_size: usize,

    /// Pad sentinel for the semantic conditioning window.
    #[serde(default = "default_coarse_semantic_pad_token")]
    pub semantic_pad_token: u32,

    /// Marker between the semantic window and the coarse history.
    #[serde(default = "default_coarse_infer_token")]
    pub infer_token: u32,

    /// Fixed length of the semantic conditioning window.
    #[serde(default = "default_context_len")]
    pub semantic_window_len: usize,

    /// Semantic token rate, used for the length ratio.
    #[serde(default = "default_semantic_rate_hz")]
    pub semantic_rate_hz: f64,

    /// Coarse frame rate, used for the length ratio.
    #[serde(default = "default_coarse_rate_hz")]
    pub coarse_rate_hz: f64,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            n_codebooks: default_n_coarse_codebooks(),
            codebook_size: default_codebook_size(),
            semantic_vocab_size: default_semantic_vocab_size(),
            semantic_pad_token: default_coarse_semantic_pad_token(),
            infer_token: default_coarse_infer_token(),
            semantic_window_len: default_context_len(),
            semantic_rate_hz: default_semantic_rate_hz(),
            coarse_rate_hz: default_coarse_rate_hz(),
        }
    }
}

impl CoarseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_codebooks == 0 {
            bail!("coarse stage needs at least one codebook");
        }
        if self.codebook_size == 0 {
            bail!("coarse codebook_size must be positive");
        }
        if self.semantic_window_len == 0 {
            bail!("coarse semantic_window_len must be positive");
        }
        if !(self.semantic_rate_hz > 0.0 && self.coarse_rate_hz > 0.0) {
            bail!("token rates must be positive");
        }
        let codebook_end = self.semantic_vocab_size + self.n_codebooks * self.codebook_size;
        if (self.semantic_pad_token as usize) < codebook_end {
            bail!(
                "coarse semantic pad sentinel {} lies inside the codebook id ranges (end {})",
                self.semantic_pad_token,
                codebook_end
            );
        }
        if (self.infer_token as usize) < codebook_end {
            bail!(
                "coarse infer sentinel {} lies inside the codebook id ranges (end {})",
                self.infer_token,
                codebook_end
            );
        }
        Ok(())
    }

    /// Flat coarse tokens produced per semantic token.
    pub fn semantic_to_coarse_ratio(&self) -> f64 {
        self.coarse_rate_hz / self.semantic_rate_hz * self.n_codebooks as f64
    }

    /// Deterministic number of flat generation steps for a semantic sequence,
    /// always a multiple of the codebook count.
    pub fn step_count(&self, semantic_len: usize) -> usize {
        let frames = (semantic_len as f64 * self.semantic_to_coarse_ratio()
            / self.n_codebooks as f64)
            .floor() as usize;
        frames * self.n_codebooks
    }

    /// Minimum logits length able to index every coarse codebook id.
    pub fn min_logits_len(&self) -> usize {
        self.semantic_vocab_size + self.n_codebooks * self.codebook_size
    }
}

/// Fine stage: coarse codebooks to the full codebook stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineConfig {
    /// Total codebooks in the output stack.
    #[serde(default = "default_n_fine_codebooks")]
    pub n_fine_codebooks: usize,

    /// Codebooks supplied by the coarse stage.
    #[serde(default = "default_n_coarse_codebooks")]
    pub n_coarse_codebooks: usize,

    /// Entries per codebook; `codebook_size` itself is the pad value for
    /// not-yet-predicted positions.
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,

    /// Time positions per forward block.
    #[serde(default = "default_fine_block_len")]
    pub block_len: usize,

    /// Positions newly filled per block; earlier positions are context.
    #[serde(default = "default_fine_fill_len")]
    pub fill_len: usize,
}

impl Default for FineConfig {
    fn default() -> Self {
        Self {
            n_fine_codebooks: default_n_fine_codebooks(),
            n_coarse_codebooks: default_n_coarse_codebooks(),
            codebook_size: default_codebook_size(),
            block_len: default_fine_block_len(),
            fill_len: default_fine_fill_len(),
        }
    }
}

impl FineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_coarse_codebooks == 0 {
            bail!("fine stage needs at least one coarse codebook as input");
        }
        if self.n_fine_codebooks <= self.n_coarse_codebooks {
            bail!(
                "fine codebook count {} must exceed the coarse count {}",
                self.n_fine_codebooks,
                self.n_coarse_codebooks
            );
        }
        if self.codebook_size == 0 {
            bail!("fine codebook_size must be positive");
        }
        if self.fill_len == 0 || self.block_len < self.fill_len {
            bail!(
                "fine block geometry is invalid: block_len {} fill_len {}",
                self.block_len,
                self.fill_len
            );
        }
        Ok(())
    }
}

/// All three stage configs, loadable from one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub coarse: CoarseConfig,
    #[serde(default)]
    pub fine: FineConfig,
}

impl CascadeConfig {
    /// Load from a JSON file; absent fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate each stage and the hand-off contracts between them.
    pub fn validate(&self) -> Result<()> {
        self.semantic.validate()?;
        self.coarse.validate()?;
        self.fine.validate()?;

        if self.semantic.vocab_size != self.coarse.semantic_vocab_size {
            bail!(
                "semantic vocab_size {} disagrees with the coarse stage's semantic range {}",
                self.semantic.vocab_size,
                self.coarse.semantic_vocab_size
            );
        }
        if self.coarse.n_codebooks != self.fine.n_coarse_codebooks {
            bail!(
                "coarse stage emits {} codebooks but the fine stage expects {}",
                self.coarse.n_codebooks,
                self.fine.n_coarse_codebooks
            );
        }
        if self.coarse.codebook_size != self.fine.codebook_size {
            bail!(
                "coarse codebook_size {} disagrees with fine codebook_size {}",
                self.coarse.codebook_size,
                self.fine.codebook_size
            );
        }
        Ok(())
    }
}

// Bark defaults.
fn default_semantic_vocab_size() -> usize {
    10_000
}

fn default_semantic_pad_token() -> u32 {
    10_000
}

fn default_text_encoding_offset() -> u32 {
    10_048
}

fn default_text_pad_token() -> u32 {
    129_595
}

fn default_semantic_infer_token() -> u32 {
    129_599
}

fn default_context_len() -> usize {
    256
}

fn default_semantic_max_steps() -> usize {
    768
}

fn default_n_coarse_codebooks() -> usize {
    2
}

fn default_codebook_size() -> usize {
    1_024
}

fn default_coarse_semantic_pad_token() -> u32 {
    12_048
}

fn default_coarse_infer_token() -> u32 {
    12_050
}

fn default_semantic_rate_hz() -> f64 {
    49.9
}

fn default_coarse_rate_hz() -> f64 {
    75.0
}

fn default_n_fine_codebooks() -> usize {
    8
}

fn default_fine_block_len() -> usize {
    1_024
}

fn default_fine_fill_len() -> usize {
    512
}
