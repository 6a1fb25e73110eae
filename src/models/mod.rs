//! Model seams and supporting layers for the cascade
//!
//! This module contains:
//! - `config`: per-stage immutable configuration
//! - the forward traits the stages consume (trained networks stay opaque)
//! - `wn_conv`: weight-normalized convolution primitive

pub mod config;
pub mod wn_conv;

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::generation::cache::CacheManager;

pub use config::{CascadeConfig, CoarseConfig, FineConfig, SemanticConfig};
pub use wn_conv::{WeightNormConv1d, WeightNormConvTranspose1d};

/// Forward interface of the semantic and coarse stage networks.
///
/// The implementation maps a token tensor and the call's cache to next-token
/// logits; the cascade never looks inside.
pub trait AutoregressiveModel {
    /// Layer count, used to size the per-call [`CacheManager`].
    fn num_layers(&self) -> usize;

    /// Device token tensors must be built on.
    fn device(&self) -> &Device;

    /// Compute logits for the position after the last input token.
    ///
    /// `tokens` has shape `(1, n_new)` with dtype `u32`: the full context
    /// when the cache is empty or disabled, only the newest tokens
    /// otherwise. Returns logits of shape `(vocab,)`.
    ///
    /// When the cache is enabled the model must fold exactly the new steps
    /// into every layer via [`crate::generation::KvCache::update_k`] /
    /// `update_v`; the caller advances the logical length afterwards.
    fn forward(&self, tokens: &Tensor, cache: &mut CacheManager) -> Result<Tensor>;
}

/// Forward interface of the fine stage network.
///
/// Non-autoregressive: one call predicts a whole block of time positions for
/// one codebook.
pub trait FineModel {
    /// Device code tensors must be built on.
    fn device(&self) -> &Device;

    /// Compute per-position logits for `codebook`.
    ///
    /// `codes` has shape `(1, block_len, n_fine_codebooks)` with dtype
    /// `u32`; not-yet-predicted entries hold the codebook-size pad value.
    /// Returns logits of shape `(block_len, vocab)`.
    fn forward(&self, codebook: usize, codes: &Tensor) -> Result<Tensor>;
}
