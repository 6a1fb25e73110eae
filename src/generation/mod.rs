//! Generation control logic for the cascade
//!
//! This module contains:
//! - `sampling`: temperature/categorical sampling with a seeded stream
//! - `cache`: per-call key/value cache lifecycle
//! - `semantic`, `coarse`, `fine`: the three stage drivers

pub mod cache;
pub mod coarse;
pub mod fine;
pub mod sampling;
pub mod semantic;

pub use cache::{CacheManager, KvCache};
pub use coarse::{deinterleave_codebooks, interleave_codebooks, CoarseStage};
pub use fine::FineStage;
pub use sampling::Sampler;
pub use semantic::{SemanticOutput, SemanticStage};
