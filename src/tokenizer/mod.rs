//! Text encoding seam
//!
//! The cascade consumes text tokenization through [`TextEncoder`] only; the
//! bundled implementation wraps a HuggingFace `tokenizers` file.

mod text;

pub use text::{TextEncoder, TextTokenizer};
