//! Text tokenizer wrapper
//!
//! The semantic stage needs raw token ids with no added special tokens; the
//! encoding offset and padding are applied by the stage itself.

use std::path::Path;

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

/// Narrow interface the cascade consumes for text encoding.
pub trait TextEncoder {
    /// Encode text to token ids without adding special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// Text tokenizer wrapping HuggingFace tokenizers.
pub struct TextTokenizer {
    tokenizer: Tokenizer,
}

impl TextTokenizer {
    /// Load tokenizer from a local `tokenizer.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Create from a tokenizers::Tokenizer instance.
    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl TextEncoder for TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizers::models::wordlevel::WordLevel;

    fn create_test_tokenizer() -> TextTokenizer {
        let vocab: ahash::AHashMap<String, u32> = [
            ("hello".to_string(), 0),
            ("world".to_string(), 1),
            ("test".to_string(), 2),
            ("text".to_string(), 3),
            ("[UNK]".to_string(), 4),
        ]
        .into_iter()
        .collect();

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(
            tokenizers::pre_tokenizers::whitespace::Whitespace::default(),
        ));

        TextTokenizer::from_tokenizer(tokenizer)
    }

    #[test]
    fn test_encode_known_words() {
        let tokenizer = create_test_tokenizer();
        let ids = tokenizer.encode("test text").unwrap();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_encode_adds_no_special_tokens() {
        let tokenizer = create_test_tokenizer();
        let ids = tokenizer.encode("").unwrap();
        assert!(ids.is_empty());
    }
}
