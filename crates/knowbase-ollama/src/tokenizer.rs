//! `Tokenizer` adapter backed by `tiktoken-rs`'s `cl100k_base` encoding,
//! the same one OpenAI-compatible embedding models are tuned against.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use knowbase_core::error::{KbError, KbResult};
use knowbase_core::ports::Tokenizer;

fn bpe() -> KbResult<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Result<CoreBPE, String>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| KbError::storage(format!("failed to initialize cl100k tokenizer: {e}")))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Cl100kTokenizer;

impl Tokenizer for Cl100kTokenizer {
    fn count_tokens(&self, text: &str) -> KbResult<usize> {
        Ok(bpe()?.encode_ordinary(text).len())
    }
}
