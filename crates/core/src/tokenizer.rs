use std::path::Path;

use anyhow::{Result, anyhow};
use tokenizers::{Tokenizer, TokenizerImpl};
use tracing::debug;

use crate::error::OcrError;

/// Fallback end-of-sequence id when neither the config nor the vocabulary names one.
pub const DEFAULT_EOS_TOKEN_ID: i64 = 1;

/// The subset of tokenizer behaviour the pipeline relies on.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>>;
    fn decode(&self, ids: &[i64]) -> Result<String>;
    fn token_id(&self, token: &str) -> Option<i64>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = TokenizerImpl::encode(&**self, text, false)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| u32::try_from(id).map_err(|_| anyhow!("token id {id} out of range")))
            .collect::<Result<Vec<_>>>()?;
        TokenizerImpl::decode(&**self, &ids, true).map_err(|err| anyhow!("decoding failed: {err}"))
    }

    fn token_id(&self, token: &str) -> Option<i64> {
        self.token_to_id(token).map(i64::from)
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, OcrError> {
    let tokenizer = Tokenizer::from_file(path)
        .map_err(|err| OcrError::tokenizer_load(path, anyhow!("{err}")))?;
    debug!(
        path = %path.display(),
        vocab = tokenizer.get_vocab_size(true),
        "tokenizer loaded"
    );
    Ok(tokenizer)
}

/// Special token ids resolved against the tokenizer vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<i64>,
    pub eos: i64,
}

impl SpecialTokens {
    /// Config ids win; otherwise `<s>` / `</s>` are looked up, and eos falls back to
    /// [`DEFAULT_EOS_TOKEN_ID`].
    pub fn resolve(
        tokenizer: &dyn TextTokenizer,
        bos_token_id: Option<i64>,
        eos_token_id: Option<i64>,
    ) -> Self {
        let bos = bos_token_id.or_else(|| tokenizer.token_id("<s>"));
        let eos = eos_token_id
            .or_else(|| tokenizer.token_id("</s>"))
            .unwrap_or(DEFAULT_EOS_TOKEN_ID);
        Self { bos, eos }
    }
}
