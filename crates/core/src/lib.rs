pub mod benchmark;
pub mod cache;
pub mod error;
pub mod generation;
pub mod inference;
pub mod runtime;
pub mod sampling;
pub mod streaming;
pub mod tensor;
pub mod tokenizer;

pub use error::OcrError;
pub use generation::{CausalDecoder, DecodedTokens, generate_tokens};
pub use inference::{
    GenerationParams, GenerationResult, ModelLoadArgs, OcrEngine, ResizeMode, StreamCallback,
    TaskKind, VisionSettings, normalize_text,
};
pub use tokenizer::{SpecialTokens, TextTokenizer, load_tokenizer};
