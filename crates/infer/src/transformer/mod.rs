mod attention;
mod block;
mod model;
mod ops;
mod rope;
mod weights;

pub use attention::{build_causal_bias, repeat_kv};
pub use model::{DecoderOutput, LanguageDecoder};
pub use ops::{Activation, apply_linear, rotate_half};
pub use rope::{RotaryEmbedding, apply_rotary};
pub use weights::{
    AttentionWeights, DecoderLayerWeights, LinearWeights, LmHead, MlpWeights, ModelWeights,
};
