use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::TextConfig;

#[derive(Debug, Clone)]
pub struct LinearWeights {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub out_dim: usize,
    pub in_dim: usize,
}

impl LinearWeights {
    pub fn load(vb: VarBuilder, out_dim: usize, in_dim: usize, use_bias: bool) -> Result<Self> {
        let weight = vb
            .get((out_dim, in_dim), "weight")
            .with_context(|| format!("missing linear weight {}.weight", vb.prefix()))?
            .contiguous()?;
        let bias = if use_bias {
            Some(
                vb.get(out_dim, "bias")
                    .with_context(|| format!("missing linear bias {}.bias", vb.prefix()))?
                    .contiguous()?,
            )
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            out_dim,
            in_dim,
        })
    }

    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_dim, in_dim) = weight.dims2().context("linear weight must be 2D")?;
        if let Some(bias) = &bias {
            ensure!(
                bias.dims() == [out_dim],
                "linear bias shape {:?} does not match output dim {out_dim}",
                bias.dims()
            );
        }
        Ok(Self {
            weight,
            bias,
            out_dim,
            in_dim,
        })
    }

    pub fn matmul_2d(&self, input: &Tensor) -> Result<Tensor> {
        let weight = if self.weight.dtype() == input.dtype() {
            self.weight.clone()
        } else {
            self.weight.to_dtype(input.dtype())?
        };
        Ok(input.matmul(&weight.t()?)?)
    }
}

#[derive(Debug, Clone)]
pub struct AttentionWeights {
    pub q_proj: LinearWeights,
    pub k_proj: LinearWeights,
    pub v_proj: LinearWeights,
    pub o_proj: LinearWeights,
}

impl AttentionWeights {
    /// q/k/v carry a bias only when `attention_bias` is set; the output projection never does.
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let q_dim = cfg.num_attention_heads * cfg.resolved_head_dim();
        let kv_dim = cfg.resolved_num_key_value_heads() * cfg.resolved_head_dim();
        let hidden = cfg.hidden_size;
        let vb = vb.pp("self_attn");
        let proj = |name: &str, out: usize, inp: usize, bias: bool| {
            LinearWeights::load(vb.pp(name), out, inp, bias)
        };
        Ok(Self {
            q_proj: proj("q_proj", q_dim, hidden, cfg.attention_bias)?,
            k_proj: proj("k_proj", kv_dim, hidden, cfg.attention_bias)?,
            v_proj: proj("v_proj", kv_dim, hidden, cfg.attention_bias)?,
            o_proj: proj("o_proj", hidden, q_dim, false)?,
        })
    }
}

/// SwiGLU-style feed-forward: `down(act(gate(x)) * up(x))`, bias-free.
#[derive(Debug, Clone)]
pub struct MlpWeights {
    pub gate_proj: LinearWeights,
    pub up_proj: LinearWeights,
    pub down_proj: LinearWeights,
}

impl MlpWeights {
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        let vb = vb.pp("mlp");
        Ok(Self {
            gate_proj: LinearWeights::load(vb.pp("gate_proj"), inter, hidden, false)?,
            up_proj: LinearWeights::load(vb.pp("up_proj"), inter, hidden, false)?,
            down_proj: LinearWeights::load(vb.pp("down_proj"), hidden, inter, false)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayerWeights {
    pub attention: AttentionWeights,
    pub mlp: MlpWeights,
    pub input_layernorm: Tensor,
    pub post_attention_layernorm: Tensor,
}

impl DecoderLayerWeights {
    pub fn load(vb: &VarBuilder, cfg: &TextConfig) -> Result<Self> {
        let attention = AttentionWeights::load(vb, cfg)?;
        let mlp = MlpWeights::load(vb, cfg)?;
        let input_layernorm = vb
            .pp("input_layernorm")
            .get(cfg.hidden_size, "weight")
            .context("missing input_layernorm.weight")?
            .contiguous()?;
        let post_attention_layernorm = vb
            .pp("post_attention_layernorm")
            .get(cfg.hidden_size, "weight")
            .context("missing post_attention_layernorm.weight")?
            .contiguous()?;
        Ok(Self {
            attention,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }
}

/// Output projection: the transposed embedding table, or a separate matrix.
#[derive(Debug, Clone)]
pub enum LmHead {
    Tied,
    Untied(LinearWeights),
}

impl LmHead {
    /// `[rows, hidden]` -> `[rows, vocab]`.
    pub fn forward(&self, hidden: &Tensor, embed_tokens: &Tensor) -> Result<Tensor> {
        match self {
            LmHead::Tied => {
                let table = if embed_tokens.dtype() == hidden.dtype() {
                    embed_tokens.clone()
                } else {
                    embed_tokens.to_dtype(hidden.dtype())?
                };
                Ok(hidden.matmul(&table.t()?)?)
            }
            LmHead::Untied(weights) => {
                let mut out = weights.matmul_2d(hidden)?;
                if let Some(bias) = &weights.bias {
                    out = out.broadcast_add(bias)?;
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub embed_tokens: Tensor,
    pub layers: Vec<DecoderLayerWeights>,
    pub final_norm: Tensor,
    pub lm_head: LmHead,
}

impl ModelWeights {
    /// Load from a root builder holding `model.*` and, unless tied, `lm_head.weight`.
    pub fn load(vb: &VarBuilder, cfg: &TextConfig, tie_word_embeddings: bool) -> Result<Self> {
        let model_vb = vb.pp("model");
        let embed_tokens = model_vb
            .pp("embed_tokens")
            .get((cfg.vocab_size, cfg.hidden_size), "weight")
            .context("missing model.embed_tokens.weight")?
            .contiguous()?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            let layer_vb = model_vb.pp(format!("layers.{idx}"));
            layers.push(
                DecoderLayerWeights::load(&layer_vb, cfg)
                    .with_context(|| format!("failed to load decoder layer {idx}"))?,
            );
        }

        let final_norm = model_vb
            .pp("norm")
            .get(cfg.hidden_size, "weight")
            .context("missing model.norm.weight")?
            .contiguous()?;

        let lm_head = if tie_word_embeddings {
            LmHead::Tied
        } else {
            LmHead::Untied(
                LinearWeights::load(vb.pp("lm_head"), cfg.vocab_size, cfg.hidden_size, false)
                    .context("failed to load lm_head weights")?,
            )
        };

        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
        })
    }
}
