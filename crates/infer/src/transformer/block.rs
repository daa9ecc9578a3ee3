use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_nn::ops::rms_norm;
use docvl_core::cache::DynamicCache;

use crate::config::TextConfig;

use super::{
    attention::attention_forward,
    ops::{Activation, apply_linear},
    weights::{DecoderLayerWeights, MlpWeights},
};

pub struct LayerContext<'a> {
    pub cfg: &'a TextConfig,
    pub activation: Activation,
    pub cos: &'a Tensor,
    pub sin: &'a Tensor,
    pub attn_bias: Option<&'a Tensor>,
}

pub fn decoder_layer_forward(
    ctx: &LayerContext<'_>,
    layer_idx: usize,
    layer: &DecoderLayerWeights,
    hidden_states: &Tensor,
    cache: &mut DynamicCache,
) -> Result<Tensor> {
    let eps = ctx.cfg.rms_norm_eps as f32;
    let normed = rms_norm(hidden_states, &layer.input_layernorm, eps)
        .context("input rms norm failed")?;
    let attn_out = attention_forward(
        ctx.cfg,
        layer_idx,
        &normed,
        &layer.attention,
        ctx.cos,
        ctx.sin,
        ctx.attn_bias,
        cache,
    )?;
    let hidden_states = hidden_states
        .add(&attn_out)
        .context("attention residual add failed")?;

    let normed = rms_norm(&hidden_states, &layer.post_attention_layernorm, eps)
        .context("post-attention rms norm failed")?;
    let mlp_out = mlp_forward(&normed, &layer.mlp, ctx.activation).context("mlp forward failed")?;
    hidden_states
        .add(&mlp_out)
        .context("mlp residual add failed")
}

fn mlp_forward(input: &Tensor, mlp: &MlpWeights, activation: Activation) -> Result<Tensor> {
    let gate = activation.forward(&apply_linear(input, &mlp.gate_proj)?)?;
    let up = apply_linear(input, &mlp.up_proj)?;
    apply_linear(&gate.mul(&up)?, &mlp.down_proj)
}
