use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor, shape::D};
use candle_nn::ops::softmax;
use docvl_core::cache::{DynamicCache, KvCacheChunk};

use crate::config::TextConfig;

use super::{ops::apply_linear, rope::apply_rotary, weights::AttentionWeights};

/// Causal self-attention for one layer. The new keys/values are appended to `cache` at
/// `layer_idx` and attention runs over everything cached so far.
pub fn attention_forward(
    cfg: &TextConfig,
    layer_idx: usize,
    hidden_states: &Tensor,
    weights: &AttentionWeights,
    cos: &Tensor,
    sin: &Tensor,
    attn_bias: Option<&Tensor>,
    cache: &mut DynamicCache,
) -> Result<Tensor> {
    let (batch, seq_len, hidden_size) = hidden_states.dims3()?;
    ensure!(
        hidden_size == cfg.hidden_size,
        "hidden size mismatch: cfg {} tensor {}",
        cfg.hidden_size,
        hidden_size
    );
    let head_dim = cfg.resolved_head_dim();
    let num_heads = cfg.num_attention_heads;
    let num_kv_heads = cfg.resolved_num_key_value_heads();

    let q = apply_linear(hidden_states, &weights.q_proj)?
        .reshape((batch, seq_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    let k = apply_linear(hidden_states, &weights.k_proj)?
        .reshape((batch, seq_len, num_kv_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    let v = apply_linear(hidden_states, &weights.v_proj)?
        .reshape((batch, seq_len, num_kv_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;

    let q = apply_rotary(&q, cos, sin)?;
    let k = apply_rotary(&k, cos, sin)?;

    let chunk = KvCacheChunk::new(k.transpose(2, 3)?.contiguous()?, v)?;
    let (keys_t, values) = cache
        .append(layer_idx, chunk)
        .with_context(|| format!("kv cache append failed for layer {layer_idx}"))?;

    let repeats = num_heads / num_kv_heads;
    let keys_t = repeat_kv(&keys_t, repeats)?.contiguous()?;
    let values = repeat_kv(&values, repeats)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = q
        .to_dtype(DType::F32)?
        .matmul(&keys_t.to_dtype(DType::F32)?)?;
    let mut scores = (scores * scale)?;
    if let Some(bias) = attn_bias {
        scores = scores.broadcast_add(&bias.to_dtype(DType::F32)?)?;
    }
    let probs = softmax(&scores, D::Minus1)
        .context("attention softmax failed")?
        .to_dtype(values.dtype())?;
    let context = probs
        .matmul(&values)?
        .transpose(1, 2)?
        .reshape((batch, seq_len, num_heads * head_dim))?;
    apply_linear(&context, &weights.o_proj)
}

/// Repeat each of the `heads` along axis 1 `repeats` times, keeping copies adjacent.
pub fn repeat_kv(tensor: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 1 {
        return Ok(tensor.clone());
    }
    let (batch, heads, a, b) = tensor.dims4()?;
    Ok(tensor
        .unsqueeze(2)?
        .expand((batch, heads, repeats, a, b))?
        .reshape((batch, heads * repeats, a, b))?)
}

/// Additive causal bias `[1, 1, q_len, past_len + q_len]`; `None` for single-token steps.
pub fn build_causal_bias(
    q_len: usize,
    past_len: usize,
    model_dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    if q_len <= 1 {
        return Ok(None);
    }
    let k_len = past_len + q_len;
    let rows = Tensor::arange(past_len as u32, k_len as u32, device)?.reshape((q_len, 1))?;
    let cols = Tensor::arange(0u32, k_len as u32, device)?.reshape((1, k_len))?;
    let mask = cols.broadcast_gt(&rows)?.to_dtype(DType::F32)?;
    let bias = (mask * f64::from(mask_fill_value(model_dtype)))?;
    Ok(Some(bias.reshape((1, 1, q_len, k_len))?))
}

fn mask_fill_value(dtype: DType) -> f32 {
    match dtype {
        DType::F16 | DType::BF16 => -1e4f32,
        _ => -1e9f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_bias_respects_offset() -> Result<()> {
        let bias = build_causal_bias(2, 3, DType::F32, &Device::Cpu)?
            .context("multi-token query needs a bias")?;
        assert_eq!(bias.dims(), &[1, 1, 2, 5]);
        let rows = bias.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0., 0., 0., 0., -1e9]);
        assert_eq!(rows[1], vec![0., 0., 0., 0., 0.]);
        Ok(())
    }

    #[test]
    fn single_token_has_no_bias() -> Result<()> {
        assert!(build_causal_bias(1, 7, DType::BF16, &Device::Cpu)?.is_none());
        Ok(())
    }

    #[test]
    fn repeat_kv_keeps_copies_adjacent() -> Result<()> {
        let t = Tensor::new(&[1f32, 2.], &Device::Cpu)?.reshape((1, 2, 1, 1))?;
        let repeated = repeat_kv(&t, 3)?;
        assert_eq!(
            repeated.flatten_all()?.to_vec1::<f32>()?,
            vec![1., 1., 1., 2., 2., 2.]
        );
        Ok(())
    }
}
