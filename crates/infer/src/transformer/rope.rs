use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor, shape::D};

use super::ops::rotate_half;

/// 1-D rotary embedding with `inv_freq[i] = theta^(-2i/head_dim)`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Result<Self> {
        ensure!(
            head_dim % 2 == 0,
            "rope head dim must be even (got {head_dim})"
        );
        ensure!(theta > 0.0, "rope theta must be positive (got {theta})");
        let half = head_dim / 2;
        let inv_freq = (0..half)
            .map(|i| theta.powf(-((2 * i) as f64) / head_dim as f64) as f32)
            .collect();
        Ok(Self { inv_freq })
    }

    /// `[seq_len, head_dim]` cos/sin tables for positions `offset..offset + seq_len`.
    pub fn cos_sin(
        &self,
        offset: usize,
        seq_len: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let positions = Tensor::arange(offset as u32, (offset + seq_len) as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let inv = Tensor::from_slice(&self.inv_freq, (1, half), device)?;
        let angles = positions.broadcast_mul(&inv)?;
        let cos_half = angles.cos()?;
        let sin_half = angles.sin()?;
        let cos = Tensor::cat(&[&cos_half, &cos_half], D::Minus1)?;
        let sin = Tensor::cat(&[&sin_half, &sin_half], D::Minus1)?;
        Ok((cos.to_dtype(dtype)?, sin.to_dtype(dtype)?))
    }
}

/// `x * cos + rotate_half(x) * sin` for `x` shaped `[batch, heads, seq, head_dim]`.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_, _, seq_len, head_dim) = x.dims4()?;
    let cos = cos.reshape((1, 1, seq_len, head_dim))?;
    let sin = sin.reshape((1, 1, seq_len, head_dim))?;
    let rotated = rotate_half(x)?;
    Ok(x.broadcast_mul(&cos)?.add(&rotated.broadcast_mul(&sin)?)?)
}
