use anyhow::{Context, Result, ensure};
use candle_core::{DType, Module, Tensor, shape::D};
use candle_nn::{Linear, VarBuilder, ops::softmax};
use tracing::trace;

use crate::{
    config::VisionConfig,
    transformer::{Activation, LinearWeights, apply_linear},
};

use super::interpolate::bicubic_resize;

/// ViT-style encoder over channel-last pixels `[batch, height, width, channels]`.
pub struct VisionEncoder {
    embeddings: VisionEmbeddings,
    layers: Vec<EncoderLayer>,
    post_layernorm: PreciseLayerNorm,
    compute_dtype: DType,
}

impl VisionEncoder {
    /// `vb` is rooted at `vision_tower`. Weights are held in f32 when the model runs in half
    /// precision.
    pub fn load(vb: &VarBuilder, cfg: &VisionConfig, model_dtype: DType) -> Result<Self> {
        let compute_dtype = resolve_compute_dtype(model_dtype);
        let vb = vb.clone().set_dtype(compute_dtype);
        let activation = Activation::from_name(&cfg.hidden_act)?;
        let embeddings = VisionEmbeddings::load(&vb.pp("embeddings"), cfg)
            .context("failed to load vision embeddings")?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(
                EncoderLayer::load(&vb.pp(format!("encoder.layers.{idx}")), cfg, activation)
                    .with_context(|| format!("failed to load vision layer {idx}"))?,
            );
        }
        let post_layernorm = PreciseLayerNorm::load(
            vb.pp("post_layernorm"),
            cfg.hidden_size,
            cfg.layer_norm_eps,
            compute_dtype,
        )?;
        Ok(Self {
            embeddings,
            layers,
            post_layernorm,
            compute_dtype,
        })
    }

    /// Patch features `[batch, num_patches, hidden]` in the input dtype, class token removed.
    pub fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let input_dtype = pixels.dtype();
        let pixels = pixels.to_dtype(self.compute_dtype)?;
        let mut hidden = self.embeddings.forward(&pixels)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        let hidden = self.post_layernorm.forward(&hidden)?;
        let hidden = if self.embeddings.class_embedding.is_some() {
            let tokens = hidden.dim(1)?;
            hidden.narrow(1, 1, tokens - 1)?
        } else {
            hidden
        };
        Ok(hidden.to_dtype(input_dtype)?)
    }
}

fn resolve_compute_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    }
}

struct VisionEmbeddings {
    patch_linear: Linear,
    position_embedding: Tensor,
    class_embedding: Option<Tensor>,
    patch_size: usize,
    num_channels: usize,
    native_grid: usize,
    hidden_size: usize,
}

impl VisionEmbeddings {
    fn load(vb: &VarBuilder, cfg: &VisionConfig) -> Result<Self> {
        let p = cfg.patch_size;
        let c = cfg.num_channels;
        let hidden = cfg.hidden_size;
        let patch_vb = vb.pp("patch_embedding");
        let kernel = patch_vb
            .get((hidden, p, p, c), "weight")
            .context("missing channel-last patch_embedding.weight")?
            .reshape((hidden, p * p * c))?;
        let bias = patch_vb
            .get(hidden, "bias")
            .context("missing patch_embedding.bias")?;
        let position_embedding = vb
            .pp("position_embedding")
            .get((cfg.num_positions(), hidden), "weight")
            .context("missing position_embedding.weight")?;
        let class_embedding = if cfg.use_class_token {
            Some(
                vb.get(hidden, "class_embedding")
                    .context("missing class_embedding")?,
            )
        } else {
            None
        };
        Ok(Self {
            patch_linear: Linear::new(kernel, Some(bias)),
            position_embedding,
            class_embedding,
            patch_size: p,
            num_channels: c,
            native_grid: cfg.native_grid(),
            hidden_size: hidden,
        })
    }

    fn forward(&self, pixels: &Tensor) -> Result<Tensor> {
        let (batch, height, width, channels) = pixels
            .dims4()
            .context("pixels must be [batch, height, width, channels]")?;
        let p = self.patch_size;
        ensure!(
            channels == self.num_channels,
            "expected {} channels, got {channels}",
            self.num_channels
        );
        ensure!(
            height % p == 0 && width % p == 0 && height > 0 && width > 0,
            "image {width}x{height} is not a positive multiple of patch size {p}"
        );
        let (grid_h, grid_w) = (height / p, width / p);
        let patches = pixels
            .reshape(vec![batch, grid_h, p, grid_w, p, channels])?
            .permute([0, 1, 3, 2, 4, 5])?
            .contiguous()?
            .reshape((batch, grid_h * grid_w, p * p * channels))?;
        let embeddings = self.patch_linear.forward(&patches)?;

        let offset = usize::from(self.class_embedding.is_some());
        let positions = self.patch_positions(grid_h, grid_w, offset)?;
        let embeddings = embeddings.broadcast_add(&positions.unsqueeze(0)?)?;

        match &self.class_embedding {
            Some(class) => {
                let class_pos = self.position_embedding.narrow(0, 0, 1)?;
                let class = class
                    .reshape((1, self.hidden_size))?
                    .add(&class_pos)?
                    .unsqueeze(0)?
                    .expand((batch, 1, self.hidden_size))?
                    .contiguous()?;
                Ok(Tensor::cat(&[&class, &embeddings], 1)?)
            }
            None => Ok(embeddings),
        }
    }

    /// `[grid_h * grid_w, hidden]` positional rows, bicubically resampled off the native grid.
    fn patch_positions(&self, grid_h: usize, grid_w: usize, offset: usize) -> Result<Tensor> {
        let native = self.native_grid;
        let table = self
            .position_embedding
            .narrow(0, offset, native * native)?;
        if (grid_h, grid_w) == (native, native) {
            return Ok(table);
        }
        trace!(native, grid_h, grid_w, "interpolating vision positions");
        let values = table
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let resized = bicubic_resize(
            &values,
            (native, native),
            (grid_h, grid_w),
            self.hidden_size,
        )?;
        Ok(Tensor::from_vec(
            resized,
            (grid_h * grid_w, self.hidden_size),
            table.device(),
        )?
        .to_dtype(table.dtype())?)
    }
}

struct EncoderLayer {
    layer_norm1: PreciseLayerNorm,
    layer_norm2: PreciseLayerNorm,
    attention: VisionAttention,
    mlp: VisionMlp,
}

impl EncoderLayer {
    fn load(vb: &VarBuilder, cfg: &VisionConfig, activation: Activation) -> Result<Self> {
        let dtype = vb.dtype();
        Ok(Self {
            layer_norm1: PreciseLayerNorm::load(
                vb.pp("layer_norm1"),
                cfg.hidden_size,
                cfg.layer_norm_eps,
                dtype,
            )?,
            layer_norm2: PreciseLayerNorm::load(
                vb.pp("layer_norm2"),
                cfg.hidden_size,
                cfg.layer_norm_eps,
                dtype,
            )?,
            attention: VisionAttention::load(&vb.pp("self_attn"), cfg)?,
            mlp: VisionMlp::load(&vb.pp("mlp"), cfg, activation)?,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.layer_norm1.forward(hidden)?;
        let residual = hidden.add(&self.attention.forward(&normed)?)?;
        let normed = self.layer_norm2.forward(&residual)?;
        Ok(residual.add(&self.mlp.forward(&normed)?)?)
    }
}

struct VisionAttention {
    q_proj: LinearWeights,
    k_proj: LinearWeights,
    v_proj: LinearWeights,
    out_proj: LinearWeights,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn load(vb: &VarBuilder, cfg: &VisionConfig) -> Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            q_proj: LinearWeights::load(vb.pp("q_proj"), hidden, hidden, true)?,
            k_proj: LinearWeights::load(vb.pp("k_proj"), hidden, hidden, true)?,
            v_proj: LinearWeights::load(vb.pp("v_proj"), hidden, hidden, true)?,
            out_proj: LinearWeights::load(vb.pp("out_proj"), hidden, hidden, true)?,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Unmasked multi-head attention; every patch attends to every patch.
    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, hidden_size) = hidden
            .dims3()
            .context("attention expects [batch, seq, hidden]")?;
        let q = self.heads(&apply_linear(hidden, &self.q_proj)?, batch, seq_len)?;
        let k = self.heads(&apply_linear(hidden, &self.k_proj)?, batch, seq_len)?;
        let v = self.heads(&apply_linear(hidden, &self.v_proj)?, batch, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q
            .to_dtype(DType::F32)?
            .matmul(&k.to_dtype(DType::F32)?.t()?.contiguous()?)?
            * scale)?;
        let probs = softmax(&scores, D::Minus1)
            .context("vision attention softmax failed")?
            .to_dtype(v.dtype())?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden_size))?;
        apply_linear(&context, &self.out_proj)
    }
}

enum VisionMlp {
    Plain {
        fc1: LinearWeights,
        fc2: LinearWeights,
        activation: Activation,
    },
    Gated {
        gate_proj: LinearWeights,
        up_proj: LinearWeights,
        down_proj: LinearWeights,
        activation: Activation,
    },
}

impl VisionMlp {
    fn load(vb: &VarBuilder, cfg: &VisionConfig, activation: Activation) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(if cfg.gated_mlp {
            Self::Gated {
                gate_proj: LinearWeights::load(vb.pp("gate_proj"), inter, hidden, true)?,
                up_proj: LinearWeights::load(vb.pp("up_proj"), inter, hidden, true)?,
                down_proj: LinearWeights::load(vb.pp("down_proj"), hidden, inter, true)?,
                activation,
            }
        } else {
            Self::Plain {
                fc1: LinearWeights::load(vb.pp("fc1"), inter, hidden, true)?,
                fc2: LinearWeights::load(vb.pp("fc2"), hidden, inter, true)?,
                activation,
            }
        })
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            Self::Plain {
                fc1,
                fc2,
                activation,
            } => apply_linear(&activation.forward(&apply_linear(input, fc1)?)?, fc2),
            Self::Gated {
                gate_proj,
                up_proj,
                down_proj,
                activation,
            } => {
                let gate = activation.forward(&apply_linear(input, gate_proj)?)?;
                let up = apply_linear(input, up_proj)?;
                apply_linear(&gate.mul(&up)?, down_proj)
            }
        }
    }
}

/// LayerNorm with statistics computed in `compute_dtype`.
struct PreciseLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    compute_dtype: DType,
}

impl PreciseLayerNorm {
    fn load(vb: VarBuilder, size: usize, eps: f64, compute_dtype: DType) -> Result<Self> {
        let weight = vb
            .get(size, "weight")
            .context("missing layernorm weight")?
            .to_dtype(compute_dtype)?;
        let bias = vb
            .get(size, "bias")
            .context("missing layernorm bias")?
            .to_dtype(compute_dtype)?;
        Ok(Self {
            weight,
            bias,
            eps,
            compute_dtype,
        })
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dtype = input.dtype();
        let x = input.to_dtype(self.compute_dtype)?;
        let hidden = x.dim(D::Minus1)? as f64;
        let mean = (x.sum_keepdim(D::Minus1)? / hidden)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?
            .to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{random_weights, tiny_config};
    use candle_core::Device;

    fn encoder(cfg: &crate::config::DocVlConfig, dtype: DType) -> Result<VisionEncoder> {
        let weights = random_weights(cfg, &Device::Cpu)?;
        let vb = VarBuilder::from_tensors(weights, dtype, &Device::Cpu);
        VisionEncoder::load(&vb.pp("vision_tower"), &cfg.vision_config, dtype)
    }

    #[test]
    fn native_grid_shapes() -> Result<()> {
        let cfg = tiny_config();
        let encoder = encoder(&cfg, DType::F32)?;
        let pixels = Tensor::randn(0f32, 1f32, (2, 8, 8, 3), &Device::Cpu)?;
        let features = encoder.encode(&pixels)?;
        assert_eq!(features.dims(), &[2, 4, cfg.vision_config.hidden_size]);
        Ok(())
    }

    #[test]
    fn class_token_is_stripped_and_grid_interpolated() -> Result<()> {
        let mut cfg = tiny_config();
        cfg.vision_config.use_class_token = true;
        cfg.vision_config.gated_mlp = true;
        let encoder = encoder(&cfg, DType::F32)?;
        let pixels = Tensor::randn(0f32, 1f32, (1, 12, 16, 3), &Device::Cpu)?;
        let features = encoder.encode(&pixels)?;
        assert_eq!(features.dims(), &[1, 3 * 4, cfg.vision_config.hidden_size]);

        let mut hidden = encoder.embeddings.forward(&pixels)?;
        for layer in &encoder.layers {
            hidden = layer.forward(&hidden)?;
        }
        let hidden = encoder.post_layernorm.forward(&hidden)?;
        assert_eq!(hidden.dim(1)?, 13);
        let max_diff = |a: &Tensor, b: &Tensor| -> Result<f32> {
            Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
        };
        assert!(max_diff(&features, &hidden.narrow(1, 1, 12)?)? < 1e-6);
        assert!(max_diff(&features, &hidden.narrow(1, 0, 12)?)? > 1e-3);
        Ok(())
    }

    #[test]
    fn half_precision_input_round_trips_dtype() -> Result<()> {
        let cfg = tiny_config();
        let encoder = encoder(&cfg, DType::BF16)?;
        let pixels = Tensor::zeros((1, 8, 8, 3), DType::BF16, &Device::Cpu)?;
        assert_eq!(encoder.encode(&pixels)?.dtype(), DType::BF16);
        Ok(())
    }

    #[test]
    fn unaligned_pixels_are_rejected() -> Result<()> {
        let cfg = tiny_config();
        let encoder = encoder(&cfg, DType::F32)?;
        let pixels = Tensor::zeros((1, 10, 8, 3), DType::F32, &Device::Cpu)?;
        assert!(encoder.encode(&pixels).is_err());
        Ok(())
    }

    #[test]
    fn batch_rows_are_independent() -> Result<()> {
        let cfg = tiny_config();
        let encoder = encoder(&cfg, DType::F32)?;
        let a = Tensor::randn(0f32, 1f32, (1, 8, 8, 3), &Device::Cpu)?;
        let b = Tensor::randn(0f32, 1f32, (1, 8, 8, 3), &Device::Cpu)?;
        let joint = encoder.encode(&Tensor::cat(&[&a, &b], 0)?)?;
        let alone = encoder.encode(&a)?;
        let diff = joint
            .narrow(0, 0, 1)?
            .sub(&alone)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "batch leaked across rows by {diff}");
        Ok(())
    }
}
