use anyhow::{Result, bail, ensure};
use candle_core::{Tensor, shape::D};
use candle_nn::ops::{sigmoid, silu};

use super::LinearWeights;

/// `x W^T + b` over the last axis of a rank >= 2 input.
pub fn apply_linear(input: &Tensor, weights: &LinearWeights) -> Result<Tensor> {
    let dims = input.dims().to_vec();
    ensure!(dims.len() >= 2, "linear expects rank >= 2, got {}", dims.len());
    let in_dim = dims[dims.len() - 1];
    ensure!(
        in_dim == weights.in_dim,
        "linear weight expects input dim {} got {}",
        weights.in_dim,
        in_dim
    );
    let outer: usize = dims[..dims.len() - 1].iter().product();
    let flat = input.reshape((outer, in_dim))?;
    let mut out = weights.matmul_2d(&flat)?;
    if let Some(bias) = &weights.bias {
        out = out.broadcast_add(&bias.reshape((1, weights.out_dim))?)?;
    }
    let mut out_dims = dims;
    let last = out_dims.len() - 1;
    out_dims[last] = weights.out_dim;
    Ok(out.reshape(out_dims)?)
}

pub fn rotate_half(tensor: &Tensor) -> Result<Tensor> {
    let last = tensor.dim(D::Minus1)?;
    ensure!(
        last % 2 == 0,
        "rotate_half expects even hidden size, got {last}"
    );
    let half = last / 2;
    let first = tensor.narrow(D::Minus1, 0, half)?;
    let second = tensor.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&second.neg()?, &first], D::Minus1)?)
}

/// Pointwise activations named by checkpoint configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    GeluTanh,
    GeluErf,
    QuickGelu,
    Silu,
    Relu,
}

impl Activation {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "gelu_pytorch_tanh" | "gelu_new" | "gelu_fast" => Self::GeluTanh,
            "gelu" => Self::GeluErf,
            "quick_gelu" => Self::QuickGelu,
            "silu" | "swish" | "swiglu" => Self::Silu,
            "relu" => Self::Relu,
            other => bail!("unsupported activation: {other}"),
        })
    }

    pub fn forward(self, input: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::GeluTanh => input.gelu()?,
            Self::GeluErf => input.gelu_erf()?,
            Self::QuickGelu => input.mul(&sigmoid(&(input * 1.702)?)?)?,
            Self::Silu => silu(input)?,
            Self::Relu => input.relu()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn linear_keeps_leading_dims() -> Result<()> {
        let device = Device::Cpu;
        let weights = LinearWeights::from_tensors(
            Tensor::ones((5, 3), DType::F32, &device)?,
            Some(Tensor::new(&[0f32, 1., 2., 3., 4.], &device)?),
        )?;
        let input = Tensor::ones((2, 4, 3), DType::F32, &device)?;
        let out = apply_linear(&input, &weights)?;
        assert_eq!(out.dims(), &[2, 4, 5]);
        assert_eq!(out.get(1)?.get(2)?.to_vec1::<f32>()?, vec![3., 4., 5., 6., 7.]);
        Ok(())
    }

    #[test]
    fn rotate_half_swaps_and_negates() -> Result<()> {
        let x = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu)?;
        assert_eq!(rotate_half(&x)?.to_vec1::<f32>()?, vec![-3., -4., 1., 2.]);
        Ok(())
    }

    #[test]
    fn activation_names() {
        assert_eq!(
            Activation::from_name("gelu_pytorch_tanh").ok(),
            Some(Activation::GeluTanh)
        );
        assert_eq!(Activation::from_name("gelu").ok(), Some(Activation::GeluErf));
        assert!(Activation::from_name("mish").is_err());
    }
}
