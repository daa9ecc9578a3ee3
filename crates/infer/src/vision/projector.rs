use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor, shape::D};
use candle_nn::VarBuilder;

use crate::transformer::{Activation, LinearWeights, apply_linear};

/// Two-layer MLP mapping vision features into the text embedding space.
pub struct Projector {
    linear_1: LinearWeights,
    linear_2: LinearWeights,
    activation: Activation,
}

impl Projector {
    /// `vb` is rooted at `multi_modal_projector`.
    pub fn load(
        vb: &VarBuilder,
        vision_hidden: usize,
        text_hidden: usize,
        activation: &str,
    ) -> Result<Self> {
        let linear_1 = LinearWeights::load(vb.pp("linear_1"), text_hidden, vision_hidden, true)
            .context("failed to load projector linear_1")?;
        let linear_2 = LinearWeights::load(vb.pp("linear_2"), text_hidden, text_hidden, true)
            .context("failed to load projector linear_2")?;
        Ok(Self {
            linear_1,
            linear_2,
            activation: Activation::from_name(activation)?,
        })
    }

    /// `[batch, patches, vision_hidden]` -> `[batch, patches, text_hidden]` in `dtype`.
    pub fn project(&self, features: &Tensor, dtype: DType) -> Result<Tensor> {
        let hidden = features.dim(D::Minus1)?;
        ensure!(
            hidden == self.linear_1.in_dim,
            "projector expects features with hidden size {}, got {hidden}",
            self.linear_1.in_dim
        );
        let x = features.to_dtype(self.linear_1.weight.dtype())?;
        let x = self.activation.forward(&apply_linear(&x, &self.linear_1)?)?;
        Ok(apply_linear(&x, &self.linear_2)?.to_dtype(dtype)?)
    }
}
