use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{D, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, ops::rms_norm};
use docvl_core::{cache::DynamicCache, generation::CausalDecoder, tensor::gather_token_embeddings};

use crate::config::TextConfig;

use super::{
    attention::build_causal_bias,
    block::{LayerContext, decoder_layer_forward},
    ops::Activation,
    rope::RotaryEmbedding,
    weights::ModelWeights,
};

pub struct DecoderOutput {
    /// Final-norm hidden states `[batch, seq, hidden]`.
    pub hidden_states: Tensor,
    /// `[batch, seq, vocab]`.
    pub logits: Tensor,
}

impl DecoderOutput {
    /// `[vocab]` logits of the last position for a batch of one.
    pub fn last_logits(&self) -> Result<Tensor> {
        let (batch, seq_len, _) = self.logits.dims3()?;
        ensure!(batch == 1, "last_logits expects batch size 1, got {batch}");
        ensure!(seq_len > 0, "decoder produced no positions");
        Ok(self.logits.i((0, seq_len - 1))?)
    }
}

pub struct LanguageDecoder {
    cfg: Arc<TextConfig>,
    weights: ModelWeights,
    rotary: RotaryEmbedding,
    activation: Activation,
}

impl LanguageDecoder {
    pub fn load(cfg: Arc<TextConfig>, vb: &VarBuilder, tie_word_embeddings: bool) -> Result<Self> {
        let weights = ModelWeights::load(vb, cfg.as_ref(), tie_word_embeddings)
            .context("failed to load language decoder weights")?;
        Self::from_parts(cfg, weights)
    }

    pub fn from_parts(cfg: Arc<TextConfig>, weights: ModelWeights) -> Result<Self> {
        ensure!(
            weights.layers.len() == cfg.num_hidden_layers,
            "decoder has {} layers but config declares {}",
            weights.layers.len(),
            cfg.num_hidden_layers
        );
        let rotary = RotaryEmbedding::new(cfg.resolved_head_dim(), cfg.rope_theta)?;
        let activation = Activation::from_name(&cfg.hidden_act)?;
        Ok(Self {
            cfg,
            weights,
            rotary,
            activation,
        })
    }

    pub fn config(&self) -> &TextConfig {
        self.cfg.as_ref()
    }

    pub fn device(&self) -> &Device {
        self.weights.embed_tokens.device()
    }

    pub fn new_cache(&self) -> DynamicCache {
        DynamicCache::with_num_layers(self.weights.layers.len())
    }

    /// `[1, n, hidden]` embedding-table rows for `token_ids`.
    pub fn embed(&self, token_ids: &[i64]) -> Result<Tensor> {
        let ids = Tensor::new(token_ids, self.device())?.reshape((1, token_ids.len()))?;
        gather_token_embeddings(&self.weights.embed_tokens, &ids)
    }

    /// Run `inputs_embeds` after the cached prefix, appending its keys/values to `cache`.
    pub fn forward(&self, inputs_embeds: &Tensor, cache: &mut DynamicCache) -> Result<DecoderOutput> {
        let (batch, seq_len, hidden) = inputs_embeds
            .dims3()
            .context("decoder input must be [batch, seq, hidden]")?;
        ensure!(
            hidden == self.cfg.hidden_size,
            "decoder expects hidden size {} got {hidden}",
            self.cfg.hidden_size
        );
        ensure!(seq_len > 0, "decoder input is empty");
        ensure!(
            cache.num_layers() == self.weights.layers.len(),
            "cache tracks {} layers but decoder has {}",
            cache.num_layers(),
            self.weights.layers.len()
        );
        let dtype = inputs_embeds.dtype();
        let device = inputs_embeds.device();
        let past_len = cache.offset();

        let attn_bias = build_causal_bias(seq_len, past_len, dtype, device)?;
        let (cos, sin) = self.rotary.cos_sin(past_len, seq_len, device, dtype)?;
        let ctx = LayerContext {
            cfg: self.cfg.as_ref(),
            activation: self.activation,
            cos: &cos,
            sin: &sin,
            attn_bias: attn_bias.as_ref(),
        };

        let mut hidden_states = inputs_embeds.clone();
        for (idx, layer) in self.weights.layers.iter().enumerate() {
            hidden_states = decoder_layer_forward(&ctx, idx, layer, &hidden_states, cache)
                .with_context(|| format!("decoder layer {idx} failed"))?;
        }

        let normed = rms_norm(
            &hidden_states,
            &self.weights.final_norm,
            self.cfg.rms_norm_eps as f32,
        )
        .context("final rms norm failed")?;
        let flat = normed.reshape((batch * seq_len, hidden))?;
        let logits = self
            .weights
            .lm_head
            .forward(&flat, &self.weights.embed_tokens)?
            .reshape((batch, seq_len, ()))?;
        ensure!(
            logits.dim(D::Minus1)? == self.cfg.vocab_size,
            "lm head produced {} logits, expected {}",
            logits.dim(D::Minus1)?,
            self.cfg.vocab_size
        );

        Ok(DecoderOutput {
            hidden_states: normed,
            logits,
        })
    }

    /// Decode-step forward for a single token, returning `[vocab]` logits.
    pub fn forward_generation(&self, token_id: i64, cache: &mut DynamicCache) -> Result<Tensor> {
        let embeds = self.embed(&[token_id])?;
        self.forward(&embeds, cache)?.last_logits()
    }
}

impl CausalDecoder for LanguageDecoder {
    fn new_cache(&self) -> DynamicCache {
        LanguageDecoder::new_cache(self)
    }

    fn embed_tokens(&self, token_ids: &[i64]) -> Result<Tensor> {
        self.embed(token_ids)
    }

    fn prefill(&self, inputs_embeds: &Tensor, cache: &mut DynamicCache) -> Result<Tensor> {
        self.forward(inputs_embeds, cache)?.last_logits()
    }

    fn step(&self, token_id: i64, cache: &mut DynamicCache) -> Result<Tensor> {
        self.forward_generation(token_id, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{random_weights, tiny_config};
    use candle_core::DType;

    fn decoder(tied: bool) -> Result<LanguageDecoder> {
        let mut cfg = tiny_config();
        cfg.tie_word_embeddings = tied;
        let weights = random_weights(&cfg, &Device::Cpu)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        LanguageDecoder::load(Arc::new(cfg.text_config), &vb, tied)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn forward_shapes() -> Result<()> {
        let decoder = decoder(false)?;
        let cfg = decoder.config().clone();
        let embeds = decoder.embed(&[1, 2, 3, 4])?;
        let mut cache = decoder.new_cache();
        let out = decoder.forward(&embeds, &mut cache)?;
        assert_eq!(out.hidden_states.dims(), &[1, 4, cfg.hidden_size]);
        assert_eq!(out.logits.dims(), &[1, 4, cfg.vocab_size]);
        assert_eq!(out.last_logits()?.dims(), &[cfg.vocab_size]);
        assert_eq!(cache.offset(), 4);
        Ok(())
    }

    #[test]
    fn prefill_matches_incremental_decode() -> Result<()> {
        for tied in [false, true] {
            let decoder = decoder(tied)?;
            let tokens = [3i64, 7, 1, 12, 5];

            let mut full_cache = decoder.new_cache();
            let full = decoder.forward(&decoder.embed(&tokens)?, &mut full_cache)?;

            let mut cache = decoder.new_cache();
            let prefix = decoder.forward(&decoder.embed(&tokens[..3])?, &mut cache)?;
            let diff = max_abs_diff(&prefix.logits, &full.logits.narrow(1, 0, 3)?)?;
            assert!(diff < 1e-4, "prefix logits diverged by {diff}");

            for (pos, &token) in tokens.iter().enumerate().skip(3) {
                let step = decoder.forward_generation(token, &mut cache)?;
                let expected = full.logits.i((0, pos))?;
                let diff = max_abs_diff(&step, &expected)?;
                assert!(diff < 1e-4, "step {pos} diverged by {diff} (tied={tied})");
            }
            assert_eq!(cache.offset(), tokens.len());
        }
        Ok(())
    }

    #[test]
    fn cache_from_another_model_is_rejected() -> Result<()> {
        let decoder = decoder(false)?;
        let mut cache = DynamicCache::with_num_layers(decoder.config().num_hidden_layers + 1);
        let embeds = decoder.embed(&[1])?;
        assert!(decoder.forward(&embeds, &mut cache).is_err());
        Ok(())
    }

    #[test]
    fn out_of_vocab_token_is_rejected() -> Result<()> {
        let decoder = decoder(false)?;
        let vocab = decoder.config().vocab_size as i64;
        assert!(decoder.embed(&[vocab]).is_err());
        Ok(())
    }
}
