use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use tracing::{debug, trace};

use crate::{
    benchmark::Timer,
    cache::DynamicCache,
    inference::{GenerationParams, normalize_text},
    sampling::{init_rng, select_token_id},
    streaming::DeltaTracker,
    tokenizer::TextTokenizer,
};

/// A decoder-only language model that can be driven token by token.
pub trait CausalDecoder {
    fn new_cache(&self) -> DynamicCache;

    /// `[1, seq, hidden]` embeddings for a batch of one.
    fn embed_tokens(&self, token_ids: &[i64]) -> Result<Tensor>;

    /// Prefill from embeddings, returning `[vocab]` logits for the last position.
    fn prefill(&self, inputs_embeds: &Tensor, cache: &mut DynamicCache) -> Result<Tensor>;

    /// Feed one token after the cached prefix, returning `[vocab]` logits.
    fn step(&self, token_id: i64, cache: &mut DynamicCache) -> Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTokens {
    pub tokens: Vec<i64>,
    pub text: String,
}

/// Run prefill and the autoregressive loop over already merged prompt embeddings.
///
/// A stop token ends the loop without being appended. The cache lives only for this call.
pub fn generate_tokens(
    decoder: &dyn CausalDecoder,
    tokenizer: &dyn TextTokenizer,
    inputs_embeds: &Tensor,
    stop_tokens: &[i64],
    params: &GenerationParams,
    mut stream: Option<&mut dyn FnMut(&str)>,
) -> Result<DecodedTokens> {
    let (_, prompt_len, _) = inputs_embeds
        .shape()
        .dims3()
        .context("prompt embeddings must be [batch, seq, hidden]")?;
    let mut cache = decoder.new_cache();

    let prefill_timer = Timer::new("decode.prefill");
    let mut logits = decoder.prefill(inputs_embeds, &mut cache)?;
    prefill_timer.finish(|event| event.add_field("prompt_tokens", prompt_len));
    ensure!(
        cache.offset() == prompt_len,
        "cache holds {} positions after prefill of {prompt_len} tokens",
        cache.offset()
    );

    let mut rng = init_rng(params.seed);
    let mut tracker = DeltaTracker::new();
    let mut generated: Vec<i64> = Vec::with_capacity(params.max_new_tokens);
    let decode_timer = Timer::new("decode.loop");
    for step in 0..params.max_new_tokens {
        let next = select_token_id(&logits, params, &generated, &mut rng)
            .with_context(|| format!("token selection failed at step {step}"))?;
        if stop_tokens.contains(&next) {
            trace!(step, token = next, "stop token");
            break;
        }
        generated.push(next);
        if let Some(cb) = stream.as_deref_mut() {
            let decoded = tokenizer.decode(&generated)?;
            let delta = tracker.advance(&decoded, false);
            if !delta.is_empty() {
                cb(&delta);
            }
        }
        if generated.len() == params.max_new_tokens {
            break;
        }
        logits = decoder
            .step(next, &mut cache)
            .with_context(|| format!("decode step {step} failed"))?;
    }
    let generated_len = generated.len();
    decode_timer.finish(|event| event.add_field("generated_tokens", generated_len));

    let decoded = tokenizer.decode(&generated)?;
    if let Some(cb) = stream.as_deref_mut() {
        let delta = tracker.advance(&decoded, true);
        if !delta.is_empty() {
            cb(&delta);
        }
    }
    debug!(
        prompt_tokens = prompt_len,
        generated_tokens = generated.len(),
        cached = cache.offset(),
        "generation finished"
    );
    Ok(DecodedTokens {
        tokens: generated,
        text: normalize_text(&decoded),
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{cache::KvCacheChunk, tokenizer::testing::WordTokenizer};
    use candle_core::{DType, Device};

    const VOCAB: usize = 6;
    const EOS: i64 = 5;

    /// Emits `script[n]` as the most likely token after `n` cached positions past the prompt.
    struct ScriptedDecoder {
        script: Vec<i64>,
        prompt_len: Cell<usize>,
        steps: Cell<usize>,
    }

    impl ScriptedDecoder {
        fn new(script: &[i64]) -> Self {
            Self {
                script: script.to_vec(),
                prompt_len: Cell::new(0),
                steps: Cell::new(0),
            }
        }

        fn logits_for(&self, generated: usize) -> Result<Tensor> {
            let target = self.script.get(generated).copied().unwrap_or(EOS) as usize;
            let mut row = vec![0f32; VOCAB];
            row[target] = 10.0;
            Ok(Tensor::from_vec(row, VOCAB, &Device::Cpu)?)
        }

        fn cache_positions(cache: &mut DynamicCache, seq: usize) -> Result<()> {
            let device = Device::Cpu;
            let chunk = KvCacheChunk::new(
                Tensor::zeros((1, 1, 2, seq), DType::F32, &device)?,
                Tensor::zeros((1, 1, seq, 2), DType::F32, &device)?,
            )?;
            cache.append(0, chunk)?;
            Ok(())
        }
    }

    impl CausalDecoder for ScriptedDecoder {
        fn new_cache(&self) -> DynamicCache {
            DynamicCache::with_num_layers(1)
        }

        fn embed_tokens(&self, token_ids: &[i64]) -> Result<Tensor> {
            Ok(Tensor::zeros(
                (1, token_ids.len(), 2),
                DType::F32,
                &Device::Cpu,
            )?)
        }

        fn prefill(&self, inputs_embeds: &Tensor, cache: &mut DynamicCache) -> Result<Tensor> {
            let seq = inputs_embeds.dim(1)?;
            self.prompt_len.set(seq);
            Self::cache_positions(cache, seq)?;
            self.logits_for(0)
        }

        fn step(&self, _token_id: i64, cache: &mut DynamicCache) -> Result<Tensor> {
            self.steps.set(self.steps.get() + 1);
            Self::cache_positions(cache, 1)?;
            self.logits_for(cache.offset() - self.prompt_len.get())
        }
    }

    fn tokenizer() -> WordTokenizer {
        WordTokenizer::new(&[("a", 1), ("b", 2), ("c", 3), ("</s>", EOS)])
    }

    fn greedy(max_new_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_new_tokens,
            ..GenerationParams::default()
        }
    }

    #[test]
    fn stops_at_eos_without_appending() -> Result<()> {
        let decoder = ScriptedDecoder::new(&[1, 2, EOS, 3]);
        let embeds = decoder.embed_tokens(&[0, 0, 0])?;
        let mut chunks = Vec::new();
        let mut sink = |delta: &str| chunks.push(delta.to_owned());
        let out = generate_tokens(
            &decoder,
            &tokenizer(),
            &embeds,
            &[EOS],
            &greedy(16),
            Some(&mut sink),
        )?;
        assert_eq!(out.tokens, vec![1, 2]);
        assert_eq!(out.text, "a b");
        assert_eq!(chunks.concat(), "a b");
        Ok(())
    }

    #[test]
    fn immediate_stop_yields_nothing() -> Result<()> {
        let decoder = ScriptedDecoder::new(&[EOS]);
        let embeds = decoder.embed_tokens(&[0, 0])?;
        let out = generate_tokens(&decoder, &tokenizer(), &embeds, &[EOS], &greedy(8), None)?;
        assert!(out.tokens.is_empty());
        assert_eq!(out.text, "");
        assert_eq!(decoder.steps.get(), 0);
        Ok(())
    }

    #[test]
    fn budget_caps_tokens_without_trailing_forward() -> Result<()> {
        let decoder = ScriptedDecoder::new(&[1, 1, 1, 1, 1]);
        let embeds = decoder.embed_tokens(&[0])?;
        let out = generate_tokens(&decoder, &tokenizer(), &embeds, &[EOS], &greedy(3), None)?;
        assert_eq!(out.tokens, vec![1, 1, 1]);
        assert_eq!(decoder.steps.get(), 2);
        Ok(())
    }

    #[test]
    fn greedy_runs_are_identical() -> Result<()> {
        let run = || -> Result<Vec<i64>> {
            let decoder = ScriptedDecoder::new(&[3, 2, 1, EOS]);
            let embeds = decoder.embed_tokens(&[0, 0])?;
            Ok(generate_tokens(&decoder, &tokenizer(), &embeds, &[EOS], &greedy(8), None)?.tokens)
        };
        assert_eq!(run()?, run()?);
        assert_eq!(run()?, vec![3, 2, 1]);
        Ok(())
    }

    #[test]
    fn zero_budget_generates_nothing() -> Result<()> {
        let decoder = ScriptedDecoder::new(&[1]);
        let embeds = decoder.embed_tokens(&[0])?;
        let out = generate_tokens(&decoder, &tokenizer(), &embeds, &[EOS], &greedy(0), None)?;
        assert!(out.tokens.is_empty());
        Ok(())
    }
}
