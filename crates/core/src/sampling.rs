use std::{cmp::Ordering, collections::HashSet, convert::TryFrom};

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor};
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

/// Knobs consulted when picking the next token.
pub trait TokenSelectionParams {
    /// Values `<= 0` select greedy decoding.
    fn temperature(&self) -> f64;
    fn top_p(&self) -> Option<f64>;
    fn top_k(&self) -> Option<usize>;
    fn repetition_penalty(&self) -> f32;
}

/// Create a deterministic RNG when a seed is provided.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

/// Select the next token id from a `[vocab]` logits row.
///
/// `context` holds the tokens generated so far and only feeds the repetition penalty.
pub fn select_token_id<P: TokenSelectionParams + ?Sized>(
    logits: &Tensor,
    params: &P,
    context: &[i64],
    rng: &mut StdRng,
) -> Result<i64> {
    let logits = logits
        .flatten_all()?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()
        .context("failed to extract logits for token selection")?;
    ensure!(!logits.is_empty(), "logits tensor is empty");

    let mut adjusted = logits.clone();
    apply_repetition_penalty(&mut adjusted, context, params.repetition_penalty());

    let temperature = params.temperature();
    if temperature > 0.0 {
        let mut scaled: Vec<f64> = adjusted
            .iter()
            .map(|&v| f64::from(v) / temperature)
            .collect();
        if let Some(k) = params.top_k() {
            if k > 0 && k < scaled.len() {
                apply_top_k(&mut scaled, k);
            }
        }
        let mut probs = softmax(&scaled);
        if let Some(top_p) = params.top_p() {
            if top_p > 0.0 && top_p < 1.0 {
                apply_top_p(&mut probs, top_p);
            }
        }
        if let Some(sampled) = sample_categorical(&probs, rng) {
            return Ok(sampled as i64);
        }
    }

    if let Some(best) = argmax_index(&adjusted) {
        return Ok(best as i64);
    }
    argmax_index(&logits)
        .map(|idx| idx as i64)
        .context("logits contain no finite values")
}

fn argmax_index(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx)
}

fn apply_repetition_penalty(scores: &mut [f32], context: &[i64], penalty: f32) {
    if penalty <= 0.0 || (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let mut seen = HashSet::new();
    for &token in context {
        if let Ok(index) = usize::try_from(token) {
            if index < scores.len() && seen.insert(index) {
                let entry = &mut scores[index];
                if *entry > 0.0 {
                    *entry /= penalty;
                } else {
                    *entry *= penalty;
                }
            }
        }
    }
}

fn apply_top_k(logits: &mut [f64], top_k: usize) {
    let mut indices: Vec<usize> = (0..logits.len())
        .filter(|&idx| logits[idx].is_finite())
        .collect();
    if indices.len() <= top_k {
        return;
    }
    indices.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));
    for &idx in indices.iter().skip(top_k) {
        logits[idx] = f64::NEG_INFINITY;
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max_logit = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_logit.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exp: Vec<f64> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max_logit).exp() } else { 0.0 })
        .collect();
    let total: f64 = exp.iter().sum();
    exp.into_iter().map(|w| w / total).collect()
}

/// Nucleus filtering over probabilities.
///
/// Probabilities are visited in ascending order; a token survives when the cumulative mass up to
/// and including it exceeds `1 - top_p`. The most probable token always survives.
fn apply_top_p(probs: &mut [f64], top_p: f64) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].partial_cmp(&probs[b]).unwrap_or(Ordering::Equal));
    let threshold = 1.0 - top_p;
    let mut cumulative = 0.0;
    for &idx in &order {
        cumulative += probs[idx];
        if cumulative <= threshold {
            probs[idx] = 0.0;
        }
    }
}

fn sample_categorical(probs: &[f64], rng: &mut StdRng) -> Option<usize> {
    let dist = WeightedIndex::new(probs).ok()?;
    Some(dist.sample(rng))
}
