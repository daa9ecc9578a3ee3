#![allow(dead_code)]

use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use docvl_core::TextTokenizer;
use serde_json::json;

pub const IMAGE_TOKEN: i64 = 20;
pub const VISION_START: i64 = 21;
pub const VISION_END: i64 = 22;
pub const EOS: i64 = 2;

const VISION_HIDDEN: usize = 8;
const VISION_INTER: usize = 16;
const PATCH: usize = 4;
const NATIVE_GRID: usize = 2;
const TEXT_HIDDEN: usize = 16;
const TEXT_INTER: usize = 24;
const TEXT_LAYERS: usize = 2;
const HEADS: usize = 4;
const KV_HEADS: usize = 2;
const HEAD_DIM: usize = 4;
const VOCAB: usize = 32;

pub fn config_json() -> serde_json::Value {
    json!({
        "vision_config": {
            "hidden_size": VISION_HIDDEN,
            "intermediate_size": VISION_INTER,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "image_size": PATCH * NATIVE_GRID,
            "patch_size": PATCH
        },
        "text_config": {
            "vocab_size": VOCAB,
            "hidden_size": TEXT_HIDDEN,
            "intermediate_size": TEXT_INTER,
            "num_hidden_layers": TEXT_LAYERS,
            "num_attention_heads": HEADS,
            "num_key_value_heads": KV_HEADS,
            "head_dim": HEAD_DIM,
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0
        },
        "image_token_index": IMAGE_TOKEN,
        "vision_start_token_id": VISION_START,
        "vision_end_token_id": VISION_END,
        "bos_token_id": 1,
        "eos_token_id": EOS,
        "tie_word_embeddings": false
    })
}

/// Tensor names and shapes as a PyTorch export lays them out (prefixed, channel-first kernels).
fn checkpoint_shapes() -> Vec<(String, Vec<usize>)> {
    let mut shapes: Vec<(String, Vec<usize>)> = Vec::new();
    let mut push = |name: String, shape: Vec<usize>| shapes.push((name, shape));

    let vis = "visual.vision_model";
    push(
        format!("{vis}.embeddings.patch_embedding.weight"),
        vec![VISION_HIDDEN, 3, PATCH, PATCH],
    );
    push(format!("{vis}.embeddings.patch_embedding.bias"), vec![VISION_HIDDEN]);
    push(
        format!("{vis}.embeddings.position_embedding.weight"),
        vec![NATIVE_GRID * NATIVE_GRID, VISION_HIDDEN],
    );
    let layer = format!("{vis}.encoder.layers.0");
    for norm in ["layer_norm1", "layer_norm2"] {
        push(format!("{layer}.{norm}.weight"), vec![VISION_HIDDEN]);
        push(format!("{layer}.{norm}.bias"), vec![VISION_HIDDEN]);
    }
    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
        push(format!("{layer}.self_attn.{proj}.weight"), vec![VISION_HIDDEN, VISION_HIDDEN]);
        push(format!("{layer}.self_attn.{proj}.bias"), vec![VISION_HIDDEN]);
    }
    push(format!("{layer}.mlp.fc1.weight"), vec![VISION_INTER, VISION_HIDDEN]);
    push(format!("{layer}.mlp.fc1.bias"), vec![VISION_INTER]);
    push(format!("{layer}.mlp.fc2.weight"), vec![VISION_HIDDEN, VISION_INTER]);
    push(format!("{layer}.mlp.fc2.bias"), vec![VISION_HIDDEN]);
    push(format!("{vis}.post_layernorm.weight"), vec![VISION_HIDDEN]);
    push(format!("{vis}.post_layernorm.bias"), vec![VISION_HIDDEN]);

    push("mlp_AR.linear_1.weight".into(), vec![TEXT_HIDDEN, VISION_HIDDEN]);
    push("mlp_AR.linear_1.bias".into(), vec![TEXT_HIDDEN]);
    push("mlp_AR.linear_2.weight".into(), vec![TEXT_HIDDEN, TEXT_HIDDEN]);
    push("mlp_AR.linear_2.bias".into(), vec![TEXT_HIDDEN]);

    let lm = "language_model.model";
    push(format!("{lm}.embed_tokens.weight"), vec![VOCAB, TEXT_HIDDEN]);
    for i in 0..TEXT_LAYERS {
        let layer = format!("{lm}.layers.{i}");
        push(format!("{layer}.self_attn.q_proj.weight"), vec![HEADS * HEAD_DIM, TEXT_HIDDEN]);
        push(format!("{layer}.self_attn.k_proj.weight"), vec![KV_HEADS * HEAD_DIM, TEXT_HIDDEN]);
        push(format!("{layer}.self_attn.v_proj.weight"), vec![KV_HEADS * HEAD_DIM, TEXT_HIDDEN]);
        push(format!("{layer}.self_attn.o_proj.weight"), vec![TEXT_HIDDEN, HEADS * HEAD_DIM]);
        push(format!("{layer}.self_attn.rotary_emb.inv_freq"), vec![HEAD_DIM / 2]);
        push(format!("{layer}.mlp.gate_proj.weight"), vec![TEXT_INTER, TEXT_HIDDEN]);
        push(format!("{layer}.mlp.up_proj.weight"), vec![TEXT_INTER, TEXT_HIDDEN]);
        push(format!("{layer}.mlp.down_proj.weight"), vec![TEXT_HIDDEN, TEXT_INTER]);
        push(format!("{layer}.input_layernorm.weight"), vec![TEXT_HIDDEN]);
        push(format!("{layer}.post_attention_layernorm.weight"), vec![TEXT_HIDDEN]);
    }
    push(format!("{lm}.norm.weight"), vec![TEXT_HIDDEN]);
    push("language_model.lm_head.weight".into(), vec![VOCAB, TEXT_HIDDEN]);
    shapes
}

fn random_checkpoint() -> Result<HashMap<String, Tensor>> {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    for (name, shape) in checkpoint_shapes() {
        let is_scale = name.ends_with("norm.weight")
            || name.ends_with("layernorm.weight")
            || (name.contains("layer_norm") && name.ends_with(".weight"));
        let tensor = if is_scale {
            Tensor::ones(shape, DType::F32, &device)?
        } else {
            (Tensor::randn(0f32, 1f32, shape, &device)? * 0.2)?
        };
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Write `config.json` and a checkpoint split into two shards with an index.
pub fn write_sharded_model(dir: &Path) -> Result<()> {
    fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config_json())?)?;

    let tensors = random_checkpoint()?;
    let mut vision = HashMap::new();
    let mut text = HashMap::new();
    let mut weight_map = serde_json::Map::new();
    for (name, tensor) in tensors {
        let shard = if name.starts_with("language_model.") {
            text.insert(name.clone(), tensor);
            "model-00002-of-00002.safetensors"
        } else {
            vision.insert(name.clone(), tensor);
            "model-00001-of-00002.safetensors"
        };
        weight_map.insert(name, json!(shard));
    }
    candle_core::safetensors::save(&vision, dir.join("model-00001-of-00002.safetensors"))?;
    candle_core::safetensors::save(&text, dir.join("model-00002-of-00002.safetensors"))?;
    fs::write(
        dir.join("model.safetensors.index.json"),
        serde_json::to_vec_pretty(&json!({ "metadata": {}, "weight_map": weight_map }))?,
    )?;
    Ok(())
}

/// Byte tokenizer folded into a small vocabulary; ids decode to `<id>`.
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(text.bytes().map(|b| i64::from(b % 16) + 3).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        Ok(ids.iter().map(|id| format!("<{id}>")).collect())
    }

    fn token_id(&self, _token: &str) -> Option<i64> {
        None
    }
}
