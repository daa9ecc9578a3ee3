use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde_json::json;

use crate::config::DocVlConfig;

pub const IMAGE_TOKEN: i64 = 20;
pub const VISION_START: i64 = 21;
pub const VISION_END: i64 = 22;
pub const EOS: i64 = 2;

/// Two-layer text model and one-layer vision tower on a 2x2 native grid of 4px patches.
pub fn tiny_config() -> DocVlConfig {
    let value = json!({
        "vision_config": {
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "image_size": 8,
            "patch_size": 4
        },
        "text_config": {
            "vocab_size": 32,
            "hidden_size": 16,
            "intermediate_size": 24,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "head_dim": 4,
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0
        },
        "image_token_index": IMAGE_TOKEN,
        "vision_start_token_id": VISION_START,
        "vision_end_token_id": VISION_END,
        "bos_token_id": 1,
        "eos_token_id": EOS
    });
    match serde_json::from_value(value) {
        Ok(cfg) => cfg,
        Err(err) => panic!("tiny config must parse: {err}"),
    }
}

fn linear(shapes: &mut Vec<(String, Vec<usize>)>, name: &str, out: usize, inp: usize, bias: bool) {
    shapes.push((format!("{name}.weight"), vec![out, inp]));
    if bias {
        shapes.push((format!("{name}.bias"), vec![out]));
    }
}

fn layer_norm(shapes: &mut Vec<(String, Vec<usize>)>, name: &str, size: usize) {
    shapes.push((format!("{name}.weight"), vec![size]));
    shapes.push((format!("{name}.bias"), vec![size]));
}

/// Every tensor name the loader reads for `cfg`, with its sanitized shape.
pub fn weight_shapes(cfg: &DocVlConfig) -> Vec<(String, Vec<usize>)> {
    let v = &cfg.vision_config;
    let t = &cfg.text_config;
    let mut shapes = Vec::new();

    let p = v.patch_size;
    shapes.push((
        "vision_tower.embeddings.patch_embedding.weight".into(),
        vec![v.hidden_size, p, p, v.num_channels],
    ));
    shapes.push((
        "vision_tower.embeddings.patch_embedding.bias".into(),
        vec![v.hidden_size],
    ));
    shapes.push((
        "vision_tower.embeddings.position_embedding.weight".into(),
        vec![v.num_positions(), v.hidden_size],
    ));
    if v.use_class_token {
        shapes.push((
            "vision_tower.embeddings.class_embedding".into(),
            vec![v.hidden_size],
        ));
    }
    for i in 0..v.num_hidden_layers {
        let prefix = format!("vision_tower.encoder.layers.{i}");
        layer_norm(&mut shapes, &format!("{prefix}.layer_norm1"), v.hidden_size);
        layer_norm(&mut shapes, &format!("{prefix}.layer_norm2"), v.hidden_size);
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            let name = format!("{prefix}.self_attn.{proj}");
            linear(&mut shapes, &name, v.hidden_size, v.hidden_size, true);
        }
        if v.gated_mlp {
            for proj in ["gate_proj", "up_proj"] {
                let name = format!("{prefix}.mlp.{proj}");
                linear(&mut shapes, &name, v.intermediate_size, v.hidden_size, true);
            }
            let name = format!("{prefix}.mlp.down_proj");
            linear(&mut shapes, &name, v.hidden_size, v.intermediate_size, true);
        } else {
            let fc1 = format!("{prefix}.mlp.fc1");
            let fc2 = format!("{prefix}.mlp.fc2");
            linear(&mut shapes, &fc1, v.intermediate_size, v.hidden_size, true);
            linear(&mut shapes, &fc2, v.hidden_size, v.intermediate_size, true);
        }
    }
    layer_norm(&mut shapes, "vision_tower.post_layernorm", v.hidden_size);

    linear(
        &mut shapes,
        "multi_modal_projector.linear_1",
        t.hidden_size,
        v.hidden_size,
        true,
    );
    linear(
        &mut shapes,
        "multi_modal_projector.linear_2",
        t.hidden_size,
        t.hidden_size,
        true,
    );

    let head_dim = t.resolved_head_dim();
    let q_dim = t.num_attention_heads * head_dim;
    let kv_dim = t.resolved_num_key_value_heads() * head_dim;
    shapes.push(("model.embed_tokens.weight".into(), vec![t.vocab_size, t.hidden_size]));
    for i in 0..t.num_hidden_layers {
        let prefix = format!("model.layers.{i}");
        let bias = t.attention_bias;
        linear(&mut shapes, &format!("{prefix}.self_attn.q_proj"), q_dim, t.hidden_size, bias);
        linear(&mut shapes, &format!("{prefix}.self_attn.k_proj"), kv_dim, t.hidden_size, bias);
        linear(&mut shapes, &format!("{prefix}.self_attn.v_proj"), kv_dim, t.hidden_size, bias);
        linear(&mut shapes, &format!("{prefix}.self_attn.o_proj"), t.hidden_size, q_dim, false);
        for proj in ["gate_proj", "up_proj"] {
            let name = format!("{prefix}.mlp.{proj}");
            linear(&mut shapes, &name, t.intermediate_size, t.hidden_size, false);
        }
        let down = format!("{prefix}.mlp.down_proj");
        linear(&mut shapes, &down, t.hidden_size, t.intermediate_size, false);
        shapes.push((format!("{prefix}.input_layernorm.weight"), vec![t.hidden_size]));
        shapes.push((format!("{prefix}.post_attention_layernorm.weight"), vec![t.hidden_size]));
    }
    shapes.push(("model.norm.weight".into(), vec![t.hidden_size]));
    if !cfg.tie_word_embeddings {
        shapes.push(("lm_head.weight".into(), vec![t.vocab_size, t.hidden_size]));
    }
    shapes
}

/// Small random weights; norm scales are ones so activations stay well conditioned.
pub fn random_weights(cfg: &DocVlConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for (name, shape) in weight_shapes(cfg) {
        let is_norm_scale = name.ends_with("norm.weight")
            || name.ends_with("layernorm.weight")
            || name.contains("layer_norm");
        let tensor = if is_norm_scale && name.ends_with(".weight") {
            Tensor::ones(shape, DType::F32, device)?
        } else {
            (Tensor::randn(0f32, 1f32, shape, device)? * 0.2)?
        };
        weights.insert(name, tensor);
    }
    Ok(weights)
}
