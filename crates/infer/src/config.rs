use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use docvl_core::inference::{DEFAULT_MAX_PIXELS, DEFAULT_MIN_PIXELS};

pub const DEFAULT_IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const DEFAULT_IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: String,
    /// Prefix a learned class token; it is stripped from the encoder output.
    pub use_class_token: bool,
    /// `down(act(gate(x)) * up(x))` instead of `fc2(act(fc1(x)))`.
    pub gated_mlp: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 1152,
            intermediate_size: 4304,
            num_hidden_layers: 27,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 448,
            patch_size: 14,
            layer_norm_eps: 1e-6,
            hidden_act: "gelu_pytorch_tanh".to_string(),
            use_class_token: false,
            gated_mlp: false,
        }
    }
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Side length of the patch grid the positional table was trained on.
    pub fn native_grid(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_positions(&self) -> usize {
        let grid = self.native_grid();
        grid * grid + usize::from(self.use_class_token)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.patch_size > 0, "vision patch_size must be positive");
        ensure!(
            self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads == 0,
            "vision hidden_size {} is not divisible by {} heads",
            self.hidden_size,
            self.num_attention_heads
        );
        ensure!(
            self.image_size % self.patch_size == 0,
            "vision image_size {} is not a multiple of patch_size {}",
            self.image_size,
            self.patch_size
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub head_dim: Option<usize>,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub hidden_act: String,
    pub attention_bias: bool,
    pub max_position_embeddings: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 103_424,
            hidden_size: 1024,
            intermediate_size: 3072,
            num_hidden_layers: 18,
            num_attention_heads: 16,
            num_key_value_heads: Some(2),
            head_dim: Some(128),
            rms_norm_eps: 1e-5,
            rope_theta: 500_000.0,
            hidden_act: "silu".to_string(),
            attention_bias: false,
            max_position_embeddings: 131_072,
        }
    }
}

impl TextConfig {
    pub fn resolved_num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn resolved_head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    fn validate(&self) -> Result<()> {
        let kv_heads = self.resolved_num_key_value_heads();
        ensure!(
            kv_heads > 0 && self.num_attention_heads % kv_heads == 0,
            "num_attention_heads {} must be divisible by num_key_value_heads {kv_heads}",
            self.num_attention_heads
        );
        ensure!(
            self.resolved_head_dim() % 2 == 0,
            "rotary head_dim must be even (got {})",
            self.resolved_head_dim()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocVlConfig {
    pub vision_config: VisionConfig,
    pub text_config: TextConfig,
    #[serde(alias = "image_token_id")]
    pub image_token_index: i64,
    pub vision_start_token_id: i64,
    pub vision_end_token_id: i64,
    pub vision_token_id: i64,
    pub bos_token_id: Option<i64>,
    pub eos_token_id: Option<i64>,
    pub pad_token_id: Option<i64>,
    /// Extra ids that end generation alongside eos.
    pub stop_token_ids: Vec<i64>,
    pub tie_word_embeddings: bool,
    pub projector_hidden_act: String,
}

impl Default for DocVlConfig {
    fn default() -> Self {
        Self {
            vision_config: VisionConfig::default(),
            text_config: TextConfig::default(),
            image_token_index: 100_295,
            vision_start_token_id: 101_305,
            vision_end_token_id: 101_306,
            vision_token_id: 101_307,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
            stop_token_ids: Vec::new(),
            tie_word_embeddings: false,
            projector_hidden_act: "gelu".to_string(),
        }
    }
}

impl DocVlConfig {
    pub fn validate(&self) -> Result<()> {
        self.vision_config.validate()?;
        self.text_config.validate()
    }
}

/// Image normalisation and pixel budget read from `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub min_pixels: u32,
    pub max_pixels: u32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            image_mean: DEFAULT_IMAGE_MEAN,
            image_std: DEFAULT_IMAGE_STD,
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub value: DocVlConfig,
    pub preprocessor: PreprocessorConfig,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(i64),
    Many(Vec<i64>),
}

#[derive(Debug, Clone, Deserialize, Default)]
struct GenerationOverrides {
    #[serde(default)]
    bos_token_id: Option<i64>,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pad_token_id: Option<i64>,
}

/// Read `config.json` (a file, or a directory containing it) plus the optional
/// `generation_config.json` and `preprocessor_config.json` beside it.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let resolved = if path.is_dir() {
        path.join("config.json")
    } else {
        path.to_path_buf()
    };
    let raw = fs::read_to_string(&resolved)
        .with_context(|| format!("failed to read config at {}", resolved.display()))?;
    let mut value: DocVlConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config at {}", resolved.display()))?;
    if let Some(overrides) = read_sibling::<GenerationOverrides>(&resolved, "generation_config.json")? {
        apply_generation_overrides(&mut value, overrides);
    }
    value
        .validate()
        .with_context(|| format!("invalid model config at {}", resolved.display()))?;
    let preprocessor =
        read_sibling::<PreprocessorConfig>(&resolved, "preprocessor_config.json")?.unwrap_or_default();
    Ok(LoadedConfig {
        value,
        preprocessor,
        path: resolved,
    })
}

fn read_sibling<T: serde::de::DeserializeOwned>(config_path: &Path, name: &str) -> Result<Option<T>> {
    let Some(parent) = config_path.parent() else {
        return Ok(None);
    };
    let candidate = parent.join(name);
    if !candidate.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&candidate)
        .with_context(|| format!("failed to read {}", candidate.display()))?;
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", candidate.display()))?;
    Ok(Some(parsed))
}

fn apply_generation_overrides(cfg: &mut DocVlConfig, overrides: GenerationOverrides) {
    if cfg.bos_token_id.is_none() {
        cfg.bos_token_id = overrides.bos_token_id;
    }
    if cfg.pad_token_id.is_none() {
        cfg.pad_token_id = overrides.pad_token_id;
    }
    let ids = match overrides.eos_token_id {
        Some(TokenIds::One(id)) => vec![id],
        Some(TokenIds::Many(ids)) => ids,
        None => Vec::new(),
    };
    let mut ids = ids.into_iter();
    if cfg.eos_token_id.is_none() {
        cfg.eos_token_id = ids.next();
    }
    for id in ids {
        if Some(id) != cfg.eos_token_id && !cfg.stop_token_ids.contains(&id) {
            cfg.stop_token_ids.push(id);
        }
    }
}
