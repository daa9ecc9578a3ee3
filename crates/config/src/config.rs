use std::{
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use docvl_core::{
    GenerationParams, ResizeMode, TaskKind, VisionSettings,
    inference::{DEFAULT_FIXED_SIZE, DEFAULT_MAX_PIXELS, DEFAULT_MIN_PIXELS},
    runtime::{DeviceKind, Precision},
};
use serde::{Deserialize, Serialize};

use crate::paths::default_config_file;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelPaths,
    pub inference: InferenceSettings,
}

/// Where the model files live. Unset entries are derived from `dir`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub weights: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResources {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelPaths {
    pub fn resolve(&self) -> Result<ModelResources> {
        let pick = |explicit: &Option<PathBuf>, file: &str| -> Result<PathBuf> {
            match (explicit, &self.dir) {
                (Some(path), _) => Ok(path.clone()),
                (None, Some(dir)) => Ok(dir.join(file)),
                (None, None) => bail!(
                    "no model directory configured and no explicit path for {file}; \
                     set [model].dir or pass --model-dir"
                ),
            }
        };
        let weights = match (&self.weights, &self.dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.clone(),
            (None, None) => bail!("no model weights configured; set [model].dir or --weights"),
        };
        Ok(ModelResources {
            config: pick(&self.config, "config.json")?,
            tokenizer: pick(&self.tokenizer, "tokenizer.json")?,
            weights,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeKind {
    Fixed,
    #[default]
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub device: DeviceKind,
    pub precision: Option<Precision>,
    pub task: TaskKind,
    pub resize: ResizeKind,
    pub fixed_size: u32,
    pub min_pixels: u32,
    pub max_pixels: u32,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpu,
            precision: None,
            task: TaskKind::Ocr,
            resize: ResizeKind::Dynamic,
            fixed_size: DEFAULT_FIXED_SIZE,
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
            max_new_tokens: 1024,
            temperature: 0.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl InferenceSettings {
    pub fn vision_settings(&self) -> VisionSettings {
        let resize = match self.resize {
            ResizeKind::Fixed => ResizeMode::Fixed {
                size: self.fixed_size,
            },
            ResizeKind::Dynamic => ResizeMode::Dynamic {
                min_pixels: self.min_pixels,
                max_pixels: self.max_pixels,
            },
        };
        VisionSettings { resize }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: (self.top_p > 0.0 && self.top_p < 1.0).then_some(self.top_p),
            top_k: self.top_k.filter(|&k| k > 0),
            repetition_penalty: self.repetition_penalty,
            seed: self.seed,
        }
    }
}

impl AppConfig {
    /// Load from `path` when given (it must exist), else from the default location when a file is
    /// there, else fall back to defaults. Returns the file actually read.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match path {
            Some(path) => Ok((Self::from_file(path)?, Some(path.to_path_buf()))),
            None => {
                let default_path = default_config_file();
                if default_path.is_file() {
                    Ok((Self::from_file(&default_path)?, Some(default_path)))
                } else {
                    Ok((Self::default(), None))
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration at {}", path.display()))
    }

    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<(Self, Option<PathBuf>)> {
        let (mut config, source) = Self::load(overrides.config_path.as_deref())?;
        config += overrides;
        Ok((config, source))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let serialized = toml::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write configuration to {}", path.display()))
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let model = &mut self.model;
        if let Some(dir) = overrides.model_dir.as_ref() {
            model.dir = Some(dir.clone());
        }
        if let Some(path) = overrides.model_config.as_ref() {
            model.config = Some(path.clone());
        }
        if let Some(path) = overrides.tokenizer.as_ref() {
            model.tokenizer = Some(path.clone());
        }
        if let Some(path) = overrides.weights.as_ref() {
            model.weights = Some(path.clone());
        }

        let inference = &mut self.inference;
        let patch = &overrides.inference;
        if let Some(device) = patch.device {
            inference.device = device;
        }
        if patch.precision.is_some() {
            inference.precision = patch.precision;
        }
        if let Some(task) = patch.task {
            inference.task = task;
        }
        if let Some(resize) = patch.resize {
            inference.resize = resize;
        }
        if let Some(size) = patch.fixed_size {
            inference.fixed_size = size;
        }
        if let Some(min_pixels) = patch.min_pixels {
            inference.min_pixels = min_pixels;
        }
        if let Some(max_pixels) = patch.max_pixels {
            inference.max_pixels = max_pixels;
        }
        if let Some(max_new_tokens) = patch.max_new_tokens {
            inference.max_new_tokens = max_new_tokens;
        }
        if let Some(temperature) = patch.temperature {
            inference.temperature = temperature;
        }
        if let Some(top_p) = patch.top_p {
            inference.top_p = top_p;
        }
        if let Some(top_k) = patch.top_k {
            inference.top_k = Some(top_k);
        }
        if let Some(penalty) = patch.repetition_penalty {
            inference.repetition_penalty = penalty;
        }
        if patch.seed.is_some() {
            inference.seed = patch.seed;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub model_config: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub inference: InferenceOverride,
}

#[derive(Debug, Default, Clone)]
pub struct InferenceOverride {
    pub device: Option<DeviceKind>,
    pub precision: Option<Precision>,
    pub task: Option<TaskKind>,
    pub resize: Option<ResizeKind>,
    pub fixed_size: Option<u32>,
    pub min_pixels: Option<u32>,
    pub max_pixels: Option<u32>,
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<u64>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl ConfigOverride for &ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_partial_toml_with_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[model]
dir = "/models/docvl"

[inference]
task = "table"
resize = "fixed"
fixed_size = 896
temperature = 0.7
"#
        )?;
        let (config, source) = AppConfig::load(Some(file.path()))?;
        assert_eq!(source.as_deref(), Some(file.path()));
        assert_eq!(config.inference.task, TaskKind::Table);
        assert_eq!(
            config.inference.vision_settings().resize,
            ResizeMode::Fixed { size: 896 }
        );
        assert_eq!(config.inference.max_new_tokens, 1024);
        assert_eq!(config.inference.min_pixels, DEFAULT_MIN_PIXELS);

        let resources = config.model.resolve()?;
        assert_eq!(resources.config, PathBuf::from("/models/docvl/config.json"));
        assert_eq!(
            resources.tokenizer,
            PathBuf::from("/models/docvl/tokenizer.json")
        );
        assert_eq!(resources.weights, PathBuf::from("/models/docvl"));
        Ok(())
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/docvl.toml"))).is_err());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let mut config = AppConfig::default();
        config.inference.temperature = 0.3;
        config += ConfigOverrides {
            weights: Some(PathBuf::from("/w/model.safetensors")),
            inference: InferenceOverride {
                temperature: Some(0.0),
                seed: Some(11),
                top_k: Some(5),
                ..InferenceOverride::default()
            },
            ..ConfigOverrides::default()
        };
        assert_eq!(config.inference.temperature, 0.0);
        assert_eq!(config.inference.seed, Some(11));
        assert_eq!(config.model.weights, Some(PathBuf::from("/w/model.safetensors")));
        let params = config.inference.generation_params();
        assert_eq!(params.top_k, Some(5));
        assert_eq!(params.top_p, None);
    }

    #[test]
    fn load_with_overrides_reads_the_named_file_first() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[inference]\ntask = \"formula\"\nmax_new_tokens = 32\n")?;
        let (config, source) = AppConfig::load_with_overrides(ConfigOverrides {
            config_path: Some(file.path().to_path_buf()),
            inference: InferenceOverride {
                max_new_tokens: Some(8),
                ..InferenceOverride::default()
            },
            ..ConfigOverrides::default()
        })?;
        assert_eq!(source.as_deref(), Some(file.path()));
        assert_eq!(config.inference.task, TaskKind::Formula);
        assert_eq!(config.inference.max_new_tokens, 8);
        Ok(())
    }

    #[test]
    fn unresolved_model_paths_fail() {
        assert!(ModelPaths::default().resolve().is_err());
    }

    #[test]
    fn save_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.inference.resize = ResizeKind::Fixed;
        config.inference.seed = Some(3);
        config.save(&path)?;
        assert_eq!(AppConfig::from_file(&path)?, config);
        Ok(())
    }
}
