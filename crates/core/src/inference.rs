use std::path::PathBuf;

use anyhow::{Result, ensure};
use candle_core::{DType, Device};
use clap::ValueEnum;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{error::OcrError, sampling::TokenSelectionParams, tokenizer::TextTokenizer};

pub const DEFAULT_FIXED_SIZE: u32 = 448;
pub const DEFAULT_MIN_PIXELS: u32 = 147_384;
pub const DEFAULT_MAX_PIXELS: u32 = 2_822_400;

/// Document understanding tasks, each bound to the instruction the model was trained on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Ocr,
    Table,
    Formula,
    Chart,
}

impl TaskKind {
    pub fn prompt(self) -> &'static str {
        match self {
            TaskKind::Ocr => "OCR:",
            TaskKind::Table => "Table Recognition:",
            TaskKind::Formula => "Formula Recognition:",
            TaskKind::Chart => "Chart Recognition:",
        }
    }
}

/// How an input image is brought to a patch-aligned size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ResizeMode {
    /// Letterbox onto a `size x size` canvas.
    Fixed { size: u32 },
    /// Keep the aspect ratio and bring the pixel count into `[min_pixels, max_pixels]`.
    Dynamic { min_pixels: u32, max_pixels: u32 },
}

impl Default for ResizeMode {
    fn default() -> Self {
        ResizeMode::Dynamic {
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl ResizeMode {
    pub fn validate(&self, patch_size: u32) -> Result<()> {
        ensure!(patch_size > 0, "patch size must be positive");
        match *self {
            ResizeMode::Fixed { size } => ensure!(
                size >= patch_size && size % patch_size == 0,
                "fixed size {size} must be a positive multiple of patch size {patch_size}"
            ),
            ResizeMode::Dynamic {
                min_pixels,
                max_pixels,
            } => ensure!(
                min_pixels <= max_pixels,
                "min_pixels {min_pixels} exceeds max_pixels {max_pixels}"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisionSettings {
    pub resize: ResizeMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 0.0,
            top_p: None,
            top_k: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl TokenSelectionParams for GenerationParams {
    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn top_p(&self) -> Option<f64> {
        self.top_p
    }

    fn top_k(&self) -> Option<usize> {
        self.top_k
    }

    fn repetition_penalty(&self) -> f32 {
        self.repetition_penalty
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct ModelLoadArgs {
    /// `config.json`, or the directory holding it. Defaults to the weights directory.
    pub config_path: Option<PathBuf>,
    /// A safetensors file or a directory of shards.
    pub weights_path: PathBuf,
    pub device: Device,
    pub dtype: DType,
}

/// Streams text deltas as they are decoded.
pub type StreamCallback<'a> = &'a mut dyn FnMut(&str);

pub trait OcrEngine: Send + Sync {
    fn device(&self) -> &Device;

    /// Recognise one image. `None` is rejected with [`OcrError::ImageRequired`].
    fn recognize(
        &self,
        tokenizer: &dyn TextTokenizer,
        image: Option<&DynamicImage>,
        prompt: &str,
        vision: &VisionSettings,
        params: &GenerationParams,
        stream: Option<StreamCallback<'_>>,
    ) -> Result<GenerationResult, OcrError>;

    /// Sequential batch; each image gets a fresh cache and the first failure aborts the batch.
    fn recognize_batch(
        &self,
        tokenizer: &dyn TextTokenizer,
        images: &[DynamicImage],
        prompt: &str,
        vision: &VisionSettings,
        params: &GenerationParams,
    ) -> Result<Vec<GenerationResult>, OcrError> {
        images
            .iter()
            .enumerate()
            .map(|(index, image)| {
                self.recognize(tokenizer, Some(image), prompt, vision, params, None)
                    .map_err(|err| err.for_image(index))
            })
            .collect()
    }
}

/// Normalise decoder output: Windows line endings and surrounding whitespace.
pub fn normalize_text(s: &str) -> String {
    s.replace("\r\n", "\n").trim().to_string()
}
