use std::path::PathBuf;

use clap::Parser;
use docvl_config::{AppConfig, ConfigOverride, ConfigOverrides, ResizeKind};
use docvl_core::{
    TaskKind,
    runtime::{DeviceKind, Precision},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Document VLM OCR CLI", long_about = None)]
pub struct Args {
    /// Page images to recognise, processed in order.
    #[arg(value_name = "IMAGE", required = true)]
    pub images: Vec<PathBuf>,

    /// Path to a TOML configuration file (defaults to the platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Directory holding config.json, tokenizer.json and the safetensors weights.
    #[arg(long, value_name = "DIR", help_heading = "Application")]
    pub model_dir: Option<PathBuf>,

    /// Override the model configuration JSON path.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub model_config: Option<PathBuf>,

    /// Override the tokenizer.json path.
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub tokenizer: Option<PathBuf>,

    /// Override the weights path (a safetensors file or a directory of shards).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub weights: Option<PathBuf>,

    /// Only print the final text; logs go to stderr at error level.
    #[arg(long, short, help_heading = "Application")]
    pub quiet: bool,

    /// Emit per-stage timing events.
    #[arg(long, help_heading = "Application")]
    pub timings: bool,

    /// Recognition task; selects the instruction sent after the image.
    #[arg(long, value_enum, help_heading = "Prompt")]
    pub task: Option<TaskKind>,

    /// Custom instruction text, replacing the task prompt.
    #[arg(long, conflicts_with = "prompt_file", help_heading = "Prompt")]
    pub prompt: Option<String>,

    /// Read the instruction from a UTF-8 file.
    #[arg(long, value_name = "PATH", conflicts_with = "prompt", help_heading = "Prompt")]
    pub prompt_file: Option<PathBuf>,

    /// Device backend to execute on (cpu/metal/cuda).
    #[arg(long, value_enum, help_heading = "Inference")]
    pub device: Option<DeviceKind>,

    /// Numeric precision. Defaults to f32 on CPU and f16 on Metal/CUDA.
    #[arg(long, value_enum, help_heading = "Inference")]
    pub dtype: Option<Precision>,

    /// Image resizing strategy (fixed/dynamic).
    #[arg(long, value_parser = parse_resize, help_heading = "Vision")]
    pub resize: Option<ResizeKind>,

    /// Square canvas side for fixed resizing; a multiple of the patch size.
    #[arg(long, help_heading = "Vision")]
    pub fixed_size: Option<u32>,

    /// Lower pixel budget for dynamic resizing.
    #[arg(long, help_heading = "Vision")]
    pub min_pixels: Option<u32>,

    /// Upper pixel budget for dynamic resizing.
    #[arg(long, help_heading = "Vision")]
    pub max_pixels: Option<u32>,

    /// Maximum number of tokens to generate per image.
    #[arg(long, help_heading = "Generation")]
    pub max_new_tokens: Option<usize>,

    /// Sampling temperature; 0 decodes greedily.
    #[arg(long, help_heading = "Generation")]
    pub temperature: Option<f64>,

    #[arg(long, help_heading = "Generation")]
    pub top_p: Option<f64>,

    #[arg(long, help_heading = "Generation")]
    pub top_k: Option<usize>,

    #[arg(long, help_heading = "Generation")]
    pub repetition_penalty: Option<f32>,

    /// Seed for sampling; unseeded runs draw from entropy.
    #[arg(long, help_heading = "Generation")]
    pub seed: Option<u64>,
}

fn parse_resize(raw: &str) -> Result<ResizeKind, String> {
    match raw.to_ascii_lowercase().as_str() {
        "fixed" => Ok(ResizeKind::Fixed),
        "dynamic" => Ok(ResizeKind::Dynamic),
        other => Err(format!("unknown resize mode `{other}` (expected fixed or dynamic)")),
    }
}

impl From<&Args> for ConfigOverrides {
    fn from(args: &Args) -> Self {
        let mut overrides = ConfigOverrides {
            config_path: args.config.clone(),
            model_dir: args.model_dir.clone(),
            model_config: args.model_config.clone(),
            tokenizer: args.tokenizer.clone(),
            weights: args.weights.clone(),
            ..ConfigOverrides::default()
        };
        let inference = &mut overrides.inference;
        inference.device = args.device;
        inference.precision = args.dtype;
        inference.task = args.task;
        inference.resize = args.resize;
        inference.fixed_size = args.fixed_size;
        inference.min_pixels = args.min_pixels;
        inference.max_pixels = args.max_pixels;
        inference.max_new_tokens = args.max_new_tokens;
        inference.temperature = args.temperature;
        inference.top_p = args.top_p;
        inference.top_k = args.top_k;
        inference.repetition_penalty = args.repetition_penalty;
        inference.seed = args.seed;
        overrides
    }
}

impl ConfigOverride for &Args {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}
