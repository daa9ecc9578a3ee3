pub mod config;
pub mod paths;

pub use config::{
    AppConfig, ConfigOverride, ConfigOverrides, InferenceOverride, InferenceSettings,
    ModelPaths, ModelResources, ResizeKind,
};
pub use paths::{config_dir, default_config_file};
