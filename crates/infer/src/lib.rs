//! Document VLM inference on candle: weight loading, image preprocessing, the vision
//! encoder and projector, and a KV-cached language decoder.

pub mod config;
pub mod model;
pub mod prompt;
pub mod transformer;
pub mod vision;
pub mod weights;

#[cfg(test)]
mod test_support;

pub use config::{DocVlConfig, LoadedConfig, PreprocessorConfig, load_config};
pub use model::{DocVlModel, load_image, load_model};
