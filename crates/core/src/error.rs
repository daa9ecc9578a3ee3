use std::path::Path;

use anyhow::Error;
use thiserror::Error;

/// Failure kinds surfaced by the public inference entry points.
///
/// Internals work with `anyhow::Result`; conversions flatten the context chain into the message.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("failed to load image {path}: {reason}")]
    ImageLoad { path: String, reason: String },
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("failed to load tokenizer {path}: {reason}")]
    TokenizerLoad { path: String, reason: String },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("an input image is required for document recognition")]
    ImageRequired,
}

impl OcrError {
    pub fn image_load(path: &Path, err: impl Into<Error>) -> Self {
        OcrError::ImageLoad {
            path: path.display().to_string(),
            reason: format!("{:#}", err.into()),
        }
    }

    pub fn tokenizer_load(path: &Path, err: impl Into<Error>) -> Self {
        OcrError::TokenizerLoad {
            path: path.display().to_string(),
            reason: format!("{:#}", err.into()),
        }
    }

    pub fn model_load(err: Error) -> Self {
        OcrError::ModelLoad(format!("{err:#}"))
    }

    pub fn configuration(err: Error) -> Self {
        OcrError::Configuration(format!("{err:#}"))
    }

    pub fn generation(err: Error) -> Self {
        OcrError::Generation(format!("{err:#}"))
    }

    /// Prefix the message with the batch index while keeping the variant.
    pub fn for_image(self, index: usize) -> Self {
        let tag = |detail: String| format!("image {index}: {detail}");
        match self {
            OcrError::ImageLoad { path, reason } => OcrError::ImageLoad {
                path,
                reason: tag(reason),
            },
            OcrError::ModelLoad(detail) => OcrError::ModelLoad(tag(detail)),
            OcrError::TokenizerLoad { path, reason } => OcrError::TokenizerLoad {
                path,
                reason: tag(reason),
            },
            OcrError::Configuration(detail) => OcrError::Configuration(tag(detail)),
            OcrError::Generation(detail) => OcrError::Generation(tag(detail)),
            OcrError::ImageRequired => OcrError::ImageRequired,
        }
    }
}

/// Decode faults are the common case once a model is loaded.
impl From<Error> for OcrError {
    fn from(err: Error) -> Self {
        OcrError::generation(err)
    }
}
