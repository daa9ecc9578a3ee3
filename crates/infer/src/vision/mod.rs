pub mod encoder;
pub mod interpolate;
pub mod preprocess;
pub mod projector;

pub use encoder::VisionEncoder;
pub use interpolate::bicubic_resize;
pub use preprocess::{ImagePreprocessor, ProcessedImage, smart_resize};
pub use projector::Projector;
