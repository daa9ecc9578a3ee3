use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{DType, Device, Tensor};
use docvl_core::ResizeMode;
use fast_image_resize as fir;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage, imageops};
use tracing::trace;

use crate::config::{DEFAULT_IMAGE_MEAN, DEFAULT_IMAGE_STD, PreprocessorConfig};

/// Pixels ready for the vision encoder.
#[derive(Debug)]
pub struct ProcessedImage {
    /// `[1, height, width, 3]`, normalised and cast to the model dtype.
    pub pixel_values: Tensor,
    pub width: u32,
    pub height: u32,
    pub num_image_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    patch_size: u32,
    resize: ResizeMode,
    image_mean: [f32; 3],
    image_std: [f32; 3],
}

impl ImagePreprocessor {
    pub fn new(patch_size: usize, resize: ResizeMode) -> Result<Self> {
        let patch_size = u32::try_from(patch_size).context("patch size does not fit in u32")?;
        resize.validate(patch_size)?;
        Ok(Self {
            patch_size,
            resize,
            image_mean: DEFAULT_IMAGE_MEAN,
            image_std: DEFAULT_IMAGE_STD,
        })
    }

    pub fn with_normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Result<Self> {
        ensure!(
            mean.iter().all(|m| m.is_finite()) && std.iter().all(|&s| s > 0.0 && s.is_finite()),
            "invalid mean/std for normalisation"
        );
        self.image_mean = mean;
        self.image_std = std;
        Ok(self)
    }

    pub fn from_config(
        patch_size: usize,
        resize: ResizeMode,
        config: &PreprocessorConfig,
    ) -> Result<Self> {
        Self::new(patch_size, resize)?.with_normalization(config.image_mean, config.image_std)
    }

    /// Target canvas for an input of `width x height`; always patch-aligned.
    pub fn target_size(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        match self.resize {
            ResizeMode::Fixed { size } => Ok((size, size)),
            ResizeMode::Dynamic {
                min_pixels,
                max_pixels,
            } => smart_resize(width, height, self.patch_size, min_pixels, max_pixels),
        }
    }

    /// Placeholder count for an input of `width x height`, known before any pixel work.
    pub fn num_image_tokens(&self, width: u32, height: u32) -> Result<usize> {
        let (tw, th) = self.target_size(width, height)?;
        Ok(((tw / self.patch_size) * (th / self.patch_size)) as usize)
    }

    pub fn process(
        &self,
        image: &DynamicImage,
        device: &Device,
        dtype: DType,
    ) -> Result<ProcessedImage> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        ensure!(width > 0 && height > 0, "image has zero area");
        let (target_w, target_h) = self.target_size(width, height)?;
        let canvas = match self.resize {
            ResizeMode::Fixed { size } => letterbox(&rgb, size)?,
            ResizeMode::Dynamic { .. } if (width, height) == (target_w, target_h) => rgb,
            ResizeMode::Dynamic { .. } => resize_rgb_image(&rgb, target_w, target_h)?,
        };
        trace!(width, height, target_w, target_h, "preprocessed image");

        let data = self.normalise(&canvas);
        let pixel_values = Tensor::from_vec(
            data,
            (1, target_h as usize, target_w as usize, 3),
            device,
        )?
        .to_dtype(dtype)?;
        Ok(ProcessedImage {
            pixel_values,
            width: target_w,
            height: target_h,
            num_image_tokens: ((target_w / self.patch_size) * (target_h / self.patch_size))
                as usize,
        })
    }

    fn normalise(&self, image: &RgbImage) -> Vec<f32> {
        let mut data = Vec::with_capacity((image.width() * image.height() * 3) as usize);
        for pixel in image.pixels() {
            for (idx, &value) in pixel.0.iter().enumerate() {
                let scaled = f32::from(value) / 255.0;
                data.push((scaled - self.image_mean[idx]) / self.image_std[idx]);
            }
        }
        data
    }
}

/// Scale the longer side to `size`, then centre on a black `size x size` canvas.
fn letterbox(image: &RgbImage, size: u32) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let scale = f64::min(
        f64::from(size) / f64::from(width),
        f64::from(size) / f64::from(height),
    );
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, size);
    let (new_w, new_h) = (scaled(width), scaled(height));
    let resized = if (new_w, new_h) == (width, height) {
        image.clone()
    } else {
        resize_rgb_image(image, new_w, new_h)?
    };
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    let x = i64::from((size - new_w) / 2);
    let y = i64::from((size - new_h) / 2);
    imageops::replace(&mut canvas, &resized, x, y);
    Ok(canvas)
}

fn resize_rgb_image(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    ensure!(width > 0 && height > 0, "target dimensions must be positive");
    let mut owned = image.clone().into_raw();
    let src = fir::images::Image::from_slice_u8(
        image.width(),
        image.height(),
        owned.as_mut_slice(),
        fir::PixelType::U8x3,
    )
    .context("failed to build fast_image_resize source image")?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x3);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    fir::Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|err| anyhow!("fast_image_resize failed: {err}"))?;
    ImageBuffer::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| anyhow!("failed to convert resized buffer into image"))
}

/// Inputs more elongated than this are rejected before resizing.
pub const MAX_ASPECT_RATIO: f64 = 200.0;

/// Aspect-preserving resize into `[min_pixels, max_pixels]` with patch-aligned sides.
///
/// Over budget shrinks and rounds down; under budget grows and rounds up so the floor holds;
/// otherwise each side rounds down. No side drops below one patch.
pub fn smart_resize(
    width: u32,
    height: u32,
    patch: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> Result<(u32, u32)> {
    ensure!(patch > 0, "patch size must be positive");
    ensure!(width > 0 && height > 0, "image has zero area");
    ensure!(
        min_pixels <= max_pixels,
        "min_pixels {min_pixels} exceeds max_pixels {max_pixels}"
    );
    let factor = f64::from(patch);
    let w = f64::from(width);
    let h = f64::from(height);
    let aspect = w.max(h) / w.min(h);
    ensure!(aspect <= MAX_ASPECT_RATIO, "aspect ratio exceeds limit ({aspect})");
    let area = w * h;
    let floor_to = |v: f64| (v / factor).floor() * factor;
    let ceil_to = |v: f64| (v / factor).ceil() * factor;

    let (w_bar, h_bar) = if area > f64::from(max_pixels) {
        let beta = (f64::from(max_pixels) / area).sqrt();
        (floor_to(w * beta), floor_to(h * beta))
    } else if area < f64::from(min_pixels) {
        let beta = (f64::from(min_pixels) / area).sqrt();
        (ceil_to(w * beta), ceil_to(h * beta))
    } else {
        (floor_to(w), floor_to(h))
    };
    let (mut w_bar, mut h_bar) = (w_bar.max(factor), h_bar.max(factor));
    let budget = f64::from(max_pixels);
    if area > budget && w_bar * h_bar > budget {
        // The short side was clamped up to one patch; give the long side what is left.
        if w_bar >= h_bar {
            w_bar = floor_to(budget / h_bar).max(factor);
        } else {
            h_bar = floor_to(budget / w_bar).max(factor);
        }
    }
    Ok((w_bar as u32, h_bar as u32))
}
