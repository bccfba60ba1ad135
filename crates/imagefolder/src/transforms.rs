//! Evaluation-time preprocessing.
//!
//! Images are resized so their shorter side equals `input_size / 0.875`,
//! center-cropped to `input_size`, scaled to `[0, 1]` and normalised per
//! channel. The output is a `(3, input_size, input_size)` f32 tensor on the CPU.

use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::{DataError, Result};

/// Fraction of the resized image kept by the center crop.
pub const CROP_FRACTION: f64 = 0.875;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    pub const INCEPTION: Self = Self {
        mean: [0.5, 0.5, 0.5],
        std: [0.5, 0.5, 0.5],
    };
}

#[derive(Debug, Clone)]
pub struct EvalTransform {
    input_size: usize,
    resize_size: usize,
    normalization: Normalization,
}

impl EvalTransform {
    pub fn new(input_size: usize, normalization: Normalization) -> Result<Self> {
        if input_size == 0 {
            return Err(DataError::InvalidConfig(
                "input_size must be greater than zero".into(),
            ));
        }
        if normalization.std.iter().any(|&std| std <= 0.0) {
            return Err(DataError::InvalidConfig(
                "normalization std must be positive".into(),
            ));
        }
        let resize_size = (input_size as f64 / CROP_FRACTION) as usize;
        Ok(Self {
            input_size,
            resize_size,
            normalization,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn resize_size(&self) -> usize {
        self.resize_size
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn apply(&self, image: &DynamicImage) -> Result<Tensor> {
        let rgb = image.to_rgb8();
        let resized = self.resize_shorter_side(&rgb);
        let cropped = self.center_crop(&resized);
        self.to_tensor(cropped)
    }

    fn resize_shorter_side(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let target = self.resize_size as u32;
        let (new_width, new_height) = if width <= height {
            let scaled = (target as u64 * height as u64 / width.max(1) as u64) as u32;
            (target, scaled.max(1))
        } else {
            let scaled = (target as u64 * width as u64 / height.max(1) as u64) as u32;
            (scaled.max(1), target)
        };
        if (new_width, new_height) == (width, height) {
            return image.clone();
        }
        image::imageops::resize(image, new_width, new_height, FilterType::Triangle)
    }

    fn center_crop(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let size = self.input_size as u32;
        // Images smaller than the crop are padded with black, as torchvision does.
        let mut canvas = RgbImage::new(size, size);
        let left = (width as i64 - size as i64) as f64 / 2.0;
        let top = (height as i64 - size as i64) as f64 / 2.0;
        let left = left.round() as i64;
        let top = top.round() as i64;
        for y in 0..size {
            let src_y = top + y as i64;
            if src_y < 0 || src_y >= height as i64 {
                continue;
            }
            for x in 0..size {
                let src_x = left + x as i64;
                if src_x < 0 || src_x >= width as i64 {
                    continue;
                }
                canvas.put_pixel(x, y, *image.get_pixel(src_x as u32, src_y as u32));
            }
        }
        canvas
    }

    fn to_tensor(&self, image: RgbImage) -> Result<Tensor> {
        let size = self.input_size;
        let raw = image.into_raw();
        let device = Device::Cpu;
        let pixels = Tensor::from_vec(raw, (size, size, 3), &device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;
        let mean = Tensor::new(&self.normalization.mean, &device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.normalization.std, &device)?.reshape((3, 1, 1))?;
        Ok(pixels.broadcast_sub(&mean)?.broadcast_div(&std)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn resize_size_matches_crop_fraction() {
        let transform = EvalTransform::new(224, Normalization::IMAGENET).unwrap();
        assert_eq!(transform.resize_size(), 256);
    }

    #[test]
    fn produces_normalized_chw_tensor() {
        let transform = EvalTransform::new(8, Normalization::INCEPTION).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 12, Rgb([255, 0, 255])));

        let tensor = transform.apply(&image).unwrap();

        assert_eq!(tensor.dims(), &[3, 8, 8]);
        let values = tensor.to_vec3::<f32>().unwrap();
        assert!((values[0][4][4] - 1.0).abs() < 1e-2);
        assert!((values[1][4][4] + 1.0).abs() < 1e-2);
        assert!((values[2][0][0] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn rejects_zero_input_size() {
        assert!(EvalTransform::new(0, Normalization::IMAGENET).is_err());
    }
}
