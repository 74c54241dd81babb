//! Depth estimation and the depth conditioning channel fed to the UNet.
//!
//! The estimator is Depth Anything V2 on top of a DINOv2 backbone. Its raw
//! output is a relative inverse depth, so every use goes through a per-sample
//! min-max normalization first.

use std::{path::Path, sync::Arc};

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{
    depth_anything_v2::{DepthAnythingV2, DepthAnythingV2Config},
    dinov2,
};
use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma, Rgb};
use tracing::debug;

use crate::SError;

// https://huggingface.co/spaces/depth-anything/Depth-Anything-V2/blob/main/depth_anything_v2/dpt.py#L207
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const DINO_IMG_SIZE: usize = 518;
const DINO_PATCH: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthModelType {
    VitSmall,
}

impl std::str::FromStr for DepthModelType {
    type Err = SError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vits" | "depth_anything_v2_vits" => Ok(Self::VitSmall),
            other => Err(SError::DepthModelType(other.to_string())),
        }
    }
}

/// Turns a signed HWC image tensor into the estimator's CHW input.
#[derive(Debug, Clone)]
pub struct DepthTransform {
    model_type: DepthModelType,
    input_size: usize,
}

impl DepthTransform {
    pub fn new(model_type: &str) -> Result<Self, SError> {
        let model_type = model_type.parse()?;
        Ok(Self {
            model_type,
            input_size: DINO_IMG_SIZE,
        })
    }

    pub fn model_type(&self) -> DepthModelType {
        self.model_type
    }

    /// `image` has shape (height, width, 3) with values in [-1, 1]. The output
    /// has shape (3, h, w), h and w being multiples of the patch size.
    pub fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let (height, width, _) = image.dims3()?;
        let (target_h, target_w) = target_size(height, width, self.input_size, DINO_PATCH);
        let pixels = image
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .affine(0.5, 0.5)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let buffer: ImageBuffer<Rgb<f32>, Vec<f32>> =
            ImageBuffer::from_raw(width as u32, height as u32, pixels)
                .ok_or(SError::String("depth transform got a malformed image"))?;
        let resized = imageops::resize(
            &buffer,
            target_w as u32,
            target_h as u32,
            FilterType::CatmullRom,
        );
        let mean = Tensor::new(&IMAGENET_MEAN, &Device::Cpu)?.reshape((1, 1, 3))?;
        let std = Tensor::new(&IMAGENET_STD, &Device::Cpu)?.reshape((1, 1, 3))?;
        let input = Tensor::from_vec(resized.into_raw(), (target_h, target_w, 3), &Device::Cpu)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .permute((2, 0, 1))?
            .contiguous()?;
        Ok(input)
    }
}

/// Aspect-preserving resize so that both sides are at least `size`, rounded to
/// a multiple of `multiple`.
fn target_size(height: usize, width: usize, size: usize, multiple: usize) -> (usize, usize) {
    let scale = (size as f32 / height as f32).max(size as f32 / width as f32);
    let constrain = |v: f32| {
        let m = multiple as f32;
        let rounded = (v / m).round() * m;
        if rounded < size as f32 {
            ((v / m).ceil() * m) as usize
        } else {
            rounded as usize
        }
    };
    (
        constrain(scale * height as f32),
        constrain(scale * width as f32),
    )
}

pub struct DepthEstimator {
    model: DepthAnythingV2,
}

impl DepthEstimator {
    pub fn new<P: AsRef<Path>>(
        dinov2_weights: P,
        depth_weights: P,
        model_type: DepthModelType,
        device: &Device,
    ) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[dinov2_weights], DType::F32, device)?
        };
        let (backbone, config) = match model_type {
            DepthModelType::VitSmall => (dinov2::vit_small(vb)?, DepthAnythingV2Config::vit_small()),
        };
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[depth_weights], DType::F32, device)?
        };
        let model = DepthAnythingV2::new(Arc::new(backbone), config, vb)?;
        Ok(Self { model })
    }

    /// (n, 3, h, w) -> (n, 1, h, w) relative inverse depth.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let depth = self.model.forward(&input.to_dtype(DType::F32)?)?;
        debug!("depth prediction {:?}", depth.shape());
        let depth = match depth.rank() {
            3 => depth.unsqueeze(1)?,
            _ => depth,
        };
        Ok(depth)
    }
}

/// Min-max normalizes every sample over all of its non-batch dims into [0, 1].
/// A constant sample maps to zeros.
pub fn normalize_min_max(t: &Tensor) -> Result<Tensor> {
    let n = t.dim(0)?;
    let flat = t.flatten_from(1)?;
    let min = flat.min_keepdim(1)?;
    let max = flat.max_keepdim(1)?;
    let range = (&max - &min)?.clamp(1e-8f32, f32::MAX)?;
    let mut shape = vec![1; t.rank()];
    shape[0] = n;
    let out = t
        .broadcast_sub(&min.reshape(shape.clone())?)?
        .broadcast_div(&range.reshape(shape)?)?;
    Ok(out)
}

/// Grayscale view of the first sample of a normalized (n, c, h, w) depth map.
pub fn depth_preview(normalized: &Tensor) -> Result<GrayImage> {
    let plane = normalized.i((0, 0))?.to_device(&Device::Cpu)?;
    let (height, width) = plane.dims2()?;
    let pixels = (plane * 255.)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let image = GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or(SError::String("depth preview has a malformed shape"))?;
    Ok(image)
}

/// Bicubic resize of every plane of a (n, c, h, w) tensor with values in [0, 1].
pub fn resize_bicubic(t: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (n, c, h, w) = t.dims4()?;
    let device = t.device().clone();
    let t = t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let mut planes = Vec::with_capacity(n * c);
    for sample in 0..n {
        for channel in 0..c {
            let values = t.i((sample, channel))?.flatten_all()?.to_vec1::<f32>()?;
            let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
                ImageBuffer::from_raw(w as u32, h as u32, values)
                    .ok_or(SError::String("depth plane has a malformed shape"))?;
            let resized =
                imageops::resize(&plane, width as u32, height as u32, FilterType::CatmullRom);
            planes.extend(resized.into_raw());
        }
    }
    let out = Tensor::from_vec(planes, (n, c, height, width), &Device::Cpu)?.to_device(&device)?;
    Ok(out)
}

pub struct DepthCondition {
    pub preview: GrayImage,
    /// Shape (n, 1, latent_h, latent_w), values in [-1, 1].
    pub cond: Tensor,
}

/// Builds the concat conditioning from raw depth predictions.
pub fn depth_condition(depth: &Tensor, latent_h: usize, latent_w: usize) -> Result<DepthCondition> {
    let normalized = normalize_min_max(&depth.to_dtype(DType::F32)?)?;
    let preview = depth_preview(&normalized)?;
    let resized = resize_bicubic(&normalized, latent_h, latent_w)?;
    let cond = normalize_min_max(&resized)?.affine(2., -1.)?;
    Ok(DepthCondition { preview, cond })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_max(t: &Tensor) -> (f32, f32) {
        let v = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let min = v.iter().copied().fold(f32::INFINITY, f32::min);
        let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (min, max)
    }

    #[test]
    fn unknown_model_types_are_rejected() {
        assert!(DepthTransform::new("vits").is_ok());
        assert!(DepthTransform::new("depth_anything_v2_vits").is_ok());
        assert!(matches!(
            DepthTransform::new("dpt_hybrid"),
            Err(SError::DepthModelType(t)) if t == "dpt_hybrid"
        ));
    }

    #[test]
    fn target_sizes_are_patch_multiples() {
        assert_eq!(target_size(512, 512, 518, 14), (518, 518));
        let (h, w) = target_size(768, 512, 518, 14);
        assert_eq!(w, 518);
        assert_eq!(h % 14, 0);
        assert!(h >= 518);
    }

    #[test]
    fn transform_output_layout() -> Result<()> {
        let transform = DepthTransform::new("vits")?;
        let image = Tensor::zeros((128, 192, 3), DType::F32, &Device::Cpu)?;
        let input = transform.apply(&image)?;
        let (c, h, w) = input.dims3()?;
        assert_eq!(c, 3);
        assert_eq!(h, 518);
        assert_eq!(w % 14, 0);
        assert!(w > h);
        // mid-gray maps to (0.5 - mean) / std
        let first = input.i((0, 0, 0))?.to_scalar::<f32>()?;
        assert!((first - (0.5 - IMAGENET_MEAN[0]) / IMAGENET_STD[0]).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn normalization_is_per_sample() -> Result<()> {
        let a: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let b: Vec<f32> = (0..16).map(|v| 100. + 3. * v as f32).collect();
        let t = Tensor::from_vec([a, b].concat(), (2, 1, 4, 4), &Device::Cpu)?;
        let n = normalize_min_max(&t)?;
        assert_eq!(min_max(&n.i(0)?), (0., 1.));
        assert_eq!(min_max(&n.i(1)?), (0., 1.));
        Ok(())
    }

    #[test]
    fn flat_depth_maps_to_zero() -> Result<()> {
        let t = Tensor::full(3f32, (1, 1, 8, 8), &Device::Cpu)?;
        let cond = depth_condition(&t, 4, 4)?;
        assert_eq!(min_max(&cond.cond), (-1., -1.));
        assert!(cond.preview.pixels().all(|p| p.0[0] == 0));
        Ok(())
    }

    #[test]
    fn condition_shape_and_range() -> Result<()> {
        let n = 3;
        let values: Vec<f32> = (0..n * 32 * 48).map(|v| (v % 97) as f32).collect();
        let depth = Tensor::from_vec(values, (n, 1, 32, 48), &Device::Cpu)?;
        let cond = depth_condition(&depth, 8, 12)?;
        assert_eq!(cond.cond.dims(), &[n, 1, 8, 12]);
        let (min, max) = min_max(&cond.cond);
        assert!((min + 1.).abs() < 1e-5);
        assert!((max - 1.).abs() < 1e-5);
        assert_eq!(cond.preview.dimensions(), (48, 32));
        Ok(())
    }

    #[test]
    fn preview_spans_the_gray_range() -> Result<()> {
        let values: Vec<f32> = (0..64).map(|v| v as f32).collect();
        let depth = Tensor::from_vec(values, (1, 1, 8, 8), &Device::Cpu)?;
        let preview = depth_preview(&normalize_min_max(&depth)?)?;
        assert_eq!(preview.get_pixel(0, 0).0[0], 0);
        assert_eq!(preview.get_pixel(7, 7).0[0], 255);
        Ok(())
    }
}
