use anyhow::Result;
use candle_core::{Device, Tensor};
use image::RgbImage;

use crate::{depth::DepthTransform, utils::image_to_signed_tensor, SError};

/// Inputs of one sampler call, replicated to the requested sample count.
#[derive(Debug)]
pub struct DepthBatch {
    /// (n, 3, height, width), values in [-1, 1].
    pub image: Tensor,
    /// (n, 3, h, w), the depth estimator input.
    pub depth_input: Tensor,
    pub prompts: Vec<String>,
}

impl DepthBatch {
    pub fn num_samples(&self) -> usize {
        self.prompts.len()
    }
}

pub fn make_batch(
    image: &RgbImage,
    prompt: &str,
    num_samples: usize,
    transform: &DepthTransform,
    device: &Device,
) -> Result<DepthBatch> {
    if num_samples == 0 {
        return Err(SError::NoSamples.into());
    }
    let signed = image_to_signed_tensor(image, &Device::Cpu)?;
    let depth_input = transform
        .apply(&signed)?
        .unsqueeze(0)?
        .repeat((num_samples, 1, 1, 1))?
        .to_device(device)?;
    let image = signed
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .repeat((num_samples, 1, 1, 1))?
        .to_device(device)?;
    Ok(DepthBatch {
        image,
        depth_input,
        prompts: vec![prompt.to_string(); num_samples],
    })
}
