use anyhow::Result;
use candle_core::{DType, Device, Error, IndexOp, Tensor};
use image::{ImageBuffer, RgbImage};
use tracing::warn;

/// Converts a u8 tensor of shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        return Err(Error::Msg(
            "tensor_to_image expects an input of shape (3, height, width)".to_string(),
        )
        .into());
    }
    let img = img.to_dtype(DType::U8)?.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    match ImageBuffer::from_raw(width as u32, height as u32, pixels) {
        Some(image) => Ok(image),
        None => Err(Error::Msg("error building image".to_string()).into()),
    }
}

/// Splits a (n, 3, height, width) u8 tensor into one image per sample.
pub fn tensor_to_images(imgs: &Tensor) -> Result<Vec<RgbImage>> {
    let (n, _, _, _) = imgs.dims4()?;
    let imgs = imgs.to_device(&Device::Cpu)?;
    (0..n).map(|idx| tensor_to_image(&imgs.i(idx)?)).collect()
}

/// Converts an RGB image into a f32 tensor of shape (height, width, 3) in [-1, 1].
pub fn image_to_signed_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let img = Tensor::from_vec(
        img.as_raw().clone(),
        (height as usize, width as usize, 3),
        &Device::Cpu,
    )?
    .to_dtype(DType::F32)?
    .affine(1. / 127.5, -1.)?
    .to_device(device)?;
    Ok(img)
}

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        warn!("Running on CPU, to run on GPU, build with `--features cuda` or `--features metal`");
        Ok(Device::Cpu)
    }
}

/// Inserts the 1-based sample index before the extension.
pub fn output_filename(basename: &str, sample_idx: usize) -> String {
    match basename.rsplit_once('.') {
        None => format!("{basename}.{sample_idx}.png"),
        Some((filename_no_extension, extension)) => {
            format!("{filename_no_extension}.{sample_idx}.{extension}")
        }
    }
}

/// Name of the nth output frame of a batch, numbered from 1.
pub fn frame_filename(batch_name: &str, frame_idx: usize) -> String {
    format!("{batch_name}_{frame_idx:05}.png")
}

pub fn depth_filename(batch_name: &str, frame_idx: usize) -> String {
    format!("{batch_name}_depth_{frame_idx:05}.png")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_filenames() {
        assert_eq!(output_filename("tree.png", 1), "tree.1.png");
        assert_eq!(output_filename("final", 2), "final.2.png");
        assert_eq!(output_filename("out.jpg", 3), "out.3.jpg");
    }

    #[test]
    fn frame_filenames_are_zero_padded() {
        assert_eq!(frame_filename("tree", 1), "tree_00001.png");
        assert_eq!(depth_filename("tree", 42), "tree_depth_00042.png");
    }

    #[test]
    fn signed_tensor_range() -> Result<()> {
        let img = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([255, 255, 255])
            }
        });
        let t = image_to_signed_tensor(&img, &Device::Cpu)?;
        assert_eq!(t.dims(), &[1, 2, 3]);
        let values = t.flatten_all()?.to_vec1::<f32>()?;
        assert!(values[..3].iter().all(|v| (*v + 1.).abs() < 1e-6));
        assert!(values[3..].iter().all(|v| (*v - 1.).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn tensor_image_conversion_keeps_layout() -> Result<()> {
        // 2 samples, 3 channels, 1x2 pixels
        let data: Vec<u8> = (0..12).collect();
        let t = Tensor::from_vec(data, (2, 3, 1, 2), &Device::Cpu)?;
        let images = tensor_to_images(&t)?;
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].get_pixel(0, 0).0, [0, 2, 4]);
        assert_eq!(images[0].get_pixel(1, 0).0, [1, 3, 5]);
        assert_eq!(images[1].get_pixel(1, 0).0, [7, 9, 11]);
        Ok(())
    }
}
