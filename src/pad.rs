//! Brings arbitrary images to dimensions the UNet accepts.

use image::RgbImage;

/// Spatial dimensions are padded to a multiple of this.
pub const TILE: u32 = 64;

/// Smallest multiples of [`TILE`] not below `width`/`height`, never below two tiles.
pub fn pad_dims(width: u32, height: u32) -> (u32, u32) {
    let round = |v: u32| v.div_ceil(TILE).max(2) * TILE;
    (round(width), round(height))
}

/// Pads to [`pad_dims`] on the right and bottom by repeating the edge pixels.
pub fn pad_image(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let (target_w, target_h) = pad_dims(width, height);
    if (target_w, target_h) == (width, height) {
        return img.clone();
    }
    RgbImage::from_fn(target_w, target_h, |x, y| {
        *img.get_pixel(x.min(width - 1), y.min(height - 1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn dims_round_up_to_tiles() {
        assert_eq!(pad_dims(500, 450), (512, 512));
        assert_eq!(pad_dims(512, 512), (512, 512));
        assert_eq!(pad_dims(513, 640), (576, 640));
        assert_eq!(pad_dims(10, 10), (128, 128));
        assert_eq!(pad_dims(64, 129), (128, 192));
        assert_eq!(pad_dims(1, 1000), (128, 1024));
    }

    #[test]
    fn dims_are_minimal_multiples() {
        for v in 1..600u32 {
            let (w, _) = pad_dims(v, 1);
            assert_eq!(w % TILE, 0);
            assert!(w >= v && w >= 2 * TILE);
            assert!(w == 2 * TILE || w - TILE < v);
        }
    }

    #[test]
    fn content_stays_top_left_and_edges_repeat() {
        let img = RgbImage::from_fn(130, 70, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]));
        let padded = pad_image(&img);
        assert_eq!(padded.dimensions(), (192, 128));
        for (x, y, px) in img.enumerate_pixels() {
            assert_eq!(padded.get_pixel(x, y), px);
        }
        // right edge repeats the last column
        assert_eq!(padded.get_pixel(191, 10), img.get_pixel(129, 10));
        // bottom edge repeats the last row
        assert_eq!(padded.get_pixel(20, 127), img.get_pixel(20, 69));
        // corner repeats the last pixel
        assert_eq!(padded.get_pixel(191, 127), img.get_pixel(129, 69));
    }

    #[test]
    fn valid_images_are_unchanged() {
        let img = RgbImage::from_pixel(128, 256, Rgb([1, 2, 3]));
        assert_eq!(pad_image(&img), img);
    }
}
