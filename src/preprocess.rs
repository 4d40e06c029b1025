use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{Result, SamDemoError};
use crate::imageops_ai::padding::{padding, Position};

/// Side length of the square the image encoder consumes.
pub const ENCODER_INPUT_SIZE: u32 = 1024;

pub const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
pub const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// Encoder input plus the geometry needed to map prompts into it.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub tensor: Array4<f32>,
    pub original_size: (u32, u32),
    pub resized_size: (u32, u32),
}

impl PreparedImage {
    /// Maps pixel coordinates of the original image into encoder space.
    pub fn transform_coords(&self, coords: &[[f32; 2]]) -> Vec<[f32; 2]> {
        transform_coords(coords, self.original_size, self.resized_size)
    }
}

pub fn transform_coords(
    coords: &[[f32; 2]],
    original_size: (u32, u32),
    resized_size: (u32, u32),
) -> Vec<[f32; 2]> {
    let (ow, oh) = original_size;
    let (rw, rh) = resized_size;
    let sx = rw as f32 / ow as f32;
    let sy = rh as f32 / oh as f32;
    coords.iter().map(|&[x, y]| [x * sx, y * sy]).collect()
}

/// 長辺が `target` になるサイズを計算（四捨五入）
pub fn resize_longest_side(width: u32, height: u32, target: u32) -> (u32, u32) {
    let scale = target as f64 / width.max(height) as f64;
    let w = (width as f64 * scale + 0.5) as u32;
    let h = (height as f64 * scale + 0.5) as u32;
    (w.max(1), h.max(1))
}

/// Resizes the longest side to 1024, pads bottom/right and normalizes with
/// the SAM pixel statistics.
pub fn preprocess(image: &RgbImage) -> Result<PreparedImage> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SamDemoError::validation("image", "must not be empty"));
    }

    let (rw, rh) = resize_longest_side(width, height, ENCODER_INPUT_SIZE);
    let resized = imageops::resize(image, rw, rh, FilterType::Triangle);

    // 平均色で埋めると正規化後のパディングがほぼ 0 になる
    let pad_color = Rgb(PIXEL_MEAN.map(|m| m.round() as u8));
    let padded = padding(
        &resized,
        ENCODER_INPUT_SIZE,
        ENCODER_INPUT_SIZE,
        Position::TopLeft,
        pad_color,
    )
    .ok_or_else(|| SamDemoError::rendering("パディング追加", "resized image exceeds encoder input"))?;

    let view = padded.as_ndarray3();
    let mut tensor = Array4::<f32>::zeros((
        1,
        3,
        ENCODER_INPUT_SIZE as usize,
        ENCODER_INPUT_SIZE as usize,
    ));
    for c in 0..3 {
        let (mean, std) = (PIXEL_MEAN[c], PIXEL_STD[c]);
        tensor
            .slice_mut(s![0, c, .., ..])
            .assign(&view.slice(s![c, .., ..]).mapv(|v| (f32::from(v) - mean) / std));
    }

    Ok(PreparedImage {
        tensor,
        original_size: (width, height),
        resized_size: (rw, rh),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_longest_side() {
        assert_eq!(resize_longest_side(2048, 1024, 1024), (1024, 512));
        assert_eq!(resize_longest_side(600, 800, 1024), (768, 1024));
        assert_eq!(resize_longest_side(1, 5000, 1024), (1, 1024));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() -> Result<()> {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let prepared = preprocess(&image)?;

        assert_eq!(prepared.tensor.shape(), &[1, 3, 1024, 1024]);
        assert_eq!(prepared.resized_size, (1024, 512));

        let expected = (255.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((prepared.tensor[[0, 0, 10, 10]] - expected).abs() < 1e-4);
        // パディング領域はほぼ 0
        assert!(prepared.tensor[[0, 1, 1000, 10]].abs() < 0.02);
        Ok(())
    }

    #[test]
    fn test_transform_coords() -> Result<()> {
        let prepared = preprocess(&RgbImage::new(512, 256))?;
        let coords = prepared.transform_coords(&[[100.0, 50.0], [0.0, 0.0]]);
        assert_eq!(coords, vec![[200.0, 100.0], [0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(preprocess(&RgbImage::new(0, 4)).is_err());
    }
}
