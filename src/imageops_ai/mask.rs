use anyhow::{ensure, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::ArrayView2;

/// Overlay colors, cycled per mask.
pub const PALETTE: [Rgb<u8>; 10] = [
    Rgb([30, 144, 255]),
    Rgb([255, 99, 71]),
    Rgb([50, 205, 50]),
    Rgb([255, 215, 0]),
    Rgb([186, 85, 211]),
    Rgb([0, 206, 209]),
    Rgb([255, 140, 0]),
    Rgb([199, 21, 133]),
    Rgb([154, 205, 50]),
    Rgb([70, 130, 180]),
];

pub fn is_set(pixel: &Luma<u8>) -> bool {
    pixel.0[0] > 0
}

/// Paints each mask over `image` with `alpha` opacity. Later masks win where
/// they overlap.
pub fn overlay(image: &RgbImage, masks: &[GrayImage], alpha: f32) -> Result<RgbImage> {
    ensure!((0.0..=1.0).contains(&alpha), "alpha must be within [0, 1]");

    let mut out = image.clone();
    for (i, mask) in masks.iter().enumerate() {
        ensure!(
            image.dimensions() == mask.dimensions(),
            "Image and mask dimensions do not match"
        );
        let color = PALETTE[i % PALETTE.len()];
        for (pixel, m) in out.pixels_mut().zip(mask.pixels()) {
            if !is_set(m) {
                continue;
            }
            for (c, tint) in pixel.0.iter_mut().zip(color.0) {
                *c = (f32::from(*c) * (1.0 - alpha) + f32::from(tint) * alpha).round() as u8;
            }
        }
    }
    Ok(out)
}

/// マスクの和集合（255 / 0）
pub fn union(width: u32, height: u32, masks: &[GrayImage]) -> Result<GrayImage> {
    let mut out = GrayImage::new(width, height);
    for mask in masks {
        ensure!(
            mask.dimensions() == (width, height),
            "Image and mask dimensions do not match"
        );
        for (dst, m) in out.pixels_mut().zip(mask.pixels()) {
            if is_set(m) {
                *dst = Luma([255]);
            }
        }
    }
    Ok(out)
}

/// `(height, width)` logits to a 255/0 mask, strictly above `threshold`.
pub fn binarize(logits: ArrayView2<f32>, threshold: f32) -> GrayImage {
    let (h, w) = logits.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        if logits[[y as usize, x as usize]] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

pub fn area(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| is_set(p)).count() as u64
}

/// Tight `[x0, y0, x1, y1]` box around the set pixels, inclusive.
pub fn bounding_box(mask: &GrayImage) -> Option<[u32; 4]> {
    let mut bbox: Option<[u32; 4]> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if !is_set(p) {
            continue;
        }
        bbox = Some(match bbox {
            None => [x, y, x, y],
            Some([x0, y0, x1, y1]) => [x0.min(x), y0.min(y), x1.max(x), y1.max(y)],
        });
    }
    bbox
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32, from: u32, to: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (from..to).contains(&x) && (from..to).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_overlay_tints_only_masked_pixels() -> Result<()> {
        let image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let out = overlay(&image, &[square_mask(8, 2, 4)], 0.5)?;

        let expected = PALETTE[0].0.map(|c| (f32::from(c) * 0.5).round() as u8);
        assert_eq!(out.get_pixel(2, 2).0, expected);
        assert_eq!(out.get_pixel(6, 6), &Rgb([0, 0, 0]));
        Ok(())
    }

    #[test]
    fn test_overlay_rejects_size_mismatch() {
        let image = RgbImage::new(8, 8);
        assert!(overlay(&image, &[GrayImage::new(4, 4)], 0.5).is_err());
    }

    #[test]
    fn test_binarize_is_strict() {
        let logits = ndarray::array![[0.0f32, 0.1], [-3.0, 8.0]];
        let mask = binarize(logits.view(), 0.0);
        assert_eq!(mask.dimensions(), (2, 2));
        assert_eq!(mask.get_pixel(0, 0), &Luma([0]));
        assert_eq!(mask.get_pixel(1, 0), &Luma([255]));
        assert_eq!(mask.get_pixel(1, 1), &Luma([255]));
    }

    #[test]
    fn test_union_area_and_bbox() -> Result<()> {
        let merged = union(10, 10, &[square_mask(10, 1, 3), square_mask(10, 5, 8)])?;
        assert_eq!(area(&merged), 4 + 9);
        assert_eq!(bounding_box(&merged), Some([1, 1, 7, 7]));
        assert_eq!(bounding_box(&GrayImage::new(3, 3)), None);
        Ok(())
    }
}
