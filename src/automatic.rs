//! Automatic mask generation, used when a submit carries no prompt points.
//!
//! A regular grid of single foreground points is decoded over the whole image
//! (and over overlapping crops when crop layers are requested). Candidates are
//! filtered by predicted IoU and stability, deduplicated with box NMS, and
//! optionally cleaned of small islands and holes.

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::prelude::*;

use crate::errors::{Result, SamDemoError};
use crate::imageops_ai::mask::{binarize, bounding_box, is_set};
use crate::inference::SamParameters;
use crate::traits::SamBackend;

/// Overlap between neighbouring crops, relative to the short image side.
pub const CROP_OVERLAP_RATIO: f64 = 512.0 / 1500.0;
/// Pixel tolerance for the crop edge test.
pub const EDGE_TOLERANCE: f32 = 20.0;
const MASK_THRESHOLD: f32 = 0.0;

/// Validated view of [`SamParameters`] for the generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomaticConfig {
    pub points_per_side: u32,
    pub pred_iou_thresh: f32,
    pub stability_score_thresh: f32,
    pub stability_score_offset: f32,
    pub box_nms_thresh: f32,
    pub crop_n_layers: u32,
    pub crop_nms_thresh: f32,
    pub min_mask_region_area: u64,
}

impl TryFrom<&SamParameters> for AutomaticConfig {
    type Error = SamDemoError;

    fn try_from(params: &SamParameters) -> Result<Self> {
        let unit = |field: &str, value: f32| {
            if (0.0..=1.0).contains(&value) {
                Ok(value)
            } else {
                Err(SamDemoError::validation(field, "must be within [0, 1]"))
            }
        };
        let points_per_side = u32::try_from(params.points_per_side)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| SamDemoError::validation("points_per_side", "must be positive"))?;
        let crop_n_layers = u32::try_from(params.crop_n_layers)
            .ok()
            .filter(|n| *n <= 4)
            .ok_or_else(|| SamDemoError::validation("crop_n_layers", "must be within 0..=4"))?;
        let min_mask_region_area = u64::try_from(params.min_mask_region_area)
            .map_err(|_| SamDemoError::validation("min_mask_region_area", "must not be negative"))?;

        Ok(Self {
            points_per_side,
            pred_iou_thresh: unit("pred_iou_thresh", params.pred_iou_thresh)?,
            stability_score_thresh: unit("stability_score_thresh", params.stability_score_thresh)?,
            stability_score_offset: params.stability_score_offset,
            box_nms_thresh: unit("box_nms_thresh", params.box_nms_thresh)?,
            crop_n_layers,
            crop_nms_thresh: unit("crop_nms_thresh", params.crop_nms_thresh)?,
            min_mask_region_area,
        })
    }
}

/// Half-open pixel box `[x0, y0, x1, y1]`.
pub type BoxXyxy = [u32; 4];

#[derive(Debug, Clone)]
struct MaskRecord {
    /// Mask in crop coordinates.
    mask: GrayImage,
    /// Box in image coordinates.
    bbox: BoxXyxy,
    predicted_iou: f32,
    crop_box: BoxXyxy,
}

/// 正規化座標 [0, 1] の格子点（セル中心）
pub fn build_point_grid(n_per_side: u32) -> Vec<[f32; 2]> {
    let n = n_per_side.max(1);
    let offset = 1.0 / (2.0 * n as f32);
    let step = if n > 1 {
        (1.0 - 2.0 * offset) / (n - 1) as f32
    } else {
        0.0
    };
    let axis: Vec<f32> = (0..n).map(|i| offset + step * i as f32).collect();

    axis.iter()
        .flat_map(|&y| axis.iter().map(move |&x| [x, y]))
        .collect()
}

/// Crop boxes for every layer, whole image first. Layer `i` splits each side
/// into `2^i` overlapping parts. Crops that fall outside a small image are
/// left out, so every returned box has a positive area.
pub fn generate_crop_boxes(width: u32, height: u32, n_layers: u32, overlap_ratio: f64) -> Vec<(BoxXyxy, u32)> {
    let mut boxes = vec![([0, 0, width, height], 0)];
    let short_side = f64::from(width.min(height));

    for layer in 0..n_layers {
        let n = 2u32.pow(layer + 1);
        let overlap = (overlap_ratio * short_side * (2.0 / f64::from(n))) as u32;
        let crop_len = |orig: u32| (orig + overlap * (n - 1)).div_ceil(n);
        let (crop_w, crop_h) = (crop_len(width), crop_len(height));

        for i in 0..n {
            for j in 0..n {
                let x0 = crop_w.saturating_sub(overlap) * i;
                let y0 = crop_h.saturating_sub(overlap) * j;
                let (x1, y1) = ((x0 + crop_w).min(width), (y0 + crop_h).min(height));
                if x0 >= x1 || y0 >= y1 {
                    continue;
                }
                boxes.push(([x0, y0, x1, y1], layer + 1));
            }
        }
    }
    boxes
}

/// IoU of the mask thresholded at `threshold + offset` against the mask
/// thresholded at `threshold - offset`.
pub fn stability_score(logits: ArrayView2<f32>, threshold: f32, offset: f32) -> f32 {
    let intersections = logits.iter().filter(|&&v| v > threshold + offset).count();
    let unions = logits.iter().filter(|&&v| v > threshold - offset).count();
    if unions == 0 {
        0.0
    } else {
        intersections as f32 / unions as f32
    }
}

fn box_area(b: &BoxXyxy) -> f32 {
    (b[2].saturating_sub(b[0]) as f32) * (b[3].saturating_sub(b[1]) as f32)
}

pub fn box_iou(a: &BoxXyxy, b: &BoxXyxy) -> f32 {
    let ix = a[2].min(b[2]).saturating_sub(a[0].max(b[0])) as f32;
    let iy = a[3].min(b[3]).saturating_sub(a[1].max(b[1])) as f32;
    let inter = ix * iy;
    let union = box_area(a) + box_area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy NMS. Returns kept indices, best score first.
pub fn nms(boxes: &[BoxXyxy], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep: Vec<usize> = Vec::new();
    for i in order {
        if keep.iter().all(|&k| box_iou(&boxes[k], &boxes[i]) <= iou_thresh) {
            keep.push(i);
        }
    }
    keep
}

/// True when the box touches a crop edge that is not also an image edge.
pub fn is_box_near_crop_edge(bbox: &BoxXyxy, crop_box: &BoxXyxy, image_box: &BoxXyxy) -> bool {
    (0..4).any(|i| {
        let near_crop = (bbox[i] as f32 - crop_box[i] as f32).abs() <= EDGE_TOLERANCE;
        let near_image = (bbox[i] as f32 - image_box[i] as f32).abs() <= EDGE_TOLERANCE;
        near_crop && !near_image
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    Holes,
    Islands,
}

/// Removes connected regions (islands) or fills holes smaller than
/// `area_thresh`. Returns the new mask and whether anything changed.
pub fn remove_small_regions(mask: &GrayImage, area_thresh: u64, mode: RegionMode) -> (GrayImage, bool) {
    let working = match mode {
        RegionMode::Holes => GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            if is_set(mask.get_pixel(x, y)) {
                Luma([0])
            } else {
                Luma([255])
            }
        }),
        RegionMode::Islands => mask.clone(),
    };

    let labels = connected_components(&working, Connectivity::Eight, Luma([0u8]));
    let n_labels = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
    let mut sizes = vec![0u64; n_labels + 1];
    for p in labels.pixels() {
        sizes[p.0[0] as usize] += 1;
    }

    let small = |label: usize| label != 0 && sizes[label] < area_thresh;
    if !(1..=n_labels).any(small) {
        return (mask.clone(), false);
    }

    let out = match mode {
        RegionMode::Holes => GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            let label = labels.get_pixel(x, y).0[0] as usize;
            if is_set(mask.get_pixel(x, y)) || small(label) {
                Luma([255])
            } else {
                Luma([0])
            }
        }),
        RegionMode::Islands => {
            let mut keep: Vec<bool> = (0..=n_labels).map(|l| l != 0 && !small(l)).collect();
            if !keep.iter().any(|k| *k) {
                // 全部小さい場合は最大の領域だけ残す
                if let Some(largest) = (1..=n_labels).max_by_key(|&l| sizes[l]) {
                    keep[largest] = true;
                }
            }
            GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
                if keep[labels.get_pixel(x, y).0[0] as usize] {
                    Luma([255])
                } else {
                    Luma([0])
                }
            })
        }
    };
    (out, true)
}

fn to_half_open(bbox: [u32; 4]) -> BoxXyxy {
    [bbox[0], bbox[1], bbox[2] + 1, bbox[3] + 1]
}

fn uncrop_mask(mask: &GrayImage, crop_box: &BoxXyxy, width: u32, height: u32) -> GrayImage {
    if *crop_box == [0, 0, width, height] {
        return mask.clone();
    }
    let mut full = GrayImage::new(width, height);
    imageops::replace(&mut full, mask, i64::from(crop_box[0]), i64::from(crop_box[1]));
    full
}

fn process_crop<B>(
    backend: &B,
    image: &RgbImage,
    crop_box: BoxXyxy,
    config: &AutomaticConfig,
) -> Result<Vec<MaskRecord>>
where
    B: SamBackend + ?Sized,
{
    let [x0, y0, x1, y1] = crop_box;
    let (crop_w, crop_h) = (x1 - x0, y1 - y0);
    let cropped = imageops::crop_imm(image, x0, y0, crop_w, crop_h).to_image();
    let embedding = backend.encode(&cropped)?;
    let image_box: BoxXyxy = [0, 0, image.width(), image.height()];

    let mut records = Vec::new();
    for [gx, gy] in build_point_grid(config.points_per_side) {
        let point = [gx * crop_w as f32, gy * crop_h as f32];
        let predictions = backend.decode(&embedding, &[point], &[1.0])?;
        // 4出力のモデルでは先頭が単一マスク、残りがマルチマスク
        let candidates = if predictions.len() == 4 {
            &predictions[1..]
        } else {
            &predictions[..]
        };

        for prediction in candidates {
            if config.pred_iou_thresh > 0.0 && prediction.iou < config.pred_iou_thresh {
                continue;
            }
            let stability = stability_score(
                prediction.logits.view(),
                MASK_THRESHOLD,
                config.stability_score_offset,
            );
            if config.stability_score_thresh > 0.0 && stability < config.stability_score_thresh {
                continue;
            }

            let mask = binarize(prediction.logits.view(), MASK_THRESHOLD);
            let Some(local) = bounding_box(&mask) else {
                continue;
            };
            let local = to_half_open(local);
            let bbox = [local[0] + x0, local[1] + y0, local[2] + x0, local[3] + y0];
            if is_box_near_crop_edge(&bbox, &crop_box, &image_box) {
                continue;
            }

            records.push(MaskRecord {
                mask,
                bbox,
                predicted_iou: prediction.iou,
                crop_box,
            });
        }
    }

    let boxes: Vec<BoxXyxy> = records.iter().map(|r| r.bbox).collect();
    let scores: Vec<f32> = records.iter().map(|r| r.predicted_iou).collect();
    let keep = nms(&boxes, &scores, config.box_nms_thresh);
    Ok(select(records, &keep))
}

fn select<T>(items: Vec<T>, keep: &[usize]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    keep.iter().filter_map(|&i| slots[i].take()).collect()
}

fn postprocess_small_regions(records: Vec<MaskRecord>, width: u32, height: u32, config: &AutomaticConfig) -> Vec<GrayImage> {
    let mut masks = Vec::with_capacity(records.len());
    let mut boxes = Vec::with_capacity(records.len());
    let mut scores = Vec::with_capacity(records.len());

    for record in records {
        let full = uncrop_mask(&record.mask, &record.crop_box, width, height);
        let (mask, filled) = remove_small_regions(&full, config.min_mask_region_area, RegionMode::Holes);
        let (mask, trimmed) = remove_small_regions(&mask, config.min_mask_region_area, RegionMode::Islands);
        let Some(bbox) = bounding_box(&mask) else {
            continue;
        };
        boxes.push(to_half_open(bbox));
        // 変更のないマスクを優先
        scores.push(if filled || trimmed { 0.0 } else { 1.0 });
        masks.push(mask);
    }

    let keep = nms(&boxes, &scores, config.box_nms_thresh);
    select(masks, &keep)
}

/// Runs the whole generator and returns full-size binary masks.
pub fn generate<B>(backend: &B, image: &RgbImage, config: &AutomaticConfig) -> Result<Vec<GrayImage>>
where
    B: SamBackend + ?Sized,
{
    let (width, height) = image.dimensions();
    let crop_boxes = generate_crop_boxes(width, height, config.crop_n_layers, CROP_OVERLAP_RATIO);

    let mut records = Vec::new();
    for (crop_box, layer) in &crop_boxes {
        let found = process_crop(backend, image, *crop_box, config)?;
        log::debug!("crop {crop_box:?} (layer {layer}): {} mask(s)", found.len());
        records.extend(found);
    }

    if crop_boxes.len() > 1 {
        // 小さいクロップ由来のマスクを優先
        let boxes: Vec<BoxXyxy> = records.iter().map(|r| r.bbox).collect();
        let scores: Vec<f32> = records.iter().map(|r| 1.0 / box_area(&r.crop_box)).collect();
        let keep = nms(&boxes, &scores, config.crop_nms_thresh);
        records = select(records, &keep);
    }

    let masks = if config.min_mask_region_area > 0 {
        postprocess_small_regions(records, width, height, config)
    } else {
        records
            .iter()
            .map(|r| uncrop_mask(&r.mask, &r.crop_box, width, height))
            .collect()
    };

    log::info!("automatic generation produced {} mask(s)", masks.len());
    Ok(masks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Embedding, MaskPrediction};

    fn config() -> AutomaticConfig {
        AutomaticConfig::try_from(&SamParameters::default()).expect("defaults are valid")
    }

    /// 点から半径 `radius` の円をマスクとして返す偽バックエンド
    struct DiscBackend {
        radius: f32,
    }

    impl SamBackend for DiscBackend {
        fn encode(&self, image: &RgbImage) -> Result<Embedding> {
            let (w, h) = image.dimensions();
            Ok(Embedding {
                features: Array4::zeros((1, 1, 1, 1)),
                original_size: (w, h),
                resized_size: (w, h),
            })
        }

        fn decode(&self, embedding: &Embedding, coords: &[[f32; 2]], _labels: &[f32]) -> Result<Vec<MaskPrediction>> {
            let (w, h) = embedding.original_size;
            let [px, py] = coords[0];
            let logits = Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
                let d = ((x as f32 - px).powi(2) + (y as f32 - py).powi(2)).sqrt();
                (self.radius - d) * 10.0
            });
            Ok(vec![MaskPrediction { logits, iou: 0.95 }])
        }
    }

    #[test]
    fn test_point_grid() {
        assert_eq!(build_point_grid(1), vec![[0.5, 0.5]]);
        let grid = build_point_grid(2);
        assert_eq!(grid, vec![[0.25, 0.25], [0.75, 0.25], [0.25, 0.75], [0.75, 0.75]]);
        assert_eq!(build_point_grid(32).len(), 1024);
    }

    #[test]
    fn test_crop_boxes() {
        assert_eq!(generate_crop_boxes(100, 80, 0, CROP_OVERLAP_RATIO), vec![([0, 0, 100, 80], 0)]);

        let boxes = generate_crop_boxes(100, 80, 1, CROP_OVERLAP_RATIO);
        assert_eq!(boxes.len(), 5);
        for (b, layer) in &boxes[1..] {
            assert_eq!(*layer, 1);
            assert!(b[2] <= 100 && b[3] <= 80);
            assert!(b[0] < b[2] && b[1] < b[3]);
        }
        // 隣り合うクロップは重なる
        assert!(boxes[3].0[0] < boxes[1].0[2]);
        assert_eq!(generate_crop_boxes(100, 80, 2, CROP_OVERLAP_RATIO).len(), 1 + 4 + 16);
    }

    #[test]
    fn test_crop_boxes_on_tiny_images_are_never_empty() {
        for (w, h) in [(10, 10), (30, 30), (3, 40), (1, 1)] {
            for (b, _) in generate_crop_boxes(w, h, 4, CROP_OVERLAP_RATIO) {
                assert!(b[0] < b[2] && b[1] < b[3], "{b:?} in {w}x{h}");
                assert!(b[2] <= w && b[3] <= h, "{b:?} in {w}x{h}");
            }
        }
    }

    #[test]
    fn test_generate_with_deep_crops_on_tiny_image() -> Result<()> {
        let mut config = config();
        config.points_per_side = 2;
        config.stability_score_thresh = 0.0;
        config.crop_n_layers = 4;

        for size in [10, 30] {
            let image = RgbImage::new(size, size);
            let masks = generate(&DiscBackend { radius: 2.0 }, &image, &config)?;
            assert!(masks.iter().all(|m| m.dimensions() == (size, size)));
        }
        Ok(())
    }

    #[test]
    fn test_stability_score() {
        let logits = array![[5.0, 0.5], [-0.5, -5.0]];
        assert_eq!(stability_score(logits.view(), 0.0, 1.0), 1.0 / 3.0);
        assert_eq!(stability_score(Array2::<f32>::from_elem((2, 2), -9.0).view(), 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        let boxes = [[0, 0, 10, 10], [1, 1, 10, 10], [20, 20, 30, 30]];
        let keep = nms(&boxes, &[0.5, 0.9, 0.1], 0.7);
        assert_eq!(keep, vec![1, 2]);
        assert_eq!(box_iou(&boxes[0], &boxes[2]), 0.0);
    }

    #[test]
    fn test_near_crop_edge() {
        let image_box = [0, 0, 200, 200];
        let crop_box = [0, 0, 120, 120];
        assert!(is_box_near_crop_edge(&[50, 50, 115, 80], &crop_box, &image_box));
        assert!(!is_box_near_crop_edge(&[5, 5, 60, 60], &crop_box, &image_box));
        assert!(!is_box_near_crop_edge(&[5, 5, 195, 195], &image_box, &image_box));
    }

    #[test]
    fn test_remove_small_islands_and_holes() {
        let mut mask = GrayImage::new(20, 20);
        for y in 2..12 {
            for x in 2..12 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        mask.put_pixel(5, 5, Luma([0])); // 穴
        mask.put_pixel(17, 17, Luma([255])); // 孤立点

        let (filled, changed) = remove_small_regions(&mask, 4, RegionMode::Holes);
        assert!(changed);
        assert_eq!(filled.get_pixel(5, 5), &Luma([255]));

        let (trimmed, changed) = remove_small_regions(&filled, 4, RegionMode::Islands);
        assert!(changed);
        assert_eq!(trimmed.get_pixel(17, 17), &Luma([0]));
        assert_eq!(trimmed.get_pixel(3, 3), &Luma([255]));

        let (same, changed) = remove_small_regions(&trimmed, 4, RegionMode::Islands);
        assert!(!changed);
        assert_eq!(same, trimmed);
    }

    #[test]
    fn test_config_validation() {
        let mut params = SamParameters::default();
        params.points_per_side = 0;
        assert!(AutomaticConfig::try_from(&params).is_err());

        let mut params = SamParameters::default();
        params.pred_iou_thresh = 1.5;
        assert!(AutomaticConfig::try_from(&params).is_err());

        let mut params = SamParameters::default();
        params.min_mask_region_area = -1;
        assert!(AutomaticConfig::try_from(&params).is_err());
    }

    #[test]
    fn test_generate_deduplicates_grid_masks() -> Result<()> {
        let image = RgbImage::new(64, 64);
        let mut config = config();
        config.points_per_side = 4;
        config.stability_score_thresh = 0.0;

        let masks = generate(&DiscBackend { radius: 6.0 }, &image, &config)?;
        // 16 個の格子点はそれぞれ重ならない円を生成する
        assert_eq!(masks.len(), 16);
        assert!(masks.iter().all(|m| m.dimensions() == (64, 64)));

        let big = generate(&DiscBackend { radius: 200.0 }, &image, &config)?;
        // 画像全体を覆うマスクは1つに統合される
        assert_eq!(big.len(), 1);
        Ok(())
    }

    #[test]
    fn test_generate_filters_low_iou() -> Result<()> {
        let image = RgbImage::new(32, 32);
        let mut config = config();
        config.points_per_side = 2;
        config.pred_iou_thresh = 0.99;

        let masks = generate(&DiscBackend { radius: 5.0 }, &image, &config)?;
        assert!(masks.is_empty());
        Ok(())
    }
}
