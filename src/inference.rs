use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SamDemoError};
use crate::image_state::{ExampleRegistry, ImageState};
use crate::point::PointStore;
use crate::traits::PromptSegmentationModel;

pub const DEFAULT_DEVICE: &str = "cuda";
pub const DEFAULT_MODEL: &str = "vit_h";

/// Sampling parameters forwarded to the model untouched.
///
/// The defaults are the values the demo UI starts with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamParameters {
    pub points_per_side: i64,
    pub pred_iou_thresh: f32,
    pub stability_score_thresh: f32,
    pub min_mask_region_area: i64,
    pub stability_score_offset: f32,
    pub box_nms_thresh: f32,
    pub crop_n_layers: i64,
    pub crop_nms_thresh: f32,
}

impl Default for SamParameters {
    fn default() -> Self {
        Self {
            points_per_side: 32,
            pred_iou_thresh: 0.88,
            stability_score_thresh: 0.95,
            min_mask_region_area: 0,
            stability_score_offset: 1.0,
            box_nms_thresh: 0.7,
            crop_n_layers: 0,
            crop_nms_thresh: 0.7,
        }
    }
}

/// UI側で選択される推論設定（デバイス・モデル名・パラメータ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub device: String,
    pub model: String,
    pub params: SamParameters,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            params: SamParameters::default(),
        }
    }
}

/// Everything the model receives for one submit.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationRequest {
    pub device: String,
    pub model: String,
    pub params: SamParameters,
    /// Clean image in display (RGB) order, without markers.
    pub image: RgbImage,
    pub point_coords: Vec<[i32; 2]>,
    pub point_labels: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationOutput {
    pub overlay: RgbImage,
    pub mask: GrayImage,
}

/// Resolves the clean image, splits the points and calls the model.
///
/// Model errors are returned unchanged; nothing is retried.
pub fn infer<M>(
    model: &M,
    registry: &ExampleRegistry,
    settings: &InferenceSettings,
    image: &ImageState,
    points: &PointStore,
) -> Result<SegmentationOutput>
where
    M: PromptSegmentationModel + ?Sized,
{
    let request = build_request(registry, settings, image, points)?;
    model.segment(&request)
}

pub fn build_request(
    registry: &ExampleRegistry,
    settings: &InferenceSettings,
    image: &ImageState,
    points: &PointStore,
) -> Result<SegmentationRequest> {
    let source = image.source().ok_or(SamDemoError::NoImage)?;
    let clean = source.clean_image(registry)?;
    let (point_coords, point_labels) = points.split();

    Ok(SegmentationRequest {
        device: settings.device.clone(),
        model: settings.model.clone(),
        params: settings.params,
        image: clean,
        point_coords,
        point_labels,
    })
}
