use image::{GrayImage, Luma};
use parking_lot::Mutex;

use crate::errors::{Result, SamDemoError};
use crate::inference::{SegmentationOutput, SegmentationRequest};
use crate::traits::PromptSegmentationModel;

/// テスト用のモックモデル
///
/// 受け取ったリクエストを記録し、前景点の位置だけ 255 のマスクを返す。
#[derive(Debug, Default)]
pub struct RecordingModel {
    failure: Option<String>,
    requests: Mutex<Vec<SegmentationRequest>>,
}

impl RecordingModel {
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> Option<SegmentationRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl PromptSegmentationModel for RecordingModel {
    fn segment(&self, request: &SegmentationRequest) -> Result<SegmentationOutput> {
        self.requests.lock().push(request.clone());

        if let Some(message) = &self.failure {
            return Err(SamDemoError::model("モック推論", message.clone()));
        }

        let (width, height) = request.image.dimensions();
        let mut mask = GrayImage::new(width, height);
        for (&[x, y], &label) in request.point_coords.iter().zip(&request.point_labels) {
            if label == 1 && x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                mask.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }

        Ok(SegmentationOutput {
            overlay: request.image.clone(),
            mask,
        })
    }
}
