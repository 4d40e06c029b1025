use image::RgbImage;
use ndarray::prelude::*;

use crate::errors::Result;
use crate::inference::{SegmentationOutput, SegmentationRequest};
use crate::preprocess::PreparedImage;

/// 点プロンプト付きセグメンテーションモデルの抽象化
///
/// ハンドラーは具象モデルではなくこの trait に依存する。テストではモックを差し込む。
pub trait PromptSegmentationModel: Send + Sync {
    /// 画像と点プロンプトから（オーバーレイ, マスク）を生成
    fn segment(&self, request: &SegmentationRequest) -> Result<SegmentationOutput>;
}

impl<M: PromptSegmentationModel + ?Sized> PromptSegmentationModel for std::sync::Arc<M> {
    fn segment(&self, request: &SegmentationRequest) -> Result<SegmentationOutput> {
        (**self).segment(request)
    }
}

/// Image features produced by the encoder, with the geometry of the image
/// they were computed from.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub features: Array4<f32>,
    pub original_size: (u32, u32),
    pub resized_size: (u32, u32),
}

impl Embedding {
    pub fn new(features: Array4<f32>, prepared: &PreparedImage) -> Self {
        Self {
            features,
            original_size: prepared.original_size,
            resized_size: prepared.resized_size,
        }
    }

    pub fn transform_coords(&self, coords: &[[f32; 2]]) -> Vec<[f32; 2]> {
        crate::preprocess::transform_coords(coords, self.original_size, self.resized_size)
    }
}

/// One decoded mask candidate at original resolution.
#[derive(Debug, Clone)]
pub struct MaskPrediction {
    /// Logits shaped `(height, width)`; a pixel is inside when `> 0`.
    pub logits: Array2<f32>,
    pub iou: f32,
}

/// エンコーダ／デコーダの2段構成モデル
///
/// 自動マスク生成はこの trait だけに依存するので、テストでは偽のバックエンドを使える。
pub trait SamBackend {
    fn encode(&self, image: &RgbImage) -> Result<Embedding>;

    /// `coords` are pixel coordinates of the encoded image, `labels` use
    /// 1 for foreground and 0 for background.
    fn decode(
        &self,
        embedding: &Embedding,
        coords: &[[f32; 2]],
        labels: &[f32],
    ) -> Result<Vec<MaskPrediction>>;
}
