use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use image::{GrayImage, RgbImage};
use ndarray::prelude::*;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::{builder::SessionBuilder, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::automatic::{self, AutomaticConfig};
use crate::errors::{Result, SamDemoError};
use crate::imageops_ai::mask;
use crate::inference::{SegmentationOutput, SegmentationRequest};
use crate::preprocess::preprocess;
use crate::traits::{Embedding, MaskPrediction, PromptSegmentationModel, SamBackend};

/// Low-resolution mask prompt side expected by the decoder.
const MASK_INPUT_SIZE: usize = 256;
const OVERLAY_ALPHA: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl FromStr for Device {
    type Err = SamDemoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            other => Err(SamDemoError::validation(
                "device",
                format!("`{other}` is not one of `cpu`, `cuda`"),
            )),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        })
    }
}

/// SAM バックボーンの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamModelKind {
    #[serde(rename = "vit_h")]
    VitH,
    #[serde(rename = "vit_l")]
    VitL,
    #[serde(rename = "vit_b")]
    VitB,
}

impl SamModelKind {
    pub const ALL: [Self; 3] = [Self::VitH, Self::VitL, Self::VitB];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VitH => "vit_h",
            Self::VitL => "vit_l",
            Self::VitB => "vit_b",
        }
    }

    pub fn encoder_path(self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("sam_{}_encoder.onnx", self.as_str()))
    }

    pub fn decoder_path(self, model_dir: &Path) -> PathBuf {
        model_dir.join(format!("sam_{}_decoder.onnx", self.as_str()))
    }
}

impl FromStr for SamModelKind {
    type Err = SamDemoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SamDemoError::validation("model", format!("`{s}` is not a known SAM model")))
    }
}

impl fmt::Display for SamModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder and prompt decoder sessions of one model on one device.
pub struct SamSessions {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
}

fn build_session(path: &Path, device: Device, device_id: i32) -> Result<Session> {
    let builder = SessionBuilder::new().map_err(|e| SamDemoError::Model {
        operation: "セッションビルダー初期化".to_string(),
        source: Box::new(e),
    })?;

    let builder = match device {
        Device::Cuda => builder.with_execution_providers([CUDAExecutionProvider::default()
            .with_device_id(device_id)
            .build()
            .error_on_failure()]),
        Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
    }
    .map_err(|e| SamDemoError::Model {
        operation: format!("実行プロバイダー設定 ({device})"),
        source: Box::new(e),
    })?;

    builder
        .with_memory_pattern(true)
        .map_err(|e| SamDemoError::Model {
            operation: "メモリパターン設定".to_string(),
            source: Box::new(e),
        })?
        .commit_from_file(path)
        .map_err(|e| SamDemoError::Model {
            operation: format!("モデルファイル読み込み: {}", path.display()),
            source: Box::new(e),
        })
}

impl SamSessions {
    pub fn load(model_dir: &Path, kind: SamModelKind, device: Device, device_id: i32) -> Result<Self> {
        let encoder = build_session(&kind.encoder_path(model_dir), device, device_id)?;
        let decoder = build_session(&kind.decoder_path(model_dir), device, device_id)?;
        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
        })
    }
}

impl SamBackend for SamSessions {
    fn encode(&self, image: &RgbImage) -> Result<Embedding> {
        let prepared = preprocess(image)?;
        let mut binding = self.encoder.lock();
        let outputs = binding.run(ort::inputs![
            "image" => TensorRef::from_array_view(&prepared.tensor.as_standard_layout())?
        ])?;
        let features = outputs["image_embeddings"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        Ok(Embedding::new(features, &prepared))
    }

    fn decode(
        &self,
        embedding: &Embedding,
        coords: &[[f32; 2]],
        labels: &[f32],
    ) -> Result<Vec<MaskPrediction>> {
        if coords.len() != labels.len() {
            return Err(SamDemoError::validation(
                "point_labels",
                "must have one label per coordinate",
            ));
        }

        // 末尾にラベル -1 のパディング点を付ける
        let n = coords.len() + 1;
        let mut point_coords = Array3::<f32>::zeros((1, n, 2));
        let mut point_labels = Array2::<f32>::from_elem((1, n), -1.0);
        for (i, ([x, y], label)) in embedding.transform_coords(coords).into_iter().zip(labels).enumerate() {
            point_coords[[0, i, 0]] = x;
            point_coords[[0, i, 1]] = y;
            point_labels[[0, i]] = *label;
        }

        let mask_input = Array4::<f32>::zeros((1, 1, MASK_INPUT_SIZE, MASK_INPUT_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);
        let (width, height) = embedding.original_size;
        let orig_im_size = Array1::from(vec![height as f32, width as f32]);

        let mut binding = self.decoder.lock();
        let outputs = binding.run(ort::inputs![
            "image_embeddings" => TensorRef::from_array_view(&embedding.features.as_standard_layout())?,
            "point_coords" => TensorRef::from_array_view(&point_coords.as_standard_layout())?,
            "point_labels" => TensorRef::from_array_view(&point_labels.as_standard_layout())?,
            "mask_input" => TensorRef::from_array_view(&mask_input.as_standard_layout())?,
            "has_mask_input" => TensorRef::from_array_view(&has_mask_input.as_standard_layout())?,
            "orig_im_size" => TensorRef::from_array_view(&orig_im_size.as_standard_layout())?
        ])?;

        let masks = outputs["masks"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?;
        let scores = outputs["iou_predictions"]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix2>()?;

        let predictions = (0..masks.shape()[1])
            .map(|k| MaskPrediction {
                logits: masks.slice(s![0, k, .., ..]).to_owned(),
                iou: scores[[0, k]],
            })
            .collect();
        Ok(predictions)
    }
}

/// Picks the candidate with the highest predicted IoU for the given prompts.
pub fn predict_with_points<B>(
    backend: &B,
    image: &RgbImage,
    point_coords: &[[i32; 2]],
    point_labels: &[i32],
) -> Result<GrayImage>
where
    B: SamBackend + ?Sized,
{
    let embedding = backend.encode(image)?;
    let coords: Vec<[f32; 2]> = point_coords
        .iter()
        .map(|&[x, y]| [x as f32, y as f32])
        .collect();
    let labels: Vec<f32> = point_labels.iter().map(|&l| l as f32).collect();

    let best = backend
        .decode(&embedding, &coords, &labels)?
        .into_iter()
        .max_by(|a, b| a.iou.total_cmp(&b.iou))
        .ok_or_else(|| SamDemoError::model("プロンプトデコード", "decoder returned no masks"))?;
    Ok(mask::binarize(best.logits.view(), 0.0))
}

/// オーバーレイ画像と和集合マスクを作る
pub fn render_output(image: &RgbImage, masks: &[GrayImage]) -> Result<SegmentationOutput> {
    let to_error = |e: anyhow::Error| SamDemoError::rendering("マスク合成", e);
    let overlay = mask::overlay(image, masks, OVERLAY_ALPHA).map_err(to_error)?;
    let union = mask::union(image.width(), image.height(), masks).map_err(to_error)?;
    Ok(SegmentationOutput {
        overlay,
        mask: union,
    })
}

/// Runs a request against an already loaded backend.
pub fn segment_with<B>(backend: &B, request: &SegmentationRequest) -> Result<SegmentationOutput>
where
    B: SamBackend + ?Sized,
{
    let masks = if request.point_coords.is_empty() {
        let config = AutomaticConfig::try_from(&request.params)?;
        automatic::generate(backend, &request.image, &config)?
    } else {
        vec![predict_with_points(
            backend,
            &request.image,
            &request.point_coords,
            &request.point_labels,
        )?]
    };
    render_output(&request.image, &masks)
}

type SessionSlot = Arc<Mutex<Option<Arc<SamSessions>>>>;

/// ONNX Runtime backed SAM. Sessions are loaded on first use per
/// `(device, model)` pair and reused afterwards.
///
/// Each pair has its own slot: loading one model only blocks requests for
/// that same pair, cached pairs keep serving.
pub struct SamModel {
    model_dir: PathBuf,
    device_id: i32,
    sessions: Mutex<HashMap<(Device, SamModelKind), SessionSlot>>,
}

impl SamModel {
    pub fn new(model_dir: impl Into<PathBuf>, device_id: i32) -> Self {
        Self {
            model_dir: model_dir.into(),
            device_id,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Models whose encoder and decoder files are both present.
    pub fn available_models(&self) -> Vec<SamModelKind> {
        SamModelKind::ALL
            .into_iter()
            .filter(|kind| {
                kind.encoder_path(&self.model_dir).is_file()
                    && kind.decoder_path(&self.model_dir).is_file()
            })
            .collect()
    }

    fn slot(&self, device: Device, kind: SamModelKind) -> SessionSlot {
        Arc::clone(self.sessions.lock().entry((device, kind)).or_default())
    }

    fn sessions(&self, device: Device, kind: SamModelKind) -> Result<Arc<SamSessions>> {
        // マップのロックは slot 取得の間だけ
        let slot = self.slot(device, kind);
        let mut loaded = slot.lock();
        if let Some(sessions) = loaded.as_ref() {
            return Ok(Arc::clone(sessions));
        }

        let started = Instant::now();
        let sessions = Arc::new(SamSessions::load(&self.model_dir, kind, device, self.device_id)?);
        log::info!(
            "loaded {kind} on {device} in {:.2}s",
            started.elapsed().as_secs_f32()
        );
        *loaded = Some(Arc::clone(&sessions));
        Ok(sessions)
    }
}

impl PromptSegmentationModel for SamModel {
    fn segment(&self, request: &SegmentationRequest) -> Result<SegmentationOutput> {
        let device: Device = request.device.parse()?;
        let kind: SamModelKind = request.model.parse()?;
        let sessions = self.sessions(device, kind)?;

        let started = Instant::now();
        let output = segment_with(sessions.as_ref(), request)?;
        log::info!(
            "{kind}/{device}: {} point(s) segmented in {} ms",
            request.point_coords.len(),
            started.elapsed().as_millis()
        );
        Ok(output)
    }
}
