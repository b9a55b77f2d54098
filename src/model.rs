// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{path::Path, sync::Arc};

use image::RgbImage;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::info;
use url::Url;

#[cfg(any(feature = "backend_tract", feature = "backend_rknpu"))]
use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_INFERENCE_SIZE: u32 = 640;

/// 模型输入边长需要对齐到的步长
const INFERENCE_STRIDE: u32 = 32;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("model load error: {0}")]
  ModelLoadError(String),
  #[error("model path error: {0}")]
  ModelPathError(String),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("inference error: {0}")]
  InferenceError(String),
  #[error("invalid input image: {0}")]
  InvalidInput(String),
  #[error("unexpected model output shape {actual:?}, expected {expected}")]
  OutputShapeMismatch { expected: String, actual: Vec<usize> },
  #[error("detector lock poisoned")]
  LockPoisoned,
  #[error("unsupported model backend: {0}")]
  UnsupportedBackend(String),
}

/// 单次请求的检测阈值配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionConfig {
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub inference_size: u32,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      inference_size: DEFAULT_INFERENCE_SIZE,
    }
  }
}

impl DetectionConfig {
  /// 实际送入模型的边长：向上对齐到 32 的倍数
  pub fn model_input_size(&self) -> u32 {
    self
      .inference_size
      .max(INFERENCE_STRIDE)
      .div_ceil(INFERENCE_STRIDE)
      * INFERENCE_STRIDE
  }
}

/// 一个检测到的目标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// [x_min, y_min, x_max, y_max]，原图像素坐标
  #[serde(rename = "box", serialize_with = "serialize_bbox")]
  pub bbox: [f32; 4],
  #[serde(rename = "conf", serialize_with = "serialize_confidence")]
  pub confidence: f32,
  #[serde(rename = "class")]
  pub class_label: String,
  #[serde(skip)]
  pub class_id: u32,
}

impl Detection {
  /// 构造检测结果，保证 x_min <= x_max, y_min <= y_max，置信度位于 [0, 1]
  pub fn new(class_id: u32, class_label: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
    let [x1, y1, x2, y2] = bbox;
    Self {
      bbox: [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
      confidence: confidence.clamp(0.0, 1.0),
      class_label: class_label.into(),
      class_id,
    }
  }
}

/// 四舍五入到 `digits` 位小数
pub fn round_to(value: f64, digits: i32) -> f64 {
  let factor = 10f64.powi(digits);
  (value * factor).round() / factor
}

fn serialize_bbox<S: Serializer>(bbox: &[f32; 4], serializer: S) -> Result<S::Ok, S::Error> {
  let rounded = bbox.map(|v| round_to(v as f64, 2));
  rounded.serialize(serializer)
}

fn serialize_confidence<S: Serializer>(confidence: &f32, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_f64(round_to(*confidence as f64, 3))
}

/// 检测器：每次调用只处理一张图像
///
/// 实现必须可以被多个请求同时调用；底层推理不可重入时由实现自行加锁。
pub trait Detector: Send + Sync {
  fn name(&self) -> &'static str;

  fn detect(&self, image: &RgbImage, config: &DetectionConfig)
  -> Result<Vec<Detection>, ModelError>;
}

pub(crate) fn ensure_non_empty(image: &RgbImage) -> Result<(), ModelError> {
  if image.width() == 0 || image.height() == 0 {
    return Err(ModelError::InvalidInput(format!(
      "image has zero size ({}x{})",
      image.width(),
      image.height()
    )));
  }
  Ok(())
}

mod labels;
pub use self::labels::{COCO_CLASSES, Labels};

mod postprocess;
pub use self::postprocess::{decode_yolo_output, iou, nms, yolo_class_count};

mod scripted;
pub use self::scripted::ScriptedDetector;

#[cfg(feature = "backend_tract")]
mod tract;
#[cfg(feature = "backend_tract")]
pub use self::tract::{TractYolo, TractYoloBuilder};

#[cfg(feature = "backend_rknpu")]
mod yolo26;
#[cfg(feature = "backend_rknpu")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

/// 根据权重路径或模型 URL 加载检测器
///
/// - `onnx:///path/best.onnx` 或 `*.onnx`：tract 后端
/// - `rknn:///path/best.rknn` 或 `*.rknn`：RKNPU 后端
pub fn load_detector(weights: &str, labels: Labels) -> Result<Arc<dyn Detector>, ModelError> {
  let url = model_url(weights)?;
  info!("加载检测模型: {}", url);

  match url.scheme() {
    #[cfg(feature = "backend_tract")]
    TractYoloBuilder::SCHEME => {
      let model = TractYoloBuilder::from_url(&url)?.labels(labels).build()?;
      Ok(Arc::new(model))
    }
    #[cfg(feature = "backend_rknpu")]
    Yolo26Builder::SCHEME => {
      let model = Yolo26Builder::from_url(&url)
        .map_err(|e| ModelError::ModelLoadError(e.to_string()))?
        .labels(labels)
        .build()
        .map_err(|e| ModelError::ModelLoadError(e.to_string()))?;
      Ok(Arc::new(model))
    }
    other => {
      let _ = labels;
      Err(ModelError::UnsupportedBackend(other.to_string()))
    }
  }
}

/// 纯路径按扩展名推断 URL 方案
fn model_url(weights: &str) -> Result<Url, ModelError> {
  if weights.contains("://") {
    return Url::parse(weights).map_err(|e| ModelError::ModelPathError(e.to_string()));
  }

  let path = Path::new(weights);
  let scheme = match path.extension().and_then(|ext| ext.to_str()) {
    Some(ext) if ext.eq_ignore_ascii_case("onnx") => "onnx",
    Some(ext) if ext.eq_ignore_ascii_case("rknn") => "rknn",
    other => {
      return Err(ModelError::ModelPathError(format!(
        "cannot infer model backend from extension {:?} of {}",
        other, weights
      )));
    }
  };

  let absolute = std::path::absolute(path)?;
  let mut url = Url::parse(&format!("{}:///", scheme))
    .map_err(|e| ModelError::ModelPathError(e.to_string()))?;
  url.set_path(&absolute.to_string_lossy());
  Ok(url)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detection_orders_coordinates() {
    let det = Detection::new(0, "person", 1.5, [50.0, 40.0, 10.0, 20.0]);
    assert_eq!(det.bbox, [10.0, 20.0, 50.0, 40.0]);
    assert_eq!(det.confidence, 1.0);
  }

  #[test]
  fn detection_serializes_rounded() {
    let det = Detection::new(16, "dog", 0.87654, [1.23456, 2.0, 3.999, 4.005]);
    let json = serde_json::to_value(&det).unwrap();
    assert_eq!(json["class"], "dog");
    assert_eq!(json["conf"], 0.877);
    assert_eq!(json["box"][0], 1.23);
    assert_eq!(json["box"][2], 4.0);
    assert!(json.get("class_id").is_none());
  }

  #[test]
  fn inference_size_rounds_up_to_stride() {
    let mut config = DetectionConfig::default();
    assert_eq!(config.model_input_size(), 640);
    config.inference_size = 500;
    assert_eq!(config.model_input_size(), 512);
    config.inference_size = 1;
    assert_eq!(config.model_input_size(), 32);
  }

  #[test]
  fn model_url_infers_scheme_from_extension() {
    let url = model_url("weights/best.onnx").unwrap();
    assert_eq!(url.scheme(), "onnx");
    assert!(url.path().ends_with("weights/best.onnx"));

    assert!(matches!(
      model_url("best.pt"),
      Err(ModelError::ModelPathError(_))
    ));
    assert_eq!(model_url("rknn:///opt/m.rknn").unwrap().path(), "/opt/m.rknn");
  }
}
