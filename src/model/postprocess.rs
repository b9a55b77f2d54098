// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/postprocess.rs - YOLO 输出解码与非极大值抑制
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

use tracing::{debug, warn};

use super::{Detection, DetectionConfig, Labels, ModelError};
use crate::frame::Letterbox;

/// 每张图像最多保留的检测数
const MAX_DETECTIONS: usize = 300;
/// 进入 NMS 的候选框上限
const MAX_NMS_INPUTS: usize = 30_000;
/// 4 个框坐标
const BOX_FEATURES: usize = 4;

/// 从 `[1, 4 + nc, anchors]`（或转置）输出形状推断类别数
pub fn yolo_class_count(shape: &[usize]) -> Option<usize> {
  match *shape {
    [1, d1, d2] if d1.min(d2) > BOX_FEATURES => Some(d1.min(d2) - BOX_FEATURES),
    _ => None,
  }
}

/// 解码 YOLOv8 风格的检测头输出
///
/// 支持 `[1, 4 + nc, anchors]` 与转置后的 `[1, anchors, 4 + nc]` 两种排布，
/// 框格式为模型输入坐标下的 (cx, cy, w, h)，类别分数已经过 sigmoid。
pub fn decode_yolo_output(
  data: &[f32],
  shape: &[usize],
  config: &DetectionConfig,
  letterbox: &Letterbox,
  labels: &Labels,
) -> Result<Vec<Detection>, ModelError> {
  let mismatch = || ModelError::OutputShapeMismatch {
    expected: "[1, 4 + classes, anchors]".to_string(),
    actual: shape.to_vec(),
  };

  let &[batch, d1, d2] = shape else {
    return Err(mismatch());
  };
  if batch != 1 || d1.min(d2) <= BOX_FEATURES || d1 * d2 != data.len() {
    return Err(mismatch());
  }

  // 特征维总是小于锚点数
  let features_first = d1 < d2;
  let (features, anchors) = if features_first { (d1, d2) } else { (d2, d1) };
  let at = |anchor: usize, feature: usize| {
    if features_first {
      data[feature * anchors + anchor]
    } else {
      data[anchor * features + feature]
    }
  };

  let classes = features - BOX_FEATURES;
  let mut candidates = Vec::new();

  for anchor in 0..anchors {
    let (class_id, score) = (0..classes)
      .map(|c| (c, at(anchor, BOX_FEATURES + c)))
      .fold((0usize, f32::NEG_INFINITY), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });

    if !score.is_finite() || score < config.confidence_threshold {
      continue;
    }

    let (cx, cy, w, h) = (
      at(anchor, 0),
      at(anchor, 1),
      at(anchor, 2),
      at(anchor, 3),
    );
    if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) || w <= 0.0 || h <= 0.0
    {
      continue;
    }

    let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
    let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
    if x2 - x1 <= 0.0 || y2 - y1 <= 0.0 {
      continue;
    }

    let class_id = class_id as u32;
    candidates.push(Detection::new(
      class_id,
      labels.name(class_id),
      score.min(1.0),
      [x1, y1, x2, y2],
    ));
  }

  debug!("候选框 {} 个，开始 NMS", candidates.len());
  Ok(nms(candidates, config.iou_threshold))
}

/// 按类别进行非极大值抑制，结果按置信度降序
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  // 稳定排序保证同分时保持原有顺序
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  if detections.len() > MAX_NMS_INPUTS {
    warn!(
      "NMS 输入过多 ({})，截断到 {}",
      detections.len(),
      MAX_NMS_INPUTS
    );
    detections.truncate(MAX_NMS_INPUTS);
  }

  let mut suppressed = vec![false; detections.len()];
  let mut kept = Vec::new();

  for i in 0..detections.len() {
    if suppressed[i] {
      continue;
    }
    kept.push(i);
    if kept.len() >= MAX_DETECTIONS {
      break;
    }

    for j in (i + 1)..detections.len() {
      if suppressed[j] || detections[j].class_id != detections[i].class_id {
        continue;
      }
      if iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  let mut detections: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
  kept
    .into_iter()
    .filter_map(|i| detections[i].take())
    .collect()
}

/// 两个 [x_min, y_min, x_max, y_max] 框的交并比
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Detection {
    Detection::new(class_id, format!("c{}", class_id), confidence, bbox)
  }

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
  }

  #[test]
  fn nms_suppresses_same_class_only() {
    let detections = vec![
      det(0, 0.6, [1.0, 1.0, 11.0, 11.0]),
      det(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
      det(1, 0.8, [0.0, 0.0, 10.0, 10.0]),
      det(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
    ];
    let kept = nms(detections, 0.45);
    let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
    assert_eq!(confidences, vec![0.9, 0.8, 0.7]);
  }

  #[test]
  fn nms_empty() {
    assert!(nms(Vec::new(), 0.5).is_empty());
  }

  /// 构造 [1, 4 + 2, anchors] 的输出
  fn features_first(anchors: &[[f32; 6]]) -> (Vec<f32>, Vec<usize>) {
    let n = anchors.len();
    let mut data = vec![0f32; 6 * n];
    for (a, values) in anchors.iter().enumerate() {
      for (f, v) in values.iter().enumerate() {
        data[f * n + a] = *v;
      }
    }
    (data, vec![1, 6, n])
  }

  #[test]
  fn decode_maps_boxes_back_to_source() {
    // 1280x720 -> 640x640，缩放 0.5，上下各填充 140
    let letterbox = Letterbox::fit(1280, 720, 640, 640);
    let labels = Labels::parse("cat\ndog");
    let mut anchors = vec![[0f32; 6]; 8];
    anchors[3] = [320.0, 320.0, 100.0, 50.0, 0.1, 0.9];
    anchors[5] = [100.0, 200.0, 20.0, 20.0, 0.2, 0.1];
    let (data, shape) = features_first(&anchors);

    let detections =
      decode_yolo_output(&data, &shape, &DetectionConfig::default(), &letterbox, &labels).unwrap();
    assert_eq!(detections.len(), 1);
    let d = &detections[0];
    assert_eq!(d.class_label, "dog");
    assert_eq!(d.class_id, 1);
    assert_eq!(d.bbox, [540.0, 310.0, 740.0, 410.0]);
  }

  #[test]
  fn decode_accepts_transposed_layout() {
    let letterbox = Letterbox::fit(640, 640, 640, 640);
    let labels = Labels::coco();
    let mut data = vec![0f32; 8 * 6];
    data[..6].copy_from_slice(&[10.0, 10.0, 4.0, 4.0, 0.95, 0.0]);

    let detections = decode_yolo_output(
      &data,
      &[1, 8, 6],
      &DetectionConfig::default(),
      &letterbox,
      &labels,
    )
    .unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_label, "person");
    assert_eq!(detections[0].bbox, [8.0, 8.0, 12.0, 12.0]);
  }

  #[test]
  fn decode_rejects_unexpected_shape() {
    let letterbox = Letterbox::fit(640, 640, 640, 640);
    let result = decode_yolo_output(
      &[0.0; 12],
      &[1, 12],
      &DetectionConfig::default(),
      &letterbox,
      &Labels::coco(),
    );
    assert!(matches!(
      result,
      Err(ModelError::OutputShapeMismatch { .. })
    ));
  }

  #[test]
  fn class_count_from_output_shape() {
    assert_eq!(yolo_class_count(&[1, 84, 8400]), Some(80));
    assert_eq!(yolo_class_count(&[1, 8400, 84]), Some(80));
    assert_eq!(yolo_class_count(&[1, 6, 8400]), Some(2));
    assert_eq!(yolo_class_count(&[1, 4, 8400]), None);
    assert_eq!(yolo_class_count(&[2, 84, 8400]), None);
  }

  #[test]
  fn two_class_model_without_labels_is_rejected() {
    let classes = yolo_class_count(&[1, 6, 8400]).unwrap();
    assert!(matches!(
      Labels::coco().check_class_count(classes),
      Err(ModelError::ModelLoadError(_))
    ));
    assert!(Labels::parse("pothole\ncrack").check_class_count(classes).is_ok());
  }

  #[test]
  fn decode_respects_confidence_threshold() {
    let letterbox = Letterbox::fit(640, 640, 640, 640);
    let anchors = vec![[10.0, 10.0, 4.0, 4.0, 0.3, 0.0]; 8];
    let (data, shape) = features_first(&anchors);
    let config = DetectionConfig {
      confidence_threshold: 0.5,
      ..DetectionConfig::default()
    };
    let detections =
      decode_yolo_output(&data, &shape, &config, &letterbox, &Labels::coco()).unwrap();
    assert!(detections.is_empty());
  }
}
