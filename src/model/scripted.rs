// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/scripted.rs - 脚本化检测器
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

use std::sync::atomic::{AtomicUsize, Ordering};

use image::RgbImage;
use tracing::debug;

use super::{Detection, DetectionConfig, Detector, ModelError, ensure_non_empty};

/// 返回固定检测结果的检测器，不依赖任何模型权重
///
/// 框坐标按原图大小截断，低于置信度阈值的结果会被过滤。
#[derive(Debug, Default)]
pub struct ScriptedDetector {
  script: Vec<Detection>,
  fail_after: Option<usize>,
  calls: AtomicUsize,
}

impl ScriptedDetector {
  pub fn new(script: Vec<Detection>) -> Self {
    Self {
      script,
      fail_after: None,
      calls: AtomicUsize::new(0),
    }
  }

  /// 前 `n` 次调用成功，之后每次调用都返回推理错误
  pub fn failing_after(mut self, n: usize) -> Self {
    self.fail_after = Some(n);
    self
  }

  /// 已发生的调用次数
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Detector for ScriptedDetector {
  fn name(&self) -> &'static str {
    "scripted"
  }

  fn detect(
    &self,
    image: &RgbImage,
    config: &DetectionConfig,
  ) -> Result<Vec<Detection>, ModelError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    ensure_non_empty(image)?;

    if self.fail_after.is_some_and(|n| call >= n) {
      return Err(ModelError::InferenceError(format!(
        "scripted failure on call {}",
        call
      )));
    }

    let (w, h) = (image.width() as f32, image.height() as f32);
    let detections: Vec<Detection> = self
      .script
      .iter()
      .filter(|d| d.confidence >= config.confidence_threshold)
      .map(|d| {
        let [x1, y1, x2, y2] = d.bbox;
        Detection::new(
          d.class_id,
          d.class_label.clone(),
          d.confidence,
          [x1.clamp(0.0, w), y1.clamp(0.0, h), x2.clamp(0.0, w), y2.clamp(0.0, h)],
        )
      })
      .collect();

    debug!("脚本化检测第 {} 次调用，返回 {} 个结果", call, detections.len());
    Ok(detections)
  }
}
