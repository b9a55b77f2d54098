// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo26.rs - RKNPU 上的 YOLO26 模型
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

use std::{sync::Mutex, time::Instant};

use image::RgbImage;
use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use super::{Detection, DetectionConfig, Detector, Labels, ModelError, ensure_non_empty, nms};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Letterbox, RgbNhwcFrame, letterbox},
};

const YOLO26_NUM_INPUTS: u32 = 1;
const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_SIZE: u32 = 640;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

/// RKNN 上下文不可重入，推理时加锁串行化
pub struct Yolo26 {
  context: Mutex<Context>,
  labels: Labels,
}

#[derive(Error, Debug)]
pub enum Yolo26Error {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("类别标签错误: {0}")]
  LabelsError(#[from] ModelError),
}

impl Yolo26Error {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    Yolo26Error::ModelInvalid(msg.to_string(), e)
  }
}

impl From<Yolo26Error> for ModelError {
  fn from(err: Yolo26Error) -> Self {
    ModelError::InferenceError(err.to_string())
  }
}

pub struct Yolo26Builder {
  model_path: String,
  flags: InitFlags,
  labels: Labels,
}

impl FromUrl for Yolo26Builder {
  type Error = Yolo26Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(Yolo26Error::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Yolo26Builder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      labels: Labels::default(),
    })
  }
}

impl FromUrlWithScheme for Yolo26Builder {
  const SCHEME: &'static str = "rknn";
}

impl Yolo26Builder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self
  }

  pub fn build(self) -> Result<Yolo26, Yolo26Error> {
    info!("加载模型文件: {}", self.model_path);
    let mode_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      mode_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&mode_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(Yolo26Error::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| Yolo26Error::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(Yolo26Error::invalid(&msg, rknpu::Error::InvalidModel));
    }

    self.labels.check_class_count(YOLO26_CLASS_NUM)?;

    info!("模型加载完成");
    Ok(Yolo26 {
      context: Mutex::new(context),
      labels: self.labels,
    })
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果大小不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
  head_idx: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((tensor2, tensor1))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx,
      tensor1.len(),
      tensor2.len(),
      reg_expected,
      cls_expected
    );
    None
  }
}

impl Yolo26 {
  fn postprocess(
    &self,
    output: &rknpu::Output,
    config: &DetectionConfig,
    params: &Letterbox,
  ) -> Result<Vec<Detection>, ModelError> {
    let input_size = YOLO26_INPUT_SIZE as f32;
    let mut items = Vec::new();

    for (head_idx, (&(map_h, map_w), stride)) in
      YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
    {
      let spatial = map_h * map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = YOLO26_CLASS_NUM * spatial;

      // RKNN 输出顺序不固定，按张量大小区分回归和分类
      let tensor1 = output.get_f32(head_idx * 2).map_err(Yolo26Error::from)?;
      let tensor2 = output.get_f32(head_idx * 2 + 1).map_err(Yolo26Error::from)?;
      let (reg, cls) =
        match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected, head_idx).ok_or_else(
          || ModelError::OutputShapeMismatch {
            expected: format!("{} / {}", reg_expected, cls_expected),
            actual: vec![tensor1.len(), tensor2.len()],
          },
        )?;

      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let (max_logit, class_id) = (0..YOLO26_CLASS_NUM)
            .map(|c| (cls[c * spatial + idx], c as u32))
            .fold((f32::MIN, 0u32), |best, cur| {
              if cur.0 > best.0 { cur } else { best }
            });
          let score = sigmoid(max_logit);
          if score < config.confidence_threshold {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;

          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_size);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_size);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_size);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_size);

          let (x1, y1) = params.to_source(xmin, ymin);
          let (x2, y2) = params.to_source(xmax, ymax);
          if x2 <= x1 || y2 <= y1 {
            continue;
          }

          items.push(Detection::new(
            class_id,
            self.labels.name(class_id),
            score,
            [x1, y1, x2, y2],
          ));
        }
      }
    }

    Ok(nms(items, config.iou_threshold))
  }
}

impl Detector for Yolo26 {
  fn name(&self) -> &'static str {
    "yolo26-rknpu"
  }

  fn detect(
    &self,
    image: &RgbImage,
    config: &DetectionConfig,
  ) -> Result<Vec<Detection>, ModelError> {
    ensure_non_empty(image)?;
    let (canvas, params) = letterbox(image, YOLO26_INPUT_SIZE, YOLO26_INPUT_SIZE);
    let input = RgbNhwcFrame::from(canvas);

    let context = self.context.lock().map_err(|_| ModelError::LockPoisoned)?;
    let now = Instant::now();

    context
      .set_input(
        0,
        input.as_nhwc(),
        rknpu::TensorFormat::NHWC,
        TensorType::UInt8,
      )
      .map_err(Yolo26Error::from)?;
    context.run().map_err(Yolo26Error::from)?;
    let output = context.get_outputs().map_err(Yolo26Error::from)?;
    let elapsed = now.elapsed();

    let detections = self.postprocess(&output, config, &params)?;
    debug!(
      "推理完成，耗时: {:.2?}，检测到 {} 个物体",
      elapsed,
      detections.len()
    );
    Ok(detections)
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reg_cls_matching_by_size() {
    let reg = vec![0f32; 4];
    let cls = vec![0f32; 80];
    let (r, c) = match_reg_cls_tensors(&cls, &reg, 4, 80, 0).unwrap();
    assert_eq!(r.len(), 4);
    assert_eq!(c.len(), 80);
    assert!(match_reg_cls_tensors(&reg, &reg, 4, 80, 0).is_none());
  }

  #[test]
  fn sigmoid_midpoint() {
    assert_eq!(sigmoid(0.0), 0.5);
  }
}
