// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/tract.rs - 基于 tract 的 ONNX YOLO 推理
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

use std::{
  collections::HashMap,
  path::PathBuf,
  sync::{Arc, Mutex},
  time::Instant,
};

use image::RgbImage;
use tract_onnx::prelude::*;
use tracing::{debug, info};
use url::Url;

use super::{
  DEFAULT_INFERENCE_SIZE, Detection, DetectionConfig, Detector, Labels, ModelError,
  decode_yolo_output, ensure_non_empty, yolo_class_count,
};
use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{RgbNchwFrame, letterbox},
};

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// YOLOv8 风格 ONNX 模型
///
/// tract 的执行计划可以被多个线程同时运行，只有按输入尺寸缓存计划的表需要加锁。
pub struct TractYolo {
  model: InferenceModel,
  labels: Labels,
  plans: Mutex<HashMap<u32, Arc<YoloPlan>>>,
}

/// Ultralytics 导出时写入类别名称的元数据键
const NAMES_METADATA_KEY: &str = "names";

pub struct TractYoloBuilder {
  model_path: PathBuf,
  labels: Labels,
}

impl FromUrl for TractYoloBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Self {
      model_path: PathBuf::from(url.path()),
      labels: Labels::default(),
    })
  }
}

impl FromUrlWithScheme for TractYoloBuilder {
  const SCHEME: &'static str = "onnx";
}

impl TractYoloBuilder {
  /// 指定类别标签；保持 COCO 缺省时优先使用模型自带的类别名称
  pub fn labels(mut self, labels: Labels) -> Self {
    self.labels = labels;
    self
  }

  pub fn build(self) -> Result<TractYolo, ModelError> {
    info!("加载模型文件: {}", self.model_path.display());
    let load_error =
      |e: TractError| ModelError::ModelLoadError(format!("{}: {}", self.model_path.display(), e));
    let onnx = tract_onnx::onnx();
    let proto = onnx.proto_model_for_path(&self.model_path).map_err(load_error)?;

    let exported = proto
      .metadata_props
      .iter()
      .find(|prop| prop.key == NAMES_METADATA_KEY)
      .and_then(|prop| Labels::from_names_metadata(&prop.value));
    let labels = match (self.labels, exported) {
      (Labels::Coco, Some(names)) => {
        info!("使用模型自带的 {} 个类别名称", names.len());
        names
      }
      (labels, _) => labels,
    };

    let model = onnx.model_for_proto_model(&proto).map_err(load_error)?;
    let detector = TractYolo {
      model,
      labels,
      plans: Mutex::new(HashMap::new()),
    };

    // 预先构建默认尺寸的执行计划，并据此核对类别数
    let plan = detector.plan(DEFAULT_INFERENCE_SIZE)?;
    let output = plan
      .model()
      .output_fact(0)
      .map_err(|e| ModelError::ModelLoadError(e.to_string()))?;
    match output.shape.as_concrete().and_then(yolo_class_count) {
      Some(classes) => {
        detector.labels.check_class_count(classes)?;
        info!("模型输出 {} 个类别", classes);
      }
      None => debug!("无法从输出形状 {:?} 推断类别数", output.shape),
    }

    info!("模型加载完成");
    Ok(detector)
  }
}

impl TractYolo {
  fn plan(&self, size: u32) -> Result<Arc<YoloPlan>, ModelError> {
    let mut plans = self.plans.lock().map_err(|_| ModelError::LockPoisoned)?;
    if let Some(plan) = plans.get(&size) {
      return Ok(plan.clone());
    }

    debug!("构建 {}x{} 的执行计划", size, size);
    let side = size as usize;
    let plan = self
      .model
      .clone()
      .with_input_fact(
        0,
        InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
      )
      .and_then(|model| model.into_optimized())
      .and_then(|model| model.into_runnable())
      .map_err(|e| ModelError::ModelLoadError(e.to_string()))?;

    let plan = Arc::new(plan);
    plans.insert(size, plan.clone());
    Ok(plan)
  }
}

impl Detector for TractYolo {
  fn name(&self) -> &'static str {
    "tract-yolo"
  }

  fn detect(
    &self,
    image: &RgbImage,
    config: &DetectionConfig,
  ) -> Result<Vec<Detection>, ModelError> {
    ensure_non_empty(image)?;
    let size = config.model_input_size();
    let plan = self.plan(size)?;

    let now = Instant::now();
    let (canvas, params) = letterbox(image, size, size);
    let frame = RgbNchwFrame::from(&canvas);
    let input = Tensor::from_shape(&frame.shape(), frame.as_nchw())
      .map_err(|e| ModelError::InvalidInput(e.to_string()))?;

    let outputs = plan
      .run(tvec!(input.into()))
      .map_err(|e| ModelError::InferenceError(e.to_string()))?;
    let elapsed = now.elapsed();

    let output = outputs.first().ok_or_else(|| ModelError::OutputShapeMismatch {
      expected: "one output tensor".to_string(),
      actual: Vec::new(),
    })?;
    let data = output
      .as_slice::<f32>()
      .map_err(|e| ModelError::InferenceError(e.to_string()))?;

    let detections = decode_yolo_output(data, output.shape(), config, &params, &self.labels)?;
    debug!(
      "推理完成，耗时: {:.2?}，检测到 {} 个物体",
      elapsed,
      detections.len()
    );
    Ok(detections)
  }
}
