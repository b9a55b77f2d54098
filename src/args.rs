// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数配置
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

use std::{path::PathBuf, sync::Arc};

use clap::{Args, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
  model::{
    DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_INFERENCE_SIZE, DEFAULT_IOU_THRESHOLD, DetectionConfig,
    Detector, Labels, ModelError, ScriptedDetector, load_detector,
  },
  output::{Annotator, DEFAULT_JPEG_QUALITY, Draw, OutputError, load_font},
};

/// 采样间隔下限，保证四舍五入到两位小数后的时间戳仍然严格递增
const MIN_SAMPLE_PERIOD_SEC: f64 = 0.05;

/// 初始化日志，默认级别 info，可通过 `RUST_LOG` 覆盖
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
  /// 按权重文件加载模型
  Model,
  /// 不加载模型，返回空结果
  Scripted,
}

/// 检测模型参数
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
  /// 模型权重：*.onnx、*.rknn，或 onnx:///path、rknn:///path
  #[arg(long, env = "YOLO_WEIGHTS", default_value = "best.onnx", value_name = "WEIGHTS")]
  pub weights: String,

  /// 类别标签文件，每行一个；缺省使用模型自带的类别名称，没有时按 COCO 80 类处理
  #[arg(long, env = "YOLO_LABELS", value_name = "FILE")]
  pub labels: Option<PathBuf>,

  #[arg(long, value_enum, default_value_t = DetectorKind::Model)]
  pub detector: DetectorKind,
}

impl ModelArgs {
  pub fn load(&self) -> Result<Arc<dyn Detector>, ModelError> {
    match self.detector {
      DetectorKind::Scripted => {
        info!("使用脚本化检测器");
        Ok(Arc::new(ScriptedDetector::default()))
      }
      DetectorKind::Model => {
        let labels = match &self.labels {
          Some(path) => Labels::from_file(path)?,
          None => Labels::coco(),
        };
        load_detector(&self.weights, labels)
      }
    }
  }
}

/// 绘制参数
#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
  /// 标签字体（TrueType），缺省时在系统字体目录中查找，找不到则无法启动
  #[arg(long, env = "SHANAN_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// JPEG 编码质量 (1 - 100)
  #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100))]
  pub jpeg_quality: u8,
}

impl RenderArgs {
  pub fn annotator(&self) -> Result<Annotator, OutputError> {
    let font = load_font(self.font.as_deref())?;
    Ok(Annotator::new(Draw::new(font), self.jpeg_quality))
  }
}

/// 命令行工具使用的检测阈值
#[derive(Args, Debug, Clone)]
pub struct ThresholdArgs {
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD, value_parser = parse_unit)]
  pub conf: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD, value_parser = parse_unit)]
  pub iou: f32,

  /// 推理尺寸
  #[arg(long, default_value_t = DEFAULT_INFERENCE_SIZE,
        value_parser = clap::value_parser!(u32).range(32..=4096))]
  pub imgsz: u32,
}

impl ThresholdArgs {
  pub fn config(&self) -> DetectionConfig {
    DetectionConfig {
      confidence_threshold: self.conf,
      iou_threshold: self.iou,
      inference_size: self.imgsz,
    }
  }
}

fn parse_unit(s: &str) -> Result<f32, String> {
  let value: f32 = s.parse().map_err(|e| format!("{}", e))?;
  if (0.0..=1.0).contains(&value) {
    Ok(value)
  } else {
    Err(format!("{} is outside [0, 1]", value))
  }
}

pub fn parse_sample_period(s: &str) -> Result<f64, String> {
  let value: f64 = s.parse().map_err(|e| format!("{}", e))?;
  if value.is_finite() && value >= MIN_SAMPLE_PERIOD_SEC {
    Ok(value)
  } else {
    Err(format!(
      "sample period must be at least {} seconds",
      MIN_SAMPLE_PERIOD_SEC
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct TestArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    thresholds: ThresholdArgs,
  }

  #[test]
  fn threshold_defaults() {
    let args = TestArgs::parse_from(["test", "--weights", "m.onnx"]);
    assert_eq!(args.thresholds.config(), DetectionConfig::default());
    assert_eq!(args.model.weights, "m.onnx");
    assert_eq!(args.model.detector, DetectorKind::Model);
  }

  #[test]
  fn rejects_out_of_range_thresholds() {
    assert!(TestArgs::try_parse_from(["test", "--conf", "2"]).is_err());
    assert!(TestArgs::try_parse_from(["test", "--imgsz", "8"]).is_err());
  }

  #[test]
  fn sample_period_lower_bound() {
    assert_eq!(parse_sample_period("1.0"), Ok(1.0));
    assert!(parse_sample_period("0.01").is_err());
    assert!(parse_sample_period("nan").is_err());
  }

  #[test]
  fn missing_font_fails_annotator() {
    let render = RenderArgs {
      font: Some(PathBuf::from("/nonexistent/label.ttf")),
      jpeg_quality: DEFAULT_JPEG_QUALITY,
    };
    assert!(matches!(render.annotator(), Err(OutputError::IoError(_))));
  }

  #[test]
  fn scripted_detector_needs_no_weights() {
    let args = TestArgs::parse_from(["test", "--detector", "scripted", "--weights", "missing.onnx"]);
    assert_eq!(args.model.load().unwrap().name(), "scripted");
  }
}
