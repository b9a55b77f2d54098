// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/detect_image.rs - 单张图像检测工具
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use shanan_serve::{
  args::{ModelArgs, RenderArgs, ThresholdArgs, init_tracing},
  input::{FrameSource, read_image_file},
  task::{OneShotTask, Task},
};

/// 检测单张图像并保存绘制结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,

  /// 输出 JPEG 路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: PathBuf,

  #[command(flatten)]
  pub model: ModelArgs,

  #[command(flatten)]
  pub thresholds: ThresholdArgs,

  #[command(flatten)]
  pub render: RenderArgs,
}

fn main() -> Result<()> {
  init_tracing();
  let args = Args::parse();

  info!("输入图像: {}", args.input.display());
  info!("输出路径: {}", args.output.display());

  let detector = args.model.load().context("无法加载检测模型")?;
  let annotator = args.render.annotator().context("无法加载字体")?;

  let image = read_image_file(&args.input)?;
  let task = OneShotTask::new(args.thresholds.config());
  let (frame, detections) = task.run_task(FrameSource::single_image(image), detector.as_ref())?;

  for detection in &detections {
    info!(
      "{} {:.3} [{:.1}, {:.1}, {:.1}, {:.1}]",
      detection.class_label,
      detection.confidence,
      detection.bbox[0],
      detection.bbox[1],
      detection.bbox[2],
      detection.bbox[3]
    );
  }

  let jpeg = annotator.annotate(&frame.image, &detections)?;
  if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&args.output, jpeg)
    .with_context(|| format!("无法写入 {}", args.output.display()))?;
  info!("检测到 {} 个物体，结果已保存", detections.len());
  Ok(())
}
