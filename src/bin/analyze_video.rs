// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/analyze_video.rs - 视频采样检测工具
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
use tracing::{info, warn};

use shanan_serve::{
  args::{ModelArgs, ThresholdArgs, init_tracing, parse_sample_period},
  input::{FrameSource, default_video_decoder},
  task::{CancelFlag, SamplingTask, Task},
};

/// 对本地视频按固定间隔采样检测，输出 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 视频文件路径
  #[arg(value_name = "VIDEO")]
  pub video: PathBuf,

  #[command(flatten)]
  pub model: ModelArgs,

  #[command(flatten)]
  pub thresholds: ThresholdArgs,

  /// 采样间隔（秒）
  #[arg(long, default_value = "1.0", value_parser = parse_sample_period, value_name = "SECONDS")]
  pub sample_period: f64,

  /// 结果输出文件，缺省打印到标准输出
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,
}

fn main() -> Result<()> {
  init_tracing();
  let args = Args::parse();

  info!("视频文件: {}", args.video.display());
  let detector = args.model.load().context("无法加载检测模型")?;

  let cancel = CancelFlag::new();
  let handler_flag = cancel.clone();
  ctrlc::set_handler(move || {
    warn!("收到中断信号，停止采样...");
    handler_flag.cancel();
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let decoder = default_video_decoder();
  let source = FrameSource::sampled_video(decoder.as_ref(), &args.video, args.sample_period)?;
  let result = SamplingTask::new(args.thresholds.config())
    .with_cancel(cancel)
    .run_task(source, detector.as_ref())?;

  let json = serde_json::to_string_pretty(&result)?;
  match &args.output {
    Some(path) => {
      std::fs::write(path, json).with_context(|| format!("无法写入 {}", path.display()))?;
      info!("结果已写入 {}", path.display());
    }
    None => println!("{}", json),
  }
  Ok(())
}
