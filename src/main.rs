// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 检测服务主程序
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

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use shanan_serve::{
  args::{ModelArgs, RenderArgs, init_tracing, parse_sample_period},
  input::default_video_decoder,
  server::{AppState, ServeOptions, serve},
};

/// 目标检测 HTTP / WebSocket 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, env = "SHANAN_HOST", default_value = "0.0.0.0")]
  pub host: String,

  /// 监听端口
  #[arg(long, env = "SHANAN_PORT", default_value_t = 8080)]
  pub port: u16,

  #[command(flatten)]
  pub model: ModelArgs,

  #[command(flatten)]
  pub render: RenderArgs,

  /// 视频采样间隔（秒）
  #[arg(long, default_value = "1.0", value_parser = parse_sample_period, value_name = "SECONDS")]
  pub sample_period: f64,

  /// 上传大小上限（MB）
  #[arg(long, default_value_t = 512, value_name = "MB")]
  pub max_upload_mb: usize,

  /// 上传视频的临时目录，缺省为系统临时目录
  #[arg(long, value_name = "DIR")]
  pub upload_dir: Option<PathBuf>,

  /// 远程图像下载超时（秒）
  #[arg(long, default_value_t = 30, value_name = "SECONDS")]
  pub fetch_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  init_tracing();
  let args = Args::parse();

  info!("模型权重: {}", args.model.weights);
  let detector = args.model.load().context("无法加载检测模型")?;
  let annotator = args.render.annotator().context("无法加载字体")?;

  let http = reqwest::Client::builder()
    .timeout(Duration::from_secs(args.fetch_timeout))
    .build()
    .context("无法创建 HTTP 客户端")?;

  let options = ServeOptions {
    sample_period_sec: args.sample_period,
    upload_dir: args.upload_dir.unwrap_or_else(std::env::temp_dir),
    max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
  };

  let state = AppState::new(detector)
    .with_annotator(annotator)
    .with_video_decoder(default_video_decoder())
    .with_http_client(http)
    .with_options(options);

  let addr = format!("{}:{}", args.host, args.port);
  let listener = TcpListener::bind(&addr)
    .await
    .with_context(|| format!("无法监听 {}", addr))?;

  serve(listener, state).await?;
  info!("服务已退出");
  Ok(())
}
