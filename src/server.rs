// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server.rs - HTTP 与 WebSocket 服务
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

use axum::{
  Router,
  extract::DefaultBodyLimit,
  routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
  ServeError,
  input::{VideoDecoder, default_video_decoder},
  model::Detector,
  output::Annotator,
};

pub const DEFAULT_SAMPLE_PERIOD_SEC: f64 = 1.0;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// 服务运行参数
#[derive(Debug, Clone)]
pub struct ServeOptions {
  /// 视频采样间隔（秒）
  pub sample_period_sec: f64,
  /// 上传视频的临时目录
  pub upload_dir: PathBuf,
  /// 请求体大小上限
  pub max_upload_bytes: usize,
}

impl Default for ServeOptions {
  fn default() -> Self {
    Self {
      sample_period_sec: DEFAULT_SAMPLE_PERIOD_SEC,
      upload_dir: std::env::temp_dir(),
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
    }
  }
}

/// 所有请求共享的只读状态，检测器在启动时加载一次
#[derive(Clone)]
pub struct AppState {
  pub detector: Arc<dyn Detector>,
  pub annotator: Arc<Annotator>,
  pub video: Arc<dyn VideoDecoder>,
  pub http: reqwest::Client,
  pub options: ServeOptions,
}

impl AppState {
  pub fn new(detector: Arc<dyn Detector>) -> Self {
    Self {
      detector,
      annotator: Arc::new(Annotator::default()),
      video: default_video_decoder(),
      http: reqwest::Client::new(),
      options: ServeOptions::default(),
    }
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = Arc::new(annotator);
    self
  }

  pub fn with_video_decoder(mut self, video: Arc<dyn VideoDecoder>) -> Self {
    self.video = video;
    self
  }

  pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
    self.http = http;
    self
  }

  pub fn with_options(mut self, options: ServeOptions) -> Self {
    self.options = options;
    self
  }
}

pub fn router(state: AppState) -> Router {
  let body_limit = state.options.max_upload_bytes;
  Router::new()
    .route("/detect/image", post(routes::detect_image))
    .route("/detect/url", post(routes::detect_url))
    .route("/detect/video", post(routes::detect_video))
    .route("/health", get(routes::health))
    .route("/ws", get(socket::ws_handler))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 运行服务直到收到 Ctrl-C
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
  info!(
    "服务监听于 {}，检测器: {}",
    listener.local_addr()?,
    state.detector.name()
  );
  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => {
      error!("无法监听中断信号: {}", e);
      std::future::pending::<()>().await;
    }
  }
}

/// 在阻塞线程池中执行解码、推理与编码
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ServeError>
where
  F: FnOnce() -> Result<T, ServeError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| ServeError::Internal(e.to_string()))?
}

mod params;
pub use self::params::DetectionParams;

mod routes;

mod socket;
pub use self::socket::{FrameEvent, decode_frame_event, encode_frame_event};
