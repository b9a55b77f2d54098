// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_video.rs - GStreamer 视频文件解码
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

//! # GStreamer 视频文件解码
//!
//! 使用 `decodebin` 顺序解码视频容器中的每一帧，统一转换为 RGB。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! 管道被丢弃时会切换到 `Null` 状态，释放文件句柄与解码器。

use std::{
  path::Path,
  time::{Duration, Instant},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{InputError, VideoDecoder, VideoStream};

const PIPELINE_DESCRIPTION: &str = "filesrc name=src ! decodebin ! videoconvert ! \
   video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4";

/// 单次拉取样本的等待时间
const PULL_TIMEOUT_MS: u64 = 100;
/// 解码器长时间没有产出时视为卡死
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GStreamerVideoDecoder;

impl VideoDecoder for GStreamerVideoDecoder {
  fn name(&self) -> &'static str {
    "gstreamer"
  }

  fn open(&self, path: &Path) -> Result<VideoStream, InputError> {
    let input = GStreamerVideoInput::open(path)?;
    Ok(VideoStream {
      fps: input.fps(),
      frames: Box::new(input),
    })
  }
}

/// GStreamer 视频输入，逐帧迭代解码结果
pub struct GStreamerVideoInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  fps: f64,
  pending: Option<RgbImage>,
  finished: bool,
}

impl Drop for GStreamerVideoInput {
  fn drop(&mut self) {
    debug!("停止 GStreamer 管道");
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

fn gst_error(e: impl std::fmt::Display) -> InputError {
  InputError::VideoOpenError(e.to_string())
}

impl GStreamerVideoInput {
  /// 打开视频文件并预读第一帧以确定帧率
  pub fn open(path: &Path) -> Result<Self, InputError> {
    if !path.is_file() {
      return Err(InputError::VideoOpenError(format!(
        "{} is not a file",
        path.display()
      )));
    }

    gst::init().map_err(gst_error)?;
    info!("GStreamer pipeline description: {}", PIPELINE_DESCRIPTION);

    let pipeline = gst::parse::launch(PIPELINE_DESCRIPTION)
      .map_err(gst_error)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| InputError::VideoOpenError("Failed to create pipeline".to_string()))?;

    let src = pipeline
      .by_name("src")
      .ok_or_else(|| InputError::VideoOpenError("filesrc element not found".to_string()))?;
    src.set_property("location", path.to_string_lossy().as_ref());

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| InputError::VideoOpenError("appsink element not found".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| InputError::VideoOpenError("Failed to convert element to appsink".to_string()))?;

    // 先构造结构体，之后的任何失败都由 Drop 释放管道
    let mut input = Self {
      pipeline,
      appsink,
      fps: 0.0,
      pending: None,
      finished: false,
    };

    input
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(gst_error)?;

    match input.next_sample()? {
      Some(sample) => {
        input.fps = sample_fps(&sample);
        input.pending = Some(sample_to_image(&sample)?);
      }
      None => {
        warn!("视频 {} 不包含任何帧", path.display());
        input.finished = true;
      }
    }

    Ok(input)
  }

  pub fn fps(&self) -> f64 {
    self.fps
  }

  fn next_sample(&self) -> Result<Option<gst::Sample>, InputError> {
    let deadline = Instant::now() + STALL_TIMEOUT;
    loop {
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
      {
        return Ok(Some(sample));
      }

      self.check_bus()?;

      if self.appsink.is_eos() {
        return Ok(None);
      }
      if Instant::now() >= deadline {
        return Err(InputError::VideoDecodeError(format!(
          "decoder produced no frame within {:?}",
          STALL_TIMEOUT
        )));
      }
    }
  }

  fn check_bus(&self) -> Result<(), InputError> {
    let Some(bus) = self.pipeline.bus() else {
      return Ok(());
    };

    while let Some(message) = bus.pop_filtered(&[gst::MessageType::Error]) {
      if let gst::MessageView::Error(err) = message.view() {
        return Err(InputError::VideoDecodeError(format!(
          "{} ({})",
          err.error(),
          err.debug().map(|d| d.to_string()).unwrap_or_default()
        )));
      }
    }
    Ok(())
  }
}

impl Iterator for GStreamerVideoInput {
  type Item = Result<RgbImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(image) = self.pending.take() {
      return Some(Ok(image));
    }
    if self.finished {
      return None;
    }

    let result = self
      .next_sample()
      .and_then(|sample| sample.map(|s| sample_to_image(&s)).transpose());
    match result {
      Ok(Some(image)) => Some(Ok(image)),
      Ok(None) => {
        self.finished = true;
        None
      }
      Err(e) => {
        self.finished = true;
        Some(Err(e))
      }
    }
  }
}

/// 从样本的 caps 中读取帧率，可变帧率（0/1）返回 0
fn sample_fps(sample: &gst::Sample) -> f64 {
  sample
    .caps()
    .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
    .map(|info| {
      let fps = info.fps();
      if fps.denom() == 0 {
        0.0
      } else {
        fps.numer() as f64 / fps.denom() as f64
      }
    })
    .unwrap_or(0.0)
}

/// 按行跨度拷贝 RGB 数据，去掉每行末尾的对齐填充
fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, InputError> {
  let decode_error = |msg: &str| InputError::VideoDecodeError(msg.to_string());

  let buffer = sample
    .buffer()
    .ok_or_else(|| decode_error("No buffer in sample"))?;
  let caps = sample.caps().ok_or_else(|| decode_error("No caps in sample"))?;
  let info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| decode_error("Failed to get video info from caps"))?;

  if info.format() != gst_video::VideoFormat::Rgb {
    return Err(InputError::VideoDecodeError(format!(
      "Unsupported video format {:?}",
      info.format()
    )));
  }

  let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
    .map_err(|_| decode_error("Failed to map buffer for reading"))?;
  let data = frame
    .plane_data(0)
    .map_err(|_| decode_error("Failed to read plane data"))?;

  let (width, height) = (info.width(), info.height());
  let row = width as usize * 3;
  let stride = frame.plane_stride()[0] as usize;

  let mut pixels = Vec::with_capacity(row * height as usize);
  for y in 0..height as usize {
    let start = y * stride;
    let line = data.get(start..start + row).ok_or_else(|| {
      InputError::VideoDecodeError(format!(
        "Buffer size mismatch: row {} needs {} bytes, buffer has {}",
        y,
        start + row,
        data.len()
      ))
    })?;
    pixels.extend_from_slice(line);
  }

  RgbImage::from_raw(width, height, pixels).ok_or_else(|| decode_error("Invalid frame dimensions"))
}
