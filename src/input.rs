// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{io::Cursor, path::Path, sync::Arc};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, info};

use crate::frame::Frame;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image decoding error: {0}")]
  ImageDecodeError(#[from] image::ImageError),
  #[error("Image is empty ({0}x{1})")]
  EmptyImage(u32, u32),
  #[error("Video open error: {0}")]
  VideoOpenError(String),
  #[error("Video decoding error: {0}")]
  VideoDecodeError(String),
  #[error("Unsupported input: {0}")]
  Unsupported(String),
}

/// 解码内存中的图像（格式由内容推断），统一转换为 RGB
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, InputError> {
  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .decode()?
    .to_rgb8();
  ensure_not_empty(image)
}

pub fn read_image_file(path: &Path) -> Result<RgbImage, InputError> {
  let image = ImageReader::open(path)?.decode()?.to_rgb8();
  ensure_not_empty(image)
}

fn ensure_not_empty(image: RgbImage) -> Result<RgbImage, InputError> {
  if image.width() == 0 || image.height() == 0 {
    return Err(InputError::EmptyImage(image.width(), image.height()));
  }
  Ok(image)
}

/// 解码器产生的原始帧序列
pub type RawFrames = Box<dyn Iterator<Item = Result<RgbImage, InputError>> + Send>;

/// 打开的视频流：容器报告的帧率与逐帧解码的迭代器
///
/// 迭代器被丢弃时底层容器句柄随之释放。
pub struct VideoStream {
  pub fps: f64,
  pub frames: RawFrames,
}

/// 视频解码器，按路径打开视频容器
pub trait VideoDecoder: Send + Sync {
  fn name(&self) -> &'static str;

  fn open(&self, path: &Path) -> Result<VideoStream, InputError>;
}

/// 未启用任何视频后端时使用，打开任何视频都会失败
pub struct UnsupportedVideoDecoder;

impl VideoDecoder for UnsupportedVideoDecoder {
  fn name(&self) -> &'static str {
    "unsupported"
  }

  fn open(&self, path: &Path) -> Result<VideoStream, InputError> {
    Err(InputError::Unsupported(format!(
      "no video decoder available for {}",
      path.display()
    )))
  }
}

pub fn default_video_decoder() -> Arc<dyn VideoDecoder> {
  #[cfg(feature = "gstreamer_input")]
  {
    Arc::new(GStreamerVideoDecoder)
  }
  #[cfg(not(feature = "gstreamer_input"))]
  {
    Arc::new(UnsupportedVideoDecoder)
  }
}

/// 帧来源
///
/// 每个变体都是惰性的有限序列：单张图像与推送帧恰好产生一帧，
/// 视频按采样间隔产生若干帧。
pub enum FrameSource {
  SingleImage(Option<RgbImage>),
  LiveFrame(Option<RgbImage>),
  SampledVideo(Sampler<RawFrames>),
}

impl FrameSource {
  pub fn single_image(image: RgbImage) -> Self {
    FrameSource::SingleImage(Some(image))
  }

  /// 由连接推送的一帧，连接之间不保留任何缓冲
  pub fn live_frame(image: RgbImage) -> Self {
    FrameSource::LiveFrame(Some(image))
  }

  /// 打开视频并按 `sample_period_sec` 采样；打开失败时已打开的资源会立刻释放
  pub fn sampled_video(
    decoder: &dyn VideoDecoder,
    path: &Path,
    sample_period_sec: f64,
  ) -> Result<Self, InputError> {
    info!("使用 {} 打开视频: {}", decoder.name(), path.display());
    let stream = decoder.open(path)?;
    Ok(Self::from_stream(stream, sample_period_sec))
  }

  pub fn from_stream(stream: VideoStream, sample_period_sec: f64) -> Self {
    let stride = SampleStride::new(stream.fps, sample_period_sec);
    debug!(
      "视频帧率 {:.3}，采样步长 {} 帧",
      stride.fps(),
      stride.stride()
    );
    FrameSource::SampledVideo(Sampler::new(stream.frames, stride))
  }
}

impl Iterator for FrameSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      FrameSource::SingleImage(image) | FrameSource::LiveFrame(image) => {
        image.take().map(|image| Ok(Frame::still(image)))
      }
      FrameSource::SampledVideo(sampler) => sampler.next(),
    }
  }
}

mod sampling;
pub use self::sampling::{SampleStride, Sampler};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_video;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_video::{GStreamerVideoDecoder, GStreamerVideoInput};
