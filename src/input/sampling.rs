// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/sampling.rs - 视频帧采样
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

use image::RgbImage;
use tracing::warn;

use super::InputError;
use crate::frame::Frame;

/// 采样步长，由帧率和采样间隔一次性算出
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStride {
  fps: f64,
  stride: u64,
}

impl SampleStride {
  /// 帧率无效（<= 0 或非有限值）时按 1 fps 处理，并对每一帧采样
  pub fn new(fps: f64, sample_period_sec: f64) -> Self {
    if !fps.is_finite() || fps <= 0.0 {
      warn!("视频帧率无效 ({})，按 1 fps 处理并采样每一帧", fps);
      return Self {
        fps: 1.0,
        stride: 1,
      };
    }

    let stride = (fps * sample_period_sec).round();
    let stride = if stride.is_finite() && stride >= 1.0 {
      stride as u64
    } else {
      1
    };
    Self { fps, stride }
  }

  pub fn fps(&self) -> f64 {
    self.fps
  }

  pub fn stride(&self) -> u64 {
    self.stride
  }

  pub fn selects(&self, frame_index: u64) -> bool {
    frame_index % self.stride == 0
  }

  pub fn timestamp(&self, frame_index: u64) -> f64 {
    frame_index as f64 / self.fps
  }
}

/// 在原始帧序列上按步长挑选帧，并附上帧号与时间戳
///
/// 与具体解码器无关；一旦底层返回错误就不再继续读取。
pub struct Sampler<I> {
  inner: I,
  stride: SampleStride,
  next_index: u64,
  failed: bool,
}

impl<I> Sampler<I> {
  pub fn new(inner: I, stride: SampleStride) -> Self {
    Self {
      inner,
      stride,
      next_index: 0,
      failed: false,
    }
  }
}

impl<I> Iterator for Sampler<I>
where
  I: Iterator<Item = Result<RgbImage, InputError>>,
{
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.failed {
      return None;
    }

    loop {
      let raw = self.inner.next()?;
      let index = self.next_index;
      self.next_index += 1;

      match raw {
        Err(e) => {
          self.failed = true;
          return Some(Err(e));
        }
        Ok(image) if self.stride.selects(index) => {
          return Some(Ok(Frame {
            image,
            index,
            timestamp_sec: self.stride.timestamp(index),
          }));
        }
        Ok(_) => continue,
      }
    }
  }
}
