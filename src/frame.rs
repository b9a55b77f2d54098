// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 帧与模型输入张量定义
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

use image::{ImageBuffer, Rgb, RgbImage, imageops};

const RGB_CHANNELS: usize = 3;
const LETTERBOX_FILL: [u8; 3] = [114, 114, 114];

/// 帧数据
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引（原始视频中的序号）
  pub index: u64,
  /// 时间戳（秒）
  pub timestamp_sec: f64,
}

impl Frame {
  /// 单张图像，时间戳固定为 0
  pub fn still(image: RgbImage) -> Self {
    Self {
      image,
      index: 0,
      timestamp_sec: 0.0,
    }
  }
}

/// 信箱缩放参数，用于把模型输入坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub src_width: u32,
  pub src_height: u32,
}

impl Letterbox {
  /// 计算将 `src_width`x`src_height` 等比放入 `width`x`height` 的参数
  pub fn fit(src_width: u32, src_height: u32, width: u32, height: u32) -> Self {
    let scale_w = width as f32 / src_width.max(1) as f32;
    let scale_h = height as f32 / src_height.max(1) as f32;
    let scale = scale_w.min(scale_h);

    let (new_w, new_h) = Self::scaled_size(src_width, src_height, width, height, scale);

    Self {
      scale,
      pad_x: ((width - new_w) / 2) as f32,
      pad_y: ((height - new_h) / 2) as f32,
      src_width,
      src_height,
    }
  }

  fn scaled_size(src_width: u32, src_height: u32, width: u32, height: u32, scale: f32) -> (u32, u32) {
    let new_w = ((src_width as f32) * scale).round() as u32;
    let new_h = ((src_height as f32) * scale).round() as u32;
    (new_w.clamp(1, width), new_h.clamp(1, height))
  }

  /// 模型输入坐标 -> 原图坐标（截断到图像范围内）
  pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
    let sx = (x - self.pad_x) / self.scale;
    let sy = (y - self.pad_y) / self.scale;
    (
      sx.clamp(0.0, self.src_width as f32),
      sy.clamp(0.0, self.src_height as f32),
    )
  }
}

/// 等比缩放并以灰色填充到 `width`x`height`
pub fn letterbox(image: &RgbImage, width: u32, height: u32) -> (RgbImage, Letterbox) {
  let params = Letterbox::fit(image.width(), image.height(), width, height);
  let (new_w, new_h) =
    Letterbox::scaled_size(image.width(), image.height(), width, height, params.scale);

  let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);
  let mut canvas: RgbImage = ImageBuffer::from_pixel(width, height, Rgb(LETTERBOX_FILL));
  imageops::replace(
    &mut canvas,
    &resized,
    params.pad_x as i64,
    params.pad_y as i64,
  );

  (canvas, params)
}

/// 归一化到 [0, 1] 的 NCHW 浮点张量
#[derive(Debug, Clone)]
pub struct RgbNchwFrame {
  width: usize,
  height: usize,
  data: Box<[f32]>,
}

impl RgbNchwFrame {
  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height, self.width]
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }
}

impl From<&RgbImage> for RgbNchwFrame {
  fn from(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    let plane = width * height;
    let mut data = vec![0f32; RGB_CHANNELS * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = (y as usize) * width + (x as usize);
      for c in 0..RGB_CHANNELS {
        data[c * plane + idx] = pixel[c] as f32 / 255.0;
      }
    }

    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }
}

/// NHWC 排布的 8 位张量
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame {
  data: Box<[u8]>,
}

impl RgbNhwcFrame {
  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

impl From<RgbImage> for RgbNhwcFrame {
  fn from(image: RgbImage) -> Self {
    Self {
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn letterbox_landscape_pads_vertically() {
    let params = Letterbox::fit(1280, 720, 640, 640);
    assert_eq!(params.scale, 0.5);
    assert_eq!(params.pad_x, 0.0);
    assert_eq!(params.pad_y, 140.0);

    let (x, y) = params.to_source(320.0, 320.0);
    assert!((x - 640.0).abs() < 1e-3);
    assert!((y - 360.0).abs() < 1e-3);
  }

  #[test]
  fn to_source_clamps_into_image() {
    let params = Letterbox::fit(100, 50, 640, 640);
    let (x, y) = params.to_source(-10.0, 639.0);
    assert_eq!(x, 0.0);
    assert_eq!(y, 50.0);
  }

  #[test]
  fn letterbox_canvas_has_target_size() {
    let image = RgbImage::from_pixel(300, 100, Rgb([255, 0, 0]));
    let (canvas, params) = letterbox(&image, 64, 64);
    assert_eq!(canvas.dimensions(), (64, 64));
    // 填充区保持灰色，中心为原图内容
    assert_eq!(canvas.get_pixel(32, 0), &Rgb(LETTERBOX_FILL));
    assert_eq!(canvas.get_pixel(32, 32)[0], 255);
    assert!(params.pad_y > 0.0);
  }

  #[test]
  fn nchw_splits_channels_into_planes() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(0, 0, Rgb([255, 0, 0]));
    image.put_pixel(1, 0, Rgb([0, 0, 255]));
    let frame = RgbNchwFrame::from(&image);
    assert_eq!(frame.shape(), [1, 3, 1, 2]);
    assert_eq!(frame.as_nchw(), &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
  }
}
