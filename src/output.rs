// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 检测结果输出
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

use std::path::Path;

use ab_glyph::FontArc;
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Detection;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// 常见发行版上的字体位置
const SYSTEM_FONTS: &[&str] = &[
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/usr/share/fonts/noto/NotoSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image encoding error: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("Invalid font {path}: {reason}")]
  InvalidFont { path: String, reason: String },
  #[error("No usable font found; pass --font or set SHANAN_FONT")]
  FontNotFound,
}

/// 把检测结果画到图像副本上并编码为 JPEG
pub struct Annotator {
  draw: Draw,
  quality: u8,
}

/// 只绘制边框，不带标签文字
impl Default for Annotator {
  fn default() -> Self {
    Self::new(Draw::default(), DEFAULT_JPEG_QUALITY)
  }
}

impl Annotator {
  pub fn new(draw: Draw, quality: u8) -> Self {
    Self {
      draw,
      quality: quality.clamp(1, 100),
    }
  }

  /// 按检测顺序绘制，后画的框叠在前面的框之上；不修改输入图像
  pub fn annotate(&self, image: &RgbImage, detections: &[Detection]) -> Result<Vec<u8>, OutputError> {
    let mut canvas = image.clone();
    self.draw.draw_detections(&mut canvas, detections);
    let bytes = encode_jpeg(&canvas, self.quality)?;
    debug!(
      "绘制 {} 个检测框，编码后 {} 字节",
      detections.len(),
      bytes.len()
    );
    Ok(bytes)
  }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, OutputError> {
  let mut bytes = Vec::new();
  let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
  encoder.encode_image(image)?;
  Ok(bytes)
}

/// 加载标签字体：优先使用指定路径，否则在系统字体目录中查找
pub fn load_font(path: Option<&Path>) -> Result<FontArc, OutputError> {
  if let Some(path) = path {
    let font = read_font(path)?;
    info!("使用字体: {}", path.display());
    return Ok(font);
  }

  find_system_font().ok_or_else(|| {
    warn!("未找到可用字体");
    OutputError::FontNotFound
  })
}

pub fn find_system_font() -> Option<FontArc> {
  SYSTEM_FONTS
    .iter()
    .map(Path::new)
    .filter(|path| path.is_file())
    .find_map(|path| match read_font(path) {
      Ok(font) => {
        info!("使用系统字体: {}", path.display());
        Some(font)
      }
      Err(e) => {
        debug!("跳过字体 {}: {}", path.display(), e);
        None
      }
    })
}

fn read_font(path: &Path) -> Result<FontArc, OutputError> {
  let data = std::fs::read(path)?;
  FontArc::try_from_vec(data).map_err(|e| OutputError::InvalidFont {
    path: path.display().to_string(),
    reason: e.to_string(),
  })
}

pub mod draw;
pub use self::draw::Draw;

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn annotate_without_detections_keeps_size() {
    let image = RgbImage::from_pixel(64, 48, Rgb([200, 100, 50]));
    let bytes = Annotator::default().annotate(&image, &[]).unwrap();
    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
  }

  #[test]
  fn annotate_leaves_input_untouched() {
    let image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
    let det = Detection::new(1, "bicycle", 0.9, [8.0, 8.0, 40.0, 40.0]);
    let bytes = Annotator::default().annotate(&image, &[det]).unwrap();
    assert!(image.pixels().all(|p| p == &Rgb([0, 0, 0])));

    let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
    let border = decoded.get_pixel(24, 8);
    assert!(border[0] > 60 || border[1] > 60 || border[2] > 60);
  }

  #[test]
  fn encoded_bytes_are_jpeg() {
    let bytes = encode_jpeg(&RgbImage::new(4, 4), 80).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    let result = load_font(Some(Path::new("/nonexistent/font.ttf")));
    assert!(matches!(result, Err(OutputError::IoError(_))));
  }

  #[test]
  fn default_font_lookup_fails_without_system_font() {
    match (find_system_font(), load_font(None)) {
      (Some(_), result) => assert!(result.is_ok()),
      (None, result) => assert!(matches!(result, Err(OutputError::FontNotFound))),
    }
  }

  #[test]
  fn invalid_font_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.ttf");
    std::fs::write(&path, b"not a font").unwrap();
    assert!(matches!(
      load_font(Some(&path)),
      Err(OutputError::InvalidFont { .. })
    ));
  }
}
