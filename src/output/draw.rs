// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};

use crate::model::Detection;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const BOX_THICKNESS: u32 = 2;
const PALETTE_SIZE: usize = 80;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 边框与标签绘制
pub struct Draw {
  font: Option<FontArc>,
  font_scale: PxScale,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::boxes_only()
  }
}

impl Draw {
  /// 绘制边框与 `"label NN%"` 标签
  pub fn new(font: FontArc) -> Self {
    Self::with_font(Some(font))
  }

  /// 只绘制边框
  pub fn boxes_only() -> Self {
    Self::with_font(None)
  }

  fn with_font(font: Option<FontArc>) -> Self {
    // 每个类别一种颜色，色相均匀分布
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }

  pub fn color_of(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      self.draw_detection(image, detection);
    }
  }

  fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let [x1, y1, x2, y2] = detection.bbox;
    let x_min = (x1.floor() as i32).clamp(0, w - 1);
    let y_min = (y1.floor() as i32).clamp(0, h - 1);
    let x_max = (x2.ceil() as i32).clamp(0, w - 1);
    let y_max = (y2.ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_of(detection.class_id);
    let box_w = (x_max - x_min + 1) as u32;
    let box_h = (y_max - y_min + 1) as u32;

    // 边框向内加粗
    for t in 0..BOX_THICKNESS {
      let (inner_w, inner_h) = (box_w.saturating_sub(2 * t), box_h.saturating_sub(2 * t));
      if inner_w == 0 || inner_h == 0 {
        break;
      }
      let rect = Rect::at(x_min + t as i32, y_min + t as i32).of_size(inner_w, inner_h);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!(
      "{} {:.0}%",
      detection.class_label,
      detection.confidence * 100.0
    );
    let (text_w, text_h) = text_size(self.font_scale, font, &label);
    let label_w = text_w as i32 + 2 * LABEL_PADDING;
    let label_h = text_h as i32 + 2 * LABEL_PADDING;

    // 标签放在框上方，空间不足时放到框内
    let label_x = x_min;
    let label_y = if y_min >= label_h { y_min - label_h } else { y_min };

    let visible_w = label_w.min(w - label_x);
    let visible_h = label_h.min(h - label_y);
    if visible_w <= 0 || visible_h <= 0 {
      return;
    }

    let background = Rect::at(label_x, label_y).of_size(visible_w as u32, visible_h as u32);
    draw_filled_rect_mut(image, background, color);
    draw_text_mut(
      image,
      TEXT_COLOR,
      label_x + LABEL_PADDING,
      label_y + LABEL_PADDING,
      self.font_scale,
      font,
      &label,
    );
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn draws_two_pixel_border() {
    let draw = Draw::default();
    let mut image = RgbImage::new(20, 20);
    let det = Detection::new(0, "person", 0.5, [5.0, 5.0, 15.0, 15.0]);
    draw.draw_detections(&mut image, &[det]);

    let color = draw.color_of(0);
    assert_eq!(image.get_pixel(10, 5), &color);
    assert_eq!(image.get_pixel(10, 6), &color);
    assert_eq!(image.get_pixel(10, 7), &Rgb([0, 0, 0]));
    assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));
  }

  #[test]
  fn later_boxes_stack_on_top() {
    let draw = Draw::default();
    let mut image = RgbImage::new(20, 20);
    let first = Detection::new(0, "a", 0.5, [2.0, 2.0, 12.0, 12.0]);
    let second = Detection::new(40, "b", 0.5, [2.0, 2.0, 18.0, 18.0]);
    draw.draw_detections(&mut image, &[first, second]);
    assert_eq!(image.get_pixel(2, 2), &draw.color_of(40));
  }

  #[test]
  fn degenerate_and_outside_boxes_are_skipped() {
    let draw = Draw::default();
    let mut image = RgbImage::new(10, 10);
    draw.draw_detections(
      &mut image,
      &[
        Detection::new(0, "a", 0.5, [3.0, 3.0, 3.0, 8.0]),
        Detection::new(0, "b", 0.5, [50.0, 50.0, 60.0, 60.0]),
      ],
    );
    assert!(image.pixels().all(|p| p == &Rgb([0, 0, 0])));
  }

  #[test]
  fn caption_is_drawn_above_box_when_font_available() {
    let Some(font) = crate::output::find_system_font() else {
      return;
    };
    let det = Detection::new(3, "motorcycle", 0.92, [10.0, 40.0, 90.0, 90.0]);

    let mut captioned = RgbImage::new(100, 100);
    Draw::new(font).draw_detections(&mut captioned, std::slice::from_ref(&det));
    let mut boxed = RgbImage::new(100, 100);
    Draw::boxes_only().draw_detections(&mut boxed, &[det]);

    let color = Draw::boxes_only().color_of(3);
    let above_box = |image: &RgbImage| {
      (0..40)
        .flat_map(|y| (0..100).map(move |x| (x, y)))
        .filter(|&(x, y)| image.get_pixel(x, y) != &Rgb([0, 0, 0]))
        .count()
    };
    assert_eq!(above_box(&boxed), 0);
    assert!(above_box(&captioned) > 0);
    // 标签背景使用类别颜色，文字为白色
    assert_eq!(captioned.get_pixel(10, 39), &color);
    assert!(captioned.pixels().any(|p| p.0.iter().all(|&c| c > 200)));
  }

  #[test]
  fn palette_is_distinct() {
    let draw = Draw::default();
    assert_ne!(draw.color_of(0), draw.color_of(20));
    assert_eq!(draw.color_of(1), draw.color_of(81));
  }
}
