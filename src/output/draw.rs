// 该文件是 Huanliu （环流） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{GrayImage, Rgb};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::{
  frame::{PixelOrder, RawFrame},
  labels::Labels,
  model::{BoundingBox, Detections, color_for_class},
};

// 未指定字体时使用内置的 DejaVu Sans
const DEFAULT_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_TEXT_HEIGHT: i32 = 22;
const LABEL_CHAR_WIDTH: f32 = 10.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const MASK_ALPHA: f32 = 0.5;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 在原始帧上原地绘制检测框、标签和掩码
pub struct Draw {
  font: FontArc,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
}

impl Draw {
  pub fn new(font_path: Option<&Path>) -> Result<Self, DrawError> {
    let font = match font_path {
      Some(path) => {
        let font = FontArc::try_from_vec(std::fs::read(path)?)?;
        info!("加载标签字体: {}", path.display());
        font
      }
      None => FontArc::try_from_slice(DEFAULT_FONT)?,
    };
    Ok(Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
    })
  }

  pub fn draw_detections(&self, frame: &mut RawFrame, detections: &Detections, labels: &Labels) {
    if frame.is_empty() {
      return;
    }
    let order = frame.order();

    for item in detections.iter() {
      let color = color_for_class(item.class_id);
      if let Some(mask) = item.mask {
        overlay_mask(frame, mask, color);
      }
      let label = format!("{} {:.2}", labels.name(item.class_id), item.score);
      self.draw_bbox_with_label(frame, item.bbox, &label, order.pixel(color), order);
    }
  }

  fn draw_bbox_with_label(
    &self,
    frame: &mut RawFrame,
    bbox: &BoundingBox,
    label: &str,
    color: Rgb<u8>,
    order: PixelOrder,
  ) {
    let (w, h) = (frame.width() as i32, frame.height() as i32);

    let x_min = (bbox.x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y_max.ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let image = frame.image_mut();
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }

    // 估算文本大小
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let text_height = self.label_text_height;

    // 标签放在边框上方，空间不足时贴着图像顶部
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;

    if label_width == 0 {
      return;
    }
    let rect = Rect::at(label_x, label_y).of_size(label_width, text_height as u32);
    draw_filled_rect_mut(image, rect, color);

    draw_text_mut(
      image,
      order.pixel(TEXT_COLOR),
      label_x,
      label_y + self.label_text_vertical_padding,
      PxScale::from(self.font_size),
      &self.font,
      label,
    );
  }
}

/// 掩码为 255 的像素与类别颜色按固定透明度混合
fn overlay_mask(frame: &mut RawFrame, mask: &GrayImage, color: [u8; 3]) {
  let order = frame.order();
  let color = order.pixel(color).0;
  let (w, h) = (
    frame.width().min(mask.width()),
    frame.height().min(mask.height()),
  );
  let image = frame.image_mut();
  for y in 0..h {
    for x in 0..w {
      if mask.get_pixel(x, y).0[0] == 0 {
        continue;
      }
      let px = image.get_pixel_mut(x, y);
      for c in 0..3 {
        let blended = px.0[c] as f32 * (1.0 - MASK_ALPHA) + color[c] as f32 * MASK_ALPHA;
        px.0[c] = blended.round() as u8;
      }
    }
  }
}
