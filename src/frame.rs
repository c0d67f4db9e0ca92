// 该文件是 Huanliu （环流） 项目的一部分。
// src/frame.rs - 原始视频帧定义
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

use image::{Rgb, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("行步长 {stride} 小于行宽 {row}")]
  InvalidStride { stride: usize, row: usize },
}

/// 帧内像素的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrder {
  #[default]
  Rgb,
  Bgr,
}

impl PixelOrder {
  /// 将 RGB 颜色转为该顺序下的存储像素
  pub fn pixel(&self, rgb: [u8; 3]) -> Rgb<u8> {
    match self {
      PixelOrder::Rgb => Rgb(rgb),
      PixelOrder::Bgr => Rgb([rgb[2], rgb[1], rgb[0]]),
    }
  }

  /// 读取存储像素对应的 RGB 值
  pub fn to_rgb(&self, px: &[u8]) -> [u8; 3] {
    match self {
      PixelOrder::Rgb => [px[0], px[1], px[2]],
      PixelOrder::Bgr => [px[2], px[1], px[0]],
    }
  }
}

/// 可复用的 NHWC 像素缓冲
///
/// 只有在尺寸变化时才重新分配，同尺寸的后续帧直接覆盖原有存储。
#[derive(Debug, Clone)]
pub struct RawFrame {
  image: RgbImage,
  order: PixelOrder,
}

impl Default for RawFrame {
  fn default() -> Self {
    Self {
      image: RgbImage::new(0, 0),
      order: PixelOrder::default(),
    }
  }
}

impl From<RgbImage> for RawFrame {
  fn from(image: RgbImage) -> Self {
    Self {
      image,
      order: PixelOrder::Rgb,
    }
  }
}

impl RawFrame {
  pub fn new(width: u32, height: u32, order: PixelOrder) -> Self {
    Self {
      image: RgbImage::new(width, height),
      order,
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn order(&self) -> PixelOrder {
    self.order
  }

  pub fn is_empty(&self) -> bool {
    self.image.width() == 0 || self.image.height() == 0
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn image_mut(&mut self) -> &mut RgbImage {
    &mut self.image
  }

  pub fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }

  /// 调整为给定尺寸并返回可写缓冲
  pub fn reshape(&mut self, width: u32, height: u32, order: PixelOrder) -> &mut [u8] {
    if self.image.dimensions() != (width, height) {
      self.image = RgbImage::new(width, height);
    }
    self.order = order;
    &mut self.image
  }

  /// 按行复制带步长的打包像素数据
  pub fn fill_from(
    &mut self,
    width: u32,
    height: u32,
    order: PixelOrder,
    data: &[u8],
    stride: usize,
  ) -> Result<(), FrameError> {
    let row = width as usize * RGB_CHANNELS;
    if stride < row {
      return Err(FrameError::InvalidStride { stride, row });
    }
    let expected = if height == 0 {
      0
    } else {
      stride * (height as usize - 1) + row
    };
    if data.len() < expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    let dst = self.reshape(width, height, order);
    for (y, dst_row) in dst.chunks_exact_mut(row.max(1)).enumerate() {
      let start = y * stride;
      dst_row.copy_from_slice(&data[start..start + row]);
    }
    Ok(())
  }

  /// 输出 RGB 顺序的图像副本
  pub fn to_rgb_image(&self) -> RgbImage {
    match self.order {
      PixelOrder::Rgb => self.image.clone(),
      PixelOrder::Bgr => RgbImage::from_fn(self.width(), self.height(), |x, y| {
        Rgb(self.order.to_rgb(&self.image.get_pixel(x, y).0))
      }),
    }
  }
}
