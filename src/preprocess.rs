// 该文件是 Huanliu （环流） 项目的一部分。
// src/preprocess.rs - 模型输入预处理
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

use image::imageops::{self, FilterType};
use thiserror::Error;

use crate::frame::{RGB_CHANNELS, RawFrame};

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("输入帧为空")]
  EmptyFrame,
  #[error("张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  TensorSizeMismatch { expected: usize, actual: usize },
}

/// 缩放、转为 RGB、归一化到 [0, 1] 并以 CHW 布局写入 `tensor`
///
/// `tensor` 的每个元素都会被覆盖。
pub fn preprocess_frame(
  frame: &RawFrame,
  tensor: &mut [f32],
  resolution: u32,
  means: &[f32; 3],
  stds: &[f32; 3],
) -> Result<(), PreprocessError> {
  if frame.is_empty() {
    return Err(PreprocessError::EmptyFrame);
  }
  let plane = resolution as usize * resolution as usize;
  let expected = RGB_CHANNELS * plane;
  if tensor.len() != expected {
    return Err(PreprocessError::TensorSizeMismatch {
      expected,
      actual: tensor.len(),
    });
  }

  let resized;
  let pixels = if frame.width() == resolution && frame.height() == resolution {
    frame.as_nhwc()
  } else {
    resized = imageops::resize(frame.image(), resolution, resolution, FilterType::Triangle);
    resized.as_raw().as_slice()
  };

  let order = frame.order();
  for (idx, px) in pixels.chunks_exact(RGB_CHANNELS).enumerate() {
    let rgb = order.to_rgb(px);
    for c in 0..RGB_CHANNELS {
      tensor[c * plane + idx] = rgb[c] as f32 / 255.0;
    }
  }

  normalize_image(tensor, plane, means, stds);
  Ok(())
}

/// 按通道执行 `(x - mean) / std`，`tensor` 为 CHW 布局
pub fn normalize_image(tensor: &mut [f32], plane: usize, means: &[f32; 3], stds: &[f32; 3]) {
  for (c, channel) in tensor.chunks_exact_mut(plane.max(1)).take(RGB_CHANNELS).enumerate() {
    let (mean, std) = (means[c], stds[c]);
    for v in channel {
      *v = (*v - mean) / std;
    }
  }
}
