// 该文件是 Huanliu （环流） 项目的一部分。
// src/model/decode.rs - 检测输出解码
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{GrayImage, Luma, imageops};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  config::InferenceConfig,
  model::{BoundingBox, Detections, EngineError, TensorView},
};

const BOX_COORDS: usize = 4;
const MASK_ON: u8 = 255;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("模型输出数量不足: 需要 {expected}, 实际 {actual}")]
  MissingOutputs { expected: usize, actual: usize },
  #[error("{name} 张量形状不符: {shape:?}")]
  UnexpectedShape { name: &'static str, shape: Vec<usize> },
  #[error("检测数量不一致: 边框 {boxes}, 其他输出 {other}")]
  DetectionCountMismatch { boxes: usize, other: usize },
  #[error("张量数据长度 {actual} 与形状 {shape:?} 不符")]
  DataLengthMismatch { shape: Vec<usize>, actual: usize },
  #[error("分类数必须至少为 2 (含背景类), 实际 {0}")]
  TooFewClasses(usize),
  #[error("推理后端错误: {0}")]
  Engine(#[from] EngineError),
}

pub fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 中心格式 `(cx, cy, w, h)` 转角点格式
pub fn cxcywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
  BoundingBox {
    x_min: cx - w / 2.0,
    y_min: cy - h / 2.0,
    x_max: cx + w / 2.0,
    y_max: cy + h / 2.0,
  }
}

/// 宽高方向独立缩放
pub fn scale_box(bbox: &BoundingBox, scale_w: f32, scale_h: f32) -> BoundingBox {
  BoundingBox {
    x_min: bbox.x_min * scale_w,
    y_min: bbox.y_min * scale_h,
    x_max: bbox.x_max * scale_w,
    y_max: bbox.y_max * scale_h,
  }
}

/// 在排除第 0 列（背景）后选出得分最高的类别
///
/// 返回 `(class_id, score)`，其中 `class_id = 列下标 - 1`。
pub fn best_class(logits: &[f32]) -> Option<(u32, f32)> {
  let mut best: Option<(usize, f32)> = None;
  for (column, logit) in logits.iter().enumerate().skip(1) {
    let score = sigmoid(*logit);
    if best.is_none_or(|(_, s)| score > s) {
      best = Some((column, score));
    }
  }
  best.map(|(column, score)| ((column - 1) as u32, score))
}

/// 按黄金角分布色相为类别生成稳定的颜色 (RGB)
pub fn color_for_class(class_id: u32) -> [u8; 3] {
  // 色相按 OpenCV 的 0..180 表示计算，再换算为角度
  let hue = ((class_id as u64 * 137) % 180) as f32 * 2.0;
  hsv_to_rgb(hue, 200.0 / 255.0, 200.0 / 255.0)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
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

  [
    ((r + m) * 255.0).round() as u8,
    ((g + m) * 255.0).round() as u8,
    ((b + m) * 255.0).round() as u8,
  ]
}

fn check_len(view: &TensorView<'_>) -> Result<(), DecodeError> {
  let expected: usize = view.shape.iter().product();
  if expected != view.data.len() {
    return Err(DecodeError::DataLengthMismatch {
      shape: view.shape.to_vec(),
      actual: view.data.len(),
    });
  }
  Ok(())
}

/// 检查 `[1, D, K]` 形状，返回 `(D, K)`
fn dims3(name: &'static str, view: &TensorView<'_>) -> Result<(usize, usize), DecodeError> {
  match view.shape {
    [1, d, k] => {
      check_len(view)?;
      Ok((*d, *k))
    }
    _ => Err(DecodeError::UnexpectedShape {
      name,
      shape: view.shape.to_vec(),
    }),
  }
}

/// 判断是否为 `[1, D, 4]` 的边框张量
pub fn is_box_tensor(view: &TensorView<'_>) -> bool {
  matches!(view.shape, [1, _, BOX_COORDS])
}

/// 按形状识别边框与分类输出，返回 `(boxes, logits)`
///
/// 期望顺序为 `boxes, logits`；若第一个不是 `[1, D, 4]` 而第二个是，则交换。
/// 两者都是 `[1, D, 4]`（模型恰好有 4 列分类）时无法区分，保持原顺序。
pub fn split_box_logits<'a>(
  first: TensorView<'a>,
  second: TensorView<'a>,
) -> (TensorView<'a>, TensorView<'a>) {
  match (is_box_tensor(&first), is_box_tensor(&second)) {
    (false, true) => {
      debug!("输出顺序为 logits, boxes, 已交换");
      (second, first)
    }
    (true, true) => {
      warn!("两个输出的形状都是 [1, D, 4], 按 boxes, logits 的顺序解析");
      (first, second)
    }
    _ => (first, second),
  }
}

/// 检测输出解码器
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
  resolution: f32,
  threshold: f32,
  mask_threshold: f32,
  max_detections: usize,
}

impl DetectionDecoder {
  pub fn new(resolution: u32, threshold: f32) -> Self {
    Self {
      resolution: resolution as f32,
      threshold,
      mask_threshold: 0.0,
      max_detections: 0,
    }
  }

  /// 使用已解析分辨率的推理配置构建
  pub fn from_config(config: &InferenceConfig) -> Self {
    Self::new(config.resolution, config.threshold)
      .with_mask_threshold(config.mask_threshold)
      .with_max_detections(config.max_detections)
  }

  pub fn with_mask_threshold(mut self, mask_threshold: f32) -> Self {
    self.mask_threshold = mask_threshold;
    self
  }

  /// 保留的最大检测数量，0 表示不限制
  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  fn is_full(&self, out: &Detections) -> bool {
    self.max_detections > 0 && out.len() >= self.max_detections
  }

  /// 解码 `boxes: [1, D, 4]` 与 `logits: [1, D, C]`，结果追加到 `out`
  ///
  /// 返回每个保留检测在输入中的下标（与 `out` 中新增的条目一一对应）。
  pub fn decode(
    &self,
    boxes: TensorView<'_>,
    logits: TensorView<'_>,
    scale_w: f32,
    scale_h: f32,
    out: &mut Detections,
  ) -> Result<Vec<usize>, DecodeError> {
    let (num_boxes, coords) = dims3("boxes", &boxes)?;
    if coords != BOX_COORDS {
      return Err(DecodeError::UnexpectedShape {
        name: "boxes",
        shape: boxes.shape.to_vec(),
      });
    }
    let (num_dets, num_classes) = dims3("logits", &logits)?;
    if num_dets != num_boxes {
      return Err(DecodeError::DetectionCountMismatch {
        boxes: num_boxes,
        other: num_dets,
      });
    }
    if num_classes < 2 {
      return Err(DecodeError::TooFewClasses(num_classes));
    }

    let mut kept = Vec::new();
    for det in 0..num_dets {
      if self.is_full(out) {
        debug!("达到最大检测数量 {}, 丢弃剩余检测", self.max_detections);
        break;
      }

      let row = &logits.data[det * num_classes..(det + 1) * num_classes];
      let Some((class_id, score)) = best_class(row) else {
        continue;
      };
      if score <= self.threshold {
        continue;
      }

      let b = &boxes.data[det * BOX_COORDS..(det + 1) * BOX_COORDS];
      let bbox = cxcywh_to_xyxy(
        b[0] * self.resolution,
        b[1] * self.resolution,
        b[2] * self.resolution,
        b[3] * self.resolution,
      );
      out.push(class_id, score, scale_box(&bbox, scale_w, scale_h));
      kept.push(det);
    }

    debug!("检测到 {} 个物体 (共 {} 个候选)", kept.len(), num_dets);
    Ok(kept)
  }

  /// 分割模式：额外解码 `masks: [1, D, Hm, Wm]`，掩码缩放到原始帧大小
  #[allow(clippy::too_many_arguments)]
  pub fn decode_segmentation(
    &self,
    boxes: TensorView<'_>,
    logits: TensorView<'_>,
    masks: TensorView<'_>,
    scale_w: f32,
    scale_h: f32,
    orig_w: u32,
    orig_h: u32,
    out: &mut Detections,
  ) -> Result<Vec<usize>, DecodeError> {
    let (num_masks, mask_h, mask_w) = match masks.shape {
      [1, d, h, w] => {
        check_len(&masks)?;
        (*d, *h, *w)
      }
      _ => {
        return Err(DecodeError::UnexpectedShape {
          name: "masks",
          shape: masks.shape.to_vec(),
        });
      }
    };
    if num_masks != boxes.shape.get(1).copied().unwrap_or_default() {
      return Err(DecodeError::DetectionCountMismatch {
        boxes: boxes.shape.get(1).copied().unwrap_or_default(),
        other: num_masks,
      });
    }

    let kept = self.decode(boxes, logits, scale_w, scale_h, out)?;

    let plane = mask_h * mask_w;
    for det in &kept {
      let logits = &masks.data[det * plane..(det + 1) * plane];
      let binary = GrayImage::from_fn(mask_w as u32, mask_h as u32, |x, y| {
        let v = logits[y as usize * mask_w + x as usize];
        Luma([if v > self.mask_threshold { MASK_ON } else { 0 }])
      });
      let mask = if (mask_w as u32, mask_h as u32) == (orig_w, orig_h) {
        binary
      } else {
        imageops::resize(&binary, orig_w, orig_h, imageops::FilterType::Nearest)
      };
      out.masks.push(mask);
    }

    Ok(kept)
  }
}
