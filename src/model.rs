// 该文件是 Huanliu （环流） 项目的一部分。
// src/model.rs - 模型与推理后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("无法自动检测模型输入分辨率")]
  ResolutionUndetectable,
  #[error("输出索引越界: {index} (共 {count} 个输出)")]
  OutputIndexOutOfRange { index: usize, count: usize },
  #[error("输出张量大小不匹配: 期望 {expected}, 实际 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("输出形状无效: {0:?}")]
  InvalidShape(Vec<i64>),
  #[error("推理后端错误: {0}")]
  Backend(String),
}

/// 注入的推理能力
///
/// 流水线只通过该接口与推理运行时交互，输出通过 [`InferenceEngine::get_output_data`]
/// 复制到调用方缓冲，不与后端内部存储产生别名。
pub trait InferenceEngine: Send {
  /// 加载模型。形状中的 0 维度表示由模型自动检测，返回实际使用的输入形状。
  fn initialize(&mut self, model_path: &Path, input_shape: &[i64]) -> Result<Vec<i64>, EngineError>;

  fn run_inference(&mut self, input: &[f32], input_shape: &[i64]) -> Result<(), EngineError>;

  fn output_count(&self) -> usize;

  /// 将第 `index` 个输出复制到 `dst`，`dst.len()` 即期望的元素数量
  fn get_output_data(&self, index: usize, dst: &mut [f32]) -> Result<(), EngineError>;

  fn get_output_shape(&self, index: usize) -> Result<Vec<i64>, EngineError>;

  fn backend_name(&self) -> &str {
    "unknown"
  }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn initialize(&mut self, model_path: &Path, input_shape: &[i64]) -> Result<Vec<i64>, EngineError> {
    (**self).initialize(model_path, input_shape)
  }

  fn run_inference(&mut self, input: &[f32], input_shape: &[i64]) -> Result<(), EngineError> {
    (**self).run_inference(input, input_shape)
  }

  fn output_count(&self) -> usize {
    (**self).output_count()
  }

  fn get_output_data(&self, index: usize, dst: &mut [f32]) -> Result<(), EngineError> {
    (**self).get_output_data(index, dst)
  }

  fn get_output_shape(&self, index: usize) -> Result<Vec<i64>, EngineError> {
    (**self).get_output_shape(index)
  }

  fn backend_name(&self) -> &str {
    (**self).backend_name()
  }
}

/// 从推理后端复制出的一个输出张量，缓冲在帧之间复用
#[derive(Debug, Default, Clone)]
pub struct OutputTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl OutputTensor {
  pub fn fetch<E: InferenceEngine + ?Sized>(
    &mut self,
    engine: &E,
    index: usize,
  ) -> Result<(), EngineError> {
    let raw_shape = engine.get_output_shape(index)?;
    self.shape.clear();
    for dim in &raw_shape {
      let dim = usize::try_from(*dim).map_err(|_| EngineError::InvalidShape(raw_shape.clone()))?;
      self.shape.push(dim);
    }
    let len = self.shape.iter().product();
    self.data.resize(len, 0.0);
    engine.get_output_data(index, &mut self.data)
  }

  pub fn view(&self) -> TensorView<'_> {
    TensorView {
      shape: &self.shape,
      data: &self.data,
    }
  }
}

/// 只读张量视图
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
  pub shape: &'a [usize],
  pub data: &'a [f32],
}

impl<'a> TensorView<'a> {
  pub fn new(shape: &'a [usize], data: &'a [f32]) -> Self {
    Self { shape, data }
  }
}

/// 角点格式的边界框 `[x_min, y_min, x_max, y_max]`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BoundingBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }

  pub fn width(&self) -> f32 {
    self.x_max - self.x_min
  }

  pub fn height(&self) -> f32 {
    self.y_max - self.y_min
  }

  /// 转回中心格式 `(cx, cy, w, h)`
  pub fn to_cxcywh(&self) -> [f32; 4] {
    [
      (self.x_min + self.x_max) / 2.0,
      (self.y_min + self.y_max) / 2.0,
      self.width(),
      self.height(),
    ]
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.x_min, self.y_min, self.x_max, self.y_max]
  }
}

/// 单个检测结果的借用视图
#[derive(Debug, Clone, Copy)]
pub struct DetectItem<'a> {
  pub class_id: u32,
  pub score: f32,
  pub bbox: &'a BoundingBox,
  pub mask: Option<&'a GrayImage>,
}

/// 一帧的检测输出，各字段按下标对齐
#[derive(Debug, Clone, Default)]
pub struct Detections {
  pub scores: Vec<f32>,
  pub class_ids: Vec<u32>,
  pub boxes: Vec<BoundingBox>,
  /// 二值掩码 (0 / 255)，仅分割模式下填充
  pub masks: Vec<GrayImage>,
}

impl Detections {
  pub fn clear(&mut self) {
    self.scores.clear();
    self.class_ids.clear();
    self.boxes.clear();
    self.masks.clear();
  }

  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  pub fn push(&mut self, class_id: u32, score: f32, bbox: BoundingBox) {
    self.scores.push(score);
    self.class_ids.push(class_id);
    self.boxes.push(bbox);
  }

  pub fn iter(&self) -> impl Iterator<Item = DetectItem<'_>> {
    self
      .scores
      .iter()
      .zip(&self.class_ids)
      .zip(&self.boxes)
      .enumerate()
      .map(|(i, ((score, class_id), bbox))| DetectItem {
        class_id: *class_id,
        score: *score,
        bbox,
        mask: self.masks.get(i),
      })
  }
}

mod decode;
pub use self::decode::{
  DecodeError, DetectionDecoder, best_class, color_for_class, cxcywh_to_xyxy, is_box_tensor,
  scale_box, sigmoid, split_box_logits,
};

#[cfg(feature = "onnx_backend")]
mod onnx;
#[cfg(feature = "onnx_backend")]
pub use self::onnx::OnnxEngine;
