// 该文件是 Huanliu （环流） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

pub const DEFAULT_RING_BUFFER_SIZE: usize = 8;
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MASK_THRESHOLD: f32 = 0.0;
pub const DEFAULT_MAX_DETECTIONS: usize = 300;
pub const IMAGENET_MEANS: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STDS: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("环形缓冲区大小必须大于 0")]
  EmptyRingBuffer,
  #[error("标准差必须为正数: {0:?}")]
  InvalidStd([f32; 3]),
  #[error("阈值超出范围 (0.0 - 1.0): {0}")]
  InvalidThreshold(f32),
  #[error("无法自动检测模型输入分辨率, 模型给出的形状: {0:?}")]
  UnresolvedResolution(Vec<i64>),
}

/// 模型类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelType {
  #[default]
  Detection,
  Segmentation,
}

/// 推理相关配置
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
  /// 模型输入分辨率，0 表示由模型自动检测
  pub resolution: u32,
  pub model_type: ModelType,
  pub max_detections: usize,
  pub threshold: f32,
  pub mask_threshold: f32,
  pub means: [f32; 3],
  pub stds: [f32; 3],
}

impl Default for InferenceConfig {
  fn default() -> Self {
    Self {
      resolution: 0,
      model_type: ModelType::Detection,
      max_detections: DEFAULT_MAX_DETECTIONS,
      threshold: DEFAULT_THRESHOLD,
      mask_threshold: DEFAULT_MASK_THRESHOLD,
      means: IMAGENET_MEANS,
      stds: IMAGENET_STDS,
    }
  }
}

impl InferenceConfig {
  pub fn with_resolution(mut self, resolution: u32) -> Self {
    self.resolution = resolution;
    self
  }

  pub fn with_model_type(mut self, model_type: ModelType) -> Self {
    self.model_type = model_type;
    self
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_mask_threshold(mut self, mask_threshold: f32) -> Self {
    self.mask_threshold = mask_threshold;
    self
  }

  pub fn with_max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn with_normalization(mut self, means: [f32; 3], stds: [f32; 3]) -> Self {
    self.means = means;
    self.stds = stds;
    self
  }

  pub fn is_segmentation(&self) -> bool {
    self.model_type == ModelType::Segmentation
  }

  /// 模型输入形状 `[1, 3, res, res]`
  pub fn input_shape(&self) -> Vec<i64> {
    let res = self.resolution as i64;
    vec![1, 3, res, res]
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.threshold) {
      return Err(ConfigError::InvalidThreshold(self.threshold));
    }
    if self.stds.iter().any(|s| !(*s > 0.0)) {
      return Err(ConfigError::InvalidStd(self.stds));
    }
    Ok(())
  }
}

/// 从推理后端返回的形状中解析正方形分辨率
pub fn resolution_from_shape(shape: &[i64]) -> Result<u32, ConfigError> {
  match shape {
    [_, _, h, w] if h == w && *h > 0 && *h <= u32::MAX as i64 => Ok(*h as u32),
    _ => Err(ConfigError::UnresolvedResolution(shape.to_vec())),
  }
}

/// 视频流水线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub video_path: Url,
  pub model_path: PathBuf,
  pub label_path: PathBuf,
  pub output_path: Url,
  pub inference_config: InferenceConfig,
  pub ring_buffer_size: usize,
  pub display: bool,
  /// 标签文字使用的 TTF 字体，未设置时只绘制边框
  pub font_path: Option<PathBuf>,
  /// 逐帧检测结果 (JSON Lines) 的输出路径
  pub records_path: Option<PathBuf>,
}

impl PipelineConfig {
  pub fn new(video_path: Url, model_path: PathBuf, label_path: PathBuf, output_path: Url) -> Self {
    Self {
      video_path,
      model_path,
      label_path,
      output_path,
      inference_config: InferenceConfig::default(),
      ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
      display: false,
      font_path: None,
      records_path: None,
    }
  }

  pub fn with_inference_config(mut self, inference_config: InferenceConfig) -> Self {
    self.inference_config = inference_config;
    self
  }

  pub fn with_ring_buffer_size(mut self, ring_buffer_size: usize) -> Self {
    self.ring_buffer_size = ring_buffer_size;
    self
  }

  pub fn with_display(mut self, display: bool) -> Self {
    self.display = display;
    self
  }

  pub fn with_font_path(mut self, font_path: Option<PathBuf>) -> Self {
    self.font_path = font_path;
    self
  }

  pub fn with_records_path(mut self, records_path: Option<PathBuf>) -> Self {
    self.records_path = records_path;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.ring_buffer_size == 0 {
      return Err(ConfigError::EmptyRingBuffer);
    }
    self.inference_config.validate()
  }
}
