// 该文件是 Huanliu （环流） 项目的一部分。
// src/bin/video_pipeline.rs - 视频检测流水线
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use huanliu::{
  FromUrl, InferenceConfig, ModelType, Pipeline, PipelineConfig,
  config::{DEFAULT_MASK_THRESHOLD, DEFAULT_MAX_DETECTIONS, DEFAULT_RING_BUFFER_SIZE, DEFAULT_THRESHOLD},
  input::InputWrapper,
  model::OnnxEngine,
  output::OutputWrapper,
};

/// Huanliu 视频检测流水线参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频，例如 gst:///path/video.mp4 或 image:///path/a.png
  #[arg(long, value_name = "SOURCE")]
  pub video: Url,
  /// ONNX 模型文件路径
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,
  /// 类别标签文件，每行一个
  #[arg(long, value_name = "LABELS")]
  pub labels: PathBuf,
  /// 输出路径，例如 gst:///path/out.mp4 或 image:///path/out.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 模型输入分辨率，0 表示由模型自动检测
  #[arg(long, default_value_t = 0)]
  pub resolution: u32,
  /// 检测置信度阈值
  #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
  pub threshold: f32,
  /// 掩码 logit 阈值
  #[arg(long, default_value_t = DEFAULT_MASK_THRESHOLD)]
  pub mask_threshold: f32,
  /// 每帧最多保留的检测数量，0 表示不限制
  #[arg(long, default_value_t = DEFAULT_MAX_DETECTIONS)]
  pub max_detections: usize,
  /// 使用分割模型
  #[arg(long)]
  pub segmentation: bool,
  /// 环形缓冲区中的帧槽数量
  #[arg(long, default_value_t = DEFAULT_RING_BUFFER_SIZE)]
  pub ring_size: usize,
  /// 同时在屏幕上显示
  #[arg(long)]
  pub display: bool,
  /// 标签文字使用的 TTF 字体，默认使用内置的 DejaVu Sans
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 逐帧检测结果 (JSON Lines) 输出路径
  #[arg(long, value_name = "RECORDS")]
  pub records: Option<PathBuf>,
  /// 推理线程数，0 表示由后端决定
  #[arg(long, default_value_t = 0)]
  pub threads: usize,
}

impl Args {
  fn pipeline_config(&self) -> PipelineConfig {
    let model_type = if self.segmentation {
      ModelType::Segmentation
    } else {
      ModelType::Detection
    };
    let inference = InferenceConfig::default()
      .with_resolution(self.resolution)
      .with_model_type(model_type)
      .with_threshold(self.threshold)
      .with_mask_threshold(self.mask_threshold)
      .with_max_detections(self.max_detections);

    PipelineConfig::new(
      self.video.clone(),
      self.model.clone(),
      self.labels.clone(),
      self.output.clone(),
    )
    .with_inference_config(inference)
    .with_ring_buffer_size(self.ring_size)
    .with_display(self.display)
    .with_font_path(self.font.clone())
    .with_records_path(self.records.clone())
  }
}

fn sinks(config: &PipelineConfig) -> Result<Vec<OutputWrapper>> {
  #[allow(unused_mut)]
  let mut sinks = vec![OutputWrapper::from_url(&config.output_path).context("无法创建输出")?];
  if config.display {
    #[cfg(feature = "gstreamer_output")]
    sinks.push(OutputWrapper::display());
    #[cfg(not(feature = "gstreamer_output"))]
    warn!("未启用 gstreamer_output 特性, 忽略屏幕显示");
  }
  Ok(sinks)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = args.pipeline_config();

  info!("输入来源: {}", config.video_path);
  info!("模型文件路径: {}", config.model_path.display());
  info!("输出路径: {}", config.output_path);

  let source = InputWrapper::from_url(&config.video_path).context("无法打开输入")?;
  let sinks = sinks(&config)?;
  let engine = OnnxEngine::new().with_threads(args.threads);

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
      if stop.swap(true, Ordering::AcqRel) {
        warn!("再次收到中断信号, 仍在等待流水线退出");
      } else {
        info!("收到中断信号, 正在停止流水线");
      }
    })?;
  }

  let mut pipeline = Pipeline::new(config, engine, source, sinks)?.with_stop_flag(stop);

  info!("开始处理...");
  let now = std::time::Instant::now();
  let frames = pipeline.run()?;
  let elapsed = now.elapsed();
  let fps = if elapsed.as_secs_f64() > 0.0 {
    frames as f64 / elapsed.as_secs_f64()
  } else {
    0.0
  };
  info!("处理完成: {} 帧, 耗时 {:.2?}, 平均 {:.1} FPS", frames, elapsed, fps);

  Ok(())
}
