// 该文件是 Huanliu （环流） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入
//!
//! 支持的 URL：
//! - `gst://file/path/to/video.mp4?rotate=90` 读取视频文件
//! - `gst://camera/dev/video0?width=640&height=480&fps=30&format=YUY2&io-mode=2` 摄像头捕获
//!
//! 使用前需要安装 GStreamer 开发库 (`libgstreamer1.0-dev`,
//! `libgstreamer-plugins-base1.0-dev`)，并启用 `gstreamer_input` 特性。

use std::collections::HashMap;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{PixelOrder, RawFrame},
  input::{DEFAULT_FRAME_RATE, FrameSource, InputError},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("无法获取 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换元素为 appsink")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

const GSTREAMER_INPUT_SCHEME: &str = "gst";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          camera, io_mode_str, format, width, height, fps
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method } => {
        format!("videoflip method={}", method)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  // 实时源允许丢帧，文件源必须逐帧读取
  live: bool,
}

impl GStreamerInputPipelineBuilder {
  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let mut items = vec![GStreamerInputBuilderItem::CameraSource {
      camera: path.to_string(),
      io_mode: parse("io-mode"),
      format: query
        .get("format")
        .cloned()
        .unwrap_or_else(|| "RGB".to_string()),
      width: parse("width").unwrap_or(DEFAULT_CAMERA_WIDTH),
      height: parse("height").unwrap_or(DEFAULT_CAMERA_HEIGHT),
      fps: parse("fps").unwrap_or(DEFAULT_CAMERA_FPS),
    }];
    items.extend(Self::video_flip(query.get("rotate").map(String::as_str)));

    Self { items, live: true }
  }

  fn build_file_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let mut items = vec![GStreamerInputBuilderItem::FileSource(path.to_string())];
    items.extend(Self::video_flip(query.get("rotate").map(String::as_str)));

    Self { items, live: false }
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method })
  }

  pub fn pipeline_description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let sink = if self.live {
      "appsink max-buffers=2 drop=true name=sink"
    } else {
      "appsink max-buffers=2 drop=false sync=false name=sink"
    };
    format!("{} ! {}", basic_pipeline, sink)
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.pipeline_description();
    info!("GStreamer 输入管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    // 预卷得到第一帧的 caps，从中读取帧率；预卷样本不会被消费
    let frame_rate = match appsink.pull_preroll() {
      Ok(sample) => sample
        .caps()
        .and_then(|caps| gst_video::VideoInfo::from_caps(caps).ok())
        .map(|info| info.fps())
        .filter(|fps| fps.numer() > 0 && fps.denom() > 0)
        .map(|fps| fps.numer() as f64 / fps.denom() as f64)
        .unwrap_or(DEFAULT_FRAME_RATE),
      Err(_) => {
        warn!("无法预卷视频源, 使用默认帧率 {}", DEFAULT_FRAME_RATE);
        DEFAULT_FRAME_RATE
      }
    };
    debug!("视频源帧率: {:.2}", frame_rate);

    Ok(GStreamerInput {
      pipeline,
      appsink,
      frame_rate,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = GSTREAMER_INPUT_SCHEME;
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != GSTREAMER_INPUT_SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(url.path(), &query),
      Some("file") => Self::build_file_pipeline(url.path(), &query),
      _ => {
        return Err(GStreamerInputError::SchemeMismatch);
      }
    };

    builder.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  frame_rate: f64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止 GStreamer 管道: {}", e);
    }
  }
}

impl GStreamerInput {
  fn copy_sample(sample: &gst::Sample, frame: &mut RawFrame) -> Result<(), InputError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

    let order = match video_info.format() {
      gst_video::VideoFormat::Rgb => PixelOrder::Rgb,
      gst_video::VideoFormat::Bgr => PixelOrder::Bgr,
      other => return Err(GStreamerInputError::UnsupportedFormat(other).into()),
    };

    let map = buffer
      .map_readable()
      .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲: {}", e)))?;
    let stride = video_info.stride()[0].max(0) as usize;
    frame.fill_from(
      video_info.width(),
      video_info.height(),
      order,
      map.as_slice(),
      stride,
    )?;
    Ok(())
  }
}

impl FrameSource for GStreamerInput {
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError> {
    match self.appsink.pull_sample() {
      Ok(sample) => {
        Self::copy_sample(&sample, frame)?;
        Ok(true)
      }
      Err(_) if self.appsink.is_eos() => {
        info!("视频源已结束");
        Ok(false)
      }
      Err(e) => Err(GStreamerInputError::PipelineError(format!("无法拉取样本: {}", e)).into()),
    }
  }

  fn frame_rate(&self) -> f64 {
    self.frame_rate
  }
}
