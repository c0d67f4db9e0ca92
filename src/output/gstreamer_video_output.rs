// 该文件是 Huanliu （环流） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输出
//!
//! - `gst:///output.mp4` 编码保存为视频文件，按扩展名选择封装 (mp4 / mkv / avi / webm)
//! - `display://` 在屏幕上显示
//!
//! 管道在写入第一帧时才创建，帧尺寸取自该帧，帧率取自视频源。

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{PixelOrder, RGB_CHANNELS, RawFrame},
  output::{FrameSink, OutputError},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("无法获取 appsrc 元素")]
  AppSrcNotFound,
  #[error("无法转换元素为 appsrc")]
  AppSrcConversionFailed,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("缓冲区创建错误")]
  BufferCreationError,
  #[error("输出尚未打开")]
  NotOpened,
  #[error("无法发送 EOS: {0:?}")]
  EndOfStream(gst::FlowError),
  #[error("{0} 秒内未收到 EOS, 输出文件可能不完整")]
  EosTimeout(u64),
  #[error("帧尺寸变化: 输出为 {expected:?}, 实际 {actual:?}")]
  FrameSizeChanged {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

const GSTREAMER_VIDEO_OUTPUT_SCHEME: &str = "gst";
const GSTREAMER_DISPLAY_SCHEME: &str = "display";
const EOS_TIMEOUT_SECONDS: u64 = 5;

enum Target {
  File(String),
  Display,
}

impl Target {
  fn pipeline_description(&self) -> String {
    match self {
      Target::File(path) => {
        let encoder = if path.ends_with(".webm") {
          "vp8enc ! webmmux".to_string()
        } else {
          let mux = if path.ends_with(".mkv") {
            "matroskamux"
          } else if path.ends_with(".avi") {
            "avimux"
          } else {
            "mp4mux"
          };
          format!(
            "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! {}",
            mux
          )
        };
        format!(
          "appsrc name=src ! videoconvert ! {} ! filesink location={}",
          encoder, path
        )
      }
      Target::Display => "appsrc name=src ! videoconvert ! autovideosink sync=false".to_string(),
    }
  }
}

struct Opened {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  info: gst_video::VideoInfo,
  order: PixelOrder,
}

/// GStreamer 编码/显示输出
pub struct GStreamerVideoOutput {
  target: Target,
  opened: Option<Opened>,
  fps: f64,
  frame_count: u64,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = GSTREAMER_VIDEO_OUTPUT_SCHEME;
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      GSTREAMER_VIDEO_OUTPUT_SCHEME => Ok(Self::file(url.path())),
      GSTREAMER_DISPLAY_SCHEME => Ok(Self::display()),
      other => {
        error!(
          "URI scheme 不匹配: 期望 '{}', 实际 '{}'",
          GSTREAMER_VIDEO_OUTPUT_SCHEME, other
        );
        Err(GStreamerVideoOutputError::SchemeMismatch)
      }
    }
  }
}

impl GStreamerVideoOutput {
  pub const DISPLAY_SCHEME: &'static str = GSTREAMER_DISPLAY_SCHEME;

  fn with_target(target: Target) -> Self {
    Self {
      target,
      opened: None,
      fps: 0.0,
      frame_count: 0,
    }
  }

  pub fn file(path: &str) -> Self {
    Self::with_target(Target::File(path.to_string()))
  }

  pub fn display() -> Self {
    Self::with_target(Target::Display)
  }

  pub fn pipeline_description(&self) -> String {
    self.target.pipeline_description()
  }

  fn frame_duration_ns(&self) -> u64 {
    (1_000_000_000.0 / self.fps).round() as u64
  }

  fn open_pipeline(
    &mut self,
    width: u32,
    height: u32,
    order: PixelOrder,
    fps: f64,
  ) -> Result<(), GStreamerVideoOutputError> {
    gst::init()?;

    let pipeline_desc = self.pipeline_description();
    info!("创建视频输出管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    let format = match order {
      PixelOrder::Rgb => gst_video::VideoFormat::Rgb,
      PixelOrder::Bgr => gst_video::VideoFormat::Bgr,
    };
    // 帧率以千分之一精度表示
    let fps_fraction = gst::Fraction::new((fps * 1000.0).round() as i32, 1000);
    let info = gst_video::VideoInfo::builder(format, width, height)
      .fps(fps_fraction)
      .build()?;
    let caps = info.to_caps()?;

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;

    info!(
      "视频输出已初始化: {}x{} @ {:.2} fps",
      width, height, fps
    );

    self.fps = fps;
    self.opened = Some(Opened {
      pipeline,
      appsrc,
      info,
      order,
    });
    Ok(())
  }

  fn push_frame(&mut self, frame: &RawFrame) -> Result<(), GStreamerVideoOutputError> {
    let duration = self.frame_duration_ns();
    let opened = self
      .opened
      .as_ref()
      .ok_or(GStreamerVideoOutputError::NotOpened)?;

    let expected = (opened.info.width(), opened.info.height());
    let actual = (frame.width(), frame.height());
    if expected != actual {
      return Err(GStreamerVideoOutputError::FrameSizeChanged { expected, actual });
    }
    if frame.order() != opened.order {
      warn!("帧像素顺序与输出不一致, 颜色可能错误");
    }

    let stride = opened.info.stride()[0] as usize;
    let row = frame.width() as usize * RGB_CHANNELS;
    let mut buffer = gst::Buffer::with_size(opened.info.size())
      .map_err(|_| GStreamerVideoOutputError::BufferCreationError)?;

    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or(GStreamerVideoOutputError::BufferCreationError)?;
      {
        let mut map = buffer_ref.map_writable().map_err(|_| {
          GStreamerVideoOutputError::PipelineError("无法映射缓冲".to_string())
        })?;
        // GStreamer 的 RGB 行按 4 字节对齐
        for (src, dst) in frame
          .as_nhwc()
          .chunks_exact(row)
          .zip(map.as_mut_slice().chunks_mut(stride))
        {
          dst[..row].copy_from_slice(src);
        }
      }
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(self.frame_count * duration));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration));
    }

    opened.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("无法推送缓冲: {:?}", e))
    })?;
    self.frame_count += 1;
    Ok(())
  }

  fn close(&mut self) -> Result<(), GStreamerVideoOutputError> {
    let Some(opened) = self.opened.take() else {
      return Ok(());
    };

    // 发送 EOS 并等待管道写完文件；无论结果如何都要停止管道
    let eos = opened
      .appsrc
      .end_of_stream()
      .map_err(GStreamerVideoOutputError::EndOfStream)
      .and_then(|_| match opened.pipeline.bus() {
        Some(bus) => check_eos(bus.timed_pop_filtered(
          gst::ClockTime::from_seconds(EOS_TIMEOUT_SECONDS),
          &[gst::MessageType::Eos, gst::MessageType::Error],
        )),
        None => Ok(()),
      });
    opened.pipeline.set_state(gst::State::Null)?;
    eos?;

    info!("视频输出已关闭, 共写入 {} 帧", self.frame_count);
    Ok(())
  }
}

/// EOS 表示文件已完整写出；管道错误和超时都返回错误
fn check_eos(msg: Option<gst::Message>) -> Result<(), GStreamerVideoOutputError> {
  let Some(msg) = msg else {
    return Err(GStreamerVideoOutputError::EosTimeout(EOS_TIMEOUT_SECONDS));
  };
  match msg.view() {
    gst::MessageView::Error(err) => {
      error!("视频输出管道错误: {}", err.error());
      Err(GStreamerVideoOutputError::PipelineError(
        err.error().to_string(),
      ))
    }
    _ => Ok(()),
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("无法停止 GStreamer 视频输出管道: {}", e);
    }
  }
}

impl FrameSink for GStreamerVideoOutput {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    if self.opened.is_some() {
      return Ok(());
    }
    let fps = if fps > 0.0 { fps } else { crate::input::DEFAULT_FRAME_RATE };
    self.open_pipeline(width, height, order, fps)?;
    Ok(())
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    self.push_frame(frame)?;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.close()?;
    Ok(())
  }
}
