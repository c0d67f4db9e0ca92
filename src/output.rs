// 该文件是 Huanliu （环流） 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::FromUrl;
#[cfg(any(feature = "save_image_file", feature = "gstreamer_output"))]
use crate::FromUrlWithScheme;
use crate::frame::{PixelOrder, RawFrame};
use thiserror::Error;
use url::Url;

pub mod draw;
pub mod record;

pub use self::draw::{Draw, DrawError};
pub use self::record::{Record, RecordError};

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[error("绘制错误: {0}")]
  DrawError(#[from] DrawError),
  #[error("检测记录错误: {0}")]
  RecordError(#[from] RecordError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("输出错误: {0}")]
  Other(String),
}

/// 帧的去向
///
/// 绘制阶段独占该对象。收到第一帧时以该帧的尺寸和视频源帧率调用一次
/// [`FrameSink::open`]，随后逐帧写入，结束时调用 [`FrameSink::finish`]。
pub trait FrameSink: Send {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    let _ = (width, height, order, fps);
    Ok(())
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError>;

  fn finish(&mut self) -> Result<(), OutputError> {
    Ok(())
  }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    (**self).open(width, height, order, fps)
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    (**self).write_frame(frame)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }
}

/// 依次写入多个输出，例如保存文件的同时在屏幕上显示
impl<S: FrameSink> FrameSink for Vec<S> {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    self
      .iter_mut()
      .try_for_each(|sink| sink.open(width, height, order, fps))
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    self.iter_mut().try_for_each(|sink| sink.write_frame(frame))
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    // 即使某个输出失败也要关闭其余输出，返回第一个错误
    let mut first = None;
    for sink in self.iter_mut() {
      if let Err(e) = sink.finish() {
        first.get_or_insert(e);
      }
    }
    first.map_or(Ok(()), Err)
  }
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideoOutput(GStreamerVideoOutput),
}

impl OutputWrapper {
  /// 屏幕显示输出
  #[cfg(feature = "gstreamer_output")]
  pub fn display() -> Self {
    OutputWrapper::GStreamerVideoOutput(GStreamerVideoOutput::display())
  }
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      #[cfg(feature = "gstreamer_output")]
      GStreamerVideoOutput::SCHEME | GStreamerVideoOutput::DISPLAY_SCHEME => {
        let output = GStreamerVideoOutput::from_url(url)?;
        Ok(OutputWrapper::GStreamerVideoOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch(url.to_string())),
    }
  }
}

impl FrameSink for OutputWrapper {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.open(width, height, order, fps),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.open(width, height, order, fps),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = (width, height, order, fps);
        Ok(())
      }
    }
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.write_frame(frame),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.write_frame(frame),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = frame;
        Ok(())
      }
    }
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output.finish(),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output.finish(),
      #[allow(unreachable_patterns)]
      _ => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Failing;

  impl FrameSink for Failing {
    fn write_frame(&mut self, _: &RawFrame) -> Result<(), OutputError> {
      Err(OutputError::Other("写入失败".to_string()))
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      Err(OutputError::Other("关闭失败".to_string()))
    }
  }

  #[derive(Default)]
  struct Counting {
    frames: usize,
    finished: bool,
  }

  impl FrameSink for Counting {
    fn write_frame(&mut self, _: &RawFrame) -> Result<(), OutputError> {
      self.frames += 1;
      Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
      self.finished = true;
      Ok(())
    }
  }

  #[test]
  fn test_sink_group_finishes_all() {
    let mut group: Vec<Box<dyn FrameSink>> = vec![Box::new(Failing), Box::new(Counting::default())];
    let frame = RawFrame::new(1, 1, PixelOrder::Rgb);
    assert!(group.write_frame(&frame).is_err());
    assert!(matches!(group.finish(), Err(OutputError::Other(_))));
  }

  #[test]
  fn test_sink_group_writes_each() {
    let mut group = vec![Counting::default(), Counting::default()];
    let frame = RawFrame::new(1, 1, PixelOrder::Rgb);
    group.open(1, 1, PixelOrder::Rgb, 25.0).unwrap();
    group.write_frame(&frame).unwrap();
    group.finish().unwrap();
    assert!(group.iter().all(|s| s.frames == 1 && s.finished));
  }

  #[test]
  fn test_unknown_scheme() {
    let url = Url::parse("rtsp://host/stream").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }
}
