// 该文件是 Huanliu （环流） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use thiserror::Error;

use crate::{FromUrl, frame::RawFrame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

/// 视频源未给出帧率时使用的默认值
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("帧数据错误: {0}")]
  FrameError(#[from] crate::frame::FrameError),
  #[error("不支持的输入 URI: {0}")]
  SchemeMismatch(String),
  #[error("输入错误: {0}")]
  Other(String),
}

/// 帧来源
///
/// 解码阶段独占该对象，每次把下一帧写入调用方提供的可复用缓冲。
pub trait FrameSource: Send {
  /// 读取下一帧，返回 `false` 表示视频源已耗尽
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError>;

  fn frame_rate(&self) -> f64 {
    DEFAULT_FRAME_RATE
  }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError> {
    (**self).read_into(frame)
  }

  fn frame_rate(&self) -> f64 {
    (**self).frame_rate()
  }
}

pub enum InputWrapper {
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == GStreamerInputPipelineBuilder::SCHEME {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    Err(InputError::SchemeMismatch(url.to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError> {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.read_into(frame),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.read_into(frame),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = frame;
        Ok(false)
      }
    }
  }

  fn frame_rate(&self) -> f64 {
    match self {
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.frame_rate(),
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.frame_rate(),
      #[allow(unreachable_patterns)]
      _ => DEFAULT_FRAME_RATE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_unknown_scheme() {
    let url = url::Url::parse("ftp://example.com/video.mp4").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(_))
    ));
  }
}
