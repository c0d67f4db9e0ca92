// 该文件是 Huanliu （环流） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RawFrame,
  output::{FrameSink, OutputError},
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 将标注后的帧保存为图像文件
///
/// 第一帧写到给定路径，之后的帧写到 `<名称>_<帧号>.<扩展名>`。
pub struct SaveImageFileOutput {
  path: PathBuf,
  written: u64,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }
    Ok(Self::new(uri.path()))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      written: 0,
    }
  }

  pub fn frame_path(&self, index: u64) -> PathBuf {
    if index == 0 {
      return self.path.clone();
    }
    let stem = self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_default();
    let name = match self.path.extension() {
      Some(ext) => format!("{}_{:06}.{}", stem, index, ext.to_string_lossy()),
      None => format!("{}_{:06}", stem, index),
    };
    self.path.with_file_name(name)
  }

  fn save_image(&self, image: image::RgbImage, path: &Path) -> Result<(), SaveImageFileError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    info!("保存图像到文件: {}", path.display());
    Ok(())
  }
}

impl FrameSink for SaveImageFileOutput {
  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    let path = self.frame_path(self.written);
    self.save_image(frame.to_rgb_image(), &path)?;
    self.written += 1;
    Ok(())
  }
}
