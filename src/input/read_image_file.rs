// 该文件是 Huanliu （环流） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{PixelOrder, RGB_CHANNELS, RawFrame},
  input::{FrameSource, InputError},
};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI scheme 不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

const READ_IMAGE_FILE_SCHEME: &str = "image";

/// 单张图像构成的视频源，读取一帧后即耗尽
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl ImageFileInput {
  pub fn new(image: RgbImage) -> Self {
    Self { image: Some(image) }
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme 不匹配: 期望 '{}', 实际 '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?;
    info!("读取图像 {}: {}x{}", path, image.width(), image.height());

    Ok(Self::new(image.into()))
  }
}

impl FrameSource for ImageFileInput {
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError> {
    let Some(image) = self.image.take() else {
      return Ok(false);
    };
    let (width, height) = image.dimensions();
    frame.fill_from(
      width,
      height,
      PixelOrder::Rgb,
      image.as_raw(),
      width as usize * RGB_CHANNELS,
    )?;
    Ok(true)
  }

  fn frame_rate(&self) -> f64 {
    1.0
  }
}
