// 该文件是 Qianli （千里眼） 项目的一部分。
// src/artifact.rs - 检测结果图像编码与保存
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

use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder as ImageJpegEncoder};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("图像数据无效: {width}x{height}x{channels}, 实际 {len} 字节")]
  InvalidImage {
    width: u32,
    height: u32,
    channels: u8,
    len: usize,
  },
}

/// 图像编码器
pub trait Encoder {
  fn encode(
    &self,
    pixels: &[u8],
    width: u32,
    height: u32,
    channels: u8,
    quality: u8,
  ) -> Result<Vec<u8>, ArtifactError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JpegEncoder;

impl Encoder for JpegEncoder {
  fn encode(
    &self,
    pixels: &[u8],
    width: u32,
    height: u32,
    channels: u8,
    quality: u8,
  ) -> Result<Vec<u8>, ArtifactError> {
    let invalid = || ArtifactError::InvalidImage {
      width,
      height,
      channels,
      len: pixels.len(),
    };
    let color = match channels {
      1 => ExtendedColorType::L8,
      3 => ExtendedColorType::Rgb8,
      _ => return Err(invalid()),
    };
    if width == 0
      || height == 0
      || pixels.len() != width as usize * height as usize * channels as usize
    {
      return Err(invalid());
    }

    let mut buffer = Vec::new();
    ImageJpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
      .write_image(pixels, width, height, color)?;
    Ok(buffer)
  }
}

/// 把每个检测目标的裁剪图写成 `<dir>/detection_<i>.jpg`
pub struct ArtifactWriter {
  directory: PathBuf,
  quality: u8,
  encoder: Box<dyn Encoder>,
}

impl ArtifactWriter {
  pub fn new(directory: impl Into<PathBuf>, quality: u8) -> Self {
    ArtifactWriter {
      directory: directory.into(),
      quality,
      encoder: Box::new(JpegEncoder),
    }
  }

  pub fn with_encoder(mut self, encoder: Box<dyn Encoder>) -> Self {
    self.encoder = encoder;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn path_for(&self, index: usize) -> PathBuf {
    self.directory.join(format!("detection_{}.jpg", index))
  }

  /// 编码 RGB 图像并写入文件，返回文件路径
  pub fn write(
    &self,
    index: usize,
    pixels: &[u8],
    width: u32,
    height: u32,
  ) -> Result<PathBuf, ArtifactError> {
    let jpeg = self.encoder.encode(pixels, width, height, 3, self.quality)?;
    if !self.directory.as_os_str().is_empty() {
      std::fs::create_dir_all(&self.directory)?;
    }
    let path = self.path_for(index);
    std::fs::write(&path, &jpeg)?;
    debug!("保存检测图像 {} ({} 字节)", path.display(), jpeg.len());
    Ok(path)
  }
}
