// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay.rs - 检测框叠加输出
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
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, postprocess::RenderableDetection};

mod bbox;
pub use self::bbox::{BboxColor, BboxOverlay, BboxStyle};

#[cfg(feature = "compositor_overlay")]
mod compositor;
#[cfg(feature = "compositor_overlay")]
pub use self::compositor::CompositorOverlay;

/// 叠加层
///
/// 每个周期收到一组已映射到视频流坐标的检测框，自行负责绘制。
pub trait OverlaySink {
  fn render(&mut self, detections: &[RenderableDetection]) -> Result<(), OverlayError>;

  /// 叠加层所在视频流的当前尺寸；`None` 表示与高清画面相同
  ///
  /// 每个周期都会重新读取，流被重新配置后从下一个周期起生效。
  fn stream_size(&self) -> Option<(u32, u32)>;
}

#[derive(Error, Debug)]
pub enum OverlayError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("缺少 width/height 参数")]
  MissingSize,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 不绘制任何内容
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverlay;

impl FromUrlWithScheme for NoOverlay {
  const SCHEME: &'static str = "none";
}

impl FromUrl for NoOverlay {
  type Error = OverlayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OverlayError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(NoOverlay)
  }
}

impl OverlaySink for NoOverlay {
  fn render(&mut self, _detections: &[RenderableDetection]) -> Result<(), OverlayError> {
    Ok(())
  }

  fn stream_size(&self) -> Option<(u32, u32)> {
    None
  }
}

pub enum OverlayWrapper {
  None(NoOverlay),
  #[cfg(feature = "compositor_overlay")]
  Compositor(CompositorOverlay),
  Bbox(BboxOverlay),
}

impl FromUrl for OverlayWrapper {
  type Error = OverlayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      NoOverlay::SCHEME => Ok(OverlayWrapper::None(NoOverlay::from_url(url)?)),
      #[cfg(feature = "compositor_overlay")]
      CompositorOverlay::SCHEME => Ok(OverlayWrapper::Compositor(CompositorOverlay::from_url(
        url,
      )?)),
      BboxOverlay::SCHEME => Ok(OverlayWrapper::Bbox(BboxOverlay::from_url(url)?)),
      other => Err(OverlayError::SchemeMismatch(other.to_string())),
    }
  }
}

impl OverlaySink for OverlayWrapper {
  fn render(&mut self, detections: &[RenderableDetection]) -> Result<(), OverlayError> {
    match self {
      OverlayWrapper::None(overlay) => overlay.render(detections),
      #[cfg(feature = "compositor_overlay")]
      OverlayWrapper::Compositor(overlay) => overlay.render(detections),
      OverlayWrapper::Bbox(overlay) => overlay.render(detections),
    }
  }

  fn stream_size(&self) -> Option<(u32, u32)> {
    match self {
      OverlayWrapper::None(overlay) => overlay.stream_size(),
      #[cfg(feature = "compositor_overlay")]
      OverlayWrapper::Compositor(overlay) => overlay.stream_size(),
      OverlayWrapper::Bbox(overlay) => overlay.stream_size(),
    }
  }
}
