// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source.rs - 视频帧输入
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

use crate::FromUrl;

mod raw_file;
pub use self::raw_file::{RawFileSource, RawFileSourceError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_source;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_source::{GStreamerSource, GStreamerSourceError};

/// 一帧 NV12 图像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub data: Vec<u8>,
  pub width: u32,
  pub height: u32,
  pub index: u64,
}

/// 固定分辨率的帧来源
///
/// 取帧会阻塞，但等待时间有上限；取到的帧用完后必须交还。
pub trait FrameSource {
  fn get_last_frame_blocking(&mut self) -> Option<Frame>;
  fn return_frame(&mut self, frame: Frame);
  fn resolution(&self) -> (u32, u32);
}

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("原始帧文件输入错误: {0}")]
  RawFileSourceError(#[from] RawFileSourceError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerSourceError(#[from] GStreamerSourceError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum SourceWrapper {
  RawFile(RawFileSource),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerSource),
}

impl FromUrl for SourceWrapper {
  type Error = SourceError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    match url.scheme() {
      RawFileSource::SCHEME => Ok(SourceWrapper::RawFile(RawFileSource::from_url(url)?)),
      #[cfg(feature = "gstreamer_input")]
      GStreamerSource::SCHEME => Ok(SourceWrapper::GStreamer(GStreamerSource::from_url(url)?)),
      other => Err(SourceError::SchemeMismatch(other.to_string())),
    }
  }
}

impl FrameSource for SourceWrapper {
  fn get_last_frame_blocking(&mut self) -> Option<Frame> {
    match self {
      SourceWrapper::RawFile(source) => source.get_last_frame_blocking(),
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamer(source) => source.get_last_frame_blocking(),
    }
  }

  fn return_frame(&mut self, frame: Frame) {
    match self {
      SourceWrapper::RawFile(source) => source.return_frame(frame),
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamer(source) => source.return_frame(frame),
    }
  }

  fn resolution(&self) -> (u32, u32) {
    match self {
      SourceWrapper::RawFile(source) => source.resolution(),
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamer(source) => source.resolution(),
    }
  }
}

/// 解析 `width`/`height` 查询参数
pub(crate) fn query_size(url: &url::Url) -> Option<(u32, u32)> {
  let mut width = None;
  let mut height = None;
  for (k, v) in url.query_pairs() {
    match k.as_ref() {
      "width" => width = v.parse::<u32>().ok(),
      "height" => height = v.parse::<u32>().ok(),
      _ => {}
    }
  }
  Some((width?, height?))
}
