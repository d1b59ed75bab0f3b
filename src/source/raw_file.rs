// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source/raw_file.rs - 原始 NV12 帧文件输入
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

use std::{
  fs::File,
  io::{ErrorKind, Read, Seek, SeekFrom},
  path::PathBuf,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  device::nv12_size,
  source::{Frame, FrameSource, query_size},
};

#[derive(Error, Debug)]
pub enum RawFileSourceError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("缺少 width/height 参数")]
  MissingSize,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 从文件中按顺序读取首尾相接的 NV12 帧
///
/// `raw:///path/frames.nv12?width=640&height=360&loop`
pub struct RawFileSource {
  path: PathBuf,
  file: File,
  width: u32,
  height: u32,
  looping: bool,
  index: u64,
  spare: Option<Vec<u8>>,
}

impl FromUrlWithScheme for RawFileSource {
  const SCHEME: &'static str = "raw";
}

impl FromUrl for RawFileSource {
  type Error = RawFileSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RawFileSourceError::SchemeMismatch(format!(
        "期望输入方式 '{}', 实际输入方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }
    let (width, height) = query_size(url).ok_or(RawFileSourceError::MissingSize)?;
    let looping = url.query_pairs().any(|(k, _)| k == "loop");
    Self::open(url.path(), width, height, looping)
  }
}

impl RawFileSource {
  pub fn open(
    path: impl Into<PathBuf>,
    width: u32,
    height: u32,
    looping: bool,
  ) -> Result<Self, RawFileSourceError> {
    let path = path.into();
    let file = File::open(&path)?;
    info!(
      "打开原始帧文件 {} ({}x{}, 循环: {})",
      path.display(),
      width,
      height,
      looping
    );
    Ok(RawFileSource {
      path,
      file,
      width,
      height,
      looping,
      index: 0,
      spare: None,
    })
  }

  fn frame_size(&self) -> usize {
    nv12_size(self.width as usize, self.height as usize)
  }

  fn read_frame(&mut self, data: &mut [u8]) -> std::io::Result<bool> {
    match self.file.read_exact(data) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
      Err(e) => Err(e),
    }
  }
}

impl FrameSource for RawFileSource {
  fn get_last_frame_blocking(&mut self) -> Option<Frame> {
    let size = self.frame_size();
    let mut data = self.spare.take().unwrap_or_default();
    data.resize(size, 0);

    let mut ok = self.read_frame(&mut data);
    if matches!(ok, Ok(false)) && self.looping {
      debug!("到达文件末尾, 从头开始: {}", self.path.display());
      ok = self
        .file
        .seek(SeekFrom::Start(0))
        .and_then(|_| self.read_frame(&mut data));
    }

    match ok {
      Ok(true) => {
        self.index += 1;
        Some(Frame {
          data,
          width: self.width,
          height: self.height,
          index: self.index,
        })
      }
      Ok(false) => {
        warn!("原始帧文件已读完: {}", self.path.display());
        None
      }
      Err(e) => {
        error!("读取原始帧失败 ({}): {}", self.path.display(), e);
        None
      }
    }
  }

  fn return_frame(&mut self, frame: Frame) {
    self.spare = Some(frame.data);
  }

  fn resolution(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}
