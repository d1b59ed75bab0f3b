// 该文件是 Qianli （千里眼） 项目的一部分。
// src/source/gstreamer_source.rs - GStreamer NV12 视频输入
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

//! # GStreamer 视频输入
//!
//! 摄像头或视频文件经 `videoconvert ! videoscale` 输出固定尺寸的 NV12 帧，
//! 通过 appsink 取帧。appsink 只保留最新的一帧，取帧等待有超时上限。
//!
//! ```text
//! gst://camera/dev/video0?width=640&height=360&fps=15
//! gst://file/path/to/video.mp4?width=1280&height=720
//! ```
//!
//! 高低分辨率两路通常指向同一个设备，需要摄像头驱动支持多路打开。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  device::nv12_size,
  source::{Frame, FrameSource, query_size},
};

const PULL_TIMEOUT_MS: u64 = 1000;

#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("缺少 width/height 参数")]
  MissingSize,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换为 appsink")]
  AppSinkConversionFailed,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态切换错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    fps: u32,
  },
  Nv12Output {
    width: u32,
    height: u32,
  },
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        camera,
        io_mode,
        fps,
      } => {
        let io_mode_str = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,framerate={}/1",
          camera, io_mode_str, fps
        )
      }
      PipelineItem::Nv12Output { width, height } => format!(
        "videoconvert ! videoscale ! video/x-raw,format=NV12,width={},height={}",
        width, height
      ),
    }
  }
}

pub struct GStreamerSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  index: u64,
}

impl FromUrlWithScheme for GStreamerSource {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerSource {
  type Error = GStreamerSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerSourceError::SchemeMismatch);
    }
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let (width, height) = query_size(url).ok_or(GStreamerSourceError::MissingSize)?;

    let source = match url.host_str() {
      Some("camera") => PipelineItem::CameraSource {
        camera: url.path().to_string(),
        io_mode: query.get("io-mode").and_then(|v| v.parse::<u32>().ok()),
        fps: query
          .get("fps")
          .and_then(|v| v.parse::<u32>().ok())
          .unwrap_or(15),
      },
      Some("file") => PipelineItem::FileSource(url.path().to_string()),
      _ => return Err(GStreamerSourceError::SchemeMismatch),
    };

    Self::build(&[source, PipelineItem::Nv12Output { width, height }], width, height)
  }
}

impl GStreamerSource {
  fn build(items: &[PipelineItem], width: u32, height: u32) -> Result<Self, GStreamerSourceError> {
    gst::init()?;

    let description = format!(
      "{} ! appsink max-buffers=1 drop=true sync=false name=sink",
      items
        .iter()
        .map(PipelineItem::to_pipeline)
        .collect::<Vec<String>>()
        .join(" ! ")
    );
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerSourceError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerSourceError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerSource {
      pipeline,
      appsink,
      width,
      height,
      index: 0,
    })
  }

  fn sample_to_frame(&mut self, sample: gst::Sample) -> Result<Frame, GStreamerSourceError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有缓冲区".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有 caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
      .map_err(|_| GStreamerSourceError::PipelineError("无法解析视频信息".to_string()))?;
    if info.format() != gst_video::VideoFormat::Nv12
      || info.width() != self.width
      || info.height() != self.height
    {
      return Err(GStreamerSourceError::PipelineError(format!(
        "帧格式不符: {:?} {}x{}",
        info.format(),
        info.width(),
        info.height()
      )));
    }

    let map = buffer
      .map_readable()
      .map_err(|e| GStreamerSourceError::PipelineError(format!("无法映射缓冲区: {}", e)))?;

    // 去掉行对齐填充，得到紧凑的 NV12
    let (w, h) = (self.width as usize, self.height as usize);
    let mut data = Vec::with_capacity(nv12_size(w, h));
    let src = map.as_slice();
    for (plane, rows, row_bytes) in [(0, h, w), (1, h.div_ceil(2), 2 * w.div_ceil(2))] {
      let offset = info.offset()[plane];
      let stride = info.stride()[plane] as usize;
      for row in 0..rows {
        let start = offset + row * stride;
        let line = src.get(start..start + row_bytes).ok_or_else(|| {
          GStreamerSourceError::PipelineError("缓冲区长度不足".to_string())
        })?;
        data.extend_from_slice(line);
      }
    }

    self.index += 1;
    Ok(Frame {
      data,
      width: self.width,
      height: self.height,
      index: self.index,
    })
  }
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止 GStreamer 管道: {}", e);
    }
  }
}

impl FrameSource for GStreamerSource {
  fn get_last_frame_blocking(&mut self) -> Option<Frame> {
    let sample = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))?;
    self
      .sample_to_frame(sample)
      .map_err(|e| {
        error!("无法读取视频帧: {}", e);
        e
      })
      .ok()
  }

  fn return_frame(&mut self, frame: Frame) {
    drop(frame);
  }

  fn resolution(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}
