// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay/bbox.rs - 硬件检测框叠加记录
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
  fs::{File, OpenOptions},
  io::{BufWriter, Write},
  path::PathBuf,
};

use chrono::Local;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  overlay::{OverlayError, OverlaySink},
  postprocess::RenderableDetection,
  source::query_size,
};

/// 低于该分数的检测框用角标样式
pub const OUTLINE_SCORE_THRESHOLD: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BboxColor {
  Red,
  Green,
  Blue,
  Black,
}

impl BboxColor {
  pub fn for_label(label: &str) -> Self {
    match label {
      "person" => BboxColor::Red,
      "bed" => BboxColor::Green,
      "chair" => BboxColor::Blue,
      _ => BboxColor::Black,
    }
  }

  pub fn rgb(&self) -> [u8; 3] {
    match self {
      BboxColor::Red => [0xff, 0, 0],
      BboxColor::Green => [0, 0xff, 0],
      BboxColor::Blue => [0, 0, 0xff],
      BboxColor::Black => [0, 0, 0],
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BboxStyle {
  Outline,
  Corners,
}

impl BboxStyle {
  pub fn for_score(score: f32) -> Self {
    if score >= OUTLINE_SCORE_THRESHOLD {
      BboxStyle::Outline
    } else {
      BboxStyle::Corners
    }
  }

  fn as_str(&self) -> &'static str {
    match self {
      BboxStyle::Outline => "outline",
      BboxStyle::Corners => "corners",
    }
  }
}

/// 每次更新写一行 JSON，坐标按视频流尺寸归一化
///
/// `bbox:///path/boxes.jsonl?width=1920&height=1080`
pub struct BboxOverlay {
  path: PathBuf,
  writer: BufWriter<File>,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for BboxOverlay {
  const SCHEME: &'static str = "bbox";
}

impl FromUrl for BboxOverlay {
  type Error = OverlayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OverlayError::SchemeMismatch(url.scheme().to_string()));
    }
    let (width, height) = query_size(url).ok_or(OverlayError::MissingSize)?;
    Self::open(url.path(), width, height)
  }
}

impl BboxOverlay {
  pub fn open(path: impl Into<PathBuf>, width: u32, height: u32) -> Result<Self, OverlayError> {
    if width == 0 || height == 0 {
      return Err(OverlayError::MissingSize);
    }
    let path = path.into();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(BboxOverlay {
      path,
      writer: BufWriter::new(file),
      width,
      height,
    })
  }
}

impl OverlaySink for BboxOverlay {
  fn render(&mut self, detections: &[RenderableDetection]) -> Result<(), OverlayError> {
    let (w, h) = (self.width as f32, self.height as f32);
    let boxes: Vec<serde_json::Value> = detections
      .iter()
      .map(|d| {
        let color = BboxColor::for_label(&d.label);
        json!({
          "label": d.label,
          "score": d.score,
          "color": color.rgb(),
          "style": BboxStyle::for_score(d.score).as_str(),
          "left": d.left as f32 / w,
          "top": d.top as f32 / h,
          "right": d.right as f32 / w,
          "bottom": d.bottom as f32 / h,
        })
      })
      .collect();

    let record = json!({
      "timestamp": Local::now().to_rfc3339(),
      "boxes": boxes,
    });
    serde_json::to_writer(&mut self.writer, &record)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    debug!("写入 {} 个检测框到 {}", detections.len(), self.path.display());
    Ok(())
  }

  fn stream_size(&self) -> Option<(u32, u32)> {
    Some((self.width, self.height))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn color_follows_label() {
    assert_eq!(BboxColor::for_label("person"), BboxColor::Red);
    assert_eq!(BboxColor::for_label("bed"), BboxColor::Green);
    assert_eq!(BboxColor::for_label("chair"), BboxColor::Blue);
    assert_eq!(BboxColor::for_label("dog"), BboxColor::Black);
  }

  #[test]
  fn style_follows_score() {
    assert_eq!(BboxStyle::for_score(0.2), BboxStyle::Outline);
    assert_eq!(BboxStyle::for_score(0.9), BboxStyle::Outline);
    assert_eq!(BboxStyle::for_score(0.19), BboxStyle::Corners);
  }

  #[test]
  fn writes_normalized_boxes() {
    let path = std::env::temp_dir().join(format!("qianli-bbox-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let mut overlay = BboxOverlay::open(&path, 200, 100).unwrap();
    overlay
      .render(&[RenderableDetection {
        left: 50,
        top: 25,
        right: 150,
        bottom: 75,
        label: "person".to_string(),
        score: 0.1,
      }])
      .unwrap();
    overlay.render(&[]).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);

    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    let b = &record["boxes"][0];
    assert_eq!(b["label"], "person");
    assert_eq!(b["style"], "corners");
    assert_eq!(b["color"], json!([255, 0, 0]));
    assert_eq!(b["left"].as_f64(), Some(0.25));
    assert_eq!(b["bottom"].as_f64(), Some(0.75));
    assert!(record["timestamp"].is_string());

    let empty: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(empty["boxes"], json!([]));
    std::fs::remove_file(path).unwrap();
  }
}
