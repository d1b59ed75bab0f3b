// 该文件是 Qianli （千里眼） 项目的一部分。
// src/overlay/compositor.rs - 透明画布叠加层
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

use std::{fmt::Write as _, path::PathBuf};

use image::{Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  overlay::{OverlayError, OverlaySink},
  postprocess::RenderableDetection,
  source::query_size,
};

const LINE_WIDTH: i32 = 5;
const BOX_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// 在视频流大小的透明画布上画框，保存为 PNG，
/// 标签和分数写到同名的 `.txt` 文件中
///
/// `compositor:///tmp/overlay.png?width=1920&height=1080`
pub struct CompositorOverlay {
  path: PathBuf,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for CompositorOverlay {
  const SCHEME: &'static str = "compositor";
}

impl FromUrl for CompositorOverlay {
  type Error = OverlayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OverlayError::SchemeMismatch(url.scheme().to_string()));
    }
    let (width, height) = query_size(url).ok_or(OverlayError::MissingSize)?;
    if width == 0 || height == 0 {
      return Err(OverlayError::MissingSize);
    }
    Ok(CompositorOverlay {
      path: PathBuf::from(url.path()),
      width,
      height,
    })
  }
}

impl CompositorOverlay {
  fn draw(&self, detections: &[RenderableDetection]) -> RgbaImage {
    let mut canvas = RgbaImage::new(self.width, self.height);
    for d in detections {
      for inset in 0..LINE_WIDTH {
        let width = d.right - d.left - 2 * inset;
        let height = d.bottom - d.top - 2 * inset;
        if width <= 0 || height <= 0 {
          break;
        }
        let rect = Rect::at(d.left + inset, d.top + inset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
      }
    }
    canvas
  }
}

impl OverlaySink for CompositorOverlay {
  fn render(&mut self, detections: &[RenderableDetection]) -> Result<(), OverlayError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    self.draw(detections).save(&self.path)?;

    let mut labels = String::new();
    for d in detections {
      let _ = writeln!(
        labels,
        "{} ({:.6}) {} {} {} {}",
        d.label, d.score, d.left, d.top, d.right, d.bottom
      );
    }
    std::fs::write(self.path.with_extension("txt"), labels)?;
    debug!("叠加层已更新: {}", self.path.display());
    Ok(())
  }

  fn stream_size(&self) -> Option<(u32, u32)> {
    Some((self.width, self.height))
  }
}
