// 该文件是 Qianli （千里眼） 项目的一部分。
// src/postprocess.rs - 检测结果后处理
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

//! # 后处理
//!
//! 从检测器原始输出中筛选分数达标的目标，
//! 把检测框映射到高清画面并裁剪保存，再映射到视频流坐标供叠加层绘制。

use tracing::{debug, info, warn};

use crate::{
  artifact::ArtifactWriter,
  error::{PipelineError, Result},
  geometry::{CenterCrop, NormalizedBox, PixelRect},
  label::LabelTable,
  orchestrator::{HdImage, RawOutputs},
};

/// 每个周期送往叠加层的检测框上限
pub const MAX_OVERLAY_DETECTIONS: usize = 5;

const RGB_CHANNELS: usize = 3;

/// 分数阈值（百分比）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold(u8);

impl Threshold {
  pub fn new(percent: u8) -> Result<Self> {
    if percent > 100 {
      return Err(PipelineError::configuration(format!(
        "分数阈值 {} 超出 0-100",
        percent
      )));
    }
    Ok(Threshold(percent))
  }

  pub fn percent(&self) -> u8 {
    self.0
  }

  pub fn passes(&self, score: f32) -> bool {
    score as f64 >= self.0 as f64 / 100.0
  }
}

/// 本周期内的一个检测目标
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub index: usize,
  pub class: usize,
  pub score: f32,
  pub bbox: NormalizedBox,
}

/// 视频流坐标下的检测框
#[derive(Debug, Clone, PartialEq)]
pub struct RenderableDetection {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
  pub label: String,
  pub score: f32,
}

impl RenderableDetection {
  fn new(rect: PixelRect, label: &str, score: f32) -> Self {
    RenderableDetection {
      left: rect.left(),
      top: rect.top(),
      right: rect.right(),
      bottom: rect.bottom(),
      label: label.to_string(),
      score,
    }
  }
}

/// 从交错排列的 RGB 图像中裁出矩形区域，超出图像的部分被裁掉
pub fn crop_interleaved(image: &HdImage<'_>, rect: &PixelRect) -> Option<Vec<u8>> {
  let rect = rect.clamp_to(image.width, image.height)?;
  let stride = image.width as usize * RGB_CHANNELS;
  let row_bytes = rect.width as usize * RGB_CHANNELS;
  let mut out = Vec::with_capacity(row_bytes * rect.height as usize);
  for row in rect.y as usize..rect.bottom() as usize {
    let start = row * stride + rect.x as usize * RGB_CHANNELS;
    out.extend_from_slice(image.data.get(start..start + row_bytes)?);
  }
  Some(out)
}

pub struct PostProcessor {
  threshold: Threshold,
  labels: LabelTable,
}

impl PostProcessor {
  pub fn new(threshold: Threshold, labels: LabelTable) -> Self {
    PostProcessor { threshold, labels }
  }

  pub fn threshold(&self) -> Threshold {
    self.threshold
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  /// 读取检测数量，过滤低分目标
  ///
  /// 数量不超过各输出张量的容量；数量非有限或不大于 0 时没有检测结果。
  pub fn detections(&self, raw: &RawOutputs) -> Result<Vec<Detection>> {
    let capacity = (raw.locations.len() / 4)
      .min(raw.classes.len())
      .min(raw.scores.len());
    let count = match raw.count.first() {
      Some(&c) if c.is_finite() && c > 0.0 => (c as usize).min(capacity),
      _ => 0,
    };
    debug!("检测数量: {}", count);

    let mut kept = Vec::new();
    for i in 0..count {
      let score = raw.scores[i];
      if !score.is_finite() {
        warn!("检测 {} 的分数无效: {}", i, score);
        continue;
      }
      let score = score.clamp(0.0, 1.0);
      if !self.threshold.passes(score) {
        continue;
      }

      let class = raw.classes[i];
      if !class.is_finite() || class < 0.0 || class as usize >= self.labels.len() {
        return Err(PipelineError::configuration(format!(
          "检测 {} 的类别编号 {} 超出标签表范围 (共 {} 个)",
          i,
          class,
          self.labels.len()
        )));
      }

      let loc = &raw.locations[4 * i..4 * i + 4];
      kept.push(Detection {
        index: i,
        class: class as usize,
        score,
        bbox: NormalizedBox {
          top: loc[0],
          left: loc[1],
          bottom: loc[2],
          right: loc[3],
        },
      });
    }
    Ok(kept)
  }

  /// 处理一个周期的检测输出
  ///
  /// 每个达标目标都会从高清画面中裁剪并保存；单个目标保存失败只记录警告。
  /// 返回按分数从高到低排列、最多 [`MAX_OVERLAY_DETECTIONS`] 个的叠加框。
  pub fn process(
    &self,
    raw: &RawOutputs,
    hd_image: &HdImage<'_>,
    stream: (u32, u32),
    artifacts: &ArtifactWriter,
  ) -> Result<Vec<RenderableDetection>> {
    let hd = CenterCrop::new(hd_image.width, hd_image.height)?;
    let overlay = CenterCrop::new(stream.0, stream.1)?;

    let mut kept = self.detections(raw)?;
    for d in &kept {
      let label = self.labels.get(d.class)?;
      info!("检测到 {} (分数 {:.2})", label, d.score);

      let rect = hd.map(&d.bbox);
      let Some(clamped) = rect.clamp_to(hd.width(), hd.height()) else {
        warn!("检测 {} 的区域 {:?} 不在画面内, 跳过保存", d.index, rect);
        continue;
      };
      let Some(pixels) = crop_interleaved(hd_image, &clamped) else {
        warn!("检测 {} 裁剪失败, 跳过保存", d.index);
        continue;
      };
      if let Err(e) = artifacts.write(
        d.index,
        &pixels,
        clamped.width as u32,
        clamped.height as u32,
      ) {
        warn!("检测 {} 保存失败: {}", d.index, e);
      }
    }

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(MAX_OVERLAY_DETECTIONS);
    kept
      .iter()
      .map(|d| {
        let label = self.labels.get(d.class)?;
        Ok(RenderableDetection::new(overlay.map(&d.bbox), label, d.score))
      })
      .collect()
  }
}
