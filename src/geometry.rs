// 该文件是 Qianli （千里眼） 项目的一部分。
// src/geometry.rs - 坐标空间换算
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

//! # 坐标空间
//!
//! - 检测空间：模型输出的归一化 `[0, 1]` 框，定义在居中裁剪的低分辨率输入上；
//! - 高清空间：高清帧上的像素坐标，用于裁剪和编码；
//! - 叠加空间：当前显示视频流上的像素坐标，用于绘制。
//!
//! 检测器看到的是帧中央的正方形区域（边长为帧高），
//! 因此归一化坐标按高度缩放，再在水平方向加上 `(width - height) / 2` 的偏移。

use crate::error::{PipelineError, Result};

/// 检测空间中的归一化框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
}

/// 像素矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub x: i32,
  pub y: i32,
  pub width: i32,
  pub height: i32,
}

impl PixelRect {
  pub fn left(&self) -> i32 {
    self.x
  }

  pub fn top(&self) -> i32 {
    self.y
  }

  pub fn right(&self) -> i32 {
    self.x.saturating_add(self.width)
  }

  pub fn bottom(&self) -> i32 {
    self.y.saturating_add(self.height)
  }

  /// 裁剪到 `[0, width) x [0, height)` 内；没有交集时返回 `None`
  pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
    let (w, h) = (width.min(i32::MAX as u32) as i32, height.min(i32::MAX as u32) as i32);
    let left = self.left().clamp(0, w);
    let top = self.top().clamp(0, h);
    let right = self.right().clamp(0, w);
    let bottom = self.bottom().clamp(0, h);
    if right <= left || bottom <= top {
      return None;
    }
    Some(PixelRect {
      x: left,
      y: top,
      width: right - left,
      height: bottom - top,
    })
  }
}

/// 宽不小于高的帧，检测器输入对应其中央的正方形区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterCrop {
  width: u32,
  height: u32,
}

impl CenterCrop {
  /// 竖直画面（高大于宽）不受支持
  pub fn new(width: u32, height: u32) -> Result<Self> {
    if width == 0 || height == 0 {
      return Err(PipelineError::configuration(format!(
        "无效的帧尺寸 {}x{}",
        width, height
      )));
    }
    if height > width {
      return Err(PipelineError::configuration(format!(
        "不支持高大于宽的画面 {}x{}",
        width, height
      )));
    }
    Ok(CenterCrop { width, height })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  /// 把检测空间的框映射到本帧的像素空间
  pub fn map(&self, b: &NormalizedBox) -> PixelRect {
    let side = self.height as f32;
    let offset = ((self.width - self.height) / 2) as f32;
    PixelRect {
      x: (b.left * side + offset) as i32,
      y: (b.top * side) as i32,
      width: ((b.right - b.left) * side) as i32,
      height: ((b.bottom - b.top) * side) as i32,
    }
  }
}

/// 低分辨率预处理的裁剪区域
///
/// 取视频流中央、与检测器输入宽高比一致的最大矩形，
/// 水平或竖直方向之一被填满。
pub fn input_crop(
  stream_width: u32,
  stream_height: u32,
  input_width: u32,
  input_height: u32,
) -> Result<PixelRect> {
  if stream_width == 0 || stream_height == 0 || input_width == 0 || input_height == 0 {
    return Err(PipelineError::configuration(format!(
      "无效的裁剪参数: 视频流 {}x{}, 模型输入 {}x{}",
      stream_width, stream_height, input_width, input_height
    )));
  }

  let ratio = input_width as f32 / input_height as f32;
  let mut crop_w = stream_width as f32;
  let mut crop_h = crop_w / ratio;
  if crop_h > stream_height as f32 {
    crop_h = stream_height as f32;
    crop_w = crop_h * ratio;
  }
  let (crop_w, crop_h) = (crop_w as u32, crop_h as u32);

  Ok(PixelRect {
    x: ((stream_width - crop_w) / 2) as i32,
    y: ((stream_height - crop_h) / 2) as i32,
    width: crop_w as i32,
    height: crop_h as i32,
  })
}
