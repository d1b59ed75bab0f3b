// 该文件是 Qianli （千里眼） 项目的一部分。
// src/config.rs - 启动参数
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

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tracing::info;
use url::Url;

use crate::{
  device::cpu_proc::CPU_PROC_DEVICE,
  error::{PipelineError, Result},
  geometry::CenterCrop,
  postprocess::Threshold,
};

/// 检测周期
pub const DEFAULT_PERIOD_MS: u64 = 2000;

/// Qianli 目标检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型文件路径
  #[arg(long, value_name = "FILE")]
  pub model: PathBuf,

  /// 模型输入宽度
  #[arg(long, value_name = "WIDTH")]
  pub width: u32,

  /// 模型输入高度
  #[arg(long, value_name = "HEIGHT")]
  pub height: u32,

  /// 检测结果 JPEG 质量 (1 - 100)
  #[arg(long, default_value = "80", value_name = "QUALITY")]
  pub quality: u8,

  /// 高清画面宽度
  #[arg(long, default_value = "1280", value_name = "WIDTH")]
  pub raw_width: u32,

  /// 高清画面高度
  #[arg(long, default_value = "720", value_name = "HEIGHT")]
  pub raw_height: u32,

  /// 分数阈值，百分比 (0 - 100)
  #[arg(long, default_value = "50", value_name = "PERCENT")]
  pub threshold: u8,

  /// 标签文件路径，每行一个类别
  #[arg(long, value_name = "FILE")]
  pub labels: PathBuf,

  /// 检测模型所用设备
  #[arg(long, default_value = "rknpu", value_name = "DEVICE")]
  pub chip: String,

  /// 预处理所用设备
  #[arg(long, default_value = CPU_PROC_DEVICE, value_name = "DEVICE")]
  pub preprocess_chip: String,

  /// 低分辨率视频源，如 raw:///tmp/low.nv12?width=640&height=360&loop
  #[arg(long, value_name = "SOURCE")]
  pub low: Url,

  /// 高清视频源，尺寸需与 raw-width/raw-height 一致
  #[arg(long, value_name = "SOURCE")]
  pub high: Url,

  /// 叠加层输出: none:, compositor:///path.png?width=&height=, bbox:///path.jsonl?width=&height=
  #[arg(long, default_value = "none:", value_name = "OVERLAY")]
  pub overlay: Url,

  /// 检测结果图像目录
  #[arg(long, default_value = "/tmp", value_name = "DIR")]
  pub artifact_dir: PathBuf,

  /// 检测周期（毫秒）
  #[arg(long, default_value_t = DEFAULT_PERIOD_MS, value_name = "MS")]
  pub period: u64,

  /// 处理指定周期数后退出
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,
}

/// 校验后的流水线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub model: PathBuf,
  pub labels: PathBuf,
  pub input_width: u32,
  pub input_height: u32,
  pub hd_width: u32,
  pub hd_height: u32,
  pub quality: u8,
  pub threshold: Threshold,
  pub detector_device: String,
  pub preprocess_device: String,
  pub artifact_dir: PathBuf,
  pub period: Duration,
  pub max_ticks: Option<u64>,
}

impl PipelineConfig {
  pub fn validate(&self) -> Result<()> {
    if self.input_width == 0 || self.input_height == 0 {
      return Err(PipelineError::configuration(format!(
        "无效的模型输入尺寸 {}x{}",
        self.input_width, self.input_height
      )));
    }
    CenterCrop::new(self.hd_width, self.hd_height)?;
    if !(1..=100).contains(&self.quality) {
      return Err(PipelineError::configuration(format!(
        "JPEG 质量 {} 超出 1-100",
        self.quality
      )));
    }
    if self.detector_device.is_empty() || self.preprocess_device.is_empty() {
      return Err(PipelineError::configuration("设备名称不能为空"));
    }
    Ok(())
  }
}

impl TryFrom<&Args> for PipelineConfig {
  type Error = PipelineError;

  fn try_from(args: &Args) -> Result<Self> {
    let config = PipelineConfig {
      model: args.model.clone(),
      labels: args.labels.clone(),
      input_width: args.width,
      input_height: args.height,
      hd_width: args.raw_width,
      hd_height: args.raw_height,
      quality: args.quality,
      threshold: Threshold::new(args.threshold)?,
      detector_device: args.chip.clone(),
      preprocess_device: args.preprocess_chip.clone(),
      artifact_dir: args.artifact_dir.clone(),
      period: Duration::from_millis(args.period),
      max_ticks: args.frame_number,
    };
    config.validate()?;
    info!(
      "模型输入 {}x{}, 高清画面 {}x{}, 阈值 {}%",
      config.input_width,
      config.input_height,
      config.hd_width,
      config.hd_height,
      config.threshold.percent()
    );
    Ok(config)
  }
}
