// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/object_detection.rs - 摄像头周期目标检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use qianli::{
  FromUrl,
  config::{Args, PipelineConfig},
  device::Connection,
  driver::{DriverState, PipelineDriver, StopReason},
  overlay::OverlayWrapper,
  pipeline::Pipeline,
  source::SourceWrapper,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model.display());
  info!("标签文件路径: {}", args.labels.display());
  info!("低分辨率视频源: {}", args.low);
  info!("高清视频源: {}", args.high);
  info!("叠加层: {}", args.overlay);

  let config = PipelineConfig::try_from(&args)?;

  let connection = Connection::connect()?;
  #[cfg(feature = "rknpu_device")]
  let connection = connection.with_device(Box::new(qianli::device::rknpu::RknpuDevice::new(
    config.input_width as usize,
    config.input_height as usize,
  )));

  let low = SourceWrapper::from_url(&args.low)?;
  let high = SourceWrapper::from_url(&args.high)?;
  let overlay = OverlayWrapper::from_url(&args.overlay)?;

  let pipeline = Pipeline::setup(
    &config,
    &connection,
    Box::new(low),
    Box::new(high),
    Box::new(overlay),
  )?;

  let mut driver = PipelineDriver::new(pipeline);
  let state = driver.run(config.period, config.max_ticks);
  info!("检测任务结束: {:?}, 共 {} 个周期", state, driver.ticks());

  driver.into_pipeline().shutdown();
  match state {
    DriverState::Stopped(StopReason::Interrupted | StopReason::TickLimit) => Ok(()),
    other => Err(anyhow::anyhow!("检测任务异常停止: {:?}", other)),
  }
}
