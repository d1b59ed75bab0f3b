// 该文件是 Qianli （千里眼） 项目的一部分。
// src/driver.rs - 周期检测任务
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
  sync::mpsc::{self, RecvTimeoutError},
  thread,
  time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{error::PipelineError, pipeline::Pipeline};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
  FrameAcquisition { stream: &'static str },
  JobFailure { message: String },
  Configuration { message: String },
  Interrupted,
  TickLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
  Idle,
  Running,
  Stopped(StopReason),
}

/// 驱动流水线按周期运行
///
/// 一个周期内依次取低分辨率帧和高清帧、执行作业、后处理并更新叠加层。
/// 周期内的错误会停止驱动，不做重试。
pub struct PipelineDriver {
  pipeline: Pipeline,
  state: DriverState,
  ticks: u64,
}

impl PipelineDriver {
  pub fn new(pipeline: Pipeline) -> Self {
    PipelineDriver {
      pipeline,
      state: DriverState::Idle,
      ticks: 0,
    }
  }

  pub fn state(&self) -> &DriverState {
    &self.state
  }

  pub fn ticks(&self) -> u64 {
    self.ticks
  }

  pub fn start(&mut self) {
    if self.state == DriverState::Idle {
      info!("开始检测任务...");
      self.state = DriverState::Running;
    }
  }

  pub fn into_pipeline(self) -> Pipeline {
    self.pipeline
  }

  fn stop(&mut self, reason: StopReason) -> DriverState {
    warn!("检测任务停止: {:?}", reason);
    self.state = DriverState::Stopped(reason);
    self.state.clone()
  }

  /// 执行一个周期；不在运行状态时直接返回当前状态
  pub fn tick(&mut self) -> DriverState {
    if self.state != DriverState::Running {
      return self.state.clone();
    }
    self.ticks += 1;
    info!("处理第 {} 个周期", self.ticks);
    let now = Instant::now();

    let Some(low) = self.pipeline.low.get_last_frame_blocking() else {
      error!("无法获取低分辨率帧");
      return self.stop(StopReason::FrameAcquisition { stream: "low" });
    };
    let Some(high) = self.pipeline.high.get_last_frame_blocking() else {
      error!("无法获取高清帧");
      self.pipeline.low.return_frame(low);
      return self.stop(StopReason::FrameAcquisition { stream: "high" });
    };

    let result = self.pipeline.process_frames(&low, &high);
    self.pipeline.low.return_frame(low);
    self.pipeline.high.return_frame(high);

    let detections = match result {
      Ok(detections) => detections,
      Err(e) => {
        error!("周期执行失败: {}", e);
        let message = e.to_string();
        return self.stop(match e {
          PipelineError::Configuration(_) | PipelineError::LabelTable(_) => {
            StopReason::Configuration { message }
          }
          _ => StopReason::JobFailure { message },
        });
      }
    };

    if let Err(e) = self.pipeline.overlay.render(&detections) {
      warn!("叠加层更新失败: {}", e);
    }
    info!(
      "周期完成, {} 个检测框, 耗时: {:.2?}",
      detections.len(),
      now.elapsed()
    );
    self.state.clone()
  }

  /// 按固定周期运行，直到停止、达到周期数或收到中断信号
  ///
  /// 每个周期执行完才开始计时等待下一个周期。周期数上限为 0 时不执行任何周期。
  pub fn run(&mut self, period: Duration, max_ticks: Option<u64>) -> DriverState {
    self.start();
    let (tx, rx) = mpsc::channel();

    if let Err(e) = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    }) {
      warn!("无法设置中断处理: {}", e);
    }

    let limit_reached = |ticks: u64| max_ticks.is_some_and(|n| ticks >= n);
    while self.state == DriverState::Running {
      if limit_reached(self.ticks) {
        info!("达到指定周期数 {}, 退出任务循环", self.ticks);
        self.stop(StopReason::TickLimit);
        break;
      }
      if self.tick() != DriverState::Running {
        break;
      }
      if limit_reached(self.ticks) {
        continue;
      }
      match rx.recv_timeout(period) {
        Ok(()) => {
          warn!("中断信号接收，退出任务循环");
          self.stop(StopReason::Interrupted);
          break;
        }
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => thread::sleep(period),
      }
    }

    info!("任务完成，退出");
    self.state.clone()
  }
}
