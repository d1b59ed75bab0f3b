// 该文件是 Qianli （千里眼） 项目的一部分。
// src/error.rs - 流水线错误定义
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

/// 流水线错误
///
/// 初始化阶段的错误（缓冲区、模型、张量绑定、标签）会中止启动；
/// 周期任务中的错误（取帧、作业执行）会终止循环，不做重试。
#[derive(Error, Debug)]
pub enum PipelineError {
  /// 共享内存缓冲区创建/映射失败
  #[error("资源错误: {op} 失败 ({tag}): {source}")]
  Resource {
    op: &'static str,
    tag: String,
    #[source]
    source: std::io::Error,
  },
  /// 张量 pitch 与期望大小不一致，属于配置错误
  #[error("张量 {tensor} 大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  SizeMismatch {
    tensor: String,
    expected: usize,
    actual: usize,
  },
  #[error("模型 {model} 在设备 {device} 上加载失败: {message}")]
  ModelLoad {
    model: String,
    device: String,
    message: String,
  },
  #[error("作业 {stage} 执行失败: {message}")]
  JobExecution { stage: &'static str, message: String },
  #[error("从 {stream} 视频源取帧失败")]
  FrameAcquisition { stream: &'static str },
  #[error("标签文件错误: {0}")]
  LabelTable(String),
  #[error("配置错误: {0}")]
  Configuration(String),
}

impl PipelineError {
  pub fn resource(op: &'static str, tag: &str, source: std::io::Error) -> Self {
    PipelineError::Resource {
      op,
      tag: tag.to_string(),
      source,
    }
  }

  pub fn job(stage: &'static str, message: impl ToString) -> Self {
    PipelineError::JobExecution {
      stage,
      message: message.to_string(),
    }
  }

  pub fn configuration(message: impl ToString) -> Self {
    PipelineError::Configuration(message.to_string())
  }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
