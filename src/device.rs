// 该文件是 Qianli （千里眼） 项目的一部分。
// src/device.rs - 推理设备接口
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

//! # 推理设备
//!
//! 推理引擎对流水线而言是不透明的作业执行器，只暴露以下能力：
//! 连接、列出设备、按名称获取设备、从文件加载模型（可带参数表）、
//! 创建作业、同步执行作业。句柄在 drop 时销毁。
//!
//! 张量没有名字，只按声明顺序区分；作业通过文件描述符访问张量内存。

use std::{collections::BTreeMap, fs::File};

use thiserror::Error;
use tracing::info;

pub mod cpu_proc;
#[cfg(feature = "rknpu_device")]
pub mod rknpu;

pub use self::cpu_proc::CpuProcDevice;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct DeviceError {
  pub message: String,
  pub code: i32,
}

impl DeviceError {
  pub const INVALID_MODEL: i32 = 1;
  pub const INVALID_PARAM: i32 = 2;
  pub const INVALID_TENSOR: i32 = 3;
  pub const IO: i32 = 4;
  pub const NOT_FOUND: i32 = 5;
  pub const BACKEND: i32 = 6;

  pub fn new(code: i32, message: impl ToString) -> Self {
    DeviceError {
      message: message.to_string(),
      code,
    }
  }
}

impl From<std::io::Error> for DeviceError {
  fn from(err: std::io::Error) -> Self {
    DeviceError::new(DeviceError::IO, err)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
  UInt8,
  Float32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
  Nv12,
  Nhwc,
  Flat,
}

/// 张量描述
///
/// `pitch` 是张量在内存中实际占用的字节数，以它为准分配缓冲区，
/// 而不是根据 `dims` 推算。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
  pub data_type: DataType,
  pub layout: Layout,
  pub dims: Vec<usize>,
  pub pitch: usize,
}

impl TensorInfo {
  pub fn new(data_type: DataType, layout: Layout, dims: Vec<usize>, pitch: usize) -> Self {
    TensorInfo {
      data_type,
      layout,
      dims,
      pitch,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
  Str(String),
  IntArr2([i64; 2]),
  IntArr4([i64; 4]),
}

/// 模型/作业参数表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMap {
  entries: BTreeMap<String, ParamValue>,
}

impl ParamMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_str(&mut self, key: &str, value: &str) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::Str(value.to_string()));
    self
  }

  pub fn set_int_arr2(&mut self, key: &str, a: i64, b: i64) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::IntArr2([a, b]));
    self
  }

  pub fn set_int_arr4(&mut self, key: &str, value: [i64; 4]) -> &mut Self {
    self
      .entries
      .insert(key.to_string(), ParamValue::IntArr4(value));
    self
  }

  pub fn get(&self, key: &str) -> Option<&ParamValue> {
    self.entries.get(key)
  }

  pub fn get_str(&self, key: &str) -> Result<&str, DeviceError> {
    match self.get(key) {
      Some(ParamValue::Str(s)) => Ok(s),
      Some(_) => Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("参数 {} 类型错误, 期望字符串", key),
      )),
      None => Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("缺少参数 {}", key),
      )),
    }
  }

  pub fn get_int_arr2(&self, key: &str) -> Result<[i64; 2], DeviceError> {
    match self.get(key) {
      Some(ParamValue::IntArr2(v)) => Ok(*v),
      Some(_) => Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("参数 {} 类型错误, 期望两个整数", key),
      )),
      None => Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("缺少参数 {}", key),
      )),
    }
  }

  pub fn get_int_arr4(&self, key: &str) -> Result<Option<[i64; 4]>, DeviceError> {
    match self.get(key) {
      Some(ParamValue::IntArr4(v)) => Ok(Some(*v)),
      Some(_) => Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("参数 {} 类型错误, 期望四个整数", key),
      )),
      None => Ok(None),
    }
  }
}

/// 已创建的作业，绑定了模型与输入输出张量，可重复执行
pub trait Job {
  fn run(&mut self) -> Result<(), DeviceError>;
}

/// 已加载的模型
pub trait Model {
  fn name(&self) -> &str;
  fn inputs(&self) -> &[TensorInfo];
  fn outputs(&self) -> &[TensorInfo];

  /// 按声明顺序绑定输入输出描述符，创建可复用的作业
  fn create_job(
    &self,
    inputs: Vec<File>,
    outputs: Vec<File>,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Job>, DeviceError>;
}

/// 执行设备
pub trait Device {
  fn name(&self) -> &str;

  /// 加载模型；`model` 为空表示设备自带的处理模型（如图像预处理）
  fn load_model(
    &self,
    model: Option<&File>,
    name: &str,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Model>, DeviceError>;
}

/// 与推理服务的连接，持有全部可用设备
pub struct Connection {
  devices: Vec<Box<dyn Device>>,
}

impl Connection {
  /// 建立连接并注册内置的软件预处理设备
  pub fn connect() -> Result<Self, DeviceError> {
    info!("连接推理服务");
    Ok(Connection {
      devices: vec![Box::new(CpuProcDevice)],
    })
  }

  pub fn with_device(mut self, device: Box<dyn Device>) -> Self {
    self.devices.push(device);
    self
  }

  pub fn devices(&self) -> Vec<&str> {
    self.devices.iter().map(|d| d.name()).collect()
  }

  pub fn device(&self, name: &str) -> Result<&dyn Device, DeviceError> {
    self
      .devices
      .iter()
      .find(|d| d.name() == name)
      .map(|d| d.as_ref())
      .ok_or_else(|| DeviceError::new(DeviceError::NOT_FOUND, format!("找不到设备 {}", name)))
  }
}

/// 计算 NV12 图像的字节数（Y 平面 + 交错的 UV 平面）
pub fn nv12_size(width: usize, height: usize) -> usize {
  width * height + 2 * width.div_ceil(2) * height.div_ceil(2)
}
