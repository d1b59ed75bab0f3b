// 该文件是 Qianli （千里眼） 项目的一部分。
// src/device/rknpu.rs - RKNPU 检测设备
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
  fs::File,
  io::{Read, Write},
  os::unix::fs::FileExt,
  rc::Rc,
};

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};

use super::{DataType, Device, DeviceError, Job, Layout, Model, ParamMap, TensorInfo};

pub const RKNPU_DEVICE: &str = "rknpu";

const SSD_NUM_INPUTS: u32 = 1;
const SSD_NUM_OUTPUTS: u32 = 4;
const SSD_MAX_DETECTIONS: usize = 20;
const RGB_CHANNELS: usize = 3;
const FLOAT_SIZE: usize = 4;

impl From<rknpu::Error> for DeviceError {
  fn from(err: rknpu::Error) -> Self {
    DeviceError::new(DeviceError::BACKEND, err)
  }
}

/// RKNPU 上的 SSD 检测模型
///
/// 输入为 NHWC uint8 RGB，输出四个 float 张量：
/// 位置 `4×N`（top, left, bottom, right），类别 `N`，分数 `N`，数量 `1`。
/// 输出从描述符的当前位置顺序写入，每次执行前需要把输出描述符复位到开头。
pub struct RknpuDevice {
  input_width: usize,
  input_height: usize,
}

impl RknpuDevice {
  pub fn new(input_width: usize, input_height: usize) -> Self {
    RknpuDevice {
      input_width,
      input_height,
    }
  }
}

impl Device for RknpuDevice {
  fn name(&self) -> &str {
    RKNPU_DEVICE
  }

  fn load_model(
    &self,
    model: Option<&File>,
    name: &str,
    _params: Option<&ParamMap>,
  ) -> Result<Box<dyn Model>, DeviceError> {
    let mut file = model.ok_or_else(|| {
      DeviceError::new(DeviceError::INVALID_MODEL, "RKNPU 需要模型文件")
    })?;
    let mut model_data = Vec::new();
    file.read_to_end(&mut model_data)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(e.into());
      }
    }

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    if num_inputs != SSD_NUM_INPUTS || num_outputs != SSD_NUM_OUTPUTS {
      error!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        SSD_NUM_INPUTS, SSD_NUM_OUTPUTS, num_inputs, num_outputs
      );
      return Err(DeviceError::new(
        DeviceError::INVALID_MODEL,
        format!(
          "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
          SSD_NUM_INPUTS, SSD_NUM_OUTPUTS, num_inputs, num_outputs
        ),
      ));
    }

    let (w, h, n) = (self.input_width, self.input_height, SSD_MAX_DETECTIONS);
    let float = |dims: Vec<usize>| {
      let pitch = dims.iter().product::<usize>() * FLOAT_SIZE;
      TensorInfo::new(DataType::Float32, Layout::Flat, dims, pitch)
    };

    info!("模型 {} 加载完成", name);
    Ok(Box::new(RknpuModel {
      name: name.to_string(),
      context: Rc::new(context),
      inputs: vec![TensorInfo::new(
        DataType::UInt8,
        Layout::Nhwc,
        vec![1, h, w, RGB_CHANNELS],
        w * h * RGB_CHANNELS,
      )],
      outputs: vec![
        float(vec![1, n, 4]),
        float(vec![1, n]),
        float(vec![1, n]),
        float(vec![1]),
      ],
    }))
  }
}

struct RknpuModel {
  name: String,
  context: Rc<Context>,
  inputs: Vec<TensorInfo>,
  outputs: Vec<TensorInfo>,
}

impl Model for RknpuModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn inputs(&self) -> &[TensorInfo] {
    &self.inputs
  }

  fn outputs(&self) -> &[TensorInfo] {
    &self.outputs
  }

  fn create_job(
    &self,
    inputs: Vec<File>,
    outputs: Vec<File>,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Job>, DeviceError> {
    if params.is_some() {
      return Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        "检测作业不接受参数表",
      ));
    }
    let Ok([input]) = <[File; 1]>::try_from(inputs) else {
      return Err(DeviceError::new(
        DeviceError::INVALID_TENSOR,
        "检测作业需要恰好一个输入",
      ));
    };
    if outputs.len() != self.outputs.len() {
      return Err(DeviceError::new(
        DeviceError::INVALID_TENSOR,
        format!("检测作业需要 {} 个输出", self.outputs.len()),
      ));
    }

    Ok(Box::new(RknpuJob {
      context: Rc::clone(&self.context),
      input,
      outputs,
      pitches: self.outputs.iter().map(|t| t.pitch).collect(),
      scratch: vec![0u8; self.inputs[0].pitch],
    }))
  }
}

struct RknpuJob {
  context: Rc<Context>,
  input: File,
  outputs: Vec<File>,
  pitches: Vec<usize>,
  scratch: Vec<u8>,
}

impl Job for RknpuJob {
  fn run(&mut self) -> Result<(), DeviceError> {
    self.input.read_exact_at(&mut self.scratch, 0)?;

    debug!("设置模型输入");
    self
      .context
      .set_input(0, &self.scratch, TensorFormat::NHWC, TensorType::UInt8)?;

    debug!("执行模型推理");
    self.context.run()?;

    let output = self.context.get_outputs()?;
    for (idx, (file, &pitch)) in self.outputs.iter_mut().zip(&self.pitches).enumerate() {
      let data = output.get_f32(idx)?;
      let mut bytes = Vec::with_capacity(pitch);
      for value in data.iter().take(pitch / FLOAT_SIZE) {
        bytes.extend_from_slice(&value.to_ne_bytes());
      }
      bytes.resize(pitch, 0);
      file.write_all(&bytes)?;
    }
    Ok(())
  }
}
