// 该文件是 Qianli （千里眼） 项目的一部分。
// src/orchestrator.rs - 模型加载与作业编排
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

//! # 作业编排
//!
//! 三个模型，三个作业：
//!
//! ```text
//! 低分辨率 NV12 ─(pp-low, 裁剪+缩放)─> RGB ─(detector)─> 位置/类别/分数/数量
//! 高清 NV12    ─(pp-high)──────────> RGB（用于裁剪检测结果）
//! ```
//!
//! 预处理的输出缓冲区同时作为检测器的输入，中间不做拷贝。
//! 所有缓冲区和作业在启动时建好，之后每个周期复用。

use std::{fs::File, path::PathBuf, time::Instant};

use tracing::{debug, info};

use crate::{
  buffer::{Buffer, BufferPool},
  device::{Connection, DataType, DeviceError, Job, Model, ParamMap, TensorInfo, cpu_proc},
  error::{PipelineError, Result},
  geometry::input_crop,
  source::Frame,
};

/// 检测器输出张量个数：位置、类别、分数、数量
pub const DETECTOR_OUTPUTS: usize = 4;

const RGB_CHANNELS: usize = 3;

#[derive(Debug, Clone)]
pub struct ModelPaths {
  pub detector: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DeviceSelectors {
  pub preprocess: String,
  pub detector: String,
}

impl DeviceSelectors {
  pub fn new(detector: impl Into<String>) -> Self {
    DeviceSelectors {
      preprocess: cpu_proc::CPU_PROC_DEVICE.to_string(),
      detector: detector.into(),
    }
  }
}

/// 各路图像尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessParams {
  pub stream_width: u32,
  pub stream_height: u32,
  pub input_width: u32,
  pub input_height: u32,
  pub hd_width: u32,
  pub hd_height: u32,
}

impl PreprocessParams {
  fn low_map(&self) -> ParamMap {
    let mut map = ParamMap::new();
    map
      .set_str(cpu_proc::INPUT_FORMAT, cpu_proc::FORMAT_NV12)
      .set_int_arr2(
        cpu_proc::INPUT_SIZE,
        self.stream_width as i64,
        self.stream_height as i64,
      )
      .set_str(cpu_proc::OUTPUT_FORMAT, cpu_proc::FORMAT_RGB_INTERLEAVED)
      .set_int_arr2(
        cpu_proc::OUTPUT_SIZE,
        self.input_width as i64,
        self.input_height as i64,
      );
    map
  }

  fn high_map(&self) -> ParamMap {
    let mut map = ParamMap::new();
    map
      .set_str(cpu_proc::INPUT_FORMAT, cpu_proc::FORMAT_NV12)
      .set_int_arr2(
        cpu_proc::INPUT_SIZE,
        self.hd_width as i64,
        self.hd_height as i64,
      )
      .set_str(cpu_proc::OUTPUT_FORMAT, cpu_proc::FORMAT_RGB_INTERLEAVED)
      .set_int_arr2(
        cpu_proc::OUTPUT_SIZE,
        self.hd_width as i64,
        self.hd_height as i64,
      );
    map
  }

  fn crop_map(&self) -> Result<ParamMap> {
    let crop = input_crop(
      self.stream_width,
      self.stream_height,
      self.input_width,
      self.input_height,
    )?;
    debug!("低分辨率裁剪区域: {:?}", crop);
    let mut map = ParamMap::new();
    map.set_int_arr4(
      cpu_proc::INPUT_CROP,
      [
        crop.x as i64,
        crop.y as i64,
        crop.width as i64,
        crop.height as i64,
      ],
    );
    Ok(map)
  }
}

struct LoadedModel {
  model: Box<dyn Model>,
  device: String,
}

impl LoadedModel {
  fn load_error(&self, err: impl ToString) -> PipelineError {
    PipelineError::ModelLoad {
      model: self.model.name().to_string(),
      device: self.device.clone(),
      message: err.to_string(),
    }
  }

  fn create_job(
    &self,
    inputs: Vec<File>,
    outputs: Vec<File>,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Job>> {
    self
      .model
      .create_job(inputs, outputs, params)
      .map_err(|e| self.load_error(format!("创建作业失败: {}", e)))
  }
}

/// 已加载、尚未绑定缓冲区的三个模型
pub struct PipelineModels {
  pp_low: LoadedModel,
  pp_high: LoadedModel,
  detector: LoadedModel,
}

fn load_on(
  connection: &Connection,
  device: &str,
  model_file: Option<&File>,
  name: &str,
  params: Option<&ParamMap>,
) -> Result<LoadedModel> {
  let err = |e: DeviceError| PipelineError::ModelLoad {
    model: name.to_string(),
    device: device.to_string(),
    message: e.to_string(),
  };
  let model = connection
    .device(device)
    .map_err(err)?
    .load_model(model_file, name, params)
    .map_err(err)?;
  info!("模型 {} 已加载到设备 {}", name, device);
  for (kind, tensors) in [("输入", model.inputs()), ("输出", model.outputs())] {
    for (i, t) in tensors.iter().enumerate() {
      debug!(
        "  {}{}: {:?} {:?} {:?}, {} 字节",
        kind, i, t.data_type, t.layout, t.dims, t.pitch
      );
    }
  }
  Ok(LoadedModel {
    model,
    device: device.to_string(),
  })
}

/// 加载两个预处理模型和检测模型
pub fn load_models(
  connection: &Connection,
  paths: &ModelPaths,
  devices: &DeviceSelectors,
  params: &PreprocessParams,
) -> Result<PipelineModels> {
  info!("可用设备: {:?}", connection.devices());

  let pp_low = load_on(
    connection,
    &devices.preprocess,
    None,
    "preprocess-low",
    Some(&params.low_map()),
  )?;
  let pp_high = load_on(
    connection,
    &devices.preprocess,
    None,
    "preprocess-high",
    Some(&params.high_map()),
  )?;

  let name = paths.detector.display().to_string();
  let file = File::open(&paths.detector).map_err(|e| PipelineError::ModelLoad {
    model: name.clone(),
    device: devices.detector.clone(),
    message: format!("无法打开模型文件: {}", e),
  })?;
  let detector = load_on(connection, &devices.detector, Some(&file), &name, None)?;

  Ok(PipelineModels {
    pp_low,
    pp_high,
    detector,
  })
}

fn check_arity(model: &LoadedModel, inputs: usize, outputs: usize) -> Result<()> {
  let (i, o) = (model.model.inputs().len(), model.model.outputs().len());
  if i != inputs || o != outputs {
    return Err(PipelineError::configuration(format!(
      "模型 {} 声明了 {} 个输入 {} 个输出, 期望 {} 个输入 {} 个输出",
      model.model.name(),
      i,
      o,
      inputs,
      outputs
    )));
  }
  Ok(())
}

fn check_data_type(tensor: &str, info: &TensorInfo, expected: DataType) -> Result<()> {
  if info.data_type != expected {
    return Err(PipelineError::configuration(format!(
      "张量 {} 的数据类型为 {:?}, 期望 {:?}",
      tensor, info.data_type, expected
    )));
  }
  Ok(())
}

fn check_size(tensor: &str, expected: usize, actual: usize) -> Result<()> {
  if expected != actual {
    return Err(PipelineError::SizeMismatch {
      tensor: tensor.to_string(),
      expected,
      actual,
    });
  }
  Ok(())
}

impl PipelineModels {
  /// 校验张量大小，按 pitch 分配缓冲区并创建三个作业
  ///
  /// 校验失败时不会分配任何缓冲区。
  pub fn bind_tensors(
    self,
    pool: &mut BufferPool,
    expect: &PreprocessParams,
  ) -> Result<JobOrchestrator> {
    check_arity(&self.pp_low, 1, 1)?;
    check_arity(&self.pp_high, 1, 1)?;
    check_arity(&self.detector, 1, DETECTOR_OUTPUTS)?;
    check_data_type(
      "pp-low-out",
      &self.pp_low.model.outputs()[0],
      DataType::UInt8,
    )?;
    check_data_type(
      "pp-high-out",
      &self.pp_high.model.outputs()[0],
      DataType::UInt8,
    )?;
    check_data_type(
      "detector-in",
      &self.detector.model.inputs()[0],
      DataType::UInt8,
    )?;
    for (i, tensor) in self.detector.model.outputs().iter().enumerate() {
      check_data_type(&format!("detector-out{}", i), tensor, DataType::Float32)?;
    }

    let low_in = self.pp_low.model.inputs()[0].pitch;
    let low_out = self.pp_low.model.outputs()[0].pitch;
    let high_in = self.pp_high.model.inputs()[0].pitch;
    let high_out = self.pp_high.model.outputs()[0].pitch;
    let det_in = self.detector.model.inputs()[0].pitch;

    let rgb = |w: u32, h: u32| w as usize * h as usize * RGB_CHANNELS;
    check_size(
      "pp-low-out",
      rgb(expect.input_width, expect.input_height),
      low_out,
    )?;
    check_size("detector-in", low_out, det_in)?;
    check_size(
      "pp-high-out",
      rgb(expect.hd_width, expect.hd_height),
      high_out,
    )?;
    let crop = expect.crop_map()?;

    let mut buffers = Vec::with_capacity(4 + DETECTOR_OUTPUTS);
    let mut acquire = |tag: &str, size: usize| -> Result<Buffer> {
      let buffer = pool.acquire(tag, size)?;
      debug!("张量 {} 绑定到 {:?}", tag, buffer);
      Ok(buffer)
    };
    buffers.push(acquire("pp-low-in", low_in)?);
    buffers.push(acquire("detector-in", det_in)?);
    buffers.push(acquire("pp-high-in", high_in)?);
    buffers.push(acquire("pp-high-out", high_out)?);
    for (i, tensor) in self.detector.model.outputs().iter().enumerate() {
      buffers.push(acquire(&format!("detector-out{}", i), tensor.pitch)?);
    }
    let bindings = TensorBindings::from_vec(buffers)?;

    let low_job = self.pp_low.create_job(
      vec![bindings.pp_low_in.share_fd()?],
      vec![bindings.detector_in.share_fd()?],
      Some(&crop),
    )?;
    let high_job = self.pp_high.create_job(
      vec![bindings.pp_high_in.share_fd()?],
      vec![bindings.pp_high_out.share_fd()?],
      None,
    )?;
    let outputs = bindings
      .detector_out
      .iter()
      .map(Buffer::share_fd)
      .collect::<Result<Vec<_>>>()?;
    let detect_job = self.detector.create_job(
      vec![bindings.detector_in.share_fd()?],
      outputs,
      None,
    )?;
    info!("作业已创建, 缓冲区共 {} 字节", pool.bytes());

    Ok(JobOrchestrator {
      jobs: Jobs {
        low: low_job,
        high: high_job,
        detect: detect_job,
      },
      models: self,
      buffers: bindings,
      hd_width: expect.hd_width,
      hd_height: expect.hd_height,
    })
  }
}

struct Jobs {
  low: Box<dyn Job>,
  high: Box<dyn Job>,
  detect: Box<dyn Job>,
}

struct TensorBindings {
  pp_low_in: Buffer,
  detector_in: Buffer,
  pp_high_in: Buffer,
  pp_high_out: Buffer,
  detector_out: [Buffer; DETECTOR_OUTPUTS],
}

impl TensorBindings {
  fn from_vec(buffers: Vec<Buffer>) -> Result<Self> {
    let mut iter = buffers.into_iter();
    let mut next = || {
      iter
        .next()
        .ok_or_else(|| PipelineError::configuration("张量缓冲区数量不足"))
    };
    Ok(TensorBindings {
      pp_low_in: next()?,
      detector_in: next()?,
      pp_high_in: next()?,
      pp_high_out: next()?,
      detector_out: [next()?, next()?, next()?, next()?],
    })
  }

  fn release(self, pool: &mut BufferPool) {
    pool.release(self.pp_low_in);
    pool.release(self.detector_in);
    pool.release(self.pp_high_in);
    pool.release(self.pp_high_out);
    for buffer in self.detector_out {
      pool.release(buffer);
    }
  }
}

/// 检测器的四个原始输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutputs {
  /// 每个检测 4 个值：top, left, bottom, right
  pub locations: Vec<f32>,
  pub classes: Vec<f32>,
  pub scores: Vec<f32>,
  pub count: Vec<f32>,
}

fn floats(bytes: &[u8]) -> Vec<f32> {
  bytes
    .chunks_exact(4)
    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
    .collect()
}

/// 高清 RGB 图像（交错排列）
#[derive(Debug, Clone, Copy)]
pub struct HdImage<'a> {
  pub data: &'a [u8],
  pub width: u32,
  pub height: u32,
}

/// 已绑定缓冲区的作业集合
///
/// 字段按释放顺序排列：先作业，再模型，最后缓冲区。
pub struct JobOrchestrator {
  jobs: Jobs,
  models: PipelineModels,
  buffers: TensorBindings,
  hd_width: u32,
  hd_height: u32,
}

fn run_stage(stage: &'static str, job: &mut dyn Job) -> Result<()> {
  let now = Instant::now();
  job.run().map_err(|e| PipelineError::job(stage, e))?;
  info!("{} 完成, 耗时: {:.2?}", stage, now.elapsed());
  Ok(())
}

impl JobOrchestrator {
  /// 执行一个周期：预处理两路图像，复位输出位置，运行检测
  ///
  /// 任一步失败即中止本周期。
  pub fn run_tick(&mut self, low: &Frame, high: &Frame) -> Result<()> {
    self.buffers.pp_low_in.fill_from(&low.data)?;
    run_stage("preprocess-low", self.jobs.low.as_mut())?;

    self.buffers.pp_high_in.fill_from(&high.data)?;
    run_stage("preprocess-high", self.jobs.high.as_mut())?;

    for buffer in &self.buffers.detector_out {
      buffer
        .rewind()
        .map_err(|e| PipelineError::job("rewind-outputs", e))?;
    }

    run_stage("inference", self.jobs.detect.as_mut())
  }

  pub fn raw_outputs(&self) -> RawOutputs {
    let [locations, classes, scores, count] = &self.buffers.detector_out;
    RawOutputs {
      locations: floats(locations.as_slice()),
      classes: floats(classes.as_slice()),
      scores: floats(scores.as_slice()),
      count: floats(count.as_slice()),
    }
  }

  pub fn hd_image(&self) -> HdImage<'_> {
    HdImage {
      data: self.buffers.pp_high_out.as_slice(),
      width: self.hd_width,
      height: self.hd_height,
    }
  }

  /// 按作业、模型、缓冲区的顺序释放，并更新缓冲池统计
  pub fn release(self, pool: &mut BufferPool) {
    let JobOrchestrator {
      jobs,
      models,
      buffers,
      ..
    } = self;
    drop(jobs);
    drop(models);
    buffers.release(pool);
    info!("作业与缓冲区已释放, 剩余 {} 个缓冲区", pool.live());
  }
}
