// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/common/mod.rs - 集成测试公共设施
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

#![allow(dead_code)]

use std::{
  cell::{Cell, RefCell},
  collections::VecDeque,
  fs::File,
  io::Write,
  os::unix::fs::FileExt,
  path::{Path, PathBuf},
  rc::Rc,
  time::Duration,
};

use qianli::{
  config::PipelineConfig,
  device::{
    Connection, CpuProcDevice, DataType, Device, DeviceError, Job, Layout, Model, ParamMap,
    TensorInfo, nv12_size,
  },
  overlay::{OverlayError, OverlaySink},
  postprocess::{RenderableDetection, Threshold},
  source::{Frame, FrameSource},
};

pub const SCRIPTED_DEVICE: &str = "scripted-npu";
pub const SKEWED_PROC_DEVICE: &str = "skewed-proc";
pub const MAX_DETECTIONS: usize = 10;

pub const LOW: (u32, u32) = (64, 36);
pub const INPUT: (u32, u32) = (32, 32);
pub const HD: (u32, u32) = (128, 72);

/// 一个检测输出：分数、类别、(top, left, bottom, right)
#[derive(Debug, Clone, Copy)]
pub struct Scripted {
  pub score: f32,
  pub class: f32,
  pub bbox: [f32; 4],
}

pub fn det(score: f32, class: f32, bbox: [f32; 4]) -> Scripted {
  Scripted { score, class, bbox }
}

/// 每次执行的检测结果，执行次数和看到的输入
#[derive(Default)]
pub struct Script {
  pub ticks: RefCell<VecDeque<Vec<Scripted>>>,
  pub runs: Cell<usize>,
  pub jobs_created: Cell<usize>,
  pub last_input: RefCell<Vec<u8>>,
}

impl Script {
  pub fn new(ticks: Vec<Vec<Scripted>>) -> Rc<Self> {
    Rc::new(Script {
      ticks: RefCell::new(ticks.into()),
      ..Default::default()
    })
  }
}

/// 按脚本输出检测结果的设备
///
/// 输出从描述符当前位置顺序写入，不复位就会写到映射区域之外。
pub struct ScriptedDevice {
  pub script: Rc<Script>,
  pub input_pitch: usize,
  pub output_type: DataType,
}

impl ScriptedDevice {
  pub fn new(script: Rc<Script>) -> Self {
    ScriptedDevice {
      script,
      input_pitch: (INPUT.0 * INPUT.1 * 3) as usize,
      output_type: DataType::Float32,
    }
  }
}

impl Device for ScriptedDevice {
  fn name(&self) -> &str {
    SCRIPTED_DEVICE
  }

  fn load_model(
    &self,
    model: Option<&File>,
    name: &str,
    _params: Option<&ParamMap>,
  ) -> Result<Box<dyn Model>, DeviceError> {
    if model.is_none() {
      return Err(DeviceError::new(DeviceError::INVALID_MODEL, "缺少模型文件"));
    }
    let n = MAX_DETECTIONS;
    let output_type = self.output_type;
    let float = |dims: Vec<usize>| {
      let pitch = dims.iter().product::<usize>() * 4;
      TensorInfo::new(output_type, Layout::Flat, dims, pitch)
    };
    Ok(Box::new(ScriptedModel {
      name: name.to_string(),
      script: Rc::clone(&self.script),
      inputs: vec![TensorInfo::new(
        DataType::UInt8,
        Layout::Nhwc,
        vec![1, INPUT.1 as usize, INPUT.0 as usize, 3],
        self.input_pitch,
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

struct ScriptedModel {
  name: String,
  script: Rc<Script>,
  inputs: Vec<TensorInfo>,
  outputs: Vec<TensorInfo>,
}

impl Model for ScriptedModel {
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
    _params: Option<&ParamMap>,
  ) -> Result<Box<dyn Job>, DeviceError> {
    self.script.jobs_created.set(self.script.jobs_created.get() + 1);
    Ok(Box::new(ScriptedJob {
      script: Rc::clone(&self.script),
      input: inputs.into_iter().next().ok_or_else(|| {
        DeviceError::new(DeviceError::INVALID_TENSOR, "缺少输入")
      })?,
      input_pitch: self.inputs[0].pitch,
      outputs,
    }))
  }
}

struct ScriptedJob {
  script: Rc<Script>,
  input: File,
  input_pitch: usize,
  outputs: Vec<File>,
}

fn bytes(values: &[f32], len: usize) -> Vec<u8> {
  let mut out: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
  out.resize(len * 4, 0);
  out
}

impl Job for ScriptedJob {
  fn run(&mut self) -> Result<(), DeviceError> {
    let mut input = vec![0u8; self.input_pitch];
    self.input.read_exact_at(&mut input, 0)?;
    *self.script.last_input.borrow_mut() = input;
    self.script.runs.set(self.script.runs.get() + 1);

    let tick = self.script.ticks.borrow_mut().pop_front().unwrap_or_default();
    let n = MAX_DETECTIONS;
    let locations: Vec<f32> = tick.iter().flat_map(|d| d.bbox).collect();
    let classes: Vec<f32> = tick.iter().map(|d| d.class).collect();
    let scores: Vec<f32> = tick.iter().map(|d| d.score).collect();

    self.outputs[0].write_all(&bytes(&locations, n * 4))?;
    self.outputs[1].write_all(&bytes(&classes, n))?;
    self.outputs[2].write_all(&bytes(&scores, n))?;
    self.outputs[3].write_all(&bytes(&[tick.len() as f32], 1))?;
    Ok(())
  }
}

/// 包装 cpu-proc，把指定模型的输出 pitch 改大
pub struct SkewedProcDevice {
  pub model: &'static str,
  pub extra: usize,
}

impl Device for SkewedProcDevice {
  fn name(&self) -> &str {
    SKEWED_PROC_DEVICE
  }

  fn load_model(
    &self,
    model: Option<&File>,
    name: &str,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Model>, DeviceError> {
    let inner = CpuProcDevice.load_model(model, name, params)?;
    let mut outputs = inner.outputs().to_vec();
    if name == self.model {
      outputs[0].pitch += self.extra;
    }
    Ok(Box::new(SkewedModel { inner, outputs }))
  }
}

struct SkewedModel {
  inner: Box<dyn Model>,
  outputs: Vec<TensorInfo>,
}

impl Model for SkewedModel {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn inputs(&self) -> &[TensorInfo] {
    self.inner.inputs()
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
    self.inner.create_job(inputs, outputs, params)
  }
}

pub fn connection(device: ScriptedDevice) -> Connection {
  Connection::connect().unwrap().with_device(Box::new(device))
}

/// 按顺序给出帧，记录取走和交还的数量
pub struct MockSource {
  pub frames: VecDeque<Option<u8>>,
  pub width: u32,
  pub height: u32,
  pub taken: Rc<Cell<usize>>,
  pub returned: Rc<Cell<usize>>,
  pub short: bool,
}

impl MockSource {
  /// `luma` 为 `None` 的位置取帧失败；用完后持续失败
  pub fn new(size: (u32, u32), frames: Vec<Option<u8>>) -> Self {
    MockSource {
      frames: frames.into(),
      width: size.0,
      height: size.1,
      taken: Rc::new(Cell::new(0)),
      returned: Rc::new(Cell::new(0)),
      short: false,
    }
  }

  pub fn repeat(size: (u32, u32), luma: u8, count: usize) -> Self {
    Self::new(size, vec![Some(luma); count])
  }
}

impl FrameSource for MockSource {
  fn get_last_frame_blocking(&mut self) -> Option<Frame> {
    let luma = self.frames.pop_front().flatten()?;
    let (w, h) = (self.width as usize, self.height as usize);
    let mut data = vec![128u8; nv12_size(w, h)];
    data[..w * h].fill(luma);
    if self.short {
      data.truncate(w * h);
    }
    self.taken.set(self.taken.get() + 1);
    Some(Frame {
      data,
      width: self.width,
      height: self.height,
      index: self.taken.get() as u64,
    })
  }

  fn return_frame(&mut self, _frame: Frame) {
    self.returned.set(self.returned.get() + 1);
  }

  fn resolution(&self) -> (u32, u32) {
    (self.width, self.height)
  }
}

#[derive(Default)]
pub struct RecordingOverlay {
  pub renders: Rc<RefCell<Vec<Vec<RenderableDetection>>>>,
  /// 流尺寸可在周期之间修改，模拟流被重新配置
  pub size: Rc<Cell<Option<(u32, u32)>>>,
  pub fail: bool,
}

impl OverlaySink for RecordingOverlay {
  fn render(&mut self, detections: &[RenderableDetection]) -> Result<(), OverlayError> {
    self.renders.borrow_mut().push(detections.to_vec());
    if self.fail {
      return Err(OverlayError::IoError(std::io::Error::other("overlay offline")));
    }
    Ok(())
  }

  fn stream_size(&self) -> Option<(u32, u32)> {
    self.size.get()
  }
}

/// 测试用临时目录，drop 时删除
pub struct TestDir(PathBuf);

impl TestDir {
  pub fn new(name: &str) -> Self {
    let path = std::env::temp_dir().join(format!("qianli-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    TestDir(path)
  }

  pub fn path(&self) -> &Path {
    &self.0
  }

  pub fn artifacts(&self) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(self.0.join("artifacts"))
      .map(|entries| {
        entries
          .filter_map(|e| e.ok())
          .map(|e| e.file_name().to_string_lossy().into_owned())
          .collect()
      })
      .unwrap_or_default();
    names.sort();
    names
  }
}

impl Drop for TestDir {
  fn drop(&mut self) {
    let _ = std::fs::remove_dir_all(&self.0);
  }
}

/// 写好模型文件和标签文件，返回对应配置
pub fn config(dir: &TestDir, threshold: u8) -> PipelineConfig {
  let model = dir.path().join("model.bin");
  std::fs::write(&model, b"scripted").unwrap();
  let labels = dir.path().join("labels.txt");
  std::fs::write(&labels, "background\nbicycle\ncar\nperson\nbed\nchair\n").unwrap();

  PipelineConfig {
    model,
    labels,
    input_width: INPUT.0,
    input_height: INPUT.1,
    hd_width: HD.0,
    hd_height: HD.1,
    quality: 80,
    threshold: Threshold::new(threshold).unwrap(),
    detector_device: SCRIPTED_DEVICE.to_string(),
    preprocess_device: "cpu-proc".to_string(),
    artifact_dir: dir.path().join("artifacts"),
    period: Duration::ZERO,
    max_ticks: None,
  }
}
