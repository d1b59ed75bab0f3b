// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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

mod common;

use std::{cell::Cell, rc::Rc, time::Duration};

use qianli::{
  PipelineError,
  device::{Connection, DataType},
  driver::{DriverState, PipelineDriver, StopReason},
  pipeline::Pipeline,
  postprocess::RenderableDetection,
};

use common::*;

struct Harness {
  driver: PipelineDriver,
  script: Rc<Script>,
  overlay: Rc<std::cell::RefCell<Vec<Vec<RenderableDetection>>>>,
  low_taken: Rc<std::cell::Cell<usize>>,
  low_returned: Rc<std::cell::Cell<usize>>,
  high_taken: Rc<std::cell::Cell<usize>>,
  high_returned: Rc<std::cell::Cell<usize>>,
}

fn harness(
  dir: &TestDir,
  threshold: u8,
  ticks: Vec<Vec<Scripted>>,
  low: MockSource,
  high: MockSource,
  overlay: RecordingOverlay,
) -> Harness {
  let script = Script::new(ticks);
  let connection = connection(ScriptedDevice::new(Rc::clone(&script)));
  let renders = Rc::clone(&overlay.renders);
  let (low_taken, low_returned) = (Rc::clone(&low.taken), Rc::clone(&low.returned));
  let (high_taken, high_returned) = (Rc::clone(&high.taken), Rc::clone(&high.returned));

  let pipeline = Pipeline::setup(
    &config(dir, threshold),
    &connection,
    Box::new(low),
    Box::new(high),
    Box::new(overlay),
  )
  .unwrap();
  let mut driver = PipelineDriver::new(pipeline);
  driver.start();

  Harness {
    driver,
    script,
    overlay: renders,
    low_taken,
    low_returned,
    high_taken,
    high_returned,
  }
}

fn setup_error(
  device: ScriptedDevice,
  config: qianli::config::PipelineConfig,
  high: (u32, u32),
) -> PipelineError {
  setup_error_on(&connection(device), config, high)
}

fn setup_error_on(
  connection: &Connection,
  config: qianli::config::PipelineConfig,
  high: (u32, u32),
) -> PipelineError {
  match Pipeline::setup(
    &config,
    connection,
    Box::new(MockSource::repeat(LOW, 235, 1)),
    Box::new(MockSource::repeat(high, 235, 1)),
    Box::new(RecordingOverlay::default()),
  ) {
    Ok(_) => panic!("setup should fail"),
    Err(e) => e,
  }
}

#[test]
fn detection_is_cropped_saved_and_overlaid() {
  let dir = TestDir::new("end-to-end");
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 3.0, [0.1, 0.1, 0.6, 0.6])]],
    MockSource::repeat(LOW, 235, 1),
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay::default(),
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  assert_eq!(h.script.runs.get(), 1);

  // 检测器看到的是预处理后的白色 RGB 图像
  let input = h.script.last_input.borrow();
  assert_eq!(input.len(), (INPUT.0 * INPUT.1 * 3) as usize);
  assert!(input.iter().all(|&b| b == 255));

  assert_eq!(dir.artifacts(), vec!["detection_0.jpg".to_string()]);
  let jpeg = image::open(dir.path().join("artifacts/detection_0.jpg")).unwrap();
  assert_eq!((jpeg.width(), jpeg.height()), (36, 36));

  let renders = h.overlay.borrow();
  assert_eq!(renders.len(), 1);
  assert_eq!(
    renders[0],
    vec![RenderableDetection {
      left: 35,
      top: 7,
      right: 71,
      bottom: 43,
      label: "person".to_string(),
      score: 0.9,
    }]
  );

  assert_eq!(h.low_returned.get(), h.low_taken.get());
  assert_eq!(h.high_returned.get(), h.high_taken.get());
}

#[test]
fn low_score_produces_nothing() {
  let dir = TestDir::new("low-score");
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.3, 3.0, [0.1, 0.1, 0.6, 0.6])]],
    MockSource::repeat(LOW, 235, 1),
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay::default(),
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  assert!(dir.artifacts().is_empty());
  assert_eq!(*h.overlay.borrow(), vec![Vec::<RenderableDetection>::new()]);
}

#[test]
fn zero_count_is_not_an_error() {
  let dir = TestDir::new("zero-count");
  let mut h = harness(
    &dir,
    0,
    vec![vec![]],
    MockSource::repeat(LOW, 16, 1),
    MockSource::repeat(HD, 16, 1),
    RecordingOverlay::default(),
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  assert!(dir.artifacts().is_empty());
  assert_eq!(h.overlay.borrow().len(), 1);
  assert!(h.overlay.borrow()[0].is_empty());
}

#[test]
fn second_tick_sees_fresh_outputs() {
  let dir = TestDir::new("rewind");
  let mut h = harness(
    &dir,
    50,
    vec![
      vec![det(0.9, 3.0, [0.1, 0.1, 0.6, 0.6])],
      vec![
        det(0.7, 4.0, [0.0, 0.0, 0.5, 0.5]),
        det(0.8, 5.0, [0.5, 0.5, 1.0, 1.0]),
      ],
    ],
    MockSource::repeat(LOW, 235, 2),
    MockSource::repeat(HD, 235, 2),
    RecordingOverlay::default(),
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  assert_eq!(h.driver.tick(), DriverState::Running);
  assert_eq!(h.script.runs.get(), 2);

  let renders = h.overlay.borrow();
  assert_eq!(renders.len(), 2);
  let second: Vec<(&str, f32)> = renders[1]
    .iter()
    .map(|d| (d.label.as_str(), d.score))
    .collect();
  assert_eq!(second, vec![("chair", 0.8), ("bed", 0.7)]);
  assert_eq!(
    (renders[1][1].left, renders[1][1].top, renders[1][1].right, renders[1][1].bottom),
    (28, 0, 64, 36)
  );
}

#[test]
fn low_frame_failure_stops_before_any_job() {
  let dir = TestDir::new("low-fail");
  let mut h = harness(
    &dir,
    50,
    vec![],
    MockSource::new(LOW, vec![None]),
    MockSource::repeat(HD, 235, 5),
    RecordingOverlay::default(),
  );

  let stopped = DriverState::Stopped(StopReason::FrameAcquisition { stream: "low" });
  assert_eq!(h.driver.tick(), stopped);
  assert_eq!(h.script.runs.get(), 0);
  assert_eq!(h.high_taken.get(), 0);

  // 停止后不再执行
  assert_eq!(h.driver.tick(), stopped);
  assert_eq!(h.driver.ticks(), 1);
  assert_eq!(h.script.runs.get(), 0);
  assert!(h.overlay.borrow().is_empty());
}

#[test]
fn high_frame_failure_returns_low_frame() {
  let dir = TestDir::new("high-fail");
  let mut h = harness(
    &dir,
    50,
    vec![],
    MockSource::repeat(LOW, 235, 5),
    MockSource::new(HD, vec![None]),
    RecordingOverlay::default(),
  );

  assert_eq!(
    h.driver.tick(),
    DriverState::Stopped(StopReason::FrameAcquisition { stream: "high" })
  );
  assert_eq!(h.low_taken.get(), 1);
  assert_eq!(h.low_returned.get(), 1);
  assert_eq!(h.script.runs.get(), 0);
  assert_eq!(h.driver.tick(), h.driver.state().clone());
  assert_eq!(h.low_taken.get(), 1);
}

#[test]
fn short_frame_is_job_failure() {
  let dir = TestDir::new("short-frame");
  let mut low = MockSource::repeat(LOW, 235, 1);
  low.short = true;
  let mut h = harness(
    &dir,
    50,
    vec![],
    low,
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay::default(),
  );

  assert!(matches!(
    h.driver.tick(),
    DriverState::Stopped(StopReason::JobFailure { .. })
  ));
  assert_eq!(h.script.runs.get(), 0);
  assert_eq!(h.low_returned.get(), 1);
  assert_eq!(h.high_returned.get(), 1);
}

#[test]
fn unknown_class_stops_with_configuration_error() {
  let dir = TestDir::new("bad-class");
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 42.0, [0.1, 0.1, 0.6, 0.6])]],
    MockSource::repeat(LOW, 235, 1),
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay::default(),
  );

  assert!(matches!(
    h.driver.tick(),
    DriverState::Stopped(StopReason::Configuration { .. })
  ));
  assert!(h.overlay.borrow().is_empty());
}

#[test]
fn overlay_failure_keeps_running() {
  let dir = TestDir::new("overlay-fail");
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 3.0, [0.1, 0.1, 0.6, 0.6])]],
    MockSource::repeat(LOW, 235, 2),
    MockSource::repeat(HD, 235, 2),
    RecordingOverlay {
      fail: true,
      ..Default::default()
    },
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  assert_eq!(h.driver.tick(), DriverState::Running);
  assert_eq!(h.overlay.borrow().len(), 2);
}

#[test]
fn overlay_uses_its_own_stream_size() {
  let dir = TestDir::new("stream-size");
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 3.0, [0.25, 0.25, 0.75, 0.75])]],
    MockSource::repeat(LOW, 235, 1),
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay {
      size: Rc::new(Cell::new(Some((1280, 720)))),
      ..Default::default()
    },
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  let d = &h.overlay.borrow()[0][0];
  assert_eq!((d.left, d.top, d.right, d.bottom), (460, 180, 820, 540));
}

#[test]
fn overlay_follows_stream_resize_between_ticks() {
  let dir = TestDir::new("stream-resize");
  let size = Rc::new(Cell::new(Some((1280, 720))));
  let bbox = [0.25, 0.25, 0.75, 0.75];
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 3.0, bbox)], vec![det(0.9, 3.0, bbox)]],
    MockSource::repeat(LOW, 235, 2),
    MockSource::repeat(HD, 235, 2),
    RecordingOverlay {
      size: Rc::clone(&size),
      ..Default::default()
    },
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  size.set(Some((1920, 1080)));
  assert_eq!(h.driver.tick(), DriverState::Running);

  let renders = h.overlay.borrow();
  let first = &renders[0][0];
  let second = &renders[1][0];
  assert_eq!(
    (first.left, first.top, first.right, first.bottom),
    (460, 180, 820, 540)
  );
  assert_eq!(
    (second.left, second.top, second.right, second.bottom),
    (690, 270, 1230, 810)
  );
}

#[test]
fn stream_reconfigured_to_tall_stops_with_configuration_error() {
  let dir = TestDir::new("stream-tall");
  let size = Rc::new(Cell::new(None));
  let mut h = harness(
    &dir,
    50,
    vec![vec![det(0.9, 3.0, [0.25, 0.25, 0.75, 0.75])]; 2],
    MockSource::repeat(LOW, 235, 2),
    MockSource::repeat(HD, 235, 2),
    RecordingOverlay {
      size: Rc::clone(&size),
      ..Default::default()
    },
  );

  assert_eq!(h.driver.tick(), DriverState::Running);
  size.set(Some((720, 1280)));
  assert!(matches!(
    h.driver.tick(),
    DriverState::Stopped(StopReason::Configuration { .. })
  ));
  assert_eq!(h.overlay.borrow().len(), 1);
  assert_eq!(h.low_returned.get(), 2);
  assert_eq!(h.high_returned.get(), 2);
}

#[test]
fn idle_driver_does_nothing() {
  let dir = TestDir::new("idle");
  let script = Script::new(vec![]);
  let connection = connection(ScriptedDevice::new(Rc::clone(&script)));
  let low = MockSource::repeat(LOW, 235, 1);
  let taken = Rc::clone(&low.taken);
  let pipeline = Pipeline::setup(
    &config(&dir, 50),
    &connection,
    Box::new(low),
    Box::new(MockSource::repeat(HD, 235, 1)),
    Box::new(RecordingOverlay::default()),
  )
  .unwrap();

  let mut driver = PipelineDriver::new(pipeline);
  assert_eq!(driver.tick(), DriverState::Idle);
  assert_eq!(taken.get(), 0);
  assert_eq!(driver.ticks(), 0);
}

#[test]
fn run_stops_at_tick_limit() {
  let dir = TestDir::new("run-limit");
  let mut h = harness(
    &dir,
    50,
    vec![],
    MockSource::repeat(LOW, 235, 10),
    MockSource::repeat(HD, 235, 10),
    RecordingOverlay::default(),
  );

  let state = h.driver.run(Duration::ZERO, Some(3));
  assert_eq!(state, DriverState::Stopped(StopReason::TickLimit));
  assert_eq!(h.driver.ticks(), 3);
  assert_eq!(h.script.runs.get(), 3);
}

#[test]
fn run_with_zero_tick_limit_runs_nothing() {
  let dir = TestDir::new("run-zero");
  let mut h = harness(
    &dir,
    50,
    vec![],
    MockSource::repeat(LOW, 235, 1),
    MockSource::repeat(HD, 235, 1),
    RecordingOverlay::default(),
  );

  let state = h.driver.run(Duration::ZERO, Some(0));
  assert_eq!(state, DriverState::Stopped(StopReason::TickLimit));
  assert_eq!(h.driver.ticks(), 0);
  assert_eq!(h.low_taken.get(), 0);
  assert_eq!(h.script.runs.get(), 0);
}

#[test]
fn run_ends_when_source_runs_dry() {
  let dir = TestDir::new("run-dry");
  let mut h = harness(
    &dir,
    50,
    vec![],
    MockSource::repeat(LOW, 235, 2),
    MockSource::repeat(HD, 235, 2),
    RecordingOverlay::default(),
  );

  let state = h.driver.run(Duration::from_millis(1), None);
  assert_eq!(
    state,
    DriverState::Stopped(StopReason::FrameAcquisition { stream: "low" })
  );
  assert_eq!(h.script.runs.get(), 2);

  let pipeline = h.driver.into_pipeline();
  assert_eq!(pipeline.buffer_pool().live(), 8);
  pipeline.shutdown();
}

#[test]
fn detector_input_size_mismatch_aborts_setup() {
  let dir = TestDir::new("size-mismatch");
  let script = Script::new(vec![]);
  let mut device = ScriptedDevice::new(Rc::clone(&script));
  device.input_pitch += 1;

  let err = setup_error(device, config(&dir, 50), HD);
  assert!(matches!(
    err,
    PipelineError::SizeMismatch {
      ref tensor,
      ..
    } if tensor == "detector-in"
  ));
  assert_eq!(script.jobs_created.get(), 0);
}

#[test]
fn hd_output_size_mismatch_aborts_setup() {
  let dir = TestDir::new("hd-mismatch");
  let script = Script::new(vec![]);
  let connection = connection(ScriptedDevice::new(Rc::clone(&script))).with_device(Box::new(
    SkewedProcDevice {
      model: "preprocess-high",
      extra: 3,
    },
  ));
  let mut cfg = config(&dir, 50);
  cfg.preprocess_device = SKEWED_PROC_DEVICE.to_string();

  let err = setup_error_on(&connection, cfg, HD);
  let hd_rgb = (HD.0 * HD.1 * 3) as usize;
  assert!(matches!(
    err,
    PipelineError::SizeMismatch {
      ref tensor,
      expected,
      actual,
    } if tensor == "pp-high-out" && expected == hd_rgb && actual == hd_rgb + 3
  ));
  assert_eq!(script.jobs_created.get(), 0);
}

#[test]
fn low_output_size_mismatch_aborts_setup() {
  let dir = TestDir::new("low-mismatch");
  let script = Script::new(vec![]);
  let connection = connection(ScriptedDevice::new(Rc::clone(&script))).with_device(Box::new(
    SkewedProcDevice {
      model: "preprocess-low",
      extra: 1,
    },
  ));
  let mut cfg = config(&dir, 50);
  cfg.preprocess_device = SKEWED_PROC_DEVICE.to_string();

  let err = setup_error_on(&connection, cfg, HD);
  assert!(matches!(
    err,
    PipelineError::SizeMismatch { ref tensor, .. } if tensor == "pp-low-out"
  ));
  assert_eq!(script.jobs_created.get(), 0);
}

#[test]
fn non_float_detector_outputs_abort_setup() {
  let dir = TestDir::new("output-type");
  let script = Script::new(vec![]);
  let mut device = ScriptedDevice::new(Rc::clone(&script));
  device.output_type = DataType::UInt8;

  let err = setup_error(device, config(&dir, 50), HD);
  assert!(matches!(
    err,
    PipelineError::Configuration(ref message) if message.contains("detector-out0")
  ));
  assert_eq!(script.jobs_created.get(), 0);
}

#[test]
fn setup_failures_are_reported() {
  let dir = TestDir::new("setup-fail");

  let mut cfg = config(&dir, 50);
  cfg.detector_device = "missing-npu".to_string();
  let err = setup_error(ScriptedDevice::new(Script::new(vec![])), cfg, HD);
  assert!(matches!(err, PipelineError::ModelLoad { ref device, .. } if device == "missing-npu"));

  let mut cfg = config(&dir, 50);
  cfg.model = dir.path().join("missing.bin");
  let err = setup_error(ScriptedDevice::new(Script::new(vec![])), cfg, HD);
  assert!(matches!(err, PipelineError::ModelLoad { .. }));

  let mut cfg = config(&dir, 50);
  cfg.labels = dir.path().join("missing.txt");
  let err = setup_error(ScriptedDevice::new(Script::new(vec![])), cfg, HD);
  assert!(matches!(err, PipelineError::LabelTable(_)));

  let cfg = config(&dir, 50);
  let err = setup_error(ScriptedDevice::new(Script::new(vec![])), cfg, (64, 64));
  assert!(matches!(err, PipelineError::Configuration(_)));

  let mut cfg = config(&dir, 50);
  cfg.hd_width = 72;
  cfg.hd_height = 128;
  let err = setup_error(ScriptedDevice::new(Script::new(vec![])), cfg, (72, 128));
  assert!(matches!(err, PipelineError::Configuration(_)));
}
