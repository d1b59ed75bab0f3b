// 该文件是 Qianli （千里眼） 项目的一部分。
// src/pipeline.rs - 流水线上下文
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

use tracing::info;

use crate::{
  artifact::ArtifactWriter,
  buffer::BufferPool,
  config::PipelineConfig,
  device::Connection,
  error::{PipelineError, Result},
  geometry::CenterCrop,
  label::LabelTable,
  orchestrator::{
    DeviceSelectors, JobOrchestrator, ModelPaths, PreprocessParams, load_models,
  },
  overlay::OverlaySink,
  postprocess::{PostProcessor, RenderableDetection},
  source::{Frame, FrameSource},
};

/// 启动完成的流水线，持有全部资源
///
/// 只能由 [`Pipeline::setup`] 构造，任一步失败都不会得到部分可用的流水线。
pub struct Pipeline {
  pub(crate) orchestrator: JobOrchestrator,
  pub(crate) post: PostProcessor,
  pub(crate) artifacts: ArtifactWriter,
  pub(crate) low: Box<dyn FrameSource>,
  pub(crate) high: Box<dyn FrameSource>,
  pub(crate) overlay: Box<dyn OverlaySink>,
  hd: (u32, u32),
  pool: BufferPool,
}

impl Pipeline {
  pub fn setup(
    config: &PipelineConfig,
    connection: &Connection,
    low: Box<dyn FrameSource>,
    high: Box<dyn FrameSource>,
    overlay: Box<dyn OverlaySink>,
  ) -> Result<Self> {
    config.validate()?;

    let (stream_width, stream_height) = low.resolution();
    let hd = high.resolution();
    if hd != (config.hd_width, config.hd_height) {
      return Err(PipelineError::configuration(format!(
        "高清视频源尺寸 {}x{} 与配置 {}x{} 不一致",
        hd.0, hd.1, config.hd_width, config.hd_height
      )));
    }
    let stream = overlay.stream_size().unwrap_or(hd);
    CenterCrop::new(stream.0, stream.1)?;
    info!(
      "低分辨率 {}x{}, 高清 {}x{}, 叠加层 {}x{}",
      stream_width, stream_height, hd.0, hd.1, stream.0, stream.1
    );

    let labels = LabelTable::from_path(&config.labels)?;
    let params = PreprocessParams {
      stream_width,
      stream_height,
      input_width: config.input_width,
      input_height: config.input_height,
      hd_width: config.hd_width,
      hd_height: config.hd_height,
    };

    let models = load_models(
      connection,
      &ModelPaths {
        detector: config.model.clone(),
      },
      &DeviceSelectors {
        preprocess: config.preprocess_device.clone(),
        detector: config.detector_device.clone(),
      },
      &params,
    )?;
    let mut pool = BufferPool::new();
    let orchestrator = models.bind_tensors(&mut pool, &params)?;

    let post = PostProcessor::new(config.threshold, labels);
    let artifacts = ArtifactWriter::new(&config.artifact_dir, config.quality);
    info!(
      "阈值 {}%, 标签 {} 个, 检测图像保存到 {}",
      post.threshold().percent(),
      post.labels().len(),
      artifacts.directory().display()
    );

    Ok(Pipeline {
      orchestrator,
      post,
      artifacts,
      low,
      high,
      overlay,
      hd,
      pool,
    })
  }

  /// 叠加层当前的流尺寸，叠加层不指定时使用高清尺寸
  ///
  /// 流可能在运行中被重新配置，每个周期都重新读取。
  pub fn stream_size(&self) -> (u32, u32) {
    self.overlay.stream_size().unwrap_or(self.hd)
  }

  pub fn buffer_pool(&self) -> &BufferPool {
    &self.pool
  }

  /// 执行作业并后处理，得到本周期的叠加框
  pub(crate) fn process_frames(
    &mut self,
    low: &Frame,
    high: &Frame,
  ) -> Result<Vec<RenderableDetection>> {
    self.orchestrator.run_tick(low, high)?;
    let raw = self.orchestrator.raw_outputs();
    let stream = self.stream_size();
    self.post.process(
      &raw,
      &self.orchestrator.hd_image(),
      stream,
      &self.artifacts,
    )
  }

  /// 按创建的逆序释放作业、模型和缓冲区
  pub fn shutdown(self) {
    let Pipeline {
      orchestrator,
      mut pool,
      ..
    } = self;
    orchestrator.release(&mut pool);
  }
}
