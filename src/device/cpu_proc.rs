// 该文件是 Qianli （千里眼） 项目的一部分。
// src/device/cpu_proc.rs - CPU 图像预处理设备
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

use std::{fs::File, os::unix::fs::FileExt};

use tracing::{debug, info};

use super::{
  DataType, Device, DeviceError, Job, Layout, Model, ParamMap, TensorInfo, nv12_size,
};

pub const CPU_PROC_DEVICE: &str = "cpu-proc";

pub const INPUT_FORMAT: &str = "image.input.format";
pub const INPUT_SIZE: &str = "image.input.size";
pub const OUTPUT_FORMAT: &str = "image.output.format";
pub const OUTPUT_SIZE: &str = "image.output.size";
pub const INPUT_CROP: &str = "image.input.crop";

pub const FORMAT_NV12: &str = "nv12";
pub const FORMAT_RGB_INTERLEAVED: &str = "rgb-interleaved";

const RGB_CHANNELS: usize = 3;

/// 软件预处理设备：NV12 转 RGB 交错格式，支持裁剪与缩放
///
/// 输入输出都按偏移读写（pread/pwrite），与描述符当前位置无关。
pub struct CpuProcDevice;

impl Device for CpuProcDevice {
  fn name(&self) -> &str {
    CPU_PROC_DEVICE
  }

  fn load_model(
    &self,
    model: Option<&File>,
    name: &str,
    params: Option<&ParamMap>,
  ) -> Result<Box<dyn Model>, DeviceError> {
    if model.is_some() {
      return Err(DeviceError::new(
        DeviceError::INVALID_MODEL,
        "cpu-proc 不接受模型文件",
      ));
    }
    let params = params.ok_or_else(|| {
      DeviceError::new(DeviceError::INVALID_PARAM, "cpu-proc 需要预处理参数表")
    })?;

    let input_format = params.get_str(INPUT_FORMAT)?;
    if input_format != FORMAT_NV12 {
      return Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("不支持的输入格式 {}", input_format),
      ));
    }
    let output_format = params.get_str(OUTPUT_FORMAT)?;
    if output_format != FORMAT_RGB_INTERLEAVED {
      return Err(DeviceError::new(
        DeviceError::INVALID_PARAM,
        format!("不支持的输出格式 {}", output_format),
      ));
    }

    let input_size = dims(params.get_int_arr2(INPUT_SIZE)?, INPUT_SIZE)?;
    let output_size = dims(params.get_int_arr2(OUTPUT_SIZE)?, OUTPUT_SIZE)?;

    info!(
      "加载预处理模型 {}: {}x{} {} -> {}x{} {}",
      name,
      input_size.0,
      input_size.1,
      input_format,
      output_size.0,
      output_size.1,
      output_format
    );

    let (iw, ih) = input_size;
    let (ow, oh) = output_size;
    Ok(Box::new(CpuProcModel {
      name: name.to_string(),
      input_size,
      output_size,
      inputs: [TensorInfo::new(
        DataType::UInt8,
        Layout::Nv12,
        vec![1, ih, iw],
        nv12_size(iw, ih),
      )],
      outputs: [TensorInfo::new(
        DataType::UInt8,
        Layout::Nhwc,
        vec![1, oh, ow, RGB_CHANNELS],
        ow * oh * RGB_CHANNELS,
      )],
    }))
  }
}

fn dims(value: [i64; 2], key: &str) -> Result<(usize, usize), DeviceError> {
  match value {
    [w, h] if w > 0 && h > 0 => Ok((w as usize, h as usize)),
    _ => Err(DeviceError::new(
      DeviceError::INVALID_PARAM,
      format!("参数 {} 必须为正数: {:?}", key, value),
    )),
  }
}

struct CpuProcModel {
  name: String,
  input_size: (usize, usize),
  output_size: (usize, usize),
  inputs: [TensorInfo; 1],
  outputs: [TensorInfo; 1],
}

impl Model for CpuProcModel {
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
    let (Ok([input]), Ok([output])) = (
      <[File; 1]>::try_from(inputs),
      <[File; 1]>::try_from(outputs),
    ) else {
      return Err(DeviceError::new(
        DeviceError::INVALID_TENSOR,
        "预处理作业需要恰好一个输入和一个输出",
      ));
    };

    let (iw, ih) = self.input_size;
    let crop = match params.map(|p| p.get_int_arr4(INPUT_CROP)).transpose()?.flatten() {
      Some([x, y, w, h]) => {
        if x < 0 || y < 0 || w <= 0 || h <= 0 || x + w > iw as i64 || y + h > ih as i64 {
          return Err(DeviceError::new(
            DeviceError::INVALID_PARAM,
            format!("裁剪区域 {:?} 超出输入 {}x{}", [x, y, w, h], iw, ih),
          ));
        }
        [x as usize, y as usize, w as usize, h as usize]
      }
      None => [0, 0, iw, ih],
    };
    debug!("预处理作业 {} 裁剪区域 {:?}", self.name, crop);

    Ok(Box::new(CpuProcJob {
      input,
      output,
      input_size: self.input_size,
      output_size: self.output_size,
      crop,
      nv12: vec![0u8; self.inputs[0].pitch],
      rgb: vec![0u8; self.outputs[0].pitch],
    }))
  }
}

struct CpuProcJob {
  input: File,
  output: File,
  input_size: (usize, usize),
  output_size: (usize, usize),
  crop: [usize; 4],
  nv12: Vec<u8>,
  rgb: Vec<u8>,
}

impl Job for CpuProcJob {
  fn run(&mut self) -> Result<(), DeviceError> {
    self.input.read_exact_at(&mut self.nv12, 0)?;
    nv12_to_rgb(
      &self.nv12,
      self.input_size,
      self.crop,
      &mut self.rgb,
      self.output_size,
    );
    self.output.write_all_at(&self.rgb, 0)?;
    Ok(())
  }
}

/// 从 NV12 图像中裁剪 `crop = [x, y, w, h]`，最近邻缩放到输出尺寸并转为 RGB
fn nv12_to_rgb(
  nv12: &[u8],
  (iw, ih): (usize, usize),
  [cx, cy, cw, ch]: [usize; 4],
  rgb: &mut [u8],
  (ow, oh): (usize, usize),
) {
  let uv_base = iw * ih;
  let uv_stride = 2 * iw.div_ceil(2);

  for oy in 0..oh {
    let sy = cy + oy * ch / oh;
    for ox in 0..ow {
      let sx = cx + ox * cw / ow;
      let y = nv12[sy * iw + sx];
      let uv = uv_base + (sy / 2) * uv_stride + (sx / 2) * 2;
      let (u, v) = (nv12[uv], nv12[uv + 1]);
      let idx = (oy * ow + ox) * RGB_CHANNELS;
      rgb[idx..idx + RGB_CHANNELS].copy_from_slice(&yuv_to_rgb(y, u, v));
    }
  }
}

// BT.601 有限范围
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let c = y as i32 - 16;
  let d = u as i32 - 128;
  let e = v as i32 - 128;
  let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
  [
    clamp(298 * c + 409 * e),
    clamp(298 * c - 100 * d - 208 * e),
    clamp(298 * c + 516 * d),
  ]
}
