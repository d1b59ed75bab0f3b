// 该文件是 Qianli （千里眼） 项目的一部分。
// src/label.rs - 类别标签表
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

use std::path::Path;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// 标签文件大小上限
pub const MAX_LABEL_FILE_SIZE: u64 = 10 * 1024 * 1024;
/// 单个标签的最大字节数
pub const MAX_LABEL_LEN: usize = 60;

/// 按行存放的类别名称，下标即类别编号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  labels: Vec<String>,
}

impl LabelTable {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path).map_err(|e| {
      PipelineError::LabelTable(format!("无法读取标签文件 {}: {}", path.display(), e))
    })?;
    if meta.len() > MAX_LABEL_FILE_SIZE {
      return Err(PipelineError::LabelTable(format!(
        "标签文件 {} 过大: {} 字节",
        path.display(),
        meta.len()
      )));
    }

    let text = std::fs::read_to_string(path).map_err(|e| {
      PipelineError::LabelTable(format!("无法读取标签文件 {}: {}", path.display(), e))
    })?;
    let table = Self::parse(&text)?;
    info!("从 {} 读取 {} 个标签", path.display(), table.len());
    Ok(table)
  }

  /// 解析标签文本；末尾换行不产生空标签
  pub fn parse(text: &str) -> Result<Self> {
    if text.is_empty() {
      return Err(PipelineError::LabelTable("标签文件为空".to_string()));
    }

    let labels: Vec<String> = text
      .lines()
      .map(|line| truncate_at_boundary(line, MAX_LABEL_LEN).to_string())
      .collect();
    debug!("标签: {:?}", labels);

    Ok(LabelTable { labels })
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, class: usize) -> Result<&str> {
    self.labels.get(class).map(String::as_str).ok_or_else(|| {
      PipelineError::configuration(format!(
        "类别编号 {} 超出标签表范围 (共 {} 个)",
        class,
        self.labels.len()
      ))
    })
  }
}

fn truncate_at_boundary(s: &str, max: usize) -> &str {
  if s.len() <= max {
    return s;
  }
  let mut end = max;
  while !s.is_char_boundary(end) {
    end -= 1;
  }
  &s[..end]
}
