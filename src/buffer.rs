// 该文件是 Qianli （千里眼） 项目的一部分。
// src/buffer.rs - 共享内存张量缓冲池
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

//! # 共享内存缓冲区
//!
//! 每个张量都绑定到一个固定大小的 [`Buffer`]：
//!
//! 1. `mkstemp` 创建临时文件；
//! 2. `ftruncate` 扩展到张量 pitch 给出的大小（内容全零）；
//! 3. 立即 `unlink`，之后只能通过文件描述符和映射地址访问；
//! 4. `mmap(PROT_READ | PROT_WRITE, MAP_SHARED)` 映射到本进程。
//!
//! 缓冲区大小创建后不再改变，映射地址在整个生命周期内保持稳定。
//! 推理作业通过 [`Buffer::share_fd`] 得到的描述符读写同一份内存，
//! 该描述符与缓冲区共享文件偏移，因此 [`Buffer::rewind`] 对作业同样生效。

use std::{
  ffi::CString,
  fs::File,
  io::{self, Seek, SeekFrom},
  os::fd::{AsRawFd, FromRawFd, OwnedFd},
  ptr::NonNull,
};

use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};

/// 固定大小、页映射的匿名共享内存
pub struct Buffer {
  tag: String,
  addr: NonNull<u8>,
  len: usize,
  file: File,
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Buffer")
      .field("tag", &self.tag)
      .field("addr", &self.addr)
      .field("len", &self.len)
      .field("fd", &self.file.as_raw_fd())
      .finish()
  }
}

impl Buffer {
  fn create(tag: &str, size: usize) -> Result<Self> {
    if size == 0 {
      return Err(PipelineError::resource(
        "ftruncate",
        tag,
        io::Error::new(io::ErrorKind::InvalidInput, "缓冲区大小不能为 0"),
      ));
    }

    let pattern = std::env::temp_dir().join(format!("qianli.{}-XXXXXX", tag));
    info!(
      "创建临时共享内存, 模式 {} 大小 {} 字节",
      pattern.display(),
      size
    );

    let mut template = CString::new(pattern.to_string_lossy().into_owned())
      .map_err(|e| {
        PipelineError::resource("mkstemp", tag, io::Error::new(io::ErrorKind::InvalidInput, e))
      })?
      .into_bytes_with_nul();

    // SAFETY: template 是以 NUL 结尾的可写缓冲区，mkstemp 原地替换 XXXXXX
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
    if fd < 0 {
      let e = io::Error::last_os_error();
      error!("无法创建临时文件 {}: {}", pattern.display(), e);
      return Err(PipelineError::resource("mkstemp", tag, e));
    }
    // SAFETY: fd 刚由 mkstemp 返回，由 OwnedFd 独占，失败路径上随 drop 关闭
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let sized = file.set_len(size as u64);

    // SAFETY: template 仍以 NUL 结尾，内容为 mkstemp 生成的实际路径
    let unlinked = if unsafe { libc::unlink(template.as_ptr().cast()) } == 0 {
      Ok(())
    } else {
      Err(io::Error::last_os_error())
    };

    if let Err(e) = sized {
      error!("无法设置临时文件大小 ({}): {}", tag, e);
      return Err(PipelineError::resource("ftruncate", tag, e));
    }
    if let Err(e) = unlinked {
      error!("无法解除临时文件链接 ({}): {}", tag, e);
      return Err(PipelineError::resource("unlink", tag, e));
    }

    // SAFETY: fd 有效且文件大小至少为 size
    let addr = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        file.as_raw_fd(),
        0,
      )
    };
    if addr == libc::MAP_FAILED {
      let e = io::Error::last_os_error();
      error!("无法映射临时文件 ({}): {}", tag, e);
      return Err(PipelineError::resource("mmap", tag, e));
    }
    let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
      PipelineError::resource("mmap", tag, io::Error::other("映射地址为空"))
    })?;

    Ok(Buffer {
      tag: tag.to_string(),
      addr,
      len: size,
      file,
    })
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn as_slice(&self) -> &[u8] {
    // SAFETY: addr 指向 len 字节的有效映射，生命周期与 self 相同
    unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    // SAFETY: 同上，&mut self 保证本进程内没有其它引用
    unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
  }

  /// 定长拷贝：把 `src` 的前 `len()` 个字节写入缓冲区
  pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
    if src.len() < self.len {
      return Err(PipelineError::SizeMismatch {
        tensor: self.tag.clone(),
        expected: self.len,
        actual: src.len(),
      });
    }
    let len = self.len;
    self.as_mut_slice().copy_from_slice(&src[..len]);
    Ok(())
  }

  /// 把描述符的读写位置重置到开头
  pub fn rewind(&self) -> io::Result<()> {
    (&self.file).seek(SeekFrom::Start(0)).map(|_| ())
  }

  /// 复制一个描述符交给作业，与本缓冲区共享文件偏移
  pub fn share_fd(&self) -> Result<File> {
    self
      .file
      .try_clone()
      .map_err(|e| PipelineError::resource("dup", &self.tag, e))
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    // SAFETY: addr/len 来自成功的 mmap，且只在此处解除映射一次
    if unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) } != 0 {
      error!(
        "解除映射失败 ({}): {}",
        self.tag,
        io::Error::last_os_error()
      );
    }
    // file 随后被关闭
  }
}

/// 缓冲池
///
/// 负责创建与释放 [`Buffer`]，并统计当前持有的缓冲区。
/// 缓冲区按值释放，重复释放或释放后继续使用在编译期即被拒绝。
#[derive(Debug, Default)]
pub struct BufferPool {
  live: usize,
  bytes: usize,
}

impl BufferPool {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn acquire(&mut self, tag: &str, size: usize) -> Result<Buffer> {
    let buffer = Buffer::create(tag, size)?;
    self.live += 1;
    self.bytes += size;
    debug!(
      "缓冲区 {} 已就绪, 当前共 {} 个, {} 字节",
      tag, self.live, self.bytes
    );
    Ok(buffer)
  }

  pub fn release(&mut self, buffer: Buffer) {
    self.live = self.live.saturating_sub(1);
    self.bytes = self.bytes.saturating_sub(buffer.len());
    debug!("释放缓冲区 {}", buffer.tag());
    drop(buffer);
  }

  pub fn live(&self) -> usize {
    self.live
  }

  pub fn bytes(&self) -> usize {
    self.bytes
  }
}
