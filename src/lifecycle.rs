// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/lifecycle.rs - 请求级缓冲区生命周期
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
  ops::Deref,
  sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{frame::IngestFrame, input::AsNhwcFrame, model::DetectResult};

/// 可以统计占用字节数的请求级缓冲区
pub trait BufferSize {
  fn byte_size(&self) -> usize;
}

impl BufferSize for IngestFrame {
  fn byte_size(&self) -> usize {
    self.as_nhwc().len()
  }
}

impl BufferSize for DetectResult {
  fn byte_size(&self) -> usize {
    DetectResult::byte_size(self)
  }
}

/// 进程级的缓冲区账本，记录所有仍存活的请求级缓冲区
#[derive(Debug, Default)]
pub struct BufferLedger {
  live_buffers: AtomicUsize,
  live_bytes: AtomicUsize,
  acquired: AtomicU64,
  released: AtomicU64,
  requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
  pub live_buffers: usize,
  pub live_bytes: usize,
  pub acquired: u64,
  pub released: u64,
  pub requests: u64,
}

impl BufferLedger {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn snapshot(&self) -> LedgerSnapshot {
    LedgerSnapshot {
      live_buffers: self.live_buffers.load(Ordering::Acquire),
      live_bytes: self.live_bytes.load(Ordering::Acquire),
      acquired: self.acquired.load(Ordering::Acquire),
      released: self.released.load(Ordering::Acquire),
      requests: self.requests.load(Ordering::Acquire),
    }
  }

  fn acquire(&self, bytes: usize) {
    self.live_buffers.fetch_add(1, Ordering::AcqRel);
    self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    self.acquired.fetch_add(1, Ordering::AcqRel);
  }

  fn release(&self, bytes: usize) {
    self.live_buffers.fetch_sub(1, Ordering::AcqRel);
    self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    self.released.fetch_add(1, Ordering::AcqRel);
  }
}

/// 一次请求的作用域
///
/// 作用域内登记的缓冲区借用作用域本身，因此不可能比作用域活得更久；
/// 不论请求成功、失败还是在推理中 panic，缓冲区都会在离开作用域前释放。
pub struct RequestScope {
  id: u64,
  ledger: Arc<BufferLedger>,
  live: AtomicUsize,
  tracked: AtomicUsize,
}

impl RequestScope {
  pub fn open(ledger: &Arc<BufferLedger>) -> Self {
    let id = ledger.requests.fetch_add(1, Ordering::AcqRel) + 1;
    Self {
      id,
      ledger: Arc::clone(ledger),
      live: AtomicUsize::new(0),
      tracked: AtomicUsize::new(0),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  /// 把缓冲区登记到当前作用域，返回的句柄析构时自动注销
  pub fn track<T: BufferSize>(&self, value: T) -> Tracked<'_, T> {
    let bytes = value.byte_size();
    self.ledger.acquire(bytes);
    self.live.fetch_add(1, Ordering::AcqRel);
    self.tracked.fetch_add(1, Ordering::AcqRel);
    Tracked {
      value,
      bytes,
      scope: self,
    }
  }

  pub fn live(&self) -> usize {
    self.live.load(Ordering::Acquire)
  }
}

impl Drop for RequestScope {
  fn drop(&mut self) {
    let live = self.live.load(Ordering::Acquire);
    if live != 0 {
      // 只有 mem::forget 之类的手段才会走到这里
      warn!("请求 {} 结束时仍有 {} 个缓冲区未释放", self.id, live);
    }
    let snapshot = self.ledger.snapshot();
    debug!(
      "请求 {} 结束：登记 {} 个缓冲区，进程内剩余 {} 个 ({} 字节)",
      self.id,
      self.tracked.load(Ordering::Acquire),
      snapshot.live_buffers,
      snapshot.live_bytes
    );
  }
}

/// 登记在请求作用域里的缓冲区
pub struct Tracked<'s, T> {
  value: T,
  bytes: usize,
  scope: &'s RequestScope,
}

impl<T> Deref for Tracked<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.value
  }
}

impl<T> Drop for Tracked<'_, T> {
  fn drop(&mut self) {
    self.scope.ledger.release(self.bytes);
    self.scope.live.fetch_sub(1, Ordering::AcqRel);
  }
}
