// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/task.rs - 单次检测任务
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

use std::{sync::Arc, time::Instant};

use tracing::info;

use crate::{
  cascade::CascadeDetector,
  input::ImageUpload,
  lifecycle::{BufferLedger, RequestScope},
  output::{DetectResponse, Reason},
};

/// 一次上传从解码到响应的完整流程
///
/// 每次调用都在独立的请求作用域内进行，返回前释放本次请求的全部缓冲区。
pub struct DetectTask {
  cascade: CascadeDetector,
  ledger: Arc<BufferLedger>,
}

impl DetectTask {
  pub fn new(cascade: CascadeDetector, ledger: Arc<BufferLedger>) -> Self {
    Self { cascade, ledger }
  }

  pub fn cascade(&self) -> &CascadeDetector {
    &self.cascade
  }

  pub fn ledger(&self) -> &Arc<BufferLedger> {
    &self.ledger
  }

  pub fn run(&self, upload: &ImageUpload) -> DetectResponse {
    let scope = RequestScope::open(&self.ledger);
    let filename = upload.filename.as_deref().unwrap_or("<unnamed>");
    info!(
      "请求 {}: 收到图像 {} ({} 字节)",
      scope.id(),
      filename,
      upload.bytes.len()
    );

    let now = Instant::now();
    let frame = match upload.decode() {
      Ok(frame) => scope.track(frame),
      Err(err) => {
        info!("请求 {}: 图像无法解码: {}", scope.id(), err);
        return DetectResponse::failure(Reason::InvalidImage).with_detail(err.to_string());
      }
    };
    let decoded = now.elapsed();

    let outcome = self.cascade.run(&frame, &scope);
    drop(frame);

    let response = DetectResponse::from_cascade(&outcome, upload.filename.as_deref());
    info!(
      "请求 {}: 完成，品种 {}，原因 {:?}，解码耗时: {:.2?}，总耗时: {:.2?}",
      scope.id(),
      response.banana_key.as_deref().unwrap_or("-"),
      response.reason,
      decoded,
      now.elapsed()
    );
    response
  }
}
