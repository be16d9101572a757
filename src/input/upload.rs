// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/input/upload.rs - 上传图像解码
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

use std::io::Cursor;

use image::{ImageReader, imageops::FilterType};
use tracing::debug;

use crate::{
  frame::{INGEST_SIZE, IngestFrame},
  input::IngestError,
};

/// 一次上传的原始字节，附带可选的文件名
#[derive(Debug, Clone)]
pub struct ImageUpload {
  pub filename: Option<String>,
  pub bytes: Vec<u8>,
}

impl ImageUpload {
  pub fn new(bytes: Vec<u8>) -> Self {
    Self {
      filename: None,
      bytes,
    }
  }

  pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
    self.filename = Some(filename.into());
    self
  }

  pub fn decode(&self) -> Result<IngestFrame, IngestError> {
    ingest(&self.bytes)
  }
}

/// 解码任意受支持格式的图像，并无条件缩放到 640x640 RGB
///
/// 解码得到的原始尺寸图像在缩放后立即释放，调用方只持有固定大小的帧。
pub fn ingest(bytes: &[u8]) -> Result<IngestFrame, IngestError> {
  if bytes.is_empty() {
    return Err(IngestError::Empty);
  }

  let decoded = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()?
    .decode()?;
  debug!(
    "解码图像: {}x{} {:?}",
    decoded.width(),
    decoded.height(),
    decoded.color()
  );

  let rgb = decoded.into_rgb8();
  let resized = image::imageops::resize(&rgb, INGEST_SIZE, INGEST_SIZE, FilterType::Triangle);
  drop(rgb);

  // RgbImage 的内存布局本身就是 NHWC
  IngestFrame::from_raw(resized.into_raw()).ok_or(IngestError::FrameShape)
}
