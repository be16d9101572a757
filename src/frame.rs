// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use image::{ImageBuffer, Rgb};

use crate::input::AsNhwcFrame;

const RGB_CHANNELS: usize = 3;

/// 所有上传图像统一缩放到的边长
pub const INGEST_SIZE: u32 = 640;

/// 归一化之后的请求图像：640x640，RGB 通道顺序
pub type IngestFrame = RgbNhwcFrame<INGEST_SIZE, INGEST_SIZE>;

/// 固定尺寸的 RGB 帧，按 NHWC（行优先、通道交错）排列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  /// 帧所需的字节数
  pub const LEN: usize = RGB_CHANNELS * (W as usize) * (H as usize);

  /// 从原始像素数据构造，长度不匹配时返回 `None`
  pub fn from_raw(data: Vec<u8>) -> Option<Self> {
    if data.len() != Self::LEN {
      return None;
    }
    Some(Self {
      data: data.into_boxed_slice(),
    })
  }

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 以 `image` 的图像视图借用帧数据，不发生拷贝
  pub fn as_image(&self) -> ImageBuffer<Rgb<u8>, &[u8]> {
    // 长度在构造时已经校验过
    ImageBuffer::from_raw(W, H, self.as_nhwc()).unwrap_or_else(|| unreachable!())
  }
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    let data = vec![0u8; Self::LEN].into_boxed_slice();
    Self { data }
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}
