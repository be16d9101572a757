// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/model.rs - 模型
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

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use thiserror::Error;
use url::Url;

use crate::frame::IngestFrame;

mod label;
pub use self::label::BananaLabel;

#[cfg(feature = "model_yolov8")]
mod yolov8;
#[cfg(feature = "model_yolov8")]
pub use self::yolov8::{YoloV8, YoloV8Builder, YoloV8Error};

/// 外部检测模型的唯一能力：对一帧图像做一次推理
///
/// 实现必须是只读的；如果底层运行时不允许同一句柄并发推理，
/// 应让 [`Model::reentrant`] 返回 `false`，由注册表按句柄串行化调用。
pub trait Model: Send + Sync {
  fn name(&self) -> &str;

  fn infer(&self, frame: &IngestFrame, params: &InferParams) -> Result<DetectResult, ModelError>;

  fn reentrant(&self) -> bool {
    true
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferParams {
  /// 置信度阈值
  pub confidence: f32,
  /// NMS IoU 阈值
  pub iou: f32,
  /// 推理分辨率（正方形边长）
  pub resolution: u32,
  pub device: Device,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl DetectItem {
  pub fn new(class_id: u32, score: f32) -> Self {
    Self {
      class_id,
      score,
      bbox: [0.0; 4],
    }
  }

  pub fn with_bbox(mut self, bbox: [f32; 4]) -> Self {
    self.bbox = bbox;
    self
  }
}

/// 一次推理调用的全部输出，构造后不可修改
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  items: Box<[DetectItem]>,
}

impl DetectResult {
  /// 丢弃 NaN 分数，并把其余分数限制在 [0, 1]
  pub fn new(items: Vec<DetectItem>) -> Self {
    let items = items
      .into_iter()
      .filter(|item| !item.score.is_nan())
      .map(|mut item| {
        item.score = item.score.clamp(0.0, 1.0);
        item
      })
      .collect::<Vec<_>>();
    Self {
      items: items.into_boxed_slice(),
    }
  }

  pub fn empty() -> Self {
    Self::default()
  }

  pub fn items(&self) -> &[DetectItem] {
    &self.items
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn byte_size(&self) -> usize {
    std::mem::size_of_val(&*self.items)
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> &'static str;
  fn from_label_id(id: u32) -> Self;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
  #[default]
  Cpu,
  Cuda(u32),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("无法识别的计算设备: {0}（可选 cpu、cuda、cuda:N）")]
pub struct DeviceParseError(String);

impl FromStr for Device {
  type Err = DeviceParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_ascii_lowercase();
    match lower.as_str() {
      "cpu" => Ok(Device::Cpu),
      "cuda" | "gpu" => Ok(Device::Cuda(0)),
      other => {
        let index = other
          .strip_prefix("cuda:")
          .unwrap_or(other)
          .parse::<u32>()
          .map_err(|_| DeviceParseError(s.to_string()))?;
        Ok(Device::Cuda(index))
      }
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(index) => write!(f, "cuda:{}", index),
    }
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
  #[error("模型文件不存在: {}", .0.display())]
  FileMissing(PathBuf),
  #[error("模型加载失败: {0}")]
  LoadFailed(String),
  #[error("模型不支持计算设备: {0}")]
  UnsupportedDevice(Device),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("推理失败: {0}")]
  Inference(String),
}

/// 根据 URL 方案选择模型后端并加载
///
/// `file://` 与 `yolov8://` 都按 Ultralytics 导出的 YOLOv8 ONNX 模型处理。
pub fn load_from_url(url: &Url, device: Device) -> Result<Arc<dyn Model>, ModelError> {
  #[cfg(feature = "model_yolov8")]
  {
    use crate::{FromUrl, FromUrlWithScheme};

    if url.scheme() == YoloV8Builder::SCHEME || url.scheme() == "file" {
      let model = YoloV8Builder::from_url(url)?.device(device).build()?;
      return Ok(Arc::new(model));
    }
  }
  let _ = device;
  Err(ModelError::SchemeMismatch(format!(
    "不支持的模型方案 '{}'",
    url.scheme()
  )))
}
