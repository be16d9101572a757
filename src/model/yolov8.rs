// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 模型
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

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Instant};

use image::imageops::FilterType;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{INGEST_SIZE, IngestFrame},
  model::{DetectItem, DetectResult, Device, InferParams, Model, ModelError},
};

const YOLOV8_NUM_INPUTS: usize = 1;
const YOLOV8_BOX_ATTRS: usize = 4;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Error, Debug)]
pub enum YoloV8Error {
  #[error("模型文件不存在: {}", .0.display())]
  ModelMissing(PathBuf),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("不支持的计算设备: {0}")]
  UnsupportedDevice(Device),
  #[error("输出形状无效: {0:?}")]
  OutputShape(Vec<usize>),
  #[error("tract 错误: {0}")]
  Tract(#[from] TractError),
}

impl From<YoloV8Error> for ModelError {
  fn from(err: YoloV8Error) -> Self {
    match err {
      YoloV8Error::ModelMissing(path) => ModelError::FileMissing(path),
      YoloV8Error::ModelPathError(msg) => ModelError::SchemeMismatch(msg),
      YoloV8Error::UnsupportedDevice(device) => ModelError::UnsupportedDevice(device),
      YoloV8Error::ModelInvalid(msg) => ModelError::LoadFailed(msg),
      other => ModelError::Inference(other.to_string()),
    }
  }
}

pub struct YoloV8Builder {
  model_path: PathBuf,
  device: Device,
}

impl FromUrlWithScheme for YoloV8Builder {
  const SCHEME: &'static str = "yolov8";
}

impl FromUrl for YoloV8Builder {
  type Error = YoloV8Error;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let model_path = match url.scheme() {
      "file" => url
        .to_file_path()
        .map_err(|_| YoloV8Error::ModelPathError(format!("无效的文件路径: {}", url)))?,
      Self::SCHEME => PathBuf::from(url.path()),
      other => {
        return Err(YoloV8Error::ModelPathError(format!(
          "模型路径必须使用 {} 或 file 方案，实际为 {}",
          Self::SCHEME,
          other
        )));
      }
    };

    Ok(YoloV8Builder {
      model_path,
      device: Device::Cpu,
    })
  }
}

impl YoloV8Builder {
  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn build(self) -> Result<YoloV8, YoloV8Error> {
    if self.device != Device::Cpu {
      error!("tract 后端只支持 CPU，拒绝设备 {}", self.device);
      return Err(YoloV8Error::UnsupportedDevice(self.device));
    }
    if !self.model_path.is_file() {
      return Err(YoloV8Error::ModelMissing(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let now = Instant::now();
    if let Ok(meta) = std::fs::metadata(&self.model_path) {
      debug!(
        "模型文件大小: {:.2} MB",
        meta.len() as f64 / (1024.0 * 1024.0)
      );
    }

    let model = tract_onnx::onnx()
      .model_for_path(&self.model_path)
      .map_err(|e| YoloV8Error::ModelInvalid(format!("{}: {}", self.model_path.display(), e)))?;

    let name = self
      .model_path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "yolov8".to_string());
    let yolo = YoloV8::from_graph(name, model)?;
    info!("模型 {} 加载完成，耗时: {:.2?}", yolo.name, now.elapsed());
    Ok(yolo)
  }
}

/// Ultralytics 导出的 YOLOv8 检测模型
///
/// 每个推理分辨率各自优化出一份执行计划并缓存。入图尺寸的计划在加载时就构建，
/// 无法完成类型推导或优化的模型在加载阶段失败，而不是留到第一次推理。
pub struct YoloV8 {
  name: String,
  model: InferenceModel,
  plans: Mutex<HashMap<u32, Arc<Plan>>>,
}

impl YoloV8 {
  fn from_graph(name: String, model: InferenceModel) -> Result<Self, YoloV8Error> {
    let num_inputs = model.inputs.len();
    let num_outputs = model.outputs.len();
    if num_inputs != YOLOV8_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLOV8_NUM_INPUTS, num_inputs
      );
      return Err(YoloV8Error::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLOV8_NUM_INPUTS, num_inputs
      )));
    }
    if num_outputs == 0 {
      return Err(YoloV8Error::ModelInvalid("模型没有输出".to_string()));
    }
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    let yolo = Self {
      name,
      model,
      plans: Mutex::new(HashMap::new()),
    };
    yolo.plan_for(INGEST_SIZE).map_err(|e| {
      error!("模型 {} 无法优化: {}", yolo.name, e);
      YoloV8Error::ModelInvalid(format!("{}: {}", yolo.name, e))
    })?;
    Ok(yolo)
  }

  fn plan_for(&self, resolution: u32) -> Result<Arc<Plan>, YoloV8Error> {
    let mut plans = self.plans.lock();
    if let Some(plan) = plans.get(&resolution) {
      return Ok(Arc::clone(plan));
    }

    info!("为分辨率 {} 优化模型 {}", resolution, self.name);
    let side = resolution as usize;
    let plan = self
      .model
      .clone()
      .with_input_fact(0, f32::fact([1, 3, side, side]).into())?
      .into_optimized()?
      .into_runnable()?;
    let plan = Arc::new(plan);
    plans.insert(resolution, Arc::clone(&plan));
    Ok(plan)
  }

  /// 缩放到推理分辨率并转换为 NCHW、[0, 1] 归一化的张量
  fn preprocess(frame: &IngestFrame, resolution: u32) -> Tensor {
    let side = resolution as usize;
    let view = frame.as_image();
    if resolution == INGEST_SIZE {
      return tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        view.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
      })
      .into();
    }

    let resized = image::imageops::resize(&view, resolution, resolution, FilterType::Triangle);
    tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
      resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into()
  }

  fn run(&self, frame: &IngestFrame, params: &InferParams) -> Result<DetectResult, YoloV8Error> {
    let plan = self.plan_for(params.resolution)?;

    debug!("设置模型输入");
    let input = Self::preprocess(frame, params.resolution);

    debug!("执行模型推理");
    let outputs = plan.run(tvec!(input.into()))?;

    debug!("获取模型输出");
    let output = outputs
      .first()
      .ok_or_else(|| YoloV8Error::OutputShape(Vec::new()))?;
    let layout = OutputLayout::from_shape(output.shape())?;
    let raw = output.as_slice::<f32>()?;

    Ok(postprocess(raw, layout, params))
  }
}

impl Model for YoloV8 {
  fn name(&self) -> &str {
    &self.name
  }

  fn infer(&self, frame: &IngestFrame, params: &InferParams) -> Result<DetectResult, ModelError> {
    if params.device != Device::Cpu {
      return Err(ModelError::UnsupportedDevice(params.device));
    }
    self.run(frame, params).map_err(ModelError::from)
  }
}

/// 输出张量布局：标准导出为 `[1, 4 + nc, N]`，部分导出工具会转置为 `[1, N, 4 + nc]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputLayout {
  attrs: usize,
  anchors: usize,
  transposed: bool,
}

impl OutputLayout {
  pub(crate) fn from_shape(shape: &[usize]) -> Result<Self, YoloV8Error> {
    let (a, b) = match shape {
      [1, a, b] | [a, b] => (*a, *b),
      _ => return Err(YoloV8Error::OutputShape(shape.to_vec())),
    };
    let layout = if a <= b {
      OutputLayout {
        attrs: a,
        anchors: b,
        transposed: false,
      }
    } else {
      OutputLayout {
        attrs: b,
        anchors: a,
        transposed: true,
      }
    };
    if layout.attrs <= YOLOV8_BOX_ATTRS {
      return Err(YoloV8Error::OutputShape(shape.to_vec()));
    }
    Ok(layout)
  }

  fn num_classes(&self) -> usize {
    self.attrs - YOLOV8_BOX_ATTRS
  }

  fn at(&self, raw: &[f32], attr: usize, anchor: usize) -> f32 {
    if self.transposed {
      raw[anchor * self.attrs + attr]
    } else {
      raw[attr * self.anchors + anchor]
    }
  }
}

/// 解码 YOLOv8 输出并执行按类别的 NMS
pub(crate) fn postprocess(raw: &[f32], layout: OutputLayout, params: &InferParams) -> DetectResult {
  debug!("后处理模型输出");
  if raw.len() < layout.attrs * layout.anchors {
    error!(
      "输出大小不匹配 - 实际: {}, 期望: {}",
      raw.len(),
      layout.attrs * layout.anchors
    );
    return DetectResult::empty();
  }

  let side = params.resolution as f32;
  let mut items = Vec::new();
  for anchor in 0..layout.anchors {
    let (class_id, score) = {
      let mut max_score = f32::MIN;
      let mut cls_idx = 0usize;
      for c in 0..layout.num_classes() {
        let score = layout.at(raw, YOLOV8_BOX_ATTRS + c, anchor);
        if score > max_score {
          max_score = score;
          cls_idx = c;
        }
      }
      (cls_idx as u32, max_score)
    };

    if score <= params.confidence {
      continue;
    }

    let cx = layout.at(raw, 0, anchor);
    let cy = layout.at(raw, 1, anchor);
    let w = layout.at(raw, 2, anchor);
    let h = layout.at(raw, 3, anchor);

    let xmin = (cx - w / 2.0).clamp(0.0, side);
    let ymin = (cy - h / 2.0).clamp(0.0, side);
    let xmax = (cx + w / 2.0).clamp(0.0, side);
    let ymax = (cy + h / 2.0).clamp(0.0, side);

    items.push(
      DetectItem::new(class_id, score).with_bbox([xmin / side, ymin / side, xmax / side, ymax / side]),
    );
  }

  let items = nms(items, params.iou);
  debug!("检测到 {} 个物体", items.len());
  DetectResult::new(items)
}

/// 非极大值抑制，只在同类别之间抑制
fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  // 按置信度降序排序
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<DetectItem> = Vec::new();
  for item in items {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == item.class_id && iou(&kept.bbox, &item.bbox) >= iou_threshold);
    if !suppressed {
      result.push(item);
    }
  }
  result
}

/// 计算两个边界框的 IoU
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}
