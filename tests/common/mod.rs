// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的替身模型与加载器
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

#![allow(dead_code)]

use std::{
  collections::{HashMap, HashSet},
  io::Cursor,
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use banana_expert::{
  cascade::CascadeDetector,
  config::{CascadeConfig, LoadPolicy, ModelSource, RegistryConfig, Role},
  frame::IngestFrame,
  lifecycle::BufferLedger,
  model::{DetectItem, DetectResult, Device, InferParams, Model, ModelError},
  registry::{ModelLoader, ModelRegistry},
  task::DetectTask,
};
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use url::Url;

#[derive(Debug, Clone)]
pub enum Behavior {
  Detect(Vec<DetectItem>),
  Fault(String),
  Panic,
}

/// 按脚本返回结果的模型，记录调用次数与每次调用的参数
pub struct ScriptedModel {
  name: String,
  behavior: Mutex<Behavior>,
  calls: AtomicUsize,
  seen: Mutex<Vec<InferParams>>,
  delay: Mutex<Duration>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

impl ScriptedModel {
  pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      behavior: Mutex::new(behavior),
      calls: AtomicUsize::new(0),
      seen: Mutex::new(Vec::new()),
      delay: Mutex::new(Duration::ZERO),
      in_flight: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
    })
  }

  pub fn detecting(name: &str, items: Vec<DetectItem>) -> Arc<Self> {
    Self::new(name, Behavior::Detect(items))
  }

  pub fn empty(name: &str) -> Arc<Self> {
    Self::new(name, Behavior::Detect(Vec::new()))
  }

  pub fn faulting(name: &str) -> Arc<Self> {
    Self::new(name, Behavior::Fault("runtime exploded".to_string()))
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn seen(&self) -> Vec<InferParams> {
    self.seen.lock().clone()
  }

  pub fn set_behavior(&self, behavior: Behavior) {
    *self.behavior.lock() = behavior;
  }

  /// 每次推理前阻塞等待的时长
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock() = delay;
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// 同时进行中的推理数的最大值
  pub fn peak(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

impl Model for ScriptedModel {
  fn name(&self) -> &str {
    &self.name
  }

  fn infer(&self, _frame: &IngestFrame, params: &InferParams) -> Result<DetectResult, ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.seen.lock().push(*params);

    let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(running, Ordering::SeqCst);
    let delay = *self.delay.lock();
    if !delay.is_zero() {
      std::thread::sleep(delay);
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let behavior = self.behavior.lock().clone();
    match behavior {
      Behavior::Detect(items) => Ok(DetectResult::new(
        items
          .into_iter()
          .filter(|item| item.score > params.confidence)
          .collect(),
      )),
      Behavior::Fault(message) => Err(ModelError::Inference(message)),
      Behavior::Panic => panic!("out of memory while running {}", self.name),
    }
  }
}

/// 记录加载次数的加载器，`fake:///<name>` 指向注册过的替身模型
#[derive(Default)]
pub struct FakeLoader {
  models: Mutex<HashMap<String, Arc<ScriptedModel>>>,
  broken: Mutex<HashSet<String>>,
  loads: Mutex<HashMap<String, usize>>,
  total: AtomicUsize,
  delay: Duration,
}

impl FakeLoader {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn register(&self, name: &str, model: Arc<ScriptedModel>) {
    self.models.lock().insert(fake_url(name).to_string(), model);
  }

  /// 文件存在但无法加载
  pub fn break_model(&self, name: &str) {
    self.broken.lock().insert(fake_url(name).to_string());
  }

  pub fn repair_model(&self, name: &str) {
    self.broken.lock().remove(&fake_url(name).to_string());
  }

  pub fn loads(&self, name: &str) -> usize {
    self
      .loads
      .lock()
      .get(&fake_url(name).to_string())
      .copied()
      .unwrap_or(0)
  }

  pub fn total_loads(&self) -> usize {
    self.total.load(Ordering::SeqCst)
  }
}

impl ModelLoader for FakeLoader {
  fn load(&self, source: &Url, _device: Device) -> Result<Arc<dyn Model>, ModelError> {
    self.total.fetch_add(1, Ordering::SeqCst);
    *self.loads.lock().entry(source.to_string()).or_insert(0) += 1;
    if !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }

    if self.broken.lock().contains(source.as_str()) {
      return Err(ModelError::LoadFailed(format!("corrupt graph: {}", source)));
    }
    match self.models.lock().get(source.as_str()) {
      Some(model) => Ok(Arc::clone(model) as Arc<dyn Model>),
      None => Err(ModelError::FileMissing(PathBuf::from(source.path()))),
    }
  }
}

pub fn fake_url(name: &str) -> Url {
  Url::parse(&format!("fake:///{}", name)).unwrap()
}

pub fn source(name: &str) -> ModelSource {
  ModelSource::new(fake_url(name))
}

pub fn registry_config(policy: LoadPolicy, roles: &[(Role, &str)]) -> RegistryConfig {
  roles
    .iter()
    .fold(RegistryConfig::new(policy), |config, (role, name)| {
      config.with_source(*role, source(name))
    })
}

/// 默认阈值下的三阶段级联
pub fn three_stage() -> CascadeConfig {
  CascadeConfig::single(0.15, 640)
    .with_filter(0.10, 320)
    .with_backup(0.10, 640)
}

pub struct Harness {
  pub loader: Arc<FakeLoader>,
  pub registry: Arc<ModelRegistry>,
  pub task: DetectTask,
}

impl Harness {
  /// 每个角色的模型以角色名注册
  pub fn new(cascade: CascadeConfig, models: &[(Role, Arc<ScriptedModel>)]) -> Self {
    let loader = Arc::new(FakeLoader::new());
    let mut config = RegistryConfig::new(LoadPolicy::Permissive);
    for (role, model) in models {
      loader.register(role.as_str(), Arc::clone(model));
      config = config.with_source(*role, source(role.as_str()));
    }
    let registry = Arc::new(ModelRegistry::new(
      &config,
      Arc::clone(&loader) as Arc<dyn ModelLoader>,
    ));
    registry.initialize().unwrap();
    let task = DetectTask::new(
      CascadeDetector::new(&cascade, Arc::clone(&registry)),
      BufferLedger::new(),
    );
    Self {
      loader,
      registry,
      task,
    }
  }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
  let image = RgbImage::from_fn(width, height, |x, y| {
    Rgb([(x % 256) as u8, (y % 256) as u8, 180])
  });
  let mut bytes = Cursor::new(Vec::new());
  image.write_to(&mut bytes, ImageFormat::Png).unwrap();
  bytes.into_inner()
}
