// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/registry.rs - 模型注册表
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
  collections::BTreeMap,
  path::PathBuf,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Instant,
};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  config::{LazyFailure, LoadPolicy, ModelSource, RegistryConfig, Role},
  frame::IngestFrame,
  model::{self, DetectResult, Device, InferParams, Model, ModelError},
};

/// 按位置加载模型的能力，注册表通过它获得模型而不关心具体后端
pub trait ModelLoader: Send + Sync {
  fn load(&self, source: &Url, device: Device) -> Result<Arc<dyn Model>, ModelError>;
}

/// 按 URL 方案分派到内置后端
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlModelLoader;

impl ModelLoader for UrlModelLoader {
  fn load(&self, source: &Url, device: Device) -> Result<Arc<dyn Model>, ModelError> {
    model::load_from_url(source, device)
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
  #[error("角色 {role} 的模型文件不存在: {}", .path.display())]
  ModelFileMissing { role: Role, path: PathBuf },
  #[error("角色 {role} 的模型加载失败: {cause}")]
  ModelLoadFailed { role: Role, cause: String },
  #[error("角色 {role} 的模型未就绪")]
  ModelNotReady { role: Role },
  #[error("角色 {role} 没有配置模型")]
  RoleNotConfigured { role: Role },
}

/// 已加载的模型句柄，加载后不可变，只在注册表关闭时销毁
pub struct DetectorHandle {
  role: Role,
  source: Url,
  device: Device,
  loaded_at: DateTime<Utc>,
  model: Arc<dyn Model>,
  // 运行时不可重入时，同一句柄上同时只允许一次推理
  gate: Option<Mutex<()>>,
}

impl DetectorHandle {
  pub fn role(&self) -> Role {
    self.role
  }

  pub fn source(&self) -> &Url {
    &self.source
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn loaded_at(&self) -> DateTime<Utc> {
    self.loaded_at
  }

  pub fn model_name(&self) -> &str {
    self.model.name()
  }

  pub fn infer(&self, frame: &IngestFrame, params: &InferParams) -> Result<DetectResult, ModelError> {
    let _guard = self.gate.as_ref().map(|gate| gate.lock());
    self.model.infer(frame, params)
  }
}

impl std::fmt::Debug for DetectorHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DetectorHandle")
      .field("role", &self.role)
      .field("source", &self.source.as_str())
      .field("device", &self.device)
      .field("model", &self.model.name())
      .field("loaded_at", &self.loaded_at)
      .finish()
  }
}

enum SlotState {
  Unloaded,
  // 加载在锁外进行，其他请求在 settled 上等待结果
  Loading,
  Ready(Arc<DetectorHandle>),
  Failed { error: RegistryError, attempt: u64 },
}

struct RoleSlot {
  source: ModelSource,
  state: Mutex<SlotState>,
  settled: Condvar,
  // 已完成的加载尝试次数，只在持有 state 锁时修改
  attempts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
  pub role: Role,
  pub state: &'static str,
  pub source: String,
  pub fallback: Option<String>,
  pub loaded_from: Option<String>,
  pub model: Option<String>,
  pub device: String,
  pub loaded_at: Option<String>,
  pub error: Option<String>,
  pub attempts: u64,
}

/// 进程级的模型注册表
///
/// 每个角色一个槽位。加载期间槽位处于 `Loading` 状态，锁只在切换状态时短暂持有，
/// 状态查询不会被慢加载阻塞。并发的首次请求只会触发一次加载，等待者看到的都是
/// 这一次加载的结果。加载失败不会回滚已成功的角色。
pub struct ModelRegistry {
  slots: BTreeMap<Role, RoleSlot>,
  policy: LoadPolicy,
  lazy_failures: LazyFailure,
  device: Device,
  loader: Arc<dyn ModelLoader>,
  closed: AtomicBool,
}

impl ModelRegistry {
  pub fn new(config: &RegistryConfig, loader: Arc<dyn ModelLoader>) -> Self {
    let slots = config
      .sources
      .iter()
      .map(|(role, source)| {
        (
          *role,
          RoleSlot {
            source: source.clone(),
            state: Mutex::new(SlotState::Unloaded),
            settled: Condvar::new(),
            attempts: AtomicU64::new(0),
          },
        )
      })
      .collect();

    Self {
      slots,
      policy: config.policy,
      lazy_failures: config.lazy_failures,
      device: config.device,
      loader,
      closed: AtomicBool::new(false),
    }
  }

  pub fn policy(&self) -> LoadPolicy {
    self.policy
  }

  pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
    self.slots.keys().copied()
  }

  /// 按配置的策略执行启动期加载
  ///
  /// 严格策略下任何角色失败都会返回错误；宽松策略只记录失败；延迟策略什么都不做。
  pub fn initialize(&self) -> Result<(), RegistryError> {
    match self.policy {
      LoadPolicy::Lazy => {
        info!("延迟加载策略：模型将在第一次使用时加载");
        Ok(())
      }
      LoadPolicy::Strict | LoadPolicy::Permissive => {
        info!("正在加载 {} 个模型角色...", self.slots.len());
        for (role, slot) in &self.slots {
          let mut state = slot.state.lock();
          while matches!(*state, SlotState::Loading) {
            slot.settled.wait(&mut state);
          }
          if matches!(*state, SlotState::Ready(_)) {
            continue;
          }
          if let Err(err) = self.load_slot(*role, slot, state) {
            if self.policy == LoadPolicy::Strict {
              error!("角色 {} 加载失败，严格策略下中止启动: {}", role, err);
              return Err(err);
            }
            warn!("角色 {} 加载失败，服务将降级运行: {}", role, err);
          }
        }
        Ok(())
      }
    }
  }

  /// 获取某个角色的模型句柄，延迟策略下按需加载
  pub fn acquire(&self, role: Role) -> Result<Arc<DetectorHandle>, RegistryError> {
    let slot = self
      .slots
      .get(&role)
      .ok_or(RegistryError::RoleNotConfigured { role })?;
    if self.closed.load(Ordering::Acquire) {
      return Err(RegistryError::ModelNotReady { role });
    }

    let observed = slot.attempts.load(Ordering::Acquire);
    let mut state = slot.state.lock();
    let mut waited = false;
    while matches!(*state, SlotState::Loading) {
      waited = true;
      slot.settled.wait(&mut state);
    }
    if self.closed.load(Ordering::Acquire) {
      return Err(RegistryError::ModelNotReady { role });
    }

    match &*state {
      SlotState::Ready(handle) => return Ok(Arc::clone(handle)),
      SlotState::Unloaded if self.policy != LoadPolicy::Lazy => {
        return Err(RegistryError::ModelNotReady { role });
      }
      SlotState::Failed { attempt, .. } => {
        let retry = self.policy == LoadPolicy::Lazy
          && self.lazy_failures == LazyFailure::Retry
          // 等待过的、或者在本请求到达之后完成的那次尝试就是本请求的结果
          && !waited
          && *attempt <= observed;
        if !retry {
          return Err(RegistryError::ModelNotReady { role });
        }
      }
      SlotState::Unloaded | SlotState::Loading => {}
    }

    self
      .load_slot(role, slot, state)
      .map_err(|_| RegistryError::ModelNotReady { role })
  }

  pub fn is_ready(&self, role: Role) -> bool {
    self
      .slots
      .get(&role)
      .map(|slot| matches!(*slot.state.lock(), SlotState::Ready(_)))
      .unwrap_or(false)
  }

  /// 最近一次加载失败的原因
  pub fn load_error(&self, role: Role) -> Option<RegistryError> {
    let slot = self.slots.get(&role)?;
    match &*slot.state.lock() {
      SlotState::Failed { error, .. } => Some(error.clone()),
      _ => None,
    }
  }

  pub fn status(&self) -> Vec<RoleStatus> {
    self
      .slots
      .iter()
      .map(|(role, slot)| {
        let state = slot.state.lock();
        let mut status = RoleStatus {
          role: *role,
          state: "unloaded",
          source: slot.source.preferred.to_string(),
          fallback: slot.source.fallback.as_ref().map(Url::to_string),
          loaded_from: None,
          model: None,
          device: self.device.to_string(),
          loaded_at: None,
          error: None,
          attempts: slot.attempts.load(Ordering::Acquire),
        };
        match &*state {
          SlotState::Unloaded => {}
          SlotState::Loading => status.state = "loading",
          SlotState::Ready(handle) => {
            status.state = "ready";
            status.loaded_from = Some(handle.source().to_string());
            status.device = handle.device().to_string();
            status.model = Some(handle.model_name().to_string());
            status.loaded_at = Some(handle.loaded_at().to_rfc3339());
          }
          SlotState::Failed { error, .. } => {
            status.state = "failed";
            status.error = Some(error.to_string());
          }
        }
        status
      })
      .collect()
  }

  /// 释放所有模型句柄；正在推理的请求持有的引用在其结束后释放
  pub fn shutdown(&self) {
    self.closed.store(true, Ordering::Release);
    for (role, slot) in &self.slots {
      let mut state = slot.state.lock();
      if matches!(*state, SlotState::Ready(_)) {
        info!("卸载角色 {} 的模型", role);
      }
      *state = SlotState::Unloaded;
      slot.settled.notify_all();
    }
  }

  /// 把槽位置为 `Loading`，释放锁后加载，再发布结果并唤醒等待者
  fn load_slot(
    &self,
    role: Role,
    slot: &RoleSlot,
    mut state: MutexGuard<'_, SlotState>,
  ) -> Result<Arc<DetectorHandle>, RegistryError> {
    let attempt = slot.attempts.load(Ordering::Acquire) + 1;
    *state = SlotState::Loading;

    let result = MutexGuard::unlocked(&mut state, || {
      catch_unwind(AssertUnwindSafe(|| self.load_role(role, &slot.source))).unwrap_or_else(|_| {
        Err(RegistryError::ModelLoadFailed {
          role,
          cause: "加载过程中发生 panic".to_string(),
        })
      })
    });

    slot.attempts.store(attempt, Ordering::Release);
    let outcome = match result {
      Ok(handle) => {
        let handle = Arc::new(handle);
        *state = if self.closed.load(Ordering::Acquire) {
          SlotState::Unloaded
        } else {
          SlotState::Ready(Arc::clone(&handle))
        };
        Ok(handle)
      }
      Err(err) => {
        warn!("角色 {} 第 {} 次加载失败: {}", role, attempt, err);
        *state = SlotState::Failed {
          error: err.clone(),
          attempt,
        };
        Err(err)
      }
    };
    slot.settled.notify_all();
    outcome
  }

  /// 先尝试首选模型，只有首选文件缺失或加载出错时才使用备用模型
  fn load_role(&self, role: Role, source: &ModelSource) -> Result<DetectorHandle, RegistryError> {
    match self.load_one(role, &source.preferred) {
      Ok(handle) => Ok(handle),
      Err(err) => match &source.fallback {
        Some(fallback) => {
          warn!("角色 {} 的首选模型不可用 ({})，回退到: {}", role, err, fallback);
          self.load_one(role, fallback)
        }
        None => Err(err),
      },
    }
  }

  fn load_one(&self, role: Role, url: &Url) -> Result<DetectorHandle, RegistryError> {
    info!("加载角色 {} 的模型: {}", role, url);
    let now = Instant::now();
    let model = self.loader.load(url, self.device).map_err(|err| match err {
      ModelError::FileMissing(path) => RegistryError::ModelFileMissing { role, path },
      other => RegistryError::ModelLoadFailed {
        role,
        cause: other.to_string(),
      },
    })?;

    let gate = (!model.reentrant()).then(|| Mutex::new(()));
    info!(
      "角色 {} 的模型 {} 加载完成，耗时: {:.2?}",
      role,
      model.name(),
      now.elapsed()
    );

    Ok(DetectorHandle {
      role,
      source: url.clone(),
      device: self.device,
      loaded_at: Utc::now(),
      model,
      gate,
    })
  }
}
