// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/config.rs - 服务配置
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

use std::{collections::BTreeMap, fmt, net::SocketAddr, path::Path, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::Device;

/// 模型槽位的逻辑用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Filter,
  Main,
  Backup,
  Default,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Filter => "filter",
      Role::Main => "main",
      Role::Backup => "backup",
      Role::Default => "default",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// 模型加载策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LoadPolicy {
  /// 启动时加载全部角色，任何角色失败都中止启动
  Strict,
  /// 启动时加载，失败的角色保持未就绪，服务降级运行
  #[default]
  Permissive,
  /// 第一次需要某个角色时才加载
  Lazy,
}

/// 延迟加载失败之后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LazyFailure {
  /// 下一个需要该角色的请求重新尝试加载
  #[default]
  Retry,
  /// 记住失败，直到进程重启
  Remember,
}

/// 同一角色的首选模型与可选的备用模型
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
  pub preferred: Url,
  pub fallback: Option<Url>,
}

impl ModelSource {
  pub fn new(preferred: Url) -> Self {
    Self {
      preferred,
      fallback: None,
    }
  }

  pub fn with_fallback(mut self, fallback: Url) -> Self {
    self.fallback = Some(fallback);
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageConfig {
  pub role: Role,
  pub confidence: f32,
  pub resolution: u32,
}

impl StageConfig {
  pub fn new(role: Role, confidence: f32, resolution: u32) -> Self {
    Self {
      role,
      confidence,
      resolution,
    }
  }
}

/// 级联的阶段参数，过滤与备用阶段可以缺省
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeConfig {
  pub filter: Option<StageConfig>,
  pub main: StageConfig,
  pub backup: Option<StageConfig>,
  pub iou: f32,
  pub device: Device,
}

impl CascadeConfig {
  pub const DEFAULT_IOU: f32 = 0.45;

  /// 只有一个模型的部署
  pub fn single(confidence: f32, resolution: u32) -> Self {
    Self {
      filter: None,
      main: StageConfig::new(Role::Default, confidence, resolution),
      backup: None,
      iou: Self::DEFAULT_IOU,
      device: Device::Cpu,
    }
  }

  pub fn with_filter(mut self, confidence: f32, resolution: u32) -> Self {
    self.filter = Some(StageConfig::new(Role::Filter, confidence, resolution));
    self.promote_main();
    self
  }

  pub fn with_backup(mut self, confidence: f32, resolution: u32) -> Self {
    self.backup = Some(StageConfig::new(Role::Backup, confidence, resolution));
    self.promote_main();
    self
  }

  // 一旦有了其他阶段，主阶段就不再是默认角色
  fn promote_main(&mut self) {
    if self.main.role == Role::Default {
      self.main.role = Role::Main;
    }
  }

  pub fn roles(&self) -> Vec<Role> {
    self
      .filter
      .iter()
      .chain(std::iter::once(&self.main))
      .chain(self.backup.iter())
      .map(|stage| stage.role)
      .collect()
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&self.iou) {
      return Err(ConfigError::IouOutOfRange(self.iou));
    }

    for stage in self
      .filter
      .iter()
      .chain(std::iter::once(&self.main))
      .chain(self.backup.iter())
    {
      if !(0.0..=1.0).contains(&stage.confidence) {
        return Err(ConfigError::ThresholdOutOfRange {
          role: stage.role,
          value: stage.confidence,
        });
      }
      if stage.resolution == 0 || stage.resolution % 32 != 0 {
        return Err(ConfigError::InvalidResolution {
          role: stage.role,
          value: stage.resolution,
        });
      }
    }

    if let Some(filter) = &self.filter {
      let others = std::iter::once(&self.main).chain(self.backup.iter());
      for other in others {
        if filter.confidence > other.confidence {
          return Err(ConfigError::FilterNotLoosest {
            filter: filter.confidence,
            role: other.role,
            other: other.confidence,
          });
        }
        if filter.resolution > other.resolution {
          return Err(ConfigError::FilterNotSmallest {
            filter: filter.resolution,
            role: other.role,
            other: other.resolution,
          });
        }
      }
    }

    if let Some(backup) = &self.backup {
      if backup.resolution > self.main.resolution {
        return Err(ConfigError::BackupTooLarge {
          backup: backup.resolution,
          main: self.main.resolution,
        });
      }
    }

    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
  pub sources: BTreeMap<Role, ModelSource>,
  pub policy: LoadPolicy,
  pub lazy_failures: LazyFailure,
  pub device: Device,
}

impl RegistryConfig {
  pub fn new(policy: LoadPolicy) -> Self {
    Self {
      sources: BTreeMap::new(),
      policy,
      lazy_failures: LazyFailure::default(),
      device: Device::Cpu,
    }
  }

  pub fn with_source(mut self, role: Role, source: ModelSource) -> Self {
    self.sources.insert(role, source);
    self
  }

  pub fn with_lazy_failures(mut self, lazy_failures: LazyFailure) -> Self {
    self.lazy_failures = lazy_failures;
    self
  }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
  /// 服务器绑定地址
  pub bind: SocketAddr,
  /// 最大上传大小（字节）
  pub max_upload_bytes: usize,
  /// 请求超时时间
  pub request_timeout: Duration,
  /// 同时进行的检测数量上限
  pub max_concurrency: usize,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
      max_upload_bytes: 20 * 1024 * 1024,
      request_timeout: Duration::from_secs(60),
      max_concurrency: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server: ServerConfig,
  pub cascade: CascadeConfig,
  pub registry: RegistryConfig,
}

impl Config {
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.cascade.validate()?;
    for role in self.cascade.roles() {
      if !self.registry.sources.contains_key(&role) {
        return Err(ConfigError::MissingSource(role));
      }
    }
    if self.server.max_concurrency == 0 {
      return Err(ConfigError::ZeroConcurrency);
    }
    Ok(())
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("角色 {role} 的置信度阈值 {value} 不在 [0, 1] 范围内")]
  ThresholdOutOfRange { role: Role, value: f32 },
  #[error("IoU 阈值 {0} 不在 [0, 1] 范围内")]
  IouOutOfRange(f32),
  #[error("角色 {role} 的推理分辨率 {value} 必须是 32 的正整数倍")]
  InvalidResolution { role: Role, value: u32 },
  #[error("过滤阶段阈值 {filter} 必须是最宽松的，但 {role} 阶段为 {other}")]
  FilterNotLoosest { filter: f32, role: Role, other: f32 },
  #[error("过滤阶段分辨率 {filter} 必须是最小的，但 {role} 阶段为 {other}")]
  FilterNotSmallest { filter: u32, role: Role, other: u32 },
  #[error("备用阶段分辨率 {backup} 不能高于主阶段分辨率 {main}")]
  BackupTooLarge { backup: u32, main: u32 },
  #[error("角色 {0} 没有配置模型文件")]
  MissingSource(Role),
  #[error("并发数量不能为 0")]
  ZeroConcurrency,
  #[error("无效的模型位置 '{0}'")]
  InvalidModelLocation(String),
}

/// 解析模型位置：带方案的 URL 原样使用，普通路径转换为 `file://` URL
pub fn parse_model_location(location: &str) -> Result<Url, ConfigError> {
  if let Ok(url) = Url::parse(location) {
    // 单字母方案是 Windows 盘符
    if url.scheme().len() > 1 {
      return Ok(url);
    }
  }

  let path = std::path::absolute(Path::new(location))
    .map_err(|_| ConfigError::InvalidModelLocation(location.to_string()))?;
  Url::from_file_path(&path).map_err(|_| ConfigError::InvalidModelLocation(location.to_string()))
}
