// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/args.rs - 项目参数配置
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
  net::{IpAddr, Ipv4Addr, SocketAddr},
  time::Duration,
};

use clap::{Args, Parser};

use crate::{
  config::{
    CascadeConfig, Config, ConfigError, LazyFailure, LoadPolicy, ModelSource, RegistryConfig,
    Role, ServerConfig, parse_model_location,
  },
  model::Device,
};

/// 级联与模型相关参数，服务和单次检测工具共用
#[derive(Args, Debug, Clone)]
pub struct CascadeArgs {
  /// 主模型位置（路径或 file:// / yolov8:// URL）
  #[arg(long, value_name = "MODEL", default_value = "model/best_modelv8sbg.onnx")]
  pub main_model: String,
  /// 主模型不可用时使用的备用模型文件
  #[arg(long, value_name = "MODEL", default_value = "model/best_modelv8nbg.onnx")]
  pub main_fallback_model: Option<String>,
  /// 不使用主模型的备用文件，首选模型不可用时直接视为加载失败
  #[arg(long, conflicts_with = "main_fallback_model")]
  pub no_main_fallback: bool,
  /// 主阶段置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.15, value_name = "THRESHOLD")]
  pub main_confidence: f32,
  /// 主阶段推理分辨率
  #[arg(long, default_value_t = 640, value_name = "PIXELS")]
  pub main_imgsz: u32,

  /// 过滤阶段模型位置，给出时启用过滤阶段
  #[arg(long, value_name = "MODEL")]
  pub filter_model: Option<String>,
  #[arg(long, value_name = "MODEL")]
  pub filter_fallback_model: Option<String>,
  #[arg(long, default_value_t = 0.10, value_name = "THRESHOLD")]
  pub filter_confidence: f32,
  #[arg(long, default_value_t = 320, value_name = "PIXELS")]
  pub filter_imgsz: u32,

  /// 备用阶段模型位置，给出时启用备用阶段
  #[arg(long, value_name = "MODEL")]
  pub backup_model: Option<String>,
  #[arg(long, value_name = "MODEL")]
  pub backup_fallback_model: Option<String>,
  #[arg(long, default_value_t = 0.10, value_name = "THRESHOLD")]
  pub backup_confidence: f32,
  #[arg(long, default_value_t = 640, value_name = "PIXELS")]
  pub backup_imgsz: u32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = CascadeConfig::DEFAULT_IOU, value_name = "THRESHOLD")]
  pub iou: f32,
  /// 计算设备：cpu、cuda 或 cuda:N
  #[arg(long, default_value = "cpu", value_name = "DEVICE")]
  pub device: Device,
  /// 模型加载策略
  #[arg(long, value_enum, default_value_t = LoadPolicy::Permissive)]
  pub load_policy: LoadPolicy,
  /// 延迟加载失败后的处理方式
  #[arg(long, value_enum, default_value_t = LazyFailure::Retry)]
  pub lazy_failures: LazyFailure,
}

impl CascadeArgs {
  pub fn cascade_config(&self) -> CascadeConfig {
    let mut cascade = CascadeConfig::single(self.main_confidence, self.main_imgsz);
    if self.filter_model.is_some() {
      cascade = cascade.with_filter(self.filter_confidence, self.filter_imgsz);
    }
    if self.backup_model.is_some() {
      cascade = cascade.with_backup(self.backup_confidence, self.backup_imgsz);
    }
    cascade.iou = self.iou;
    cascade.device = self.device;
    cascade
  }

  pub fn registry_config(&self, cascade: &CascadeConfig) -> Result<RegistryConfig, ConfigError> {
    let mut registry = RegistryConfig::new(self.load_policy).with_lazy_failures(self.lazy_failures);
    registry.device = self.device;

    let roles = [
      (
        cascade.main.role,
        Some(&self.main_model),
        self
          .main_fallback_model
          .as_ref()
          .filter(|_| !self.no_main_fallback),
      ),
      (
        Role::Filter,
        self.filter_model.as_ref(),
        self.filter_fallback_model.as_ref(),
      ),
      (
        Role::Backup,
        self.backup_model.as_ref(),
        self.backup_fallback_model.as_ref(),
      ),
    ];
    for (role, preferred, fallback) in roles {
      let Some(preferred) = preferred else {
        continue;
      };
      let mut source = ModelSource::new(parse_model_location(preferred)?);
      if let Some(fallback) = fallback {
        source = source.with_fallback(parse_model_location(fallback)?);
      }
      registry = registry.with_source(role, source);
    }
    Ok(registry)
  }
}

/// HTTP 服务参数
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
  /// 绑定地址
  #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
  pub bind: IpAddr,
  /// 监听端口
  #[arg(long, env = "PORT", default_value_t = 8000)]
  pub port: u16,
  /// 最大上传大小（字节）
  #[arg(long, default_value_t = 20 * 1024 * 1024, value_name = "BYTES")]
  pub max_upload_bytes: usize,
  /// 请求超时时间（秒）
  #[arg(long, default_value_t = 60, value_name = "SECONDS")]
  pub request_timeout: u64,
  /// 同时进行的检测数量上限，默认为 CPU 数量
  #[arg(long, value_name = "COUNT")]
  pub max_concurrency: Option<usize>,
}

impl ServerArgs {
  pub fn server_config(&self) -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
      bind: SocketAddr::new(self.bind, self.port),
      max_upload_bytes: self.max_upload_bytes,
      request_timeout: Duration::from_secs(self.request_timeout),
      max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
    }
  }
}

/// Banana Expert 香蕉品种鉴定服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ServeArgs {
  #[command(flatten)]
  pub cascade: CascadeArgs,
  #[command(flatten)]
  pub server: ServerArgs,
  /// 日志级别，RUST_LOG 优先
  #[arg(long, default_value = "info", value_name = "LEVEL")]
  pub log_level: String,
}

impl ServeArgs {
  pub fn into_config(self) -> Result<Config, ConfigError> {
    let cascade = self.cascade.cascade_config();
    let registry = self.cascade.registry_config(&cascade)?;
    let config = Config {
      server: self.server.server_config(),
      cascade,
      registry,
    };
    config.validate()?;
    Ok(config)
  }
}
