// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::{
    DefaultBodyLimit, Multipart, State,
    multipart::{MultipartError, MultipartRejection},
  },
  http::StatusCode,
  routing::get,
};
use clap::ValueEnum;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::{
  cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
  cascade::CascadeDetector,
  config::{Config, ServerConfig},
  input::ImageUpload,
  lifecycle::BufferLedger,
  output::{DetectResponse, Reason},
  registry::{ModelLoader, ModelRegistry, RegistryError},
  task::DetectTask,
};

/// 上传表单中图像字段的名称
pub const FILE_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
  task: Arc<DetectTask>,
  registry: Arc<ModelRegistry>,
  ledger: Arc<BufferLedger>,
  permits: Arc<Semaphore>,
}

impl AppState {
  pub fn new(task: Arc<DetectTask>, max_concurrency: usize) -> Self {
    Self {
      registry: Arc::clone(task.cascade().registry()),
      ledger: Arc::clone(task.ledger()),
      task,
      permits: Arc::new(Semaphore::new(max_concurrency)),
    }
  }

  /// 按配置创建注册表并执行启动期加载，严格策略下加载失败会返回错误
  pub fn build(config: &Config, loader: Arc<dyn ModelLoader>) -> Result<Self, RegistryError> {
    let registry = Arc::new(ModelRegistry::new(&config.registry, loader));
    registry.initialize()?;
    let cascade = CascadeDetector::new(&config.cascade, registry);
    let task = Arc::new(DetectTask::new(cascade, BufferLedger::new()));
    Ok(Self::new(task, config.server.max_concurrency))
  }

  pub fn registry(&self) -> &Arc<ModelRegistry> {
    &self.registry
  }

  pub fn ledger(&self) -> &Arc<BufferLedger> {
    &self.ledger
  }
}

pub fn router(state: AppState, config: &ServerConfig) -> Router {
  Router::new()
    .route("/", get(index))
    .route("/detect", get(detect_hint).post(detect))
    .route("/detect/", get(detect_hint).post(detect))
    .route("/health", get(health))
    .layer(DefaultBodyLimit::disable())
    .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
    .layer(TimeoutLayer::new(config.request_timeout))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 启动服务，收到 Ctrl-C 后停止接收新请求，等待进行中的请求完成后卸载模型
pub async fn serve(config: Config, loader: Arc<dyn ModelLoader>) -> anyhow::Result<()> {
  config.validate()?;

  let state = {
    let config = config.clone();
    tokio::task::spawn_blocking(move || AppState::build(&config, loader)).await??
  };
  let registry = Arc::clone(state.registry());
  let roles = registry.roles().map(|role| role.as_str()).collect::<Vec<_>>();
  info!("模型角色: {}", roles.join(" -> "));
  let app = router(state, &config.server);

  let listener = TcpListener::bind(config.server.bind).await?;
  info!("服务启动于 http://{}", listener.local_addr()?);
  info!("  POST /detect  - 上传图像进行品种鉴定");
  info!("  GET  /health  - 模型与缓冲区状态");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  registry.shutdown();
  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(err) = tokio::signal::ctrl_c().await {
    error!("无法监听中断信号: {}", err);
    std::future::pending::<()>().await;
  }
  info!("收到中断信号，准备退出...");
}

async fn index() -> Json<Value> {
  Json(json!({
    "status": "online",
    "message": "Banana Expert AI is ready!",
  }))
}

async fn detect_hint() -> Json<Value> {
  Json(json!({
    "status": "ok",
    "message": "Use POST /detect with multipart/form-data",
  }))
}

async fn detect(
  State(state): State<AppState>,
  multipart: Result<Multipart, MultipartRejection>,
) -> (StatusCode, Json<DetectResponse>) {
  let mut multipart = match multipart {
    Ok(multipart) => multipart,
    Err(rejection) => {
      warn!("无效的上传请求: {}", rejection.body_text());
      let response = DetectResponse::failure(Reason::InvalidRequest).with_detail(rejection.body_text());
      return (StatusCode::OK, Json(response));
    }
  };

  let upload = match read_upload(&mut multipart).await {
    Ok(Some(upload)) => upload,
    Ok(None) => return (StatusCode::OK, Json(DetectResponse::failure(Reason::MissingFile))),
    Err(err) => {
      warn!("读取上传数据失败: {}", err.body_text());
      // 流式上传在读取过程中超出大小限制时，与声明了长度的请求一样返回 413
      let status = match err.status() {
        StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::OK,
      };
      let response = DetectResponse::failure(Reason::InvalidRequest).with_detail(err.body_text());
      return (status, Json(response));
    }
  };

  let Ok(permit) = Arc::clone(&state.permits).acquire_owned().await else {
    return (StatusCode::OK, Json(DetectResponse::failure(Reason::ServerError)));
  };

  // 许可随推理任务一起移动，请求超时被丢弃时，推理结束前许可不会归还
  let task = Arc::clone(&state.task);
  let job = tokio::task::spawn_blocking(move || {
    let _permit = permit;
    task.run(&upload)
  });
  match job.await {
    Ok(response) => (StatusCode::OK, Json(response)),
    Err(err) => {
      error!("检测任务异常退出: {}", err);
      (StatusCode::OK, Json(DetectResponse::failure(Reason::ServerError)))
    }
  }
}

async fn read_upload(multipart: &mut Multipart) -> Result<Option<ImageUpload>, MultipartError> {
  while let Some(field) = multipart.next_field().await? {
    if field.name() != Some(FILE_FIELD) {
      continue;
    }
    let filename = field.file_name().map(str::to_string);
    let bytes = field.bytes().await?;
    let upload = ImageUpload::new(bytes.to_vec());
    return Ok(Some(match filename {
      Some(filename) => upload.with_filename(filename),
      None => upload,
    }));
  }
  Ok(None)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
  let roles = state.registry.status();
  let degraded = roles.iter().any(|role| role.state == "failed");
  let policy = state
    .registry
    .policy()
    .to_possible_value()
    .map(|value| value.get_name().to_string());

  Json(json!({
    "status": if degraded { "degraded" } else { "ok" },
    "policy": policy,
    "roles": roles,
    "buffers": state.ledger.snapshot(),
    "timestamp": chrono::Utc::now().to_rfc3339(),
    "version": env!("CARGO_PKG_VERSION"),
  }))
}
