// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/main.rs - 项目主程序
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use banana_expert::{args::ServeArgs, registry::UrlModelLoader, server};

#[tokio::main]
async fn main() -> Result<()> {
  let args = ServeArgs::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
    )
    .init();

  let config = args.into_config()?;

  info!("Banana Expert 香蕉品种鉴定服务");
  info!("加载策略: {:?}", config.registry.policy);
  for (role, source) in &config.registry.sources {
    match &source.fallback {
      Some(fallback) => info!("角色 {}: {} (备用: {})", role, source.preferred, fallback),
      None => info!("角色 {}: {}", role, source.preferred),
    }
  }
  info!(
    "IoU 阈值: {}，计算设备: {}，并发上限: {}",
    config.cascade.iou, config.cascade.device, config.server.max_concurrency
  );

  server::serve(config, Arc::new(UrlModelLoader)).await
}
