// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像鉴定工具
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

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use banana_expert::{
  args::CascadeArgs,
  cascade::CascadeDetector,
  config::{Config, ServerConfig},
  input::ImageUpload,
  lifecycle::BufferLedger,
  registry::{ModelRegistry, UrlModelLoader},
  task::DetectTask,
};

/// 对单张图像运行一次级联检测并输出 JSON 结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像文件
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,
  #[command(flatten)]
  pub cascade: CascadeArgs,
  /// 日志级别，RUST_LOG 优先
  #[arg(long, default_value = "warn", value_name = "LEVEL")]
  pub log_level: String,
}

fn main() -> Result<()> {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
    )
    .with_writer(std::io::stderr)
    .init();

  let cascade = args.cascade.cascade_config();
  let config = Config {
    registry: args.cascade.registry_config(&cascade)?,
    cascade,
    server: ServerConfig::default(),
  };
  config.validate()?;

  info!("输入图像: {}", args.input.display());
  let bytes = std::fs::read(&args.input)?;
  let mut upload = ImageUpload::new(bytes);
  if let Some(name) = args.input.file_name() {
    upload = upload.with_filename(name.to_string_lossy());
  }

  let registry = Arc::new(ModelRegistry::new(&config.registry, Arc::new(UrlModelLoader)));
  registry.initialize()?;
  let task = DetectTask::new(
    CascadeDetector::new(&config.cascade, Arc::clone(&registry)),
    BufferLedger::new(),
  );

  let response = task.run(&upload);
  registry.shutdown();

  println!("{}", serde_json::to_string_pretty(&response)?);
  Ok(())
}
