// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/cascade.rs - 多阶段检测级联
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

use std::{sync::Arc, time::Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{CascadeConfig, Role, StageConfig},
  frame::IngestFrame,
  lifecycle::RequestScope,
  model::{Device, InferParams, ModelError},
  output::{self, Verdict},
  registry::ModelRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
  Filter,
  Main,
  Backup,
}

/// 级联中的一个阶段：绑定一个模型角色和它自己的阈值、分辨率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
  pub kind: StageKind,
  pub config: StageConfig,
}

/// 单个阶段一次推理的结果
#[derive(Debug)]
pub enum StageOutcome<D> {
  Empty,
  Detections(D),
  Fault(ModelError),
}

/// 阶段结束后级联的下一步
#[derive(Debug, PartialEq)]
pub enum Step<D> {
  /// 进入下一个阶段；主阶段推理出错时带上错误原因
  Advance { fault: Option<ModelError> },
  NoDetection,
  AllStagesFailed,
  Reduce { detections: D, used_fallback: bool },
  Fail(ModelError),
}

/// 阶段转移表
///
/// | 阶段   | 空结果                 | 有检测         | 推理出错             |
/// |--------|------------------------|----------------|----------------------|
/// | filter | NoDetection            | 下一阶段       | Fail                 |
/// | main   | 有 backup 则下一阶段，否则 NoDetection | Reduce | 有 backup 则下一阶段，否则 Fail |
/// | backup | AllStagesFailed        | Reduce(回退)   | Fail                 |
pub fn decide<D>(kind: StageKind, outcome: StageOutcome<D>, has_next: bool) -> Step<D> {
  match (kind, outcome) {
    (StageKind::Filter, StageOutcome::Empty) => Step::NoDetection,
    (StageKind::Filter, StageOutcome::Detections(_)) => Step::Advance { fault: None },
    (StageKind::Filter, StageOutcome::Fault(cause)) => Step::Fail(cause),

    (StageKind::Main, StageOutcome::Detections(detections)) => Step::Reduce {
      detections,
      used_fallback: false,
    },
    (StageKind::Main, StageOutcome::Empty) if has_next => Step::Advance { fault: None },
    (StageKind::Main, StageOutcome::Empty) => Step::NoDetection,
    (StageKind::Main, StageOutcome::Fault(cause)) if has_next => Step::Advance { fault: Some(cause) },
    (StageKind::Main, StageOutcome::Fault(cause)) => Step::Fail(cause),

    (StageKind::Backup, StageOutcome::Detections(detections)) => Step::Reduce {
      detections,
      used_fallback: true,
    },
    (StageKind::Backup, StageOutcome::Empty) => Step::AllStagesFailed,
    (StageKind::Backup, StageOutcome::Fault(cause)) => Step::Fail(cause),
  }
}

/// 一次请求的级联结果
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOutcome {
  NoDetection {
    role: Role,
  },
  Success {
    verdict: Verdict,
    used_role: Role,
    used_fallback: bool,
    model: String,
    count: usize,
  },
  AllStagesFailed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CascadeError {
  #[error("角色 {role} 的模型未就绪")]
  ModelNotReady { role: Role },
  #[error("角色 {role} 推理失败: {cause}")]
  StageFault { role: Role, cause: ModelError },
}

/// 多阶段检测级联
///
/// 只有主阶段时与三阶段使用同一套循环，缺省的阶段直接不出现在阶段列表里。
/// 每个阶段每个请求只推理一次。
pub struct CascadeDetector {
  stages: Vec<Stage>,
  iou: f32,
  device: Device,
  registry: Arc<ModelRegistry>,
}

impl CascadeDetector {
  pub fn new(config: &CascadeConfig, registry: Arc<ModelRegistry>) -> Self {
    let mut stages = Vec::with_capacity(3);
    if let Some(filter) = config.filter {
      stages.push(Stage {
        kind: StageKind::Filter,
        config: filter,
      });
    }
    stages.push(Stage {
      kind: StageKind::Main,
      config: config.main,
    });
    if let Some(backup) = config.backup {
      stages.push(Stage {
        kind: StageKind::Backup,
        config: backup,
      });
    }

    Self {
      stages,
      iou: config.iou,
      device: config.device,
      registry,
    }
  }

  pub fn stages(&self) -> &[Stage] {
    &self.stages
  }

  pub fn registry(&self) -> &Arc<ModelRegistry> {
    &self.registry
  }

  pub fn run(&self, frame: &IngestFrame, scope: &RequestScope) -> Result<CascadeOutcome, CascadeError> {
    for (index, stage) in self.stages.iter().enumerate() {
      let role = stage.config.role;
      let has_next = index + 1 < self.stages.len();

      let handle = self.registry.acquire(role).map_err(|err| {
        warn!("请求 {}: {}", scope.id(), err);
        CascadeError::ModelNotReady { role }
      })?;

      let params = InferParams {
        confidence: stage.config.confidence,
        iou: self.iou,
        resolution: stage.config.resolution,
        device: self.device,
      };

      let now = Instant::now();
      let outcome = match handle.infer(frame, &params) {
        Ok(result) if result.is_empty() => StageOutcome::Empty,
        Ok(result) => StageOutcome::Detections(scope.track(result)),
        Err(err) => StageOutcome::Fault(err),
      };
      debug!(
        "请求 {}: 阶段 {:?}（角色 {}，阈值 {}，分辨率 {}）完成，{}，耗时: {:.2?}",
        scope.id(),
        stage.kind,
        role,
        params.confidence,
        params.resolution,
        match &outcome {
          StageOutcome::Empty => "无检测".to_string(),
          StageOutcome::Detections(result) => format!("{} 个检测", result.len()),
          StageOutcome::Fault(_) => "推理出错".to_string(),
        },
        now.elapsed()
      );

      match decide(stage.kind, outcome, has_next) {
        Step::Advance { fault: None } => continue,
        Step::Advance { fault: Some(cause) } => {
          warn!("请求 {}: 角色 {} 推理失败，转入备用阶段: {}", scope.id(), role, cause);
          continue;
        }
        Step::NoDetection => {
          info!("请求 {}: 阶段 {:?} 没有检测到香蕉", scope.id(), stage.kind);
          return Ok(CascadeOutcome::NoDetection { role });
        }
        Step::AllStagesFailed => {
          info!("请求 {}: 所有阶段都没有检测到香蕉", scope.id());
          return Ok(CascadeOutcome::AllStagesFailed);
        }
        Step::Reduce {
          detections,
          used_fallback,
        } => {
          let count = detections.len();
          let Some(verdict) = output::reduce(detections.items()) else {
            return Ok(CascadeOutcome::NoDetection { role });
          };
          return Ok(CascadeOutcome::Success {
            verdict,
            used_role: role,
            used_fallback,
            model: handle.model_name().to_string(),
            count,
          });
        }
        Step::Fail(cause) => {
          warn!("请求 {}: 角色 {} 推理失败: {}", scope.id(), role, cause);
          return Err(CascadeError::StageFault { role, cause });
        }
      }
    }

    // 阶段列表总以主阶段或备用阶段结尾，二者都会终止循环
    Ok(CascadeOutcome::AllStagesFailed)
  }
}
