// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/output.rs - 结果归约与响应定义
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

use serde::{Deserialize, Serialize};

use crate::{
  cascade::{CascadeError, CascadeOutcome},
  config::Role,
  model::{BananaLabel, DetectItem, WithLabel},
};

/// 一次检测最终给出的品种判定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
  pub class_id: u32,
  pub label: BananaLabel,
  pub confidence: f32,
}

impl Verdict {
  pub fn banana_key(&self) -> &'static str {
    self.label.to_label_str()
  }

  /// 对外报告的置信度，保留三位小数
  pub fn reported_confidence(&self) -> f64 {
    round3(self.confidence)
  }
}

impl From<&DetectItem> for Verdict {
  fn from(item: &DetectItem) -> Self {
    Self {
      class_id: item.class_id,
      label: BananaLabel::from_label_id(item.class_id),
      confidence: item.score,
    }
  }
}

/// 取置信度最高的检测项，置信度相同时取最先出现的
pub fn reduce(items: &[DetectItem]) -> Option<Verdict> {
  items
    .iter()
    .fold(None::<&DetectItem>, |best, item| match best {
      Some(best) if item.score <= best.score => Some(best),
      _ => Some(item),
    })
    .map(Verdict::from)
}

fn round3(value: f32) -> f64 {
  (f64::from(value) * 1000.0).round() / 1000.0
}

/// 失败原因码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
  InvalidRequest,
  InvalidImage,
  MissingFile,
  ModelNotReady,
  NoBananaDetected,
  AllStagesFailed,
  InferenceError,
  ServerError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
  pub count: usize,
  pub model: String,
  pub stage: Role,
  pub filename: Option<String>,
}

/// `/detect` 的响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub banana_key: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub class_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub confidence: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<Reason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub used_backup: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub debug: Option<DebugInfo>,
}

impl DetectResponse {
  pub fn failure(reason: Reason) -> Self {
    Self {
      success: false,
      banana_key: None,
      class_name: None,
      confidence: None,
      reason: Some(reason),
      used_backup: None,
      detail: None,
      debug: None,
    }
  }

  pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
    self.detail = Some(detail.into());
    self
  }

  pub fn with_used_backup(mut self, used_backup: bool) -> Self {
    self.used_backup = Some(used_backup);
    self
  }

  pub fn from_cascade(result: &Result<CascadeOutcome, CascadeError>, filename: Option<&str>) -> Self {
    match result {
      Ok(CascadeOutcome::Success {
        verdict,
        used_role,
        used_fallback,
        model,
        count,
      }) => Self {
        success: true,
        banana_key: Some(verdict.banana_key().to_string()),
        class_name: Some(verdict.banana_key().to_string()),
        confidence: Some(verdict.reported_confidence()),
        reason: None,
        used_backup: Some(*used_fallback),
        detail: None,
        debug: Some(DebugInfo {
          count: *count,
          model: model.clone(),
          stage: *used_role,
          filename: filename.map(str::to_string),
        }),
      },
      Ok(CascadeOutcome::NoDetection { .. }) => Self::failure(Reason::NoBananaDetected),
      Ok(CascadeOutcome::AllStagesFailed) => Self::failure(Reason::AllStagesFailed).with_used_backup(true),
      Err(err @ CascadeError::ModelNotReady { .. }) => {
        Self::failure(Reason::ModelNotReady).with_detail(err.to_string())
      }
      Err(err @ CascadeError::StageFault { .. }) => {
        Self::failure(Reason::InferenceError).with_detail(err.to_string())
      }
    }
  }
}
