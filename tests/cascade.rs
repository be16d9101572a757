// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// tests/cascade.rs - 级联检测行为测试
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

mod common;

use std::panic::{AssertUnwindSafe, catch_unwind};

use banana_expert::{
  config::{CascadeConfig, Role},
  input::ImageUpload,
  model::DetectItem,
  output::Reason,
};

use common::{Behavior, Harness, ScriptedModel, png_bytes, three_stage};

fn upload() -> ImageUpload {
  ImageUpload::new(png_bytes(800, 600)).with_filename("banana.png")
}

fn banana() -> Vec<DetectItem> {
  vec![DetectItem::new(3, 0.62), DetectItem::new(1, 0.30)]
}

#[test]
fn undecodable_image_never_reaches_a_model() {
  let filter = ScriptedModel::detecting("filter", banana());
  let main = ScriptedModel::detecting("main", banana());
  let backup = ScriptedModel::detecting("backup", banana());
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, filter.clone()),
      (Role::Main, main.clone()),
      (Role::Backup, backup.clone()),
    ],
  );

  for bytes in [Vec::new(), b"definitely not an image".to_vec()] {
    let response = harness.task.run(&ImageUpload::new(bytes));
    assert!(!response.success);
    assert_eq!(response.reason, Some(Reason::InvalidImage));
  }
  assert_eq!(filter.calls() + main.calls() + backup.calls(), 0);
}

#[test]
fn single_stage_empty_is_no_detection() {
  let main = ScriptedModel::empty("default");
  let harness = Harness::new(
    CascadeConfig::single(0.15, 640),
    &[(Role::Default, main.clone())],
  );

  let response = harness.task.run(&upload());
  assert!(!response.success);
  assert_eq!(response.reason, Some(Reason::NoBananaDetected));
  assert_ne!(response.used_backup, Some(true));
  assert_eq!(main.calls(), 1);
}

#[test]
fn single_stage_success() {
  let main = ScriptedModel::detecting("default", banana());
  let harness = Harness::new(
    CascadeConfig::single(0.15, 640),
    &[(Role::Default, main.clone())],
  );

  let response = harness.task.run(&upload());
  assert!(response.success);
  assert_eq!(response.banana_key.as_deref(), Some("homthong"));
  assert_eq!(response.confidence, Some(0.62));
  assert_eq!(response.used_backup, Some(false));
  let debug = response.debug.unwrap();
  assert_eq!(debug.stage, Role::Default);
  assert_eq!(debug.count, 2);
  assert_eq!(debug.filename.as_deref(), Some("banana.png"));
}

#[test]
fn empty_filter_short_circuits() {
  let filter = ScriptedModel::empty("filter");
  let main = ScriptedModel::detecting("main", banana());
  let backup = ScriptedModel::detecting("backup", banana());
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, filter.clone()),
      (Role::Main, main.clone()),
      (Role::Backup, backup.clone()),
    ],
  );

  let response = harness.task.run(&upload());
  assert_eq!(response.reason, Some(Reason::NoBananaDetected));
  assert_eq!(filter.calls(), 1);
  assert_eq!(main.calls(), 0);
  assert_eq!(backup.calls(), 0);
}

#[test]
fn main_success_skips_backup() {
  let filter = ScriptedModel::detecting("filter", banana());
  let main = ScriptedModel::detecting("main", vec![DetectItem::new(9, 0.8)]);
  let backup = ScriptedModel::detecting("backup", banana());
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, filter.clone()),
      (Role::Main, main.clone()),
      (Role::Backup, backup.clone()),
    ],
  );

  let response = harness.task.run(&upload());
  assert!(response.success);
  assert_eq!(response.banana_key.as_deref(), Some("huamao"));
  assert_eq!(response.used_backup, Some(false));
  assert_eq!(response.debug.unwrap().stage, Role::Main);
  assert_eq!(backup.calls(), 0);

  // 每个阶段使用自己的阈值和分辨率
  let filter_params = filter.seen()[0];
  assert_eq!((filter_params.confidence, filter_params.resolution), (0.10, 320));
  let main_params = main.seen()[0];
  assert_eq!((main_params.confidence, main_params.resolution), (0.15, 640));
  assert_eq!(main_params.iou, 0.45);
}

#[test]
fn empty_main_falls_back_to_backup() {
  let filter = ScriptedModel::detecting("filter", banana());
  let main = ScriptedModel::empty("main");
  let backup = ScriptedModel::detecting(
    "backup",
    vec![DetectItem::new(0, 0.2), DetectItem::new(6, 0.55)],
  );
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, filter.clone()),
      (Role::Main, main.clone()),
      (Role::Backup, backup.clone()),
    ],
  );

  let response = harness.task.run(&upload());
  assert!(response.success);
  assert_eq!(response.used_backup, Some(true));
  assert_eq!(response.banana_key.as_deref(), Some("kai"));
  assert_eq!(response.confidence, Some(0.55));
  assert_eq!(response.debug.unwrap().stage, Role::Backup);
  assert_eq!((main.calls(), backup.calls()), (1, 1));
}

#[test]
fn faulting_main_falls_back_to_backup() {
  let filter = ScriptedModel::detecting("filter", banana());
  let main = ScriptedModel::faulting("main");
  let backup = ScriptedModel::detecting("backup", vec![DetectItem::new(2, 0.47)]);
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, filter),
      (Role::Main, main.clone()),
      (Role::Backup, backup.clone()),
    ],
  );

  let response = harness.task.run(&upload());
  assert!(response.success);
  assert_eq!(response.used_backup, Some(true));
  assert_eq!(response.banana_key.as_deref(), Some("namwadam"));
  assert_eq!((main.calls(), backup.calls()), (1, 1));
}

#[test]
fn empty_backup_is_all_stages_failed() {
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::detecting("filter", banana())),
      (Role::Main, ScriptedModel::empty("main")),
      (Role::Backup, ScriptedModel::empty("backup")),
    ],
  );

  let response = harness.task.run(&upload());
  assert!(!response.success);
  assert_eq!(response.reason, Some(Reason::AllStagesFailed));
}

#[test]
fn filter_and_backup_faults_are_reported() {
  let main = ScriptedModel::detecting("main", banana());
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::faulting("filter")),
      (Role::Main, main.clone()),
      (Role::Backup, ScriptedModel::detecting("backup", banana())),
    ],
  );
  let response = harness.task.run(&upload());
  assert_eq!(response.reason, Some(Reason::InferenceError));
  assert_eq!(main.calls(), 0);

  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::detecting("filter", banana())),
      (Role::Main, ScriptedModel::faulting("main")),
      (Role::Backup, ScriptedModel::faulting("backup")),
    ],
  );
  let response = harness.task.run(&upload());
  assert_eq!(response.reason, Some(Reason::InferenceError));
}

#[test]
fn detections_below_threshold_do_not_count() {
  // 0.12 低于主阶段阈值 0.15，但高于备用阶段阈值 0.10
  let scores = vec![DetectItem::new(4, 0.12)];
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::detecting("filter", scores.clone())),
      (Role::Main, ScriptedModel::detecting("main", scores.clone())),
      (Role::Backup, ScriptedModel::detecting("backup", scores)),
    ],
  );

  let response = harness.task.run(&upload());
  assert!(response.success);
  assert_eq!(response.used_backup, Some(true));
  assert_eq!(response.banana_key.as_deref(), Some("nak"));
}

#[test]
fn missing_role_is_model_not_ready() {
  let harness = Harness::new(CascadeConfig::single(0.15, 640), &[]);
  let response = harness.task.run(&upload());
  assert_eq!(response.reason, Some(Reason::ModelNotReady));
}

#[test]
fn repeated_detection_is_deterministic() {
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::detecting("filter", banana())),
      (Role::Main, ScriptedModel::detecting("main", banana())),
      (Role::Backup, ScriptedModel::empty("backup")),
    ],
  );

  let first = harness.task.run(&upload());
  let second = harness.task.run(&upload());
  assert_eq!(first.banana_key, second.banana_key);
  assert_eq!(first.confidence, second.confidence);
}

#[test]
fn sequential_requests_release_every_buffer() {
  let main = ScriptedModel::detecting("main", banana());
  let harness = Harness::new(
    three_stage(),
    &[
      (Role::Filter, ScriptedModel::detecting("filter", banana())),
      (Role::Main, main.clone()),
      (Role::Backup, ScriptedModel::detecting("backup", banana())),
    ],
  );

  for round in 0..20 {
    if round % 3 == 0 {
      main.set_behavior(Behavior::Detect(Vec::new()));
    } else {
      main.set_behavior(Behavior::Detect(banana()));
    }
    harness.task.run(&upload());
    harness.task.run(&ImageUpload::new(b"garbage".to_vec()));
    let snapshot = harness.task.ledger().snapshot();
    assert_eq!(snapshot.live_buffers, 0);
    assert_eq!(snapshot.live_bytes, 0);
  }

  let snapshot = harness.task.ledger().snapshot();
  assert_eq!(snapshot.requests, 40);
  assert_eq!(snapshot.acquired, snapshot.released);
  assert!(snapshot.acquired > 0);
}

#[test]
fn panicking_model_still_releases_buffers() {
  let main = ScriptedModel::new("main", Behavior::Panic);
  let harness = Harness::new(
    CascadeConfig::single(0.15, 640),
    &[(Role::Default, main)],
  );

  let outcome = catch_unwind(AssertUnwindSafe(|| harness.task.run(&upload())));
  assert!(outcome.is_err());
  let snapshot = harness.task.ledger().snapshot();
  assert_eq!(snapshot.live_buffers, 0);
  assert_eq!(snapshot.acquired, snapshot.released);
}
