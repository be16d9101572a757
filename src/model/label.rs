// 该文件是 Banana Expert （香蕉鉴定） 项目的一部分。
// src/model/label.rs - 香蕉品种标签
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

use crate::model::WithLabel;

/// 模型类别编号到品种标识（slug）的固定映射，slug 与前端数据库保持一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BananaLabel {
  CandyApple,
  Namwa,
  NamwaDam,
  HomThong,
  Nak,
  ThepPhanom,
  Kai,
  LepChangKut,
  NgaChang,
  HuaMao,
  Unknown,
}

impl BananaLabel {
  pub const ALL: [BananaLabel; 10] = [
    BananaLabel::CandyApple,
    BananaLabel::Namwa,
    BananaLabel::NamwaDam,
    BananaLabel::HomThong,
    BananaLabel::Nak,
    BananaLabel::ThepPhanom,
    BananaLabel::Kai,
    BananaLabel::LepChangKut,
    BananaLabel::NgaChang,
    BananaLabel::HuaMao,
  ];

  pub fn is_known(&self) -> bool {
    *self != BananaLabel::Unknown
  }
}

impl WithLabel for BananaLabel {
  fn to_label_str(&self) -> &'static str {
    match self {
      BananaLabel::CandyApple => "candyapple",
      BananaLabel::Namwa => "namwa",
      BananaLabel::NamwaDam => "namwadam",
      BananaLabel::HomThong => "homthong",
      BananaLabel::Nak => "nak",
      BananaLabel::ThepPhanom => "thepphanom",
      BananaLabel::Kai => "kai",
      BananaLabel::LepChangKut => "lepchangkut",
      BananaLabel::NgaChang => "ngachang",
      BananaLabel::HuaMao => "huamao",
      BananaLabel::Unknown => "unknown",
    }
  }

  fn from_label_id(id: u32) -> Self {
    Self::ALL
      .get(id as usize)
      .copied()
      .unwrap_or(BananaLabel::Unknown)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_ids_map_to_fixed_slugs() {
    let slugs: Vec<_> = (0..10)
      .map(|id| BananaLabel::from_label_id(id).to_label_str())
      .collect();
    assert_eq!(
      slugs,
      [
        "candyapple",
        "namwa",
        "namwadam",
        "homthong",
        "nak",
        "thepphanom",
        "kai",
        "lepchangkut",
        "ngachang",
        "huamao"
      ]
    );
  }

  #[test]
  fn out_of_range_ids_are_unknown() {
    assert_eq!(BananaLabel::from_label_id(7).to_label_str(), "lepchangkut");
    assert_eq!(BananaLabel::from_label_id(42), BananaLabel::Unknown);
    assert_eq!(BananaLabel::from_label_id(10).to_label_str(), "unknown");
    assert_eq!(BananaLabel::from_label_id(u32::MAX).to_label_str(), "unknown");
    assert!(!BananaLabel::from_label_id(42).is_known());
  }
}
