// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/labels.rs - 类别标签
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

use std::{borrow::Cow, path::Path, sync::Arc};

use tracing::{info, warn};

use super::ModelError;

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 类别标签表，按类别索引查找名称
#[derive(Debug, Clone)]
pub enum Labels {
  Coco,
  Custom(Arc<[String]>),
}

impl Default for Labels {
  fn default() -> Self {
    Self::Coco
  }
}

impl Labels {
  pub fn coco() -> Self {
    Self::Coco
  }

  /// 每行一个类别名，忽略空行
  pub fn from_file(path: &Path) -> Result<Self, ModelError> {
    let content = std::fs::read_to_string(path)?;
    let labels = Self::parse(&content);
    info!("从 {} 读取 {} 个类别标签", path.display(), labels.len());
    Ok(labels)
  }

  pub fn parse(content: &str) -> Self {
    let names: Vec<String> = content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(String::from)
      .collect();
    Self::Custom(names.into())
  }

  /// 解析 Ultralytics 导出写入的 `names` 元数据，例如 `{0: 'pothole', 1: 'crack'}`
  ///
  /// 类别号必须从 0 开始连续，否则返回 `None`。
  pub fn from_names_metadata(value: &str) -> Option<Self> {
    let body = value.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries = Vec::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
      let (key, after) = rest.split_once(':')?;
      let id: usize = key.trim().parse().ok()?;
      let after = after.trim_start();
      let quote = after.chars().next().filter(|c| *c == '\'' || *c == '"')?;
      let after = &after[quote.len_utf8()..];
      let end = after.find(quote)?;
      entries.push((id, after[..end].to_string()));

      let tail = after[end + quote.len_utf8()..].trim_start();
      rest = tail.strip_prefix(',').unwrap_or(tail).trim_start();
    }

    entries.sort_by_key(|(id, _)| *id);
    if entries.is_empty() || entries.iter().enumerate().any(|(i, (id, _))| i != *id) {
      return None;
    }
    let names: Vec<String> = entries.into_iter().map(|(_, name)| name).collect();
    Some(Self::Custom(names.into()))
  }

  /// 检查标签表与模型输出的类别数是否一致
  ///
  /// 未提供标签表（COCO）而模型不是 80 类时报错；自定义标签表数量不符时只给出警告。
  pub fn check_class_count(&self, classes: usize) -> Result<(), ModelError> {
    match self {
      Self::Coco if classes != COCO_CLASSES.len() => Err(ModelError::ModelLoadError(format!(
        "model predicts {} classes but carries no class names; pass --labels",
        classes
      ))),
      Self::Custom(names) if names.len() != classes => {
        warn!(
          "标签数量 ({}) 与模型类别数 ({}) 不一致",
          names.len(),
          classes
        );
        Ok(())
      }
      _ => Ok(()),
    }
  }

  pub fn len(&self) -> usize {
    match self {
      Self::Coco => COCO_CLASSES.len(),
      Self::Custom(names) => names.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 表外的索引返回 `class_<id>`
  pub fn name(&self, class_id: u32) -> Cow<'_, str> {
    let known = match self {
      Self::Coco => COCO_CLASSES.get(class_id as usize).copied(),
      Self::Custom(names) => names.get(class_id as usize).map(String::as_str),
    };
    match known {
      Some(name) => Cow::Borrowed(name),
      None => Cow::Owned(format!("class_{}", class_id)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn coco_lookup() {
    let labels = Labels::coco();
    assert_eq!(labels.len(), 80);
    assert_eq!(labels.name(0), "person");
    assert_eq!(labels.name(79), "toothbrush");
    assert_eq!(labels.name(80), "class_80");
  }

  #[test]
  fn parse_skips_blank_lines() {
    let labels = Labels::parse("pothole\n\n  crack  \n");
    assert_eq!(labels.len(), 2);
    assert_eq!(labels.name(1), "crack");
    assert_eq!(labels.name(2), "class_2");
  }

  #[test]
  fn coco_requires_eighty_classes() {
    assert!(Labels::coco().check_class_count(80).is_ok());
    assert!(matches!(
      Labels::coco().check_class_count(2),
      Err(ModelError::ModelLoadError(_))
    ));
    // 自定义标签表数量不符只告警
    assert!(Labels::parse("a\nb\nc").check_class_count(2).is_ok());
  }

  #[test]
  fn names_metadata_from_export() {
    let metadata = "{0: 'pothole', 1: \"driver's seat\", 2: 'a, b'}";
    let labels = Labels::from_names_metadata(metadata).unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.name(0), "pothole");
    assert_eq!(labels.name(1), "driver's seat");
    assert_eq!(labels.name(2), "a, b");

    assert!(Labels::from_names_metadata("{1: 'a'}").is_none());
    assert!(Labels::from_names_metadata("{}").is_none());
    assert!(Labels::from_names_metadata("not a dict").is_none());
  }

  #[test]
  fn from_file_reads_labels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "cat\ndog\n").unwrap();
    let labels = Labels::from_file(&path).unwrap();
    assert_eq!(labels.name(0), "cat");
    assert!(!labels.is_empty());
  }
}
