// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型与检测结果
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

use std::{fmt::Display, path::Path, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::geometry::BBox;

pub mod decode;
pub mod nms;
pub mod replay;
pub mod tensor;
mod yolo;

pub use self::decode::{DecodeError, Decoder, DecoderBuilder, Layout, LayoutHint, Malformed};
pub use self::nms::{suppress, suppress_per_class};
pub use self::tensor::{InputTensor, RawOutputTensor};
pub use self::yolo::{DetectorError, Postprocess, YoloDetector, YoloDetectorBuilder};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 推理协作方：将归一化输入张量映射为原始输出张量
pub trait Inference: Send + Sync {
  fn infer(&self, input: &InputTensor) -> Result<RawOutputTensor, InferenceError>;
}

impl<F, E> Inference for F
where
  F: Fn(&InputTensor) -> Result<RawOutputTensor, E> + Send + Sync,
  E: Display,
{
  fn infer(&self, input: &InputTensor) -> Result<RawOutputTensor, InferenceError> {
    self(input).map_err(|e| InferenceError(e.to_string()))
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("推理失败: {0}")]
pub struct InferenceError(pub String);

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {found}")]
  SchemeMismatch {
    expected: &'static str,
    found: String,
  },
  #[error("类别数量不匹配: 模型输出 {model} 类, 词表 {vocabulary} 项")]
  ClassCountMismatch { model: usize, vocabulary: usize },
  #[error("参数 {key} 取值无效: {value}")]
  InvalidValue { key: &'static str, value: String },
  #[error("词表为空")]
  EmptyVocabulary,
  #[error("标签文件读取错误: {0}")]
  LabelFile(#[from] std::io::Error),
}

/// 单个检测结果，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  #[serde(skip)]
  pub class_id: usize,
  pub label: String,
  pub score: f32,
  #[serde(flatten)]
  pub bbox: BBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

const UNKNOWN_LABEL: &str = "unknown";

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

/// 有序类别词表，下标即类别编号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
  labels: Arc<[String]>,
}

impl Vocabulary {
  pub fn coco() -> Self {
    Self::new(COCO_CLASSES.iter().map(|s| s.to_string()))
  }

  pub fn new<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      labels: labels.into_iter().map(Into::into).collect(),
    }
  }

  /// 从每行一个标签的文本文件加载，忽略空行
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let vocabulary = Self::new(
      content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    );
    if vocabulary.is_empty() {
      return Err(ConfigError::EmptyVocabulary);
    }
    Ok(vocabulary)
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, class_id: usize) -> Option<&str> {
    self.labels.get(class_id).map(String::as_str)
  }

  /// 越界时返回 "unknown"
  pub fn label(&self, class_id: usize) -> &str {
    self.get(class_id).unwrap_or(UNKNOWN_LABEL)
  }
}

impl Default for Vocabulary {
  fn default() -> Self {
    Self::coco()
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use super::*;

  #[test]
  fn vocabulary_falls_back_to_unknown() {
    let vocabulary = Vocabulary::new(["cat", "dog"]);
    assert_eq!(vocabulary.label(1), "dog");
    assert_eq!(vocabulary.label(2), "unknown");
    assert_eq!(Vocabulary::coco().len(), 80);
  }

  #[test]
  fn vocabulary_from_file_skips_blank_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "person\n\n  car  \nbus\n").unwrap();
    let vocabulary = Vocabulary::from_file(file.path()).unwrap();
    assert_eq!(vocabulary.len(), 3);
    assert_eq!(vocabulary.label(1), "car");
  }

  #[test]
  fn empty_label_file_is_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    assert!(matches!(
      Vocabulary::from_file(file.path()),
      Err(ConfigError::EmptyVocabulary)
    ));
  }

  #[test]
  fn closures_act_as_inference() {
    let infer = |_: &InputTensor| -> Result<RawOutputTensor, String> { Err("设备离线".into()) };
    let input = InputTensor::zeros(2);
    let err = Inference::infer(&infer, &input).unwrap_err();
    assert_eq!(err, InferenceError("设备离线".into()));
  }

  #[test]
  fn detection_serializes_flat_box() {
    let detection = Detection {
      class_id: 0,
      label: "person".into(),
      score: 0.5,
      bbox: BBox::new(0.0, 0.25, 0.5, 0.75),
    };
    let json = serde_json::to_value(&detection).unwrap();
    assert_eq!(json["label"], "person");
    assert_eq!(json["ymin"], 0.25);
    assert!(json.get("class_id").is_none());
  }
}
