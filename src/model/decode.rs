// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/decode.rs - 输出张量解码
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

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::{
  geometry::BBox,
  model::{ConfigError, Detection, RawOutputTensor, Vocabulary},
};

pub const DEFAULT_OBJECTNESS_THRESHOLD: f32 = 0.25;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_RESOLUTION: u32 = 640;

// cx, cy, w, h, objectness
const BOX_ATTRS: usize = 5;
const OBJECTNESS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("模型输出结构错误: {0}")]
  MalformedOutput(Malformed),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
  #[error("元素数量 {len} 不能被属性数 {attrs} 整除")]
  NotDivisible { len: usize, attrs: usize },
  #[error("声明形状 {shape:?} 与元素数量 {len} 不一致")]
  ShapeMismatch { shape: Vec<usize>, len: usize },
}

impl From<Malformed> for DecodeError {
  fn from(m: Malformed) -> Self {
    DecodeError::MalformedOutput(m)
  }
}

/// 输出张量的元素排列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
  /// 候选优先：`index(i, k) = i * A + k`
  Interleaved,
  /// 属性优先：`index(i, k) = k * N + i`
  Planar,
}

impl Layout {
  #[inline]
  pub fn index(self, candidate: usize, attr: usize, attrs: usize, candidates: usize) -> usize {
    match self {
      Layout::Interleaved => candidate * attrs + attr,
      Layout::Planar => attr * candidates + candidate,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutHint {
  /// 形状最后一维等于属性数时按交错排列，否则按平面排列
  #[default]
  Auto,
  Fixed(Layout),
}

impl FromStr for LayoutHint {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "auto" => Ok(LayoutHint::Auto),
      "interleaved" => Ok(LayoutHint::Fixed(Layout::Interleaved)),
      "planar" => Ok(LayoutHint::Fixed(Layout::Planar)),
      other => Err(ConfigError::InvalidValue {
        key: "layout",
        value: other.to_string(),
      }),
    }
  }
}

/// 将原始输出张量解码为候选检测
///
/// 每个候选有 `A = 4 + 1 + num_classes` 个属性：中心点、宽高（模型输入像素坐标）、
/// 目标置信度以及各类别分数。输出框归一化到 [0, 1]。
#[derive(Debug, Clone)]
pub struct Decoder {
  vocabulary: Vocabulary,
  num_classes: usize,
  objectness_threshold: f32,
  score_threshold: f32,
  resolution: f32,
  layout: LayoutHint,
}

impl Decoder {
  pub fn builder() -> DecoderBuilder {
    DecoderBuilder::default()
  }

  pub fn attributes(&self) -> usize {
    BOX_ATTRS + self.num_classes
  }

  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  pub fn vocabulary(&self) -> &Vocabulary {
    &self.vocabulary
  }

  pub fn resolve_layout(&self, tensor: &RawOutputTensor) -> Layout {
    match self.layout {
      LayoutHint::Fixed(layout) => layout,
      LayoutHint::Auto if tensor.shape().last() == Some(&self.attributes()) => Layout::Interleaved,
      LayoutHint::Auto => Layout::Planar,
    }
  }

  pub fn decode(&self, tensor: &RawOutputTensor) -> Result<Vec<Detection>, DecodeError> {
    let data = tensor.data();
    let len = data.len();
    let attrs = self.attributes();

    let declared = tensor
      .shape()
      .iter()
      .try_fold(1usize, |acc, &dim| acc.checked_mul(dim));
    if declared != Some(len) {
      return Err(
        Malformed::ShapeMismatch {
          shape: tensor.shape().to_vec(),
          len,
        }
        .into(),
      );
    }
    if len % attrs != 0 {
      return Err(Malformed::NotDivisible { len, attrs }.into());
    }

    let candidates = len / attrs;
    let layout = self.resolve_layout(tensor);
    debug!(
      "解码输出张量: 形状 {:?}, 排列 {:?}, 候选数 {}",
      tensor.shape(),
      layout,
      candidates
    );

    let at = |i: usize, k: usize| data[layout.index(i, k, attrs, candidates)];
    let mut items = Vec::new();

    for i in 0..candidates {
      let objectness = at(i, OBJECTNESS);
      // 取反比较同时过滤 NaN
      if !(objectness > self.objectness_threshold) {
        continue;
      }

      let mut best_score = f32::NEG_INFINITY;
      let mut best_class = 0usize;
      for c in 0..self.num_classes {
        let score = at(i, BOX_ATTRS + c);
        if score > best_score {
          best_score = score;
          best_class = c;
        }
      }

      let score = objectness * best_score;
      if !(score > self.score_threshold) {
        continue;
      }

      let Some(bbox) = BBox::from_center(at(i, 0), at(i, 1), at(i, 2), at(i, 3), self.resolution)
      else {
        continue;
      };

      items.push(Detection {
        class_id: best_class,
        label: self.vocabulary.label(best_class).to_string(),
        score,
        bbox,
      });
    }

    debug!("解码得到 {} 个候选检测", items.len());
    Ok(items)
  }
}

#[derive(Debug, Clone)]
pub struct DecoderBuilder {
  vocabulary: Option<Vocabulary>,
  num_classes: Option<usize>,
  objectness_threshold: f32,
  score_threshold: f32,
  resolution: u32,
  layout: LayoutHint,
}

impl Default for DecoderBuilder {
  fn default() -> Self {
    Self {
      vocabulary: None,
      num_classes: None,
      objectness_threshold: DEFAULT_OBJECTNESS_THRESHOLD,
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      resolution: DEFAULT_RESOLUTION,
      layout: LayoutHint::Auto,
    }
  }
}

impl DecoderBuilder {
  pub fn vocabulary(mut self, vocabulary: Vocabulary) -> Self {
    self.vocabulary = Some(vocabulary);
    self
  }

  /// 模型输出的类别数，必须与词表长度一致
  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.num_classes = Some(num_classes);
    self
  }

  pub fn objectness_threshold(mut self, threshold: f32) -> Self {
    self.objectness_threshold = threshold;
    self
  }

  pub fn score_threshold(mut self, threshold: f32) -> Self {
    self.score_threshold = threshold;
    self
  }

  pub fn resolution(mut self, resolution: u32) -> Self {
    self.resolution = resolution;
    self
  }

  pub fn layout(mut self, layout: LayoutHint) -> Self {
    self.layout = layout;
    self
  }

  pub fn build(self) -> Result<Decoder, ConfigError> {
    let vocabulary = self.vocabulary.unwrap_or_default();
    if vocabulary.is_empty() {
      return Err(ConfigError::EmptyVocabulary);
    }

    let num_classes = self.num_classes.unwrap_or(vocabulary.len());
    if num_classes != vocabulary.len() {
      return Err(ConfigError::ClassCountMismatch {
        model: num_classes,
        vocabulary: vocabulary.len(),
      });
    }

    check_unit("objectness", self.objectness_threshold)?;
    check_unit("score", self.score_threshold)?;
    if self.resolution == 0 {
      return Err(ConfigError::InvalidValue {
        key: "resolution",
        value: self.resolution.to_string(),
      });
    }

    Ok(Decoder {
      vocabulary,
      num_classes,
      objectness_threshold: self.objectness_threshold,
      score_threshold: self.score_threshold,
      resolution: self.resolution as f32,
      layout: self.layout,
    })
  }
}

pub(crate) fn check_unit(key: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::InvalidValue {
      key,
      value: value.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn two_class_decoder() -> Decoder {
    Decoder::builder()
      .vocabulary(Vocabulary::new(["person", "car"]))
      .build()
      .unwrap()
  }

  // 每行一个候选: cx, cy, w, h, obj, c0, c1
  fn interleaved(rows: &[[f32; 7]]) -> RawOutputTensor {
    let data = rows.iter().flatten().copied().collect();
    RawOutputTensor::new(data, vec![1, rows.len(), 7])
  }

  fn planar(rows: &[[f32; 7]]) -> RawOutputTensor {
    let mut data = Vec::with_capacity(rows.len() * 7);
    for k in 0..7 {
      data.extend(rows.iter().map(|row| row[k]));
    }
    RawOutputTensor::new(data, vec![1, 7, rows.len()])
  }

  const ROWS: [[f32; 7]; 3] = [
    [100.0, 100.0, 50.0, 50.0, 0.9, 0.8, 0.1],
    [320.0, 320.0, 64.0, 128.0, 0.6, 0.2, 0.9],
    [500.0, 500.0, 10.0, 10.0, 0.1, 0.9, 0.9],
  ];

  #[test]
  fn decodes_interleaved_candidates_in_scan_order() {
    let detections = two_class_decoder().decode(&interleaved(&ROWS)).unwrap();
    assert_eq!(detections.len(), 2);

    assert_eq!(detections[0].label, "person");
    assert!((detections[0].score - 0.72).abs() < 1e-6);
    assert!((detections[0].bbox.xmin - 75.0 / 640.0).abs() < 1e-6);
    assert!((detections[0].bbox.ymax - 125.0 / 640.0).abs() < 1e-6);

    assert_eq!(detections[1].label, "car");
    assert_eq!(detections[1].class_id, 1);
    assert!((detections[1].bbox.ymin - 256.0 / 640.0).abs() < 1e-6);
  }

  #[test]
  fn auto_layout_reads_planar_tensor_identically() {
    let decoder = two_class_decoder();
    let a = interleaved(&ROWS);
    let b = planar(&ROWS);
    assert_eq!(decoder.resolve_layout(&a), Layout::Interleaved);
    assert_eq!(decoder.resolve_layout(&b), Layout::Planar);
    assert_eq!(decoder.decode(&a).unwrap(), decoder.decode(&b).unwrap());
  }

  #[test]
  fn fixed_layout_overrides_shape() {
    let decoder = Decoder::builder()
      .vocabulary(Vocabulary::new(["person", "car"]))
      .layout(LayoutHint::Fixed(Layout::Interleaved))
      .build()
      .unwrap();
    let flat = RawOutputTensor::flat(ROWS.iter().flatten().copied().collect());
    assert_eq!(decoder.resolve_layout(&flat), Layout::Interleaved);
    assert_eq!(decoder.decode(&flat).unwrap().len(), 2);
  }

  #[test]
  fn ties_pick_the_lowest_class_index() {
    let rows = [[100.0, 100.0, 50.0, 50.0, 0.9, 0.7, 0.7]];
    let detections = two_class_decoder().decode(&interleaved(&rows)).unwrap();
    assert_eq!(detections[0].class_id, 0);
  }

  #[test]
  fn thresholds_are_exclusive() {
    // obj == 0.25 跳过; 0.5 * 0.5 == 0.25 跳过
    let rows = [
      [100.0, 100.0, 50.0, 50.0, 0.25, 1.0, 0.0],
      [100.0, 100.0, 50.0, 50.0, 0.5, 0.5, 0.0],
    ];
    assert!(two_class_decoder().decode(&interleaved(&rows)).unwrap().is_empty());
  }

  #[test]
  fn degenerate_boxes_are_dropped() {
    let rows = [
      [700.0, 100.0, 20.0, 20.0, 0.9, 0.9, 0.0],
      [100.0, 100.0, 0.0, 20.0, 0.9, 0.9, 0.0],
      [f32::NAN, 100.0, 20.0, 20.0, 0.9, 0.9, 0.0],
    ];
    assert!(two_class_decoder().decode(&interleaved(&rows)).unwrap().is_empty());
  }

  #[test]
  fn indivisible_length_is_malformed() {
    let tensor = RawOutputTensor::flat(vec![0.0; 15]);
    assert_eq!(
      two_class_decoder().decode(&tensor),
      Err(DecodeError::MalformedOutput(Malformed::NotDivisible {
        len: 15,
        attrs: 7
      }))
    );
  }

  #[test]
  fn inconsistent_shape_is_malformed() {
    let tensor = RawOutputTensor::new(vec![0.0; 14], vec![1, 3, 7]);
    assert!(matches!(
      two_class_decoder().decode(&tensor),
      Err(DecodeError::MalformedOutput(Malformed::ShapeMismatch { len: 14, .. }))
    ));
  }

  #[test]
  fn overflowing_shape_is_malformed() {
    let tensor = RawOutputTensor::new(vec![0.0; 7], vec![usize::MAX, 2]);
    assert!(matches!(
      two_class_decoder().decode(&tensor),
      Err(DecodeError::MalformedOutput(Malformed::ShapeMismatch { len: 7, .. }))
    ));

    // 乘积回绕后恰好为 0 的形状也不能与空缓冲区对上
    let wrapped = RawOutputTensor::new(Vec::new(), vec![usize::MAX / 2 + 1, 2, 7]);
    assert!(matches!(
      two_class_decoder().decode(&wrapped),
      Err(DecodeError::MalformedOutput(Malformed::ShapeMismatch { len: 0, .. }))
    ));
  }

  #[test]
  fn empty_tensor_decodes_to_nothing() {
    let tensor = RawOutputTensor::new(Vec::new(), vec![1, 0, 7]);
    assert_eq!(two_class_decoder().decode(&tensor), Ok(Vec::new()));
  }

  #[test]
  fn builder_rejects_mismatched_class_count() {
    let err = Decoder::builder()
      .vocabulary(Vocabulary::new(["a", "b"]))
      .num_classes(80)
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      ConfigError::ClassCountMismatch {
        model: 80,
        vocabulary: 2
      }
    ));
  }

  #[test]
  fn builder_rejects_out_of_range_values() {
    assert!(Decoder::builder().score_threshold(1.5).build().is_err());
    assert!(Decoder::builder().objectness_threshold(-0.1).build().is_err());
    assert!(Decoder::builder().resolution(0).build().is_err());
    assert_eq!(Decoder::builder().build().unwrap().attributes(), 85);
  }

  #[test]
  fn layout_hint_parses() {
    assert_eq!("auto".parse::<LayoutHint>().unwrap(), LayoutHint::Auto);
    assert_eq!(
      "planar".parse::<LayoutHint>().unwrap(),
      LayoutHint::Fixed(Layout::Planar)
    );
    assert!("nchw".parse::<LayoutHint>().is_err());
  }
}
