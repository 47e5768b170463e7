// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolo.rs - YOLO 检测器组装
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
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Frame, Preprocess, PreprocessError, RgbNchwNormalize},
  model::{
    ConfigError, DecodeError, Decoder, DecoderBuilder, DetectResult, Inference,
    InferenceError, LayoutHint, Model, RawOutputTensor, Vocabulary,
    decode::check_unit,
    nms::{DEFAULT_IOU_THRESHOLD, suppress, suppress_per_class},
  },
};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Decode(#[from] DecodeError),
}

/// 解码加抑制
#[derive(Debug, Clone)]
pub struct Postprocess {
  decoder: Decoder,
  iou_threshold: f32,
  per_class: bool,
}

impl Postprocess {
  pub fn decoder(&self) -> &Decoder {
    &self.decoder
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  pub fn run(&self, tensor: &RawOutputTensor) -> Result<DetectResult, DecodeError> {
    let candidates = self.decoder.decode(tensor)?;
    let kept = if self.per_class {
      suppress_per_class(candidates, self.iou_threshold)
    } else {
      suppress(candidates, self.iou_threshold)
    };
    Ok(DetectResult::from(kept))
  }
}

/// 预处理、推理、解码、抑制串成的检测器
pub struct YoloDetector<P, I> {
  preprocess: P,
  inference: I,
  postprocess: Postprocess,
}

impl<P: Preprocess, I: Inference> Model for YoloDetector<P, I> {
  type Input = Frame;
  type Output = DetectResult;
  type Error = DetectorError;

  fn infer(&self, frame: &Frame) -> Result<DetectResult, DetectorError> {
    debug!("预处理帧 {}", frame.id());
    let input = self.preprocess.preprocess(frame)?;

    debug!("执行模型推理");
    let output = self.inference.infer(&input)?;

    let result = self
      .postprocess
      .run(&output)
      .inspect_err(|e| error!("帧 {} 解码失败: {}", frame.id(), e))?;
    debug!("帧 {} 检测到 {} 个物体", frame.id(), result.len());
    Ok(result)
  }
}

impl<P, I> YoloDetector<P, I> {
  pub fn postprocess(&self) -> &Postprocess {
    &self.postprocess
  }
}

const YOLO_SCHEME: &str = "yolo";

/// 检测器配置
///
/// URL 形式：`yolo:///<标签文件>?classes=80&resolution=640&objectness=0.25&score=0.25&iou=0.45&layout=auto`，
/// 路径为空时使用内置 COCO 词表。
#[derive(Debug, Clone)]
pub struct YoloDetectorBuilder {
  decoder: DecoderBuilder,
  resolution: u32,
  iou_threshold: f32,
  per_class: bool,
}

impl Default for YoloDetectorBuilder {
  fn default() -> Self {
    Self {
      decoder: DecoderBuilder::default(),
      resolution: crate::model::decode::DEFAULT_RESOLUTION,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      per_class: false,
    }
  }
}

impl FromUrlWithScheme for YoloDetectorBuilder {
  const SCHEME: &'static str = YOLO_SCHEME;
}

impl FromUrl for YoloDetectorBuilder {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let mut builder = YoloDetectorBuilder::default();

    let path = urlencoding::decode(url.path()).map_err(|_| ConfigError::InvalidValue {
      key: "path",
      value: url.path().to_string(),
    })?;
    if !path.is_empty() && path != "/" {
      info!("加载标签文件: {}", path);
      builder = builder.vocabulary(Vocabulary::from_file(&*path)?);
    }

    for (key, value) in url.query_pairs() {
      builder = match key.as_ref() {
        "classes" => builder.num_classes(parse_value("classes", &value)?),
        "resolution" => builder.resolution(parse_value("resolution", &value)?),
        "objectness" => builder.objectness_threshold(parse_value("objectness", &value)?),
        "score" => builder.score_threshold(parse_value("score", &value)?),
        "iou" => builder.iou_threshold(parse_value("iou", &value)?),
        "layout" => builder.layout(value.parse::<LayoutHint>()?),
        "per_class" => builder.per_class(parse_value("per_class", &value)?),
        other => {
          warn!("忽略未知参数: {}={}", other, value);
          builder
        }
      };
    }

    Ok(builder)
  }
}

impl YoloDetectorBuilder {
  pub fn vocabulary(mut self, vocabulary: Vocabulary) -> Self {
    self.decoder = self.decoder.vocabulary(vocabulary);
    self
  }

  pub fn num_classes(mut self, num_classes: usize) -> Self {
    self.decoder = self.decoder.num_classes(num_classes);
    self
  }

  pub fn resolution(mut self, resolution: u32) -> Self {
    self.resolution = resolution;
    self.decoder = self.decoder.resolution(resolution);
    self
  }

  pub fn objectness_threshold(mut self, threshold: f32) -> Self {
    self.decoder = self.decoder.objectness_threshold(threshold);
    self
  }

  pub fn score_threshold(mut self, threshold: f32) -> Self {
    self.decoder = self.decoder.score_threshold(threshold);
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn layout(mut self, layout: LayoutHint) -> Self {
    self.decoder = self.decoder.layout(layout);
    self
  }

  /// 按类别分别抑制，默认关闭
  pub fn per_class(mut self, per_class: bool) -> Self {
    self.per_class = per_class;
    self
  }

  pub fn canonical_resolution(&self) -> u32 {
    self.resolution
  }

  pub fn build_postprocess(self) -> Result<Postprocess, ConfigError> {
    check_unit("iou", self.iou_threshold)?;
    let decoder = self.decoder.build()?;
    info!(
      "检测器配置: {} 类, 输入 {}x{}, IoU 阈值 {}",
      decoder.num_classes(),
      self.resolution,
      self.resolution,
      self.iou_threshold
    );
    Ok(Postprocess {
      decoder,
      iou_threshold: self.iou_threshold,
      per_class: self.per_class,
    })
  }

  pub fn build<I: Inference>(
    self,
    inference: I,
  ) -> Result<YoloDetector<RgbNchwNormalize, I>, ConfigError> {
    let preprocess = RgbNchwNormalize::new(self.resolution);
    self.build_with(preprocess, inference)
  }

  pub fn build_with<P: Preprocess, I: Inference>(
    self,
    preprocess: P,
    inference: I,
  ) -> Result<YoloDetector<P, I>, ConfigError> {
    let postprocess = self.build_postprocess()?;
    Ok(YoloDetector {
      preprocess,
      inference,
      postprocess,
    })
  }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
  value.parse().map_err(|_| ConfigError::InvalidValue {
    key,
    value: value.to_string(),
  })
}
