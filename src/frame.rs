// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 帧定义与预处理
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

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::InputTensor;

const RGB_CHANNELS: usize = 3;

/// 调用方提供的帧标识，在同一条流水线的生命周期内唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(String);

impl FrameId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for FrameId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for FrameId {
  fn from(id: &str) -> Self {
    FrameId(id.to_string())
  }
}

impl From<String> for FrameId {
  fn from(id: String) -> Self {
    FrameId(id)
  }
}

impl From<u64> for FrameId {
  fn from(id: u64) -> Self {
    FrameId(id.to_string())
  }
}

/// 采集端送来的一帧
#[derive(Debug, Clone)]
pub struct Frame {
  id: FrameId,
  capture_ts: u64,
  payload: Box<[u8]>,
  width: u32,
  height: u32,
}

impl Frame {
  pub fn new(
    id: impl Into<FrameId>,
    capture_ts: u64,
    payload: Vec<u8>,
    width: u32,
    height: u32,
  ) -> Self {
    Self {
      id: id.into(),
      capture_ts,
      payload: payload.into_boxed_slice(),
      width,
      height,
    }
  }

  pub fn id(&self) -> &FrameId {
    &self.id
  }

  /// 采集时间戳（Unix 毫秒）
  pub fn capture_ts(&self) -> u64 {
    self.capture_ts
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  /// 丢弃图像数据后保留的标识与时间信息
  pub fn meta(&self, recv_ts: u64, inference_ts: u64) -> FrameMeta {
    FrameMeta {
      id: self.id.clone(),
      capture_ts: self.capture_ts,
      recv_ts,
      inference_ts,
      width: self.width,
      height: self.height,
    }
  }
}

/// 与检测结果配对交给渲染端的帧信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMeta {
  pub id: FrameId,
  pub capture_ts: u64,
  pub recv_ts: u64,
  pub inference_ts: u64,
  pub width: u32,
  pub height: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("帧尺寸 {width}x{height} 与模型输入 {resolution}x{resolution} 不一致")]
  SizeMismatch {
    width: u32,
    height: u32,
    resolution: u32,
  },
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  PayloadLength { expected: usize, actual: usize },
}

/// 预处理协作方：把帧转换为模型输入
pub trait Preprocess: Send + Sync {
  fn preprocess(&self, frame: &Frame) -> Result<InputTensor, PreprocessError>;
}

impl<F> Preprocess for F
where
  F: Fn(&Frame) -> Result<InputTensor, PreprocessError> + Send + Sync,
{
  fn preprocess(&self, frame: &Frame) -> Result<InputTensor, PreprocessError> {
    self(frame)
  }
}

/// NHWC RGB 字节转换为 NCHW 浮点输入，像素缩放到 [0, 1]
///
/// 不做缩放，帧必须已经是 R×R。
#[derive(Debug, Clone, Copy)]
pub struct RgbNchwNormalize {
  resolution: u32,
}

impl RgbNchwNormalize {
  pub fn new(resolution: u32) -> Self {
    Self { resolution }
  }
}

impl Preprocess for RgbNchwNormalize {
  fn preprocess(&self, frame: &Frame) -> Result<InputTensor, PreprocessError> {
    if frame.width() != self.resolution || frame.height() != self.resolution {
      return Err(PreprocessError::SizeMismatch {
        width: frame.width(),
        height: frame.height(),
        resolution: self.resolution,
      });
    }

    let r = self.resolution as usize;
    let plane_size = r * r;
    let expected = plane_size * RGB_CHANNELS;
    let pixels = frame.payload();
    if pixels.len() != expected {
      return Err(PreprocessError::PayloadLength {
        expected,
        actual: pixels.len(),
      });
    }

    let mut input = InputTensor::zeros(r);
    let data = input.as_mut();
    for (idx, pixel) in pixels.chunks_exact(RGB_CHANNELS).enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane_size + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane_size + idx] = pixel[2] as f32 / 255.0;
    }

    Ok(input)
  }
}
