// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放推理
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

use std::{thread, time::Duration};

use tracing::debug;

use crate::model::{Inference, InferenceError, InputTensor, RawOutputTensor};

/// 固定返回同一输出张量的推理实现，可模拟推理耗时
///
/// 用于在没有推理设备时压测流水线。
#[derive(Debug, Clone)]
pub struct ReplayInference {
  output: RawOutputTensor,
  latency: Duration,
}

impl ReplayInference {
  pub fn new(output: RawOutputTensor) -> Self {
    Self {
      output,
      latency: Duration::ZERO,
    }
  }

  /// 两个几乎重合的类别 0 候选，交错排列
  pub fn synthetic(num_classes: usize) -> Self {
    let attrs = 5 + num_classes;
    let mut data = vec![0.0f32; 2 * attrs];
    for (i, (shift, objectness)) in [(0.0f32, 0.9f32), (2.0, 0.85)].into_iter().enumerate() {
      let row = &mut data[i * attrs..(i + 1) * attrs];
      row[..5].copy_from_slice(&[100.0 + shift, 100.0 + shift, 50.0, 50.0, objectness]);
      if num_classes > 0 {
        row[5] = 0.8;
      }
      if num_classes > 1 {
        row[6] = 0.1;
      }
    }
    Self::new(RawOutputTensor::new(data, vec![1, 2, attrs]))
  }

  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }
}

impl Inference for ReplayInference {
  fn infer(&self, _input: &InputTensor) -> Result<RawOutputTensor, InferenceError> {
    if !self.latency.is_zero() {
      thread::sleep(self.latency);
    }
    debug!("回放输出张量: 形状 {:?}", self.output.shape());
    Ok(self.output.clone())
  }
}
