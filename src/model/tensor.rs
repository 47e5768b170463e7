// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/tensor.rs - 模型输入输出张量
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

use std::path::Path;

const RGB_CHANNELS: usize = 3;

/// 推理输出的扁平 f32 缓冲区及其声明形状
///
/// 形状与长度是否一致由解码器检查，这里不做校验。
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutputTensor {
  data: Box<[f32]>,
  shape: Box<[usize]>,
}

impl RawOutputTensor {
  pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
    Self {
      data: data.into_boxed_slice(),
      shape: shape.into_boxed_slice(),
    }
  }

  /// 一维张量，形状为 `[len]`
  pub fn flat(data: Vec<f32>) -> Self {
    let len = data.len();
    Self::new(data, vec![len])
  }

  /// 读取小端 f32 原始转储文件
  pub fn read_f32_le(path: impl AsRef<Path>, shape: Vec<usize>) -> std::io::Result<Self> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 {
      return Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("转储文件长度 {} 不是 4 的倍数", bytes.len()),
      ));
    }
    let data = bytes
      .chunks_exact(4)
      .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
      .collect();
    Ok(Self::new(data, shape))
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// NCHW 排列、取值 [0, 1] 的模型输入
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
  data: Box<[f32]>,
  resolution: usize,
}

impl InputTensor {
  pub fn zeros(resolution: usize) -> Self {
    Self {
      data: vec![0.0; RGB_CHANNELS * resolution * resolution].into_boxed_slice(),
      resolution,
    }
  }

  pub fn resolution(&self) -> usize {
    self.resolution
  }

  /// `[1, 3, R, R]`
  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.resolution, self.resolution]
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }
}

impl AsMut<[f32]> for InputTensor {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}
