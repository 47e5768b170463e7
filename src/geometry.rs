// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框与 IoU
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

/// 归一化坐标 [0, 1] 下的边界框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  pub xmin: f32,
  pub ymin: f32,
  pub xmax: f32,
  pub ymax: f32,
}

impl BBox {
  pub const fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
    Self {
      xmin,
      ymin,
      xmax,
      ymax,
    }
  }

  /// 由中心点与宽高构造，坐标按 `scale` 归一化并截断到 [0, 1]。
  ///
  /// 截断后面积为零或为负的框返回 `None`，不会保留退化框。
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, scale: f32) -> Option<Self> {
    if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
      return None;
    }

    let xmin = ((cx - w / 2.0) / scale).max(0.0);
    let ymin = ((cy - h / 2.0) / scale).max(0.0);
    let xmax = ((cx + w / 2.0) / scale).min(1.0);
    let ymax = ((cy + h / 2.0) / scale).min(1.0);

    if xmax > xmin && ymax > ymin {
      Some(Self::new(xmin, ymin, xmax, ymax))
    } else {
      None
    }
  }

  pub fn width(&self) -> f32 {
    self.xmax - self.xmin
  }

  pub fn height(&self) -> f32 {
    self.ymax - self.ymin
  }

  pub fn is_valid(&self) -> bool {
    self.xmax >= self.xmin && self.ymax >= self.ymin
  }

  pub fn area(&self) -> f32 {
    area(self)
  }

  pub fn iou(&self, other: &BBox) -> f32 {
    iou(self, other)
  }
}

impl From<[f32; 4]> for BBox {
  fn from(bbox: [f32; 4]) -> Self {
    Self::new(bbox[0], bbox[1], bbox[2], bbox[3])
  }
}

impl From<BBox> for [f32; 4] {
  fn from(bbox: BBox) -> Self {
    [bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax]
  }
}

/// 面积，非法框返回 0
pub fn area(bbox: &BBox) -> f32 {
  if !bbox.is_valid() {
    return 0.0;
  }
  bbox.width() * bbox.height()
}

/// 交并比
pub fn iou(a: &BBox, b: &BBox) -> f32 {
  let inter_w = (a.xmax.min(b.xmax) - a.xmin.max(b.xmin)).max(0.0);
  let inter_h = (a.ymax.min(b.ymax) - a.ymin.max(b.ymin)).max(0.0);

  if inter_w <= 0.0 || inter_h <= 0.0 {
    return 0.0;
  }

  // 交集为正意味着两个框面积都为正
  let intersection = inter_w * inter_h;
  intersection / (area(a) + area(b) - intersection)
}
