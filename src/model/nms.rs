// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use std::collections::BTreeMap;

use tracing::debug;

use crate::{geometry::iou, model::Detection};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 贪心非极大值抑制，不区分类别
///
/// 按分数降序处理，同分时保持输入顺序；IoU 严格大于阈值的低分框被抑制。
/// 返回结果按分数降序排列。需要按类别抑制时使用 [`suppress_per_class`]。
pub fn suppress(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  // sort_by 是稳定排序
  detections.sort_by(|a, b| b.score.total_cmp(&a.score));

  let total = detections.len();
  let mut suppressed = vec![false; total];

  for i in 0..total {
    if suppressed[i] {
      continue;
    }
    for j in (i + 1)..total {
      if !suppressed[j] && iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  let kept: Vec<Detection> = detections
    .into_iter()
    .zip(suppressed)
    .filter_map(|(det, gone)| (!gone).then_some(det))
    .collect();

  debug!("NMS: {} -> {}", total, kept.len());
  kept
}

/// 先按类别分组再分别抑制，结果重新按分数降序合并
pub fn suppress_per_class(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  let mut groups: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
  for det in detections {
    groups.entry(det.class_id).or_default().push(det);
  }

  let mut kept: Vec<Detection> = groups
    .into_values()
    .flat_map(|group| suppress(group, iou_threshold))
    .collect();
  kept.sort_by(|a, b| b.score.total_cmp(&a.score));
  kept
}
