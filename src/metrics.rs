// 该文件是 Shanan （山南西风） 项目的一部分。
// src/metrics.rs - 延迟与吞吐统计
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

use std::{
  collections::VecDeque,
  sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use tracing::info;

use crate::timestamp_ms;

pub const DEFAULT_LATENCY_WINDOW: usize = 4096;

/// 一个统计周期
#[derive(Debug)]
struct MetricsEpoch {
  started_ms: u64,
  total_frames: u64,
  latencies: VecDeque<u64>,
}

impl MetricsEpoch {
  fn new(started_ms: u64, window: usize) -> Self {
    Self {
      started_ms,
      total_frames: 0,
      latencies: VecDeque::with_capacity(window),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
  pub median_latency_ms: u64,
  pub p95_latency_ms: u64,
  pub processed_fps: f64,
  pub total_frames: u64,
}

/// 端到端延迟统计
///
/// 延迟样本保存在最近 `window` 个的滑动窗口中，帧计数覆盖整个周期。
/// `record` 与 `reset` 由同一把锁串行化，一次记录只会落在一个周期内。
#[derive(Debug)]
pub struct MetricsAggregator {
  epoch: Mutex<MetricsEpoch>,
  window: usize,
}

impl Default for MetricsAggregator {
  fn default() -> Self {
    Self::with_window(DEFAULT_LATENCY_WINDOW)
  }
}

impl MetricsAggregator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_window(window: usize) -> Self {
    Self::starting_at(timestamp_ms(), window)
  }

  pub fn starting_at(started_ms: u64, window: usize) -> Self {
    let window = window.max(1);
    Self {
      epoch: Mutex::new(MetricsEpoch::new(started_ms, window)),
      window,
    }
  }

  fn lock(&self) -> MutexGuard<'_, MetricsEpoch> {
    self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 记录一帧的采集与完成时间（Unix 毫秒）
  pub fn record(&self, capture_ts: u64, completion_ts: u64) {
    // 发送端与接收端时钟可能不同步
    let latency = completion_ts.saturating_sub(capture_ts);
    let mut epoch = self.lock();
    if epoch.latencies.len() == self.window {
      epoch.latencies.pop_front();
    }
    epoch.latencies.push_back(latency);
    epoch.total_frames += 1;
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    self.snapshot_at(timestamp_ms())
  }

  pub fn snapshot_at(&self, now_ms: u64) -> MetricsSnapshot {
    let (mut sorted, total_frames, started_ms) = {
      let epoch = self.lock();
      (
        epoch.latencies.iter().copied().collect::<Vec<_>>(),
        epoch.total_frames,
        epoch.started_ms,
      )
    };
    sorted.sort_unstable();

    let elapsed_s = now_ms.saturating_sub(started_ms) as f64 / 1000.0;
    let processed_fps = if elapsed_s > 0.0 {
      total_frames as f64 / elapsed_s
    } else {
      0.0
    };

    MetricsSnapshot {
      median_latency_ms: percentile(&sorted, 0.5),
      p95_latency_ms: percentile(&sorted, 0.95),
      processed_fps,
      total_frames,
    }
  }

  pub fn reset(&self) {
    self.reset_at(timestamp_ms());
  }

  /// 以新的空周期整体替换当前周期
  pub fn reset_at(&self, now_ms: u64) {
    let previous = {
      let mut epoch = self.lock();
      std::mem::replace(&mut *epoch, MetricsEpoch::new(now_ms, self.window))
    };
    info!("统计已重置, 上一周期共 {} 帧", previous.total_frames);
  }
}

/// 已排序样本的 `floor(n * q)` 位置，空集为 0
fn percentile(sorted: &[u64], q: f64) -> u64 {
  if sorted.is_empty() {
    return 0;
  }
  let idx = ((sorted.len() as f64) * q).floor() as usize;
  sorted[idx.min(sorted.len() - 1)]
}
