// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务驱动
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
  fmt::Display,
  sync::{
    Arc,
    mpsc::{self, Receiver},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
  frame::{Frame, FrameMeta},
  metrics::MetricsAggregator,
  model::{DetectResult, Model},
  output::Render,
  pipeline::{DEFAULT_QUEUE_CAPACITY, FramePipeline, PipelineConfig},
  timestamp_ms,
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 对单帧推理并输出
pub struct OneShotTask;

impl<I, M, O> Task<I, M, O> for OneShotTask
where
  I: Iterator<Item = Frame>,
  M: Model<Input = Frame, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  O: Render<FrameMeta, DetectResult>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    let recv_ts = timestamp_ms();
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = model.infer(&frame)?;
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}", elapsed);
    output.render_result(&frame.meta(recv_ts, timestamp_ms()), &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 对同一帧反复推理，统计平均耗时
#[derive(Debug, Clone, Copy)]
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times.max(1);
    self
  }
}

impl<I, M, O> Task<I, M, O> for RepeatShotTask
where
  I: Iterator<Item = Frame>,
  M: Model<Input = Frame, Output = DetectResult>,
  M::Error: std::error::Error + Send + Sync + 'static,
  O: Render<FrameMeta, DetectResult>,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    // 前两次视为预热
    const WARMUP: usize = 2;

    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    let recv_ts = timestamp_ms();
    info!("输入帧获取成功，开始推理...");
    let mut times = Vec::with_capacity(self.times);
    for i in 0..self.times {
      let now = Instant::now();
      let result = model.infer(&frame)?;
      let elapsed = now.elapsed();
      debug!("({})推理完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&frame.meta(recv_ts, timestamp_ms()), &result)?;
      times.push(elapsed);
    }

    let skip = if times.len() > WARMUP { WARMUP } else { 0 };
    let counted = (times.len() - skip) as u32;
    warn!(
      "平均推理时间: {:.2?}",
      times.iter().skip(skip).sum::<Duration>() / counted
    );

    Ok(())
  }
}

/// 把输入帧持续送入 [`FramePipeline`]，结束时输出统计
#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  queue_capacity: usize,
  metrics: Arc<MetricsAggregator>,
  handle_interrupt: bool,
  drain_timeout: Duration,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      metrics: Arc::new(MetricsAggregator::new()),
      handle_interrupt: true,
      drain_timeout: Duration::from_secs(30),
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
    self.queue_capacity = queue_capacity;
    self
  }

  pub fn with_metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
    self.metrics = metrics;
    self
  }

  /// 是否注册 Ctrl-C 处理，每个进程只能注册一次
  pub fn with_interrupt(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }

  pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
    self.drain_timeout = drain_timeout;
    self
  }
}

fn install_interrupt_handler() -> Result<Receiver<()>, ctrlc::Error> {
  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

impl<I, M, O> Task<I, M, O> for ContinuousTask
where
  I: Iterator<Item = Frame>,
  M: Model<Input = Frame, Output = DetectResult> + Send + 'static,
  M::Error: Display,
  O: Render<FrameMeta, DetectResult> + Send + Sync + 'static,
  O::Error: Display,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let interrupt = if self.handle_interrupt {
      Some(install_interrupt_handler()?)
    } else {
      None
    };

    let config = PipelineConfig::default()
      .with_queue_capacity(self.queue_capacity)
      .with_auto_dispatch(true);
    let pipeline = FramePipeline::spawn(config, model, output, Arc::clone(&self.metrics))?;

    let mut frame_index = 0usize;
    for frame in input {
      frame_index += 1;
      debug!("提交第 {} 帧 ({})", frame_index, frame.id());
      pipeline.submit(frame)?;
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if interrupt.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    if !pipeline.wait_idle(self.drain_timeout) {
      warn!("等待剩余帧处理超时");
    }
    pipeline.shutdown();

    let stats = pipeline.stats();
    let snapshot = self.metrics.snapshot();
    info!(
      "任务完成: 提交 {} 帧, 挤出 {} 帧, 完成 {} 帧 (失败 {})",
      stats.submitted, stats.evicted, stats.completed, stats.failed
    );
    info!(
      "延迟中位数 {} ms, P95 {} ms, 处理帧率 {:.2}",
      snapshot.median_latency_ms, snapshot.p95_latency_ms, snapshot.processed_fps
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc;

  use super::*;
  use crate::output::ChannelOutput;

  struct CountingModel;

  impl Model for CountingModel {
    type Input = Frame;
    type Output = DetectResult;
    type Error = std::io::Error;

    fn infer(&self, _frame: &Frame) -> Result<DetectResult, std::io::Error> {
      Ok(DetectResult::empty())
    }
  }

  fn frames(n: u64) -> impl Iterator<Item = Frame> {
    (0..n).map(|i| Frame::new(i, timestamp_ms(), vec![], 0, 0))
  }

  #[test]
  fn one_shot_renders_first_frame() {
    let (tx, rx) = mpsc::channel();
    OneShotTask
      .run_task(frames(3), CountingModel, ChannelOutput::new(tx))
      .unwrap();
    let messages: Vec<_> = rx.try_iter().collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].frame_id.as_str(), "0");
  }

  #[test]
  fn one_shot_without_input_fails() {
    let (tx, _rx) = mpsc::channel();
    assert!(
      OneShotTask
        .run_task(frames(0), CountingModel, ChannelOutput::new(tx))
        .is_err()
    );
  }

  #[test]
  fn repeat_shot_renders_every_round() {
    let (tx, rx) = mpsc::channel();
    RepeatShotTask::default()
      .with_times(5)
      .run_task(frames(1), CountingModel, ChannelOutput::new(tx))
      .unwrap();
    assert_eq!(rx.try_iter().count(), 5);
  }

  #[test]
  fn continuous_task_stops_at_frame_number() {
    let (tx, rx) = mpsc::channel();
    let metrics = Arc::new(MetricsAggregator::new());
    ContinuousTask::default()
      .with_interrupt(false)
      .with_frame_number(Some(4))
      .with_metrics(Arc::clone(&metrics))
      .run_task(frames(100), CountingModel, ChannelOutput::new(tx))
      .unwrap();

    let delivered = rx.try_iter().count() as u64;
    assert!((1..=4).contains(&delivered));
    assert_eq!(metrics.snapshot().total_frames, delivered);
  }
}
