// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 带背压的帧流水线
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

//! 帧的生命周期：`排队 → 推理中 → 完成`，或 `排队 → 被挤出`。
//!
//! 队列满时丢弃最旧的排队帧，提交端永不阻塞；同一时刻最多一帧在推理。
//! 推理在独立线程上执行，结果与帧标识、采集时间配对后交给 [`Render`]。

use std::{
  collections::VecDeque,
  fmt::Display,
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError,
    mpsc::{self, Receiver, Sender},
  },
  thread::{self, JoinHandle},
  time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{Frame, FrameId, FrameMeta},
  metrics::MetricsAggregator,
  model::{DetectResult, Model},
  output::Render,
  timestamp_ms,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
  /// 排队帧上限，不含正在推理的帧
  pub queue_capacity: usize,
  /// 提交与完成后自动派发下一帧
  pub auto_dispatch: bool,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      auto_dispatch: true,
    }
  }
}

impl PipelineConfig {
  pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
    self.queue_capacity = queue_capacity;
    self
  }

  pub fn with_auto_dispatch(mut self, auto_dispatch: bool) -> Self {
    self.auto_dispatch = auto_dispatch;
    self
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("流水线已关闭")]
  Closed,
  #[error("推理线程已退出")]
  WorkerGone,
  #[error("队列容量必须至少为 1")]
  ZeroCapacity,
  #[error("无法启动推理线程: {0}")]
  Spawn(#[from] std::io::Error),
}

/// 仍被流水线持有的帧所处的状态，终止状态的帧不再被记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
  Queued,
  Dispatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
  Dispatched(FrameId),
  /// 已有一帧在推理
  Busy,
  /// 队列为空
  Idle,
}

/// 流水线计数
///
/// `evicted` 包含队列满时挤出的帧与关闭时丢弃的排队帧；
/// `completed` 包含推理失败后以空结果交付的帧，`failed` 为其中失败的部分；
/// `discarded` 是找不到对应帧而丢弃的迟到结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
  pub submitted: u64,
  pub evicted: u64,
  pub dispatched: u64,
  pub completed: u64,
  pub failed: u64,
  pub discarded: u64,
}

struct Queued {
  frame: Frame,
  recv_ts: u64,
}

struct InFlight {
  id: FrameId,
  capture_ts: u64,
  recv_ts: u64,
  width: u32,
  height: u32,
  completing: bool,
}

struct State {
  queue: VecDeque<Queued>,
  in_flight: Option<InFlight>,
  closed: bool,
  stats: PipelineStats,
  jobs: Option<Sender<Frame>>,
}

impl State {
  fn is_idle(&self) -> bool {
    self.queue.is_empty() && self.in_flight.is_none()
  }
}

struct Shared<O> {
  config: PipelineConfig,
  state: Mutex<State>,
  idle: Condvar,
  metrics: Arc<MetricsAggregator>,
  output: O,
}

impl<O> Shared<O> {
  // 队列与在途记录在任意中途退出后都保持一致，可以直接沿用
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<O> Shared<O>
where
  O: Render<FrameMeta, DetectResult>,
  O::Error: Display,
{
  fn submit(&self, frame: Frame) -> Result<Option<FrameId>, PipelineError> {
    let recv_ts = timestamp_ms();
    let evicted = {
      let mut state = self.lock();
      if state.closed {
        return Err(PipelineError::Closed);
      }

      let evicted = if state.queue.len() >= self.config.queue_capacity {
        state.queue.pop_front().map(|old| old.frame.id().clone())
      } else {
        None
      };
      if let Some(id) = &evicted {
        state.stats.evicted += 1;
        debug!("队列已满, 丢弃最旧的帧 {}", id);
      }

      state.queue.push_back(Queued { frame, recv_ts });
      state.stats.submitted += 1;
      evicted
    };

    if self.config.auto_dispatch {
      self.pump();
    }
    Ok(evicted)
  }

  fn dispatch(&self) -> Result<DispatchOutcome, PipelineError> {
    let mut state = self.lock();
    if state.closed {
      return Err(PipelineError::Closed);
    }
    if state.in_flight.is_some() {
      return Ok(DispatchOutcome::Busy);
    }
    let Some(Queued { frame, recv_ts }) = state.queue.pop_front() else {
      return Ok(DispatchOutcome::Idle);
    };

    let id = frame.id().clone();
    let in_flight = InFlight {
      id: id.clone(),
      capture_ts: frame.capture_ts(),
      recv_ts,
      width: frame.width(),
      height: frame.height(),
      completing: false,
    };

    let sent = state
      .jobs
      .as_ref()
      .is_some_and(|jobs| jobs.send(frame).is_ok());
    if !sent {
      error!("推理线程不可用, 帧 {} 被丢弃", id);
      state.stats.evicted += 1;
      if state.is_idle() {
        self.idle.notify_all();
      }
      return Err(PipelineError::WorkerGone);
    }

    state.in_flight = Some(in_flight);
    state.stats.dispatched += 1;
    debug!("派发帧 {} 进行推理", id);
    Ok(DispatchOutcome::Dispatched(id))
  }

  fn pump(&self) -> Option<FrameId> {
    match self.dispatch() {
      Ok(DispatchOutcome::Dispatched(id)) => Some(id),
      Ok(_) | Err(PipelineError::Closed) => None,
      Err(e) => {
        warn!("自动派发失败: {}", e);
        None
      }
    }
  }

  fn complete<E: Display>(&self, id: &FrameId, result: Result<DetectResult, E>) -> bool {
    let inference_ts = timestamp_ms();
    let meta = {
      let mut state = self.lock();
      let accepted = state
        .in_flight
        .as_ref()
        .is_some_and(|flight| &flight.id == id && !flight.completing);
      if !accepted {
        state.stats.discarded += 1;
        warn!("帧 {} 已不在流水线中, 丢弃其推理结果", id);
        return false;
      }
      let Some(flight) = state.in_flight.as_mut() else {
        return false;
      };
      flight.completing = true;
      FrameMeta {
        id: flight.id.clone(),
        capture_ts: flight.capture_ts,
        recv_ts: flight.recv_ts,
        inference_ts,
        width: flight.width,
        height: flight.height,
      }
    };

    let (result, failed) = match result {
      Ok(result) => (result, false),
      Err(e) => {
        warn!("帧 {} 推理失败, 以空结果交付: {}", id, e);
        (DetectResult::empty(), true)
      }
    };

    self.metrics.record(meta.capture_ts, inference_ts);
    let rendered =
      panic::catch_unwind(AssertUnwindSafe(|| self.output.render_result(&meta, &result)));
    match rendered {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!("帧 {} 结果输出失败: {}", id, e),
      Err(_) => error!("帧 {} 结果输出时发生 panic", id),
    }

    {
      let mut state = self.lock();
      // 输出期间流水线可能已被关闭
      if state.in_flight.as_ref().is_some_and(|flight| &flight.id == id) {
        state.in_flight = None;
      }
      state.stats.completed += 1;
      if failed {
        state.stats.failed += 1;
      }
      self.idle.notify_all();
    }

    if self.config.auto_dispatch {
      self.pump();
    }
    true
  }
}

fn run_worker<M, O>(shared: Arc<Shared<O>>, model: M, jobs: Receiver<Frame>)
where
  M: Model<Input = Frame, Output = DetectResult>,
  M::Error: Display,
  O: Render<FrameMeta, DetectResult>,
  O::Error: Display,
{
  for frame in jobs {
    let id = frame.id().clone();
    // 错误的格式化也在保护范围内
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
      model.infer(&frame).map_err(|e| e.to_string())
    }));
    drop(frame);

    let result = outcome.unwrap_or_else(|_| Err("推理过程中发生 panic".to_string()));
    shared.complete(&id, result);
  }
  debug!("推理线程退出");
}

/// 单路推理的帧流水线
pub struct FramePipeline<O> {
  shared: Arc<Shared<O>>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl<O> FramePipeline<O>
where
  O: Render<FrameMeta, DetectResult> + Send + Sync + 'static,
  O::Error: Display,
{
  /// 启动推理线程，模型的所有权移交给该线程
  pub fn spawn<M>(
    config: PipelineConfig,
    model: M,
    output: O,
    metrics: Arc<MetricsAggregator>,
  ) -> Result<Self, PipelineError>
  where
    M: Model<Input = Frame, Output = DetectResult> + Send + 'static,
    M::Error: Display,
  {
    if config.queue_capacity == 0 {
      return Err(PipelineError::ZeroCapacity);
    }

    let (jobs, receiver) = mpsc::channel();
    let shared = Arc::new(Shared {
      config,
      state: Mutex::new(State {
        queue: VecDeque::with_capacity(config.queue_capacity),
        in_flight: None,
        closed: false,
        stats: PipelineStats::default(),
        jobs: Some(jobs),
      }),
      idle: Condvar::new(),
      metrics,
      output,
    });

    let worker = {
      let shared = Arc::clone(&shared);
      thread::Builder::new()
        .name("shanan-infer".to_string())
        .spawn(move || run_worker(shared, model, receiver))?
    };
    info!(
      "流水线启动: 队列容量 {}, 自动派发 {}",
      config.queue_capacity, config.auto_dispatch
    );

    Ok(Self {
      shared,
      worker: Mutex::new(Some(worker)),
    })
  }

  /// 提交一帧，返回被挤出的帧标识
  pub fn submit(&self, frame: Frame) -> Result<Option<FrameId>, PipelineError> {
    self.shared.submit(frame)
  }

  /// 将最旧的排队帧交给推理线程；已有在途帧时不做任何事
  pub fn dispatch(&self) -> Result<DispatchOutcome, PipelineError> {
    self.shared.dispatch()
  }

  pub fn pump(&self) -> Option<FrameId> {
    self.shared.pump()
  }

  /// 交付推理结果
  ///
  /// 只接受当前在途帧的结果；其余结果记录日志后丢弃，返回 `false`。
  /// 推理失败的帧以空结果交付。
  pub fn complete<E: Display>(&self, id: &FrameId, result: Result<DetectResult, E>) -> bool {
    self.shared.complete(id, result)
  }
}

impl<O> FramePipeline<O> {
  pub fn config(&self) -> PipelineConfig {
    self.shared.config
  }

  pub fn metrics(&self) -> &Arc<MetricsAggregator> {
    &self.shared.metrics
  }

  pub fn state_of(&self, id: &FrameId) -> Option<FrameState> {
    let state = self.shared.lock();
    if state.in_flight.as_ref().is_some_and(|flight| &flight.id == id) {
      Some(FrameState::Dispatched)
    } else if state.queue.iter().any(|queued| queued.frame.id() == id) {
      Some(FrameState::Queued)
    } else {
      None
    }
  }

  pub fn queued_len(&self) -> usize {
    self.shared.lock().queue.len()
  }

  /// 从旧到新
  pub fn queued_ids(&self) -> Vec<FrameId> {
    let state = self.shared.lock();
    state
      .queue
      .iter()
      .map(|queued| queued.frame.id().clone())
      .collect()
  }

  pub fn in_flight(&self) -> Option<FrameId> {
    let state = self.shared.lock();
    state.in_flight.as_ref().map(|flight| flight.id.clone())
  }

  pub fn is_closed(&self) -> bool {
    self.shared.lock().closed
  }

  pub fn stats(&self) -> PipelineStats {
    self.shared.lock().stats
  }

  /// 等待队列清空且没有在途帧，超时返回 `false`
  pub fn wait_idle(&self, timeout: Duration) -> bool {
    let state = self.shared.lock();
    let (state, _) = self
      .shared
      .idle
      .wait_timeout_while(state, timeout, |state| !state.closed && !state.is_idle())
      .unwrap_or_else(PoisonError::into_inner);
    state.is_idle()
  }

  /// 关闭流水线
  ///
  /// 丢弃排队帧并忘记在途帧，之后到达的推理结果都会被丢弃。
  /// 等待推理线程处理完手上的帧后返回。
  pub fn shutdown(&self) {
    let dropped = {
      let mut state = self.shared.lock();
      if state.closed {
        None
      } else {
        state.closed = true;
        let dropped = state.queue.len();
        state.queue.clear();
        state.stats.evicted += dropped as u64;
        state.in_flight = None;
        state.jobs = None;
        self.shared.idle.notify_all();
        Some(dropped)
      }
    };
    if let Some(dropped) = dropped {
      info!("流水线关闭, 丢弃 {} 个排队帧", dropped);
    }

    let worker = self
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(worker) = worker {
      // 在输出回调中关闭时不能等待自己
      if worker.thread().id() == thread::current().id() {
        return;
      }
      if worker.join().is_err() {
        error!("推理线程异常退出");
      }
    }
  }
}

impl<O> Drop for FramePipeline<O> {
  fn drop(&mut self) {
    self.shutdown();
  }
}
