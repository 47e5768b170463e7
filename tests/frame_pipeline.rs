// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/frame_pipeline.rs - 帧流水线
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
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc::{self, Receiver},
  },
  thread,
  time::Duration,
};

use shanan_live::{
  frame::{Frame, FrameId, FrameMeta},
  metrics::MetricsAggregator,
  model::{DetectResult, Model, YoloDetectorBuilder, replay::ReplayInference},
  output::{ChannelOutput, DetectionMessage, OutputError, Render},
  pipeline::{DispatchOutcome, FramePipeline, PipelineConfig},
  timestamp_ms,
};

/// 按帧内容决定成功或失败，并记录并发推理数的峰值
#[derive(Clone, Default)]
struct ScriptedModel {
  delay: Duration,
  active: Arc<AtomicUsize>,
  peak: Arc<AtomicUsize>,
}

impl Model for ScriptedModel {
  type Input = Frame;
  type Output = DetectResult;
  type Error = String;

  fn infer(&self, frame: &Frame) -> Result<DetectResult, String> {
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    thread::sleep(self.delay);
    self.active.fetch_sub(1, Ordering::SeqCst);

    if frame.payload().first() == Some(&0xff) {
      Err("设备超时".to_string())
    } else {
      Ok(DetectResult::empty())
    }
  }
}

fn frame(id: u64) -> Frame {
  Frame::new(id, timestamp_ms(), vec![0], 1, 1)
}

fn spawn(
  config: PipelineConfig,
  model: ScriptedModel,
) -> (FramePipeline<ChannelOutput>, Receiver<DetectionMessage>) {
  let (tx, rx) = mpsc::channel();
  let pipeline = FramePipeline::spawn(
    config,
    model,
    ChannelOutput::new(tx),
    Arc::new(MetricsAggregator::new()),
  )
  .unwrap();
  (pipeline, rx)
}

#[test]
fn oldest_frame_is_evicted_first() {
  let (pipeline, _rx) = spawn(
    PipelineConfig::default().with_auto_dispatch(false),
    ScriptedModel::default(),
  );

  for id in 1..=3 {
    assert_eq!(pipeline.submit(frame(id)).unwrap(), None);
  }
  assert_eq!(pipeline.submit(frame(4)).unwrap(), Some(FrameId::from(1u64)));
  assert_eq!(
    pipeline.queued_ids(),
    vec![FrameId::from(2u64), FrameId::from(3u64), FrameId::from(4u64)]
  );
  assert_eq!(pipeline.state_of(&FrameId::from(1u64)), None);
  assert_eq!(pipeline.stats().evicted, 1);
}

#[test]
fn queue_never_exceeds_capacity() {
  let (pipeline, _rx) = spawn(
    PipelineConfig::default()
      .with_queue_capacity(5)
      .with_auto_dispatch(false),
    ScriptedModel::default(),
  );

  for id in 0..100 {
    pipeline.submit(frame(id)).unwrap();
    assert!(pipeline.queued_len() <= 5);
  }
  assert_eq!(pipeline.stats().evicted, 95);
  assert_eq!(pipeline.queued_ids().first(), Some(&FrameId::from(95u64)));
}

#[test]
fn second_dispatch_waits_for_completion() {
  let model = ScriptedModel {
    delay: Duration::from_millis(100),
    ..Default::default()
  };
  let (pipeline, rx) = spawn(PipelineConfig::default().with_auto_dispatch(false), model);

  pipeline.submit(frame(1)).unwrap();
  pipeline.submit(frame(2)).unwrap();
  assert_eq!(
    pipeline.dispatch().unwrap(),
    DispatchOutcome::Dispatched(FrameId::from(1u64))
  );
  assert_eq!(pipeline.dispatch().unwrap(), DispatchOutcome::Busy);
  assert_eq!(pipeline.in_flight(), Some(FrameId::from(1u64)));

  let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(first.frame_id, FrameId::from(1u64));
}

#[test]
fn burst_runs_one_inference_at_a_time() {
  let model = ScriptedModel {
    delay: Duration::from_millis(5),
    ..Default::default()
  };
  let peak = Arc::clone(&model.peak);
  let (pipeline, rx) = spawn(PipelineConfig::default(), model);

  let pipeline = Arc::new(pipeline);
  let handle = Arc::clone(&pipeline);
  thread::spawn(move || {
    for id in 0..50 {
      handle.submit(frame(id)).unwrap();
      assert!(handle.queued_len() <= 3);
    }
  })
  .join()
  .unwrap();
  assert!(pipeline.wait_idle(Duration::from_secs(10)));

  let stats = pipeline.stats();
  assert_eq!(peak.load(Ordering::SeqCst), 1);
  assert_eq!(stats.submitted, 50);
  assert_eq!(stats.evicted + stats.completed, 50);

  // 交付顺序与提交顺序一致
  let delivered: Vec<u64> = rx
    .try_iter()
    .map(|message| message.frame_id.as_str().parse().unwrap())
    .collect();
  assert_eq!(delivered.len() as u64, stats.completed);
  assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
  assert_eq!(pipeline.metrics().snapshot().total_frames, stats.completed);
}

#[test]
fn failed_inference_delivers_empty_result() {
  let (pipeline, rx) = spawn(PipelineConfig::default(), ScriptedModel::default());

  pipeline
    .submit(Frame::new("bad", timestamp_ms(), vec![0xff], 1, 1))
    .unwrap();
  let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(message.frame_id.as_str(), "bad");
  assert!(message.detections.is_empty());

  pipeline.submit(frame(2)).unwrap();
  let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(message.frame_id.as_str(), "2");

  assert!(pipeline.wait_idle(Duration::from_secs(5)));
  let stats = pipeline.stats();
  assert_eq!(stats.completed, 2);
  assert_eq!(stats.failed, 1);
}

#[test]
fn result_after_shutdown_is_discarded() {
  let model = ScriptedModel {
    delay: Duration::from_millis(200),
    ..Default::default()
  };
  let (pipeline, rx) = spawn(PipelineConfig::default(), model);

  pipeline.submit(frame(1)).unwrap();
  assert_eq!(pipeline.in_flight(), Some(FrameId::from(1u64)));
  pipeline.shutdown();

  let stats = pipeline.stats();
  assert_eq!(stats.discarded, 1);
  assert_eq!(stats.completed, 0);
  assert!(rx.try_recv().is_err());
  assert!(!pipeline.complete(&FrameId::from(1u64), Ok::<_, String>(DetectResult::empty())));
}

#[test]
fn yolo_detector_drives_the_pipeline() {
  let detector = YoloDetectorBuilder::default()
    .vocabulary(shanan_live::model::Vocabulary::new(["person", "car"]))
    .resolution(640)
    .build(ReplayInference::synthetic(2))
    .unwrap();
  let (tx, rx) = mpsc::channel();
  let metrics = Arc::new(MetricsAggregator::new());
  let pipeline = FramePipeline::spawn(
    PipelineConfig::default(),
    detector,
    ChannelOutput::new(tx),
    Arc::clone(&metrics),
  )
  .unwrap();

  pipeline
    .submit(Frame::new("cam-0", timestamp_ms(), vec![0; 640 * 640 * 3], 640, 640))
    .unwrap();
  let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(message.detections.len(), 1);
  assert!(message.inference_ts >= message.recv_ts);
  assert!(message.recv_ts >= message.capture_ts);

  // 尺寸不对的帧以空结果交付
  pipeline
    .submit(Frame::new("cam-1", timestamp_ms(), vec![0; 12], 2, 2))
    .unwrap();
  let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert!(message.detections.is_empty());

  assert!(pipeline.wait_idle(Duration::from_secs(5)));
  assert_eq!(pipeline.stats().failed, 1);
  assert_eq!(metrics.snapshot().total_frames, 2);
}

/// 第一帧输出时 panic，之后的帧照常转发
struct FragileOutput {
  inner: ChannelOutput,
}

impl Render<FrameMeta, DetectResult> for FragileOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &FrameMeta, result: &DetectResult) -> Result<(), OutputError> {
    if frame.id.as_str() == "a" {
      panic!("渲染端崩溃");
    }
    self.inner.render_result(frame, result)
  }
}

#[test]
fn renderer_panic_does_not_stall_the_pipeline() {
  let (tx, rx) = mpsc::channel();
  let pipeline = FramePipeline::spawn(
    PipelineConfig::default(),
    ScriptedModel::default(),
    FragileOutput {
      inner: ChannelOutput::new(tx),
    },
    Arc::new(MetricsAggregator::new()),
  )
  .unwrap();

  pipeline
    .submit(Frame::new("a", timestamp_ms(), vec![0], 1, 1))
    .unwrap();
  assert!(pipeline.wait_idle(Duration::from_secs(5)));
  assert_eq!(pipeline.in_flight(), None);

  pipeline
    .submit(Frame::new("b", timestamp_ms(), vec![0], 1, 1))
    .unwrap();
  let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(message.frame_id.as_str(), "b");

  assert!(pipeline.wait_idle(Duration::from_secs(5)));
  assert_eq!(pipeline.stats().completed, 2);
}
