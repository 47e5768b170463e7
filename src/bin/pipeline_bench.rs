// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/pipeline_bench.rs - 流水线压测
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

use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use url::Url;

use shanan_live::{
  FromUrl,
  frame::Frame,
  metrics::MetricsAggregator,
  model::{RawOutputTensor, YoloDetectorBuilder, replay::ReplayInference},
  output::OutputWrapper,
  pipeline::DEFAULT_QUEUE_CAPACITY,
  task::{ContinuousTask, OneShotTask, RepeatShotTask, Task},
  timestamp_ms,
};
use tracing::info;

/// 运行方式
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
  /// 经由帧流水线持续处理
  Continuous,
  /// 只处理第一帧
  Oneshot,
  /// 对第一帧重复推理，统计平均耗时
  Repeat,
}

/// 以固定帧率向流水线送入合成帧，推理由回放张量模拟
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测器配置
  #[arg(long, value_name = "MODEL", default_value = "yolo:///")]
  pub model: Url,
  /// 回放的输出张量转储，缺省时使用内置的合成输出
  #[arg(long, value_name = "FILE")]
  pub tensor: Option<PathBuf>,
  /// 回放张量形状，逗号分隔
  #[arg(long, value_name = "SHAPE", value_delimiter = ',')]
  pub shape: Option<Vec<usize>>,
  /// 输出路径: stdout://, jsonl:///path, log://
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 运行方式
  #[arg(long, value_enum, default_value_t = Mode::Continuous)]
  pub mode: Mode,
  /// repeat 方式下的推理次数
  #[arg(long, default_value = "1000")]
  pub times: usize,
  /// 总帧数
  #[arg(long, default_value = "100")]
  pub frames: usize,
  /// 采集帧率
  #[arg(long, default_value = "30")]
  pub fps: u32,
  /// 模拟推理耗时（毫秒）
  #[arg(long, default_value = "50")]
  pub latency_ms: u64,
  /// 排队帧上限
  #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
  pub queue_capacity: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测器配置: {}", args.model);
  info!("输出路径: {}", args.output);

  let builder = YoloDetectorBuilder::from_url(&args.model)?;
  let num_classes = builder.clone().build_postprocess()?.decoder().num_classes();
  let resolution = builder.canonical_resolution();

  let inference = match &args.tensor {
    Some(path) => {
      let shape = args.shape.clone().unwrap_or_default();
      let tensor = RawOutputTensor::read_f32_le(path, shape)?;
      let tensor = if tensor.shape().is_empty() {
        RawOutputTensor::flat(tensor.data().to_vec())
      } else {
        tensor
      };
      ReplayInference::new(tensor)
    }
    None => ReplayInference::synthetic(num_classes),
  }
  .with_latency(Duration::from_millis(args.latency_ms));

  let model = builder.build(inference)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let interval = Duration::from_secs_f64(1.0 / f64::from(args.fps.max(1)));
  let pixels = (resolution as usize) * (resolution as usize) * 3;
  let frames = (0..args.frames as u64).map(move |i| {
    thread::sleep(interval);
    Frame::new(i, timestamp_ms(), vec![0; pixels], resolution, resolution)
  });

  match args.mode {
    Mode::Oneshot => OneShotTask.run_task(frames, model, output)?,
    Mode::Repeat => RepeatShotTask::default()
      .with_times(args.times)
      .run_task(frames, model, output)?,
    Mode::Continuous => {
      let metrics = Arc::new(MetricsAggregator::new());
      ContinuousTask::default()
        .with_queue_capacity(args.queue_capacity)
        .with_metrics(Arc::clone(&metrics))
        .run_task(frames, model, output)?;

      println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }
  }

  Ok(())
}
