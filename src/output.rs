// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
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
  fs::File,
  io::{self, BufWriter, Write},
  path::Path,
  sync::{Mutex, PoisonError, mpsc::Sender},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FrameId, FrameMeta},
  model::DetectResult,
};

pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] io::Error),
  #[error("JSON 序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("结果接收端已关闭")]
  ChannelClosed,
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 一帧的检测结果消息，交给传输端转发
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionMessage {
  pub frame_id: FrameId,
  pub capture_ts: u64,
  pub recv_ts: u64,
  pub inference_ts: u64,
  pub detections: DetectResult,
}

impl DetectionMessage {
  pub fn new(meta: &FrameMeta, result: &DetectResult) -> Self {
    Self {
      frame_id: meta.id.clone(),
      capture_ts: meta.capture_ts,
      recv_ts: meta.recv_ts,
      inference_ts: meta.inference_ts,
      detections: result.clone(),
    }
  }
}

/// 每帧一行 JSON
pub struct JsonLinesOutput<W: Write + Send> {
  writer: Mutex<W>,
}

pub type StdoutOutput = JsonLinesOutput<io::Stdout>;
pub type JsonFileOutput = JsonLinesOutput<BufWriter<File>>;

impl<W: Write + Send> JsonLinesOutput<W> {
  pub fn new(writer: W) -> Self {
    Self {
      writer: Mutex::new(writer),
    }
  }

  pub fn into_inner(self) -> W {
    self
      .writer
      .into_inner()
      .unwrap_or_else(PoisonError::into_inner)
  }
}

impl<W: Write + Send> Render<FrameMeta, DetectResult> for JsonLinesOutput<W> {
  type Error = OutputError;

  fn render_result(&self, frame: &FrameMeta, result: &DetectResult) -> Result<(), Self::Error> {
    let message = DetectionMessage::new(frame, result);
    let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    serde_json::to_writer(&mut *writer, &message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}

impl FromUrlWithScheme for StdoutOutput {
  const SCHEME: &'static str = "stdout";
}

impl FromUrl for StdoutOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(scheme_mismatch(Self::SCHEME, uri));
    }
    Ok(JsonLinesOutput::new(io::stdout()))
  }
}

impl FromUrlWithScheme for JsonFileOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonFileOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(scheme_mismatch(Self::SCHEME, uri));
    }

    let path = urlencoding::decode(uri.path())
      .map_err(|e| OutputError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let path = Path::new(&*path);
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    info!("检测结果写入文件: {}", path.display());
    Ok(JsonLinesOutput::new(BufWriter::new(File::create(path)?)))
  }
}

/// 以日志形式输出检测结果
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOutput;

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(scheme_mismatch(Self::SCHEME, uri));
    }
    Ok(LogOutput)
  }
}

impl Render<FrameMeta, DetectResult> for LogOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &FrameMeta, result: &DetectResult) -> Result<(), Self::Error> {
    info!(
      "帧 {} 检测到 {} 个物体, 端到端延迟 {} ms",
      frame.id,
      result.len(),
      frame.inference_ts.saturating_sub(frame.capture_ts)
    );
    for det in result.iter() {
      debug!(
        "  {} {:.2} [{:.3}, {:.3}, {:.3}, {:.3}]",
        det.label, det.score, det.bbox.xmin, det.bbox.ymin, det.bbox.xmax, det.bbox.ymax
      );
    }
    Ok(())
  }
}

/// 把结果消息送入通道，供同进程的传输端消费
#[derive(Debug, Clone)]
pub struct ChannelOutput {
  sender: Sender<DetectionMessage>,
}

impl ChannelOutput {
  pub fn new(sender: Sender<DetectionMessage>) -> Self {
    Self { sender }
  }
}

impl Render<FrameMeta, DetectResult> for ChannelOutput {
  type Error = OutputError;

  fn render_result(&self, frame: &FrameMeta, result: &DetectResult) -> Result<(), Self::Error> {
    self
      .sender
      .send(DetectionMessage::new(frame, result))
      .map_err(|_| OutputError::ChannelClosed)
  }
}

pub enum OutputWrapper {
  Stdout(StdoutOutput),
  JsonFile(JsonFileOutput),
  Log(LogOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      StdoutOutput::SCHEME => Ok(OutputWrapper::Stdout(StdoutOutput::from_url(url)?)),
      JsonFileOutput::SCHEME => Ok(OutputWrapper::JsonFile(JsonFileOutput::from_url(url)?)),
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      other => Err(OutputError::SchemeMismatch(format!(
        "不支持的输出方式 '{}'",
        other
      ))),
    }
  }
}

impl Render<FrameMeta, DetectResult> for OutputWrapper {
  type Error = OutputError;

  fn render_result(&self, frame: &FrameMeta, result: &DetectResult) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Stdout(output) => output.render_result(frame, result),
      OutputWrapper::JsonFile(output) => output.render_result(frame, result),
      OutputWrapper::Log(output) => output.render_result(frame, result),
    }
  }
}

fn scheme_mismatch(expected: &str, uri: &Url) -> OutputError {
  OutputError::SchemeMismatch(format!(
    "期望输出方式 '{}', 实际输出方式 '{}'",
    expected,
    uri.scheme()
  ))
}
