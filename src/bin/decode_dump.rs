// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/decode_dump.rs - 解码模型输出转储
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_live::{
  FromUrl,
  model::{DetectResult, RawOutputTensor, YoloDetectorBuilder},
};
use tracing::info;

/// 解码一份模型输出张量转储，打印抑制后的检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测器配置，例如 yolo:///?classes=80&layout=auto
  #[arg(long, value_name = "MODEL", default_value = "yolo:///")]
  pub model: Url,
  /// 小端 f32 原始转储文件
  #[arg(long, value_name = "FILE")]
  pub tensor: PathBuf,
  /// 张量形状，逗号分隔；缺省时按一维处理
  #[arg(long, value_name = "SHAPE", value_delimiter = ',')]
  pub shape: Option<Vec<usize>>,
  /// 同时输出抑制前的候选
  #[arg(long)]
  pub raw: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测器配置: {}", args.model);
  info!("张量文件: {}", args.tensor.display());

  let postprocess = YoloDetectorBuilder::from_url(&args.model)?.build_postprocess()?;
  let tensor = match args.shape {
    Some(shape) => RawOutputTensor::read_f32_le(&args.tensor, shape)?,
    None => {
      let flat = RawOutputTensor::read_f32_le(&args.tensor, vec![])?;
      RawOutputTensor::flat(flat.data().to_vec())
    }
  };
  info!("张量形状: {:?}", tensor.shape());

  if args.raw {
    let candidates = DetectResult::from(postprocess.decoder().decode(&tensor)?);
    println!("{}", serde_json::to_string_pretty(&candidates)?);
  }

  let result = postprocess.run(&tensor)?;
  info!("保留 {} 个检测结果", result.len());
  println!("{}", serde_json::to_string_pretty(&result)?);

  Ok(())
}
