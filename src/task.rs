// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 检测任务
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
    atomic::{AtomicBool, Ordering},
  },
  time::{Duration, Instant},
};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::Frame,
  input::InputError,
  model::{Detection, DetectionConfig, Detector, ModelError, round_to},
};

pub trait Task<I, M: ?Sized>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: &M) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("no input frame")]
  NoFrame,
  #[error(transparent)]
  Input(#[from] InputError),
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error("cancelled after {processed} frames")]
  Cancelled { processed: usize },
}

/// 协作式取消标志，在帧与帧之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// 守卫被丢弃时取消任务，除非已调用 [`CancelOnDrop::disarm`]
  pub fn guard(&self) -> CancelOnDrop {
    CancelOnDrop {
      flag: Some(self.clone()),
    }
  }
}

pub struct CancelOnDrop {
  flag: Option<CancelFlag>,
}

impl CancelOnDrop {
  pub fn disarm(mut self) {
    self.flag = None;
  }
}

impl Drop for CancelOnDrop {
  fn drop(&mut self) {
    if let Some(flag) = self.flag.take() {
      debug!("请求已被丢弃，取消任务");
      flag.cancel();
    }
  }
}

/// 一个采样帧的检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSample {
  #[serde(rename = "time_sec", serialize_with = "serialize_timestamp")]
  pub timestamp_sec: f64,
  pub detections: Vec<Detection>,
}

impl FrameSample {
  pub fn new(timestamp_sec: f64, detections: Vec<Detection>) -> Self {
    Self {
      timestamp_sec: round_to(timestamp_sec, 2),
      detections,
    }
  }
}

fn serialize_timestamp<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_f64(round_to(*value, 2))
}

/// 按时间戳升序排列的整段视频检测结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoAnalysisResult {
  pub frames: Vec<FrameSample>,
}

/// 单帧任务：取出唯一一帧并检测
#[derive(Debug, Default, Clone, Copy)]
pub struct OneShotTask {
  config: DetectionConfig,
}

impl OneShotTask {
  pub fn new(config: DetectionConfig) -> Self {
    Self { config }
  }
}

impl<I, M> Task<I, M> for OneShotTask
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Detector + ?Sized,
{
  type Output = (Frame, Vec<Detection>);
  type Error = TaskError;

  fn run_task(self, mut input: I, model: &M) -> Result<Self::Output, Self::Error> {
    let frame = input.next().ok_or(TaskError::NoFrame)??;
    drop(input);

    let now = Instant::now();
    let detections = model.detect(&frame.image, &self.config)?;
    info!(
      "推理完成，耗时: {:.2?}，检测到 {} 个物体",
      now.elapsed(),
      detections.len()
    );
    Ok((frame, detections))
  }
}

/// 视频采样任务：对帧来源产生的每一帧依次检测
///
/// 无论成功、失败还是取消，返回前都会释放帧来源。
#[derive(Debug, Clone, Default)]
pub struct SamplingTask {
  config: DetectionConfig,
  cancel: CancelFlag,
}

impl SamplingTask {
  pub fn new(config: DetectionConfig) -> Self {
    Self {
      config,
      cancel: CancelFlag::new(),
    }
  }

  pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }
}

impl<I, M> Task<I, M> for SamplingTask
where
  I: Iterator<Item = Result<Frame, InputError>>,
  M: Detector + ?Sized,
{
  type Output = VideoAnalysisResult;
  type Error = TaskError;

  fn run_task(self, mut input: I, model: &M) -> Result<Self::Output, Self::Error> {
    info!("开始视频采样任务...");
    let started = Instant::now();
    let mut inference = Duration::ZERO;
    let mut frames = Vec::new();

    let outcome = loop {
      if self.cancel.is_cancelled() {
        warn!("任务已取消，已处理 {} 帧", frames.len());
        break Err(TaskError::Cancelled {
          processed: frames.len(),
        });
      }

      let frame = match input.next() {
        None => break Ok(()),
        Some(Err(e)) => break Err(TaskError::from(e)),
        Some(Ok(frame)) => frame,
      };

      let now = Instant::now();
      match model.detect(&frame.image, &self.config) {
        Ok(detections) => {
          let elapsed = now.elapsed();
          inference += elapsed;
          debug!(
            "第 {} 帧 ({:.2}s) 推理完成，耗时: {:.2?}，检测到 {} 个物体",
            frame.index,
            frame.timestamp_sec,
            elapsed,
            detections.len()
          );
          frames.push(FrameSample::new(frame.timestamp_sec, detections));
        }
        Err(e) => break Err(TaskError::from(e)),
      }
    };

    drop(input);

    match &outcome {
      Ok(()) => info!(
        "任务完成，共 {} 帧，总耗时: {:.2?}，推理耗时: {:.2?}",
        frames.len(),
        started.elapsed(),
        inference
      ),
      Err(e) => warn!("任务失败: {}", e),
    }

    outcome.map(|()| VideoAnalysisResult { frames })
  }
}
