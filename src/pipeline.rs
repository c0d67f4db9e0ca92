// 该文件是 Huanliu （环流） 项目的一部分。
// src/pipeline.rs - 环形流水线编排
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

//! 四个阶段各占一个线程，帧槽按 `free → decode → preprocess → infer → draw → free`
//! 循环流动：
//!
//! ```text
//!   ┌──────────── free ◄────────────────────────────┐
//!   ▼                                               │
//! Decode ─► decoded ─► Preprocess ─► preprocessed ─► Infer ─► inferred ─► Draw
//! ```

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  config::{ConfigError, PipelineConfig, resolution_from_shape},
  input::{FrameSource, InputError},
  labels::{LabelError, Labels},
  model::{DecodeError, DetectionDecoder, EngineError, InferenceEngine},
  output::{Draw, DrawError, FrameSink, OutputError, Record, RecordError},
  preprocess::PreprocessError,
  queue::{Abort, BoundedQueue, Packet},
  slot::{Slot, SlotError, SlotPool},
};

mod stages;

use self::stages::{DrawStage, InferStage, PreprocessStage, StageContext};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("帧槽错误: {0}")]
  Slot(#[from] SlotError),
  #[error("标签错误: {0}")]
  Label(#[from] LabelError),
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("输出解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("预处理错误: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("输入错误: {0}")]
  Input(#[from] InputError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("绘制错误: {0}")]
  Draw(#[from] DrawError),
  #[error("检测记录错误: {0}")]
  Record(#[from] RecordError),
  #[error("工作线程 {0} 异常退出")]
  WorkerPanicked(&'static str),
}

/// 阶段之间的四个队列，共用一个中止信号
pub(crate) struct Queues {
  abort: Abort,
  pub free: BoundedQueue<Packet<Slot>>,
  pub decoded: BoundedQueue<Packet<Slot>>,
  pub preprocessed: BoundedQueue<Packet<Slot>>,
  pub inferred: BoundedQueue<Packet<Slot>>,
}

impl Queues {
  pub fn new(capacity: usize) -> Self {
    let abort = Abort::new();
    Self {
      free: BoundedQueue::with_abort(capacity, &abort),
      decoded: BoundedQueue::with_abort(capacity, &abort),
      preprocessed: BoundedQueue::with_abort(capacity, &abort),
      inferred: BoundedQueue::with_abort(capacity, &abort),
      abort,
    }
  }

  /// 唤醒所有阻塞在队列上的阶段，之后的 `push` 与 `pop` 都立即失败
  pub fn halt(&self) {
    self.abort.trigger();
  }

  /// 各队列中当前排队的消息数量
  #[cfg(test)]
  pub fn lens(&self) -> [usize; 4] {
    [
      self.free.len(),
      self.decoded.len(),
      self.preprocessed.len(),
      self.inferred.len(),
    ]
  }
}

/// 一次运行结束后的队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAccounting {
  /// 运行结束时空闲队列中的槽数量
  pub free_slots: usize,
  /// 其他队列中残留的槽数量（已被归还）
  pub stranded_slots: usize,
}

/// 视频检测流水线
pub struct Pipeline<E, S, K> {
  config: PipelineConfig,
  engine: E,
  source: S,
  sink: K,
  labels: Labels,
  draw: Draw,
  records: Option<Record<BufWriter<File>>>,
  decoder: DetectionDecoder,
  pool: SlotPool,
  stop: Arc<AtomicBool>,
  frames: AtomicUsize,
  accounting: Option<SlotAccounting>,
}

impl<E, S, K> Pipeline<E, S, K>
where
  E: InferenceEngine,
  S: FrameSource,
  K: FrameSink,
{
  /// 校验配置、加载标签与模型并分配帧槽；任何错误都发生在工作线程启动之前
  pub fn new(
    mut config: PipelineConfig,
    mut engine: E,
    source: S,
    sink: K,
  ) -> Result<Self, PipelineError> {
    config.validate()?;

    let labels = Labels::load(&config.label_path)?;

    let requested = config.inference_config.input_shape();
    let resolved = engine.initialize(&config.model_path, &requested)?;
    let resolution = resolution_from_shape(&resolved)?;
    if config.inference_config.resolution == 0 {
      info!("自动检测到模型分辨率: {}", resolution);
    }
    config.inference_config.resolution = resolution;

    let pool = SlotPool::new(config.ring_buffer_size, resolution)?;
    let draw = Draw::new(config.font_path.as_deref())?;
    let records = config
      .records_path
      .as_deref()
      .map(Record::create)
      .transpose()?;
    let decoder = DetectionDecoder::from_config(&config.inference_config);

    info!(
      "流水线就绪: 后端 {}, 分辨率 {}, 帧槽 {}, 模型类型 {:?}",
      engine.backend_name(),
      resolution,
      config.ring_buffer_size,
      config.inference_config.model_type
    );

    Ok(Self {
      config,
      engine,
      source,
      sink,
      labels,
      draw,
      records,
      decoder,
      pool,
      stop: Arc::new(AtomicBool::new(false)),
      frames: AtomicUsize::new(0),
      accounting: None,
    })
  }

  /// 使用外部的停止标志（例如 Ctrl-C 处理函数设置的标志）
  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  pub fn stop_handle(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.stop)
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn resolution(&self) -> u32 {
    self.config.inference_config.resolution
  }

  pub fn frames_processed(&self) -> usize {
    self.frames.load(Ordering::Acquire)
  }

  pub fn slot_accounting(&self) -> Option<SlotAccounting> {
    self.accounting
  }

  pub fn into_parts(self) -> (E, S, K) {
    (self.engine, self.source, self.sink)
  }

  /// 运行流水线直到视频源耗尽、出现错误或停止标志被设置，返回处理的帧数
  pub fn run(&mut self) -> Result<usize, PipelineError> {
    self.frames.store(0, Ordering::Release);
    let queues = Queues::new(self.config.ring_buffer_size);
    self.pool.seed(&queues.free);

    let frame_rate = self.source.frame_rate();
    let ctx = StageContext::new(&queues, &self.stop, &self.frames);

    let resolution = self.config.inference_config.resolution;
    let preprocess = PreprocessStage {
      resolution,
      means: self.config.inference_config.means,
      stds: self.config.inference_config.stds,
    };
    let infer = InferStage::new(
      &mut self.engine,
      &self.decoder,
      self.config.inference_config.input_shape(),
      resolution,
      self.config.inference_config.is_segmentation(),
    );
    let draw = DrawStage {
      sink: &mut self.sink,
      draw: &self.draw,
      labels: &self.labels,
      records: self.records.as_mut(),
      frame_rate,
    };
    let source = &mut self.source;

    thread::scope(|s| {
      let ctx = &ctx;
      s.spawn(move || ctx.supervise("decode", |ctx| stages::decode(ctx, source)));
      s.spawn(move || ctx.supervise("preprocess", |ctx| preprocess.run(ctx)));
      s.spawn(move || ctx.supervise("infer", |ctx| infer.run(ctx)));
      s.spawn(move || ctx.supervise("draw", |ctx| draw.run(ctx)));
    });

    let result = ctx.take_error();
    self.shutdown(&queues, result)
  }

  /// 所有线程结束后的收尾：关闭输出、归还残留的帧槽并检查槽数量
  fn shutdown(
    &mut self,
    queues: &Queues,
    result: Option<PipelineError>,
  ) -> Result<usize, PipelineError> {
    let mut first_error = result;

    if let Err(e) = self.sink.finish() {
      error!("关闭输出失败: {}", e);
      first_error.get_or_insert(e.into());
    }
    if let Some(records) = self.records.as_mut()
      && let Err(e) = records.flush()
    {
      error!("写入检测记录失败: {}", e);
      first_error.get_or_insert(e.into());
    }

    let free_slots: Vec<Slot> = queues
      .free
      .drain()
      .into_iter()
      .filter_map(Packet::into_data)
      .collect();
    let stranded_slots: Vec<Slot> = [&queues.decoded, &queues.preprocessed, &queues.inferred]
      .into_iter()
      .flat_map(|queue| queue.drain())
      .filter_map(Packet::into_data)
      .collect();
    let stranded = stranded_slots.len();
    self.accounting = Some(SlotAccounting {
      free_slots: free_slots.len(),
      stranded_slots: stranded,
    });
    let recovered = self.pool.reclaim(free_slots.into_iter().chain(stranded_slots));
    if stranded > 0 {
      warn!("{} 个帧槽在中止时仍在队列中, 已归还", stranded);
    }

    let frames = self.frames_processed();
    match first_error {
      Some(e) => {
        error!("流水线异常终止: {} (已处理 {} 帧)", e, frames);
        Err(e)
      }
      None => {
        info!("流水线完成: 处理 {} 帧, 收回 {} 个帧槽", frames, recovered);
        Ok(frames)
      }
    }
  }
}
