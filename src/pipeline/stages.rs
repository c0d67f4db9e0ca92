// 该文件是 Huanliu （环流） 项目的一部分。
// src/pipeline/stages.rs - 流水线各阶段
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

use std::fs::File;
use std::io::BufWriter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, error, info, warn};

use crate::{
  input::FrameSource,
  labels::Labels,
  model::{DecodeError, DetectionDecoder, InferenceEngine, OutputTensor, split_box_logits},
  output::{Draw, FrameSink, Record},
  pipeline::{PipelineError, Queues},
  preprocess::preprocess_frame,
  queue::{BoundedQueue, Packet},
  slot::Slot,
};

/// 各阶段共享的状态：队列、停止标志、帧计数和第一个错误
pub(crate) struct StageContext<'a> {
  queues: &'a Queues,
  stop: &'a AtomicBool,
  frames: &'a AtomicUsize,
  error: Mutex<Option<PipelineError>>,
}

impl<'a> StageContext<'a> {
  pub fn new(queues: &'a Queues, stop: &'a AtomicBool, frames: &'a AtomicUsize) -> Self {
    Self {
      queues,
      stop,
      frames,
      error: Mutex::new(None),
    }
  }

  /// 记录错误（只保留第一个）并让所有阶段退出
  pub fn fail(&self, err: PipelineError) {
    {
      let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
      if slot.is_none() {
        error!("流水线错误: {}", err);
        *slot = Some(err);
      } else {
        debug!("忽略后续错误: {}", err);
      }
    }
    self.queues.halt();
  }

  pub fn halt(&self) {
    self.queues.halt();
  }

  pub fn take_error(&self) -> Option<PipelineError> {
    self
      .error
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .take()
  }

  /// 运行一个阶段；错误和 panic 都会触发中止
  pub fn supervise<F>(&self, name: &'static str, stage: F)
  where
    F: FnOnce(&Self) -> Result<(), PipelineError>,
  {
    debug!("{} 阶段启动", name);
    match panic::catch_unwind(AssertUnwindSafe(|| stage(self))) {
      Ok(Ok(())) => {}
      Ok(Err(e)) => self.fail(e),
      Err(_) => self.fail(PipelineError::WorkerPanicked(name)),
    }
    debug!("{} 阶段退出", name);
  }

  /// 空闲队列容量等于槽数量，归还不会阻塞
  fn return_slot(&self, slot: Slot) {
    if let Err(packet) = self.queues.free.try_push(Packet::Data(slot)) {
      warn!("空闲队列已满, 丢弃帧槽 {:?}", packet.into_data().map(|s| s.index));
    }
  }

  /// 把槽交给下游；流水线中止时槽改为归还空闲队列并返回 `false`
  fn forward(&self, output: &BoundedQueue<Packet<Slot>>, slot: Slot) -> bool {
    match output.push(Packet::Data(slot)) {
      Ok(()) => true,
      Err(packet) => {
        if let Some(slot) = packet.into_data() {
          self.return_slot(slot);
        }
        false
      }
    }
  }

  /// 中间阶段的通用循环：处理一个槽并转发，收到关闭标记时向下游转发后退出
  fn relay<F>(
    &self,
    input: &BoundedQueue<Packet<Slot>>,
    output: &BoundedQueue<Packet<Slot>>,
    mut process: F,
  ) -> Result<(), PipelineError>
  where
    F: FnMut(&mut Slot) -> Result<(), PipelineError>,
  {
    loop {
      let mut slot = match input.pop() {
        Some(Packet::Data(slot)) => slot,
        Some(Packet::Shutdown) => {
          let _ = output.push(Packet::Shutdown);
          return Ok(());
        }
        None => return Ok(()),
      };
      if let Err(e) = process(&mut slot) {
        self.return_slot(slot);
        return Err(e);
      }
      if !self.forward(output, slot) {
        return Ok(());
      }
    }
  }
}

/// 解码阶段：唯一会发起正常关闭的阶段
pub(crate) fn decode<S: FrameSource + ?Sized>(
  ctx: &StageContext<'_>,
  source: &mut S,
) -> Result<(), PipelineError> {
  let mut frame_number = 0u64;
  loop {
    let Some(Packet::Data(mut slot)) = ctx.queues.free.pop() else {
      return Ok(());
    };

    match source.read_into(&mut slot.frame) {
      Ok(true) => {
        slot.orig_w = slot.frame.width();
        slot.orig_h = slot.frame.height();
        slot.frame_number = frame_number;
        frame_number += 1;
        if !ctx.forward(&ctx.queues.decoded, slot) {
          return Ok(());
        }
      }
      Ok(false) => {
        info!("视频源已耗尽, 共读取 {} 帧", frame_number);
        ctx.return_slot(slot);
        let _ = ctx.queues.decoded.push(Packet::Shutdown);
        return Ok(());
      }
      Err(e) => {
        ctx.return_slot(slot);
        return Err(e.into());
      }
    }
  }
}

pub(crate) struct PreprocessStage {
  pub resolution: u32,
  pub means: [f32; 3],
  pub stds: [f32; 3],
}

impl PreprocessStage {
  pub fn run(self, ctx: &StageContext<'_>) -> Result<(), PipelineError> {
    ctx.relay(&ctx.queues.decoded, &ctx.queues.preprocessed, |slot| {
      preprocess_frame(
        &slot.frame,
        &mut slot.tensor,
        self.resolution,
        &self.means,
        &self.stds,
      )?;
      Ok(())
    })
  }
}

pub(crate) struct InferStage<'a, E: ?Sized> {
  engine: &'a mut E,
  decoder: &'a DetectionDecoder,
  input_shape: Vec<i64>,
  resolution: f32,
  segmentation: bool,
  outputs: [OutputTensor; 3],
}

impl<'a, E: InferenceEngine + ?Sized> InferStage<'a, E> {
  pub fn new(
    engine: &'a mut E,
    decoder: &'a DetectionDecoder,
    input_shape: Vec<i64>,
    resolution: u32,
    segmentation: bool,
  ) -> Self {
    Self {
      engine,
      decoder,
      input_shape,
      resolution: resolution as f32,
      segmentation,
      outputs: Default::default(),
    }
  }

  fn infer(&mut self, slot: &mut Slot) -> Result<(), PipelineError> {
    // 推理失败时槽里不能残留上一帧的检测结果
    slot.detections.clear();
    self.engine.run_inference(&slot.tensor, &self.input_shape)?;

    let needed = if self.segmentation { 3 } else { 2 };
    let count = self.engine.output_count();
    if count < needed {
      return Err(
        DecodeError::MissingOutputs {
          expected: needed,
          actual: count,
        }
        .into(),
      );
    }
    for (index, output) in self.outputs.iter_mut().enumerate().take(needed) {
      output.fetch(&*self.engine, index)?;
    }

    let (boxes, logits) = split_box_logits(self.outputs[0].view(), self.outputs[1].view());
    let scale_w = slot.orig_w as f32 / self.resolution;
    let scale_h = slot.orig_h as f32 / self.resolution;
    if self.segmentation {
      self.decoder.decode_segmentation(
        boxes,
        logits,
        self.outputs[2].view(),
        scale_w,
        scale_h,
        slot.orig_w,
        slot.orig_h,
        &mut slot.detections,
      )?;
    } else {
      self
        .decoder
        .decode(boxes, logits, scale_w, scale_h, &mut slot.detections)?;
    }
    Ok(())
  }

  pub fn run(mut self, ctx: &StageContext<'_>) -> Result<(), PipelineError> {
    ctx.relay(&ctx.queues.preprocessed, &ctx.queues.inferred, |slot| {
      self.infer(slot)
    })
  }
}

pub(crate) struct DrawStage<'a, K: ?Sized> {
  pub sink: &'a mut K,
  pub draw: &'a Draw,
  pub labels: &'a Labels,
  pub records: Option<&'a mut Record<BufWriter<File>>>,
  pub frame_rate: f64,
}

impl<K: FrameSink + ?Sized> DrawStage<'_, K> {
  fn render(&mut self, slot: &mut Slot, opened: &mut bool) -> Result<(), PipelineError> {
    if !*opened {
      self.sink.open(
        slot.frame.width(),
        slot.frame.height(),
        slot.frame.order(),
        self.frame_rate,
      )?;
      *opened = true;
    }

    self
      .draw
      .draw_detections(&mut slot.frame, &slot.detections, self.labels);
    self.sink.write_frame(&slot.frame)?;

    if let Some(records) = self.records.as_mut() {
      records.record(
        slot.frame_number,
        slot.orig_w,
        slot.orig_h,
        &slot.detections,
        self.labels,
      )?;
    }
    Ok(())
  }

  /// 绘制并写出帧，然后把槽还给空闲队列
  pub fn run(mut self, ctx: &StageContext<'_>) -> Result<(), PipelineError> {
    let mut opened = false;
    loop {
      let Some(Packet::Data(mut slot)) = ctx.queues.inferred.pop() else {
        return Ok(());
      };

      let result = self.render(&mut slot, &mut opened);
      let frame_number = slot.frame_number;
      ctx.return_slot(slot);
      result?;

      let total = ctx.frames.fetch_add(1, Ordering::AcqRel) + 1;
      debug!("帧 {} 已写出 (共 {} 帧)", frame_number, total);

      if ctx.stop.load(Ordering::Acquire) {
        info!("收到停止信号, 提前结束");
        ctx.halt();
        return Ok(());
      }
    }
  }
}
