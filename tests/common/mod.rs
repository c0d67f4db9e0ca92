// 该文件是 Huanliu （环流） 项目的一部分。
// tests/common/mod.rs - 流水线测试用的模拟组件
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbImage;
use tempfile::TempDir;
use url::Url;

use huanliu::{
  InferenceConfig, ModelType, PipelineConfig,
  frame::{PixelOrder, RawFrame},
  input::{FrameSource, InputError},
  model::{EngineError, InferenceEngine},
  output::{FrameSink, OutputError},
};

pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;
pub const FRAME_RATE: f64 = 25.0;
pub const NATIVE_RESOLUTION: i64 = 32;
pub const LABELS: &str = "person\nbicycle\ncar\n";
/// 背景列加五个类别，分类输出与 `[1, D, 4]` 的边框输出形状不同
pub const NUM_CLASSES: usize = 6;
pub const NUM_DETECTIONS: usize = 5;
pub const MASK_SIZE: usize = 4;

/// 每帧在第 0 个候选上给出一个 `person` 检测，位于画面中央
pub struct MockEngine {
  segmentation: bool,
  swapped: bool,
  output_count: Option<usize>,
  fail_after: Option<usize>,
  panic_after: Option<usize>,
  calls: usize,
  outputs: Vec<(Vec<i64>, Vec<f32>)>,
}

impl MockEngine {
  pub fn detection() -> Self {
    Self {
      segmentation: false,
      swapped: false,
      output_count: None,
      fail_after: None,
      panic_after: None,
      calls: 0,
      outputs: Vec::new(),
    }
  }

  pub fn segmentation() -> Self {
    Self {
      segmentation: true,
      ..Self::detection()
    }
  }

  /// 以 `logits, boxes` 的顺序给出输出
  pub fn swapped(mut self) -> Self {
    self.swapped = true;
    self
  }

  /// 只报告前 `count` 个输出
  pub fn with_output_count(mut self, count: usize) -> Self {
    self.output_count = Some(count);
    self
  }

  /// 前 `calls` 次推理成功，之后返回错误
  pub fn failing_after(mut self, calls: usize) -> Self {
    self.fail_after = Some(calls);
    self
  }

  pub fn panicking_after(mut self, calls: usize) -> Self {
    self.panic_after = Some(calls);
    self
  }

  fn build_outputs(&mut self) {
    let boxes: Vec<f32> = (0..NUM_DETECTIONS)
      .flat_map(|_| [0.5, 0.5, 0.5, 0.5])
      .collect();
    let mut logits = vec![-5.0; NUM_DETECTIONS * NUM_CLASSES];
    logits[1] = 5.0;

    let boxes = (vec![1, NUM_DETECTIONS as i64, 4], boxes);
    let logits = (vec![1, NUM_DETECTIONS as i64, NUM_CLASSES as i64], logits);
    self.outputs = if self.swapped {
      vec![logits, boxes]
    } else {
      vec![boxes, logits]
    };

    if self.segmentation {
      let plane = MASK_SIZE * MASK_SIZE;
      let mut masks = vec![-1.0; NUM_DETECTIONS * plane];
      // 第 0 个候选的掩码只覆盖中央 2x2
      for y in 1..3 {
        for x in 1..3 {
          masks[y * MASK_SIZE + x] = 1.0;
        }
      }
      self.outputs.push((
        vec![1, NUM_DETECTIONS as i64, MASK_SIZE as i64, MASK_SIZE as i64],
        masks,
      ));
    }
  }

  fn output(&self, index: usize) -> Result<&(Vec<i64>, Vec<f32>), EngineError> {
    if index >= self.output_count() {
      return Err(EngineError::OutputIndexOutOfRange {
        index,
        count: self.output_count(),
      });
    }
    Ok(&self.outputs[index])
  }
}

impl InferenceEngine for MockEngine {
  fn initialize(&mut self, _: &Path, input_shape: &[i64]) -> Result<Vec<i64>, EngineError> {
    let mut shape = input_shape.to_vec();
    for dim in shape.iter_mut().skip(2) {
      if *dim == 0 {
        *dim = NATIVE_RESOLUTION;
      }
    }
    Ok(shape)
  }

  fn run_inference(&mut self, input: &[f32], input_shape: &[i64]) -> Result<(), EngineError> {
    let expected = input_shape.iter().product::<i64>() as usize;
    if input.len() != expected {
      return Err(EngineError::SizeMismatch {
        expected,
        actual: input.len(),
      });
    }
    self.calls += 1;
    if self.fail_after.is_some_and(|n| self.calls > n) {
      return Err(EngineError::Backend("模拟推理失败".to_string()));
    }
    if self.panic_after.is_some_and(|n| self.calls > n) {
      panic!("模拟推理崩溃");
    }
    self.build_outputs();
    Ok(())
  }

  fn output_count(&self) -> usize {
    self
      .output_count
      .unwrap_or(self.outputs.len())
      .min(self.outputs.len())
  }

  fn get_output_data(&self, index: usize, dst: &mut [f32]) -> Result<(), EngineError> {
    let (_, data) = self.output(index)?;
    if dst.len() != data.len() {
      return Err(EngineError::SizeMismatch {
        expected: dst.len(),
        actual: data.len(),
      });
    }
    dst.copy_from_slice(data);
    Ok(())
  }

  fn get_output_shape(&self, index: usize) -> Result<Vec<i64>, EngineError> {
    Ok(self.output(index)?.0.clone())
  }

  fn backend_name(&self) -> &str {
    "mock"
  }
}

/// 产生 `total` 帧，第 n 帧的每个像素值都是 `n % 256`
pub struct MockSource {
  total: usize,
  produced: usize,
  fail_at: Option<usize>,
}

impl MockSource {
  pub fn new(total: usize) -> Self {
    Self {
      total,
      produced: 0,
      fail_at: None,
    }
  }

  pub fn failing_at(mut self, frame: usize) -> Self {
    self.fail_at = Some(frame);
    self
  }

  pub fn produced(&self) -> usize {
    self.produced
  }
}

impl FrameSource for MockSource {
  fn read_into(&mut self, frame: &mut RawFrame) -> Result<bool, InputError> {
    if self.fail_at == Some(self.produced) {
      return Err(InputError::Other("模拟解码失败".to_string()));
    }
    if self.produced >= self.total {
      return Ok(false);
    }
    let value = (self.produced % 256) as u8;
    frame
      .reshape(FRAME_WIDTH, FRAME_HEIGHT, PixelOrder::Bgr)
      .fill(value);
    self.produced += 1;
    Ok(true)
  }

  fn frame_rate(&self) -> f64 {
    FRAME_RATE
  }
}

#[derive(Debug, Default)]
pub struct SinkLog {
  pub opened: Vec<(u32, u32, PixelOrder, f64)>,
  /// 每帧左上角像素的值，即帧号
  pub frames: Vec<u8>,
  /// 最后写出的一帧
  pub last_image: Option<RgbImage>,
  pub finished: bool,
}

/// 把写入的帧记录到共享的日志中
#[derive(Clone, Default)]
pub struct RecordingSink {
  log: Arc<Mutex<SinkLog>>,
  fail_at: Option<usize>,
  stop_after: Option<(usize, Arc<AtomicBool>)>,
}

impl RecordingSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn failing_at(mut self, frame: usize) -> Self {
    self.fail_at = Some(frame);
    self
  }

  /// 写完第 `frames` 帧后设置停止标志
  pub fn stopping_after(mut self, frames: usize, stop: Arc<AtomicBool>) -> Self {
    self.stop_after = Some((frames, stop));
    self
  }

  pub fn log(&self) -> Arc<Mutex<SinkLog>> {
    Arc::clone(&self.log)
  }
}

impl FrameSink for RecordingSink {
  fn open(&mut self, width: u32, height: u32, order: PixelOrder, fps: f64) -> Result<(), OutputError> {
    self.log.lock().unwrap().opened.push((width, height, order, fps));
    Ok(())
  }

  fn write_frame(&mut self, frame: &RawFrame) -> Result<(), OutputError> {
    let mut log = self.log.lock().unwrap();
    if self.fail_at == Some(log.frames.len()) {
      return Err(OutputError::Other("模拟写入失败".to_string()));
    }
    log.frames.push(frame.image().get_pixel(0, 0).0[0]);
    log.last_image = Some(frame.image().clone());
    if let Some((frames, stop)) = &self.stop_after
      && log.frames.len() == *frames
    {
      stop.store(true, Ordering::Release);
    }
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.log.lock().unwrap().finished = true;
    Ok(())
  }
}

/// 临时目录中的标签文件和对应的配置
pub struct Fixture {
  pub dir: TempDir,
  pub config: PipelineConfig,
}

impl Fixture {
  pub fn new(ring_buffer_size: usize) -> Self {
    let dir = tempfile::tempdir().unwrap();
    let label_path = dir.path().join("labels.txt");
    std::fs::write(&label_path, LABELS).unwrap();

    let config = PipelineConfig::new(
      Url::parse("mock://frames").unwrap(),
      PathBuf::from("mock.onnx"),
      label_path,
      Url::parse("mock://sink").unwrap(),
    )
    .with_ring_buffer_size(ring_buffer_size);
    Self { dir, config }
  }

  pub fn segmentation(mut self) -> Self {
    self.config.inference_config = self
      .config
      .inference_config
      .clone()
      .with_model_type(ModelType::Segmentation);
    self
  }

  pub fn with_inference_config(mut self, inference_config: InferenceConfig) -> Self {
    self.config.inference_config = inference_config;
    self
  }

  pub fn with_records(mut self) -> Self {
    self.config.records_path = Some(self.records_path());
    self
  }

  pub fn records_path(&self) -> PathBuf {
    self.dir.path().join("records").join("detections.jsonl")
  }

  pub fn read_records(&self) -> Vec<serde_json::Value> {
    std::fs::read_to_string(self.records_path())
      .unwrap()
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect()
  }
}
