// 该文件是 Huanliu （环流） 项目的一部分。
// tests/pipeline_test.rs - 流水线端到端测试
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

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use huanliu::{
  InferenceConfig, Pipeline, PipelineError, SlotAccounting,
  config::ConfigError,
  frame::PixelOrder,
  model::{DecodeError, color_for_class},
};

use common::*;

fn expected_frames(count: usize) -> Vec<u8> {
  (0..count).map(|n| (n % 256) as u8).collect()
}

#[test]
fn test_processes_every_frame_in_order() {
  let fixture = Fixture::new(4);
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline =
    Pipeline::new(fixture.config.clone(), MockEngine::detection(), MockSource::new(20), sink).unwrap();
  assert_eq!(pipeline.resolution(), NATIVE_RESOLUTION as u32);

  let frames = pipeline.run().unwrap();
  assert_eq!(frames, 20);
  assert_eq!(pipeline.frames_processed(), 20);

  let log = log.lock().unwrap();
  assert_eq!(log.frames, expected_frames(20));
  assert_eq!(
    log.opened,
    vec![(FRAME_WIDTH, FRAME_HEIGHT, PixelOrder::Bgr, FRAME_RATE)]
  );
  assert!(log.finished);

  assert_eq!(
    pipeline.slot_accounting(),
    Some(SlotAccounting {
      free_slots: 4,
      stranded_slots: 0,
    })
  );
}

#[test]
fn test_single_slot_ring() {
  let fixture = Fixture::new(1);
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline =
    Pipeline::new(fixture.config.clone(), MockEngine::detection(), MockSource::new(7), sink).unwrap();
  assert_eq!(pipeline.run().unwrap(), 7);
  assert_eq!(log.lock().unwrap().frames, expected_frames(7));
}

#[test]
fn test_empty_source() {
  let fixture = Fixture::new(8);
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline =
    Pipeline::new(fixture.config.clone(), MockEngine::detection(), MockSource::new(0), sink).unwrap();
  assert_eq!(pipeline.run().unwrap(), 0);

  let log = log.lock().unwrap();
  assert!(log.opened.is_empty());
  assert!(log.frames.is_empty());
  assert!(log.finished);
  assert_eq!(pipeline.slot_accounting().unwrap().free_slots, 8);
}

#[test]
fn test_pipeline_can_run_again() {
  let fixture = Fixture::new(3);
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(5),
    RecordingSink::new(),
  )
  .unwrap();

  assert_eq!(pipeline.run().unwrap(), 5);
  // 视频源已经耗尽，第二次运行立即结束且槽全部回收
  assert_eq!(pipeline.run().unwrap(), 0);
  assert_eq!(pipeline.slot_accounting().unwrap().free_slots, 3);

  let (_, source, _) = pipeline.into_parts();
  assert_eq!(source.produced(), 5);
}

#[test]
fn test_engine_error_halts_pipeline() {
  let fixture = Fixture::new(4);
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection().failing_after(3),
    MockSource::new(1000),
    sink,
  )
  .unwrap();

  let err = pipeline.run().unwrap_err();
  assert!(matches!(err, PipelineError::Engine(_)), "{err}");
  assert!(pipeline.frames_processed() <= 3);

  let log = log.lock().unwrap();
  assert_eq!(log.frames, expected_frames(log.frames.len()));
  assert!(log.finished);

  let accounting = pipeline.slot_accounting().unwrap();
  assert_eq!(accounting.free_slots + accounting.stranded_slots, 4);
}

#[test]
fn test_engine_panic_is_reported() {
  let fixture = Fixture::new(4);
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection().panicking_after(2),
    MockSource::new(1000),
    RecordingSink::new(),
  )
  .unwrap();

  let err = pipeline.run().unwrap_err();
  assert!(matches!(err, PipelineError::WorkerPanicked("infer")), "{err}");
  let accounting = pipeline.slot_accounting().unwrap();
  // 崩溃的阶段持有的槽无法归还
  assert!(accounting.free_slots + accounting.stranded_slots >= 3);
}

#[test]
fn test_source_error_halts_pipeline() {
  let fixture = Fixture::new(4);
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(100).failing_at(5),
    sink,
  )
  .unwrap();

  let err = pipeline.run().unwrap_err();
  assert!(matches!(err, PipelineError::Input(_)), "{err}");
  assert!(log.lock().unwrap().frames.len() <= 5);
}

#[test]
fn test_sink_error_halts_pipeline() {
  let fixture = Fixture::new(4);
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(100),
    RecordingSink::new().failing_at(2),
  )
  .unwrap();

  let err = pipeline.run().unwrap_err();
  assert!(matches!(err, PipelineError::Output(_)), "{err}");
  assert_eq!(pipeline.frames_processed(), 2);
  let accounting = pipeline.slot_accounting().unwrap();
  assert_eq!(accounting.free_slots + accounting.stranded_slots, 4);
}

#[test]
fn test_stop_flag_ends_run_early() {
  let fixture = Fixture::new(4);
  let stop = Arc::new(AtomicBool::new(false));
  let sink = RecordingSink::new().stopping_after(5, Arc::clone(&stop));
  let log = sink.log();

  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(10_000),
    sink,
  )
  .unwrap()
  .with_stop_flag(stop);

  assert_eq!(pipeline.run().unwrap(), 5);
  let log = log.lock().unwrap();
  assert_eq!(log.frames, expected_frames(5));
  assert!(log.finished);

  let accounting = pipeline.slot_accounting().unwrap();
  assert_eq!(accounting.free_slots + accounting.stranded_slots, 4);
}

#[test]
fn test_records_detections() {
  let fixture = Fixture::new(4).with_records();
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(6),
    RecordingSink::new(),
  )
  .unwrap();
  assert_eq!(pipeline.run().unwrap(), 6);

  let records = fixture.read_records();
  assert_eq!(records.len(), 6);
  for (n, record) in records.iter().enumerate() {
    assert_eq!(record["frame"], n as u64);
    assert_eq!(record["width"], FRAME_WIDTH);
    assert_eq!(record["height"], FRAME_HEIGHT);
    let detections = record["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0]["label"], "person");
    assert_eq!(detections[0]["class_id"], 0);
  }

  // 中心 (0.5, 0.5)、大小 0.5 的框按原始帧尺寸缩放
  let bbox: Vec<f64> = records[0]["detections"][0]["box"]
    .as_array()
    .unwrap()
    .iter()
    .map(|v| v.as_f64().unwrap())
    .collect();
  let expected = [16.0, 12.0, 48.0, 36.0];
  for (got, want) in bbox.iter().zip(expected) {
    assert!((got - want).abs() < 1e-3, "{bbox:?}");
  }
}

#[test]
fn test_swapped_outputs_are_recognised() {
  let fixture = Fixture::new(2).with_records();
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection().swapped(),
    MockSource::new(3),
    RecordingSink::new(),
  )
  .unwrap();
  assert_eq!(pipeline.run().unwrap(), 3);

  let records = fixture.read_records();
  assert!(
    records
      .iter()
      .all(|r| r["detections"].as_array().unwrap().len() == 1)
  );
}

#[test]
fn test_segmentation_run() {
  let fixture = Fixture::new(4).segmentation().with_records();
  let sink = RecordingSink::new();
  let log = sink.log();

  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::segmentation(),
    MockSource::new(8),
    sink,
  )
  .unwrap();
  assert_eq!(pipeline.run().unwrap(), 8);
  assert_eq!(fixture.read_records().len(), 8);

  let log = log.lock().unwrap();
  assert_eq!(log.frames, expected_frames(8));

  // 最后一帧的像素值为 7；掩码覆盖中央 (16..48, 12..36)，按 0.5 与类别颜色混合
  let image = log.last_image.as_ref().unwrap();
  let color = PixelOrder::Bgr.pixel(color_for_class(0)).0;
  let blended = color.map(|c| (7.0 * 0.5 + c as f32 * 0.5).round() as u8);
  assert_eq!(image.get_pixel(32, 30).0, blended);
  assert_eq!(image.get_pixel(5, 40).0, [7, 7, 7]);
}

#[test]
fn test_segmentation_requires_mask_output() {
  let fixture = Fixture::new(4).segmentation();
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::segmentation().with_output_count(2),
    MockSource::new(8),
    RecordingSink::new(),
  )
  .unwrap();

  let err = pipeline.run().unwrap_err();
  assert!(
    matches!(
      err,
      PipelineError::Decode(DecodeError::MissingOutputs {
        expected: 3,
        actual: 2
      })
    ),
    "{err}"
  );
  assert_eq!(pipeline.frames_processed(), 0);
}

#[test]
fn test_explicit_resolution_is_kept() {
  let fixture = Fixture::new(2)
    .with_inference_config(InferenceConfig::default().with_resolution(16));
  let mut pipeline = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(2),
    RecordingSink::new(),
  )
  .unwrap();
  assert_eq!(pipeline.resolution(), 16);
  assert_eq!(pipeline.config().inference_config.resolution, 16);
  assert_eq!(pipeline.run().unwrap(), 2);
}

#[test]
fn test_invalid_config_is_rejected_before_start() {
  let fixture = Fixture::new(0);
  let result = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(2),
    RecordingSink::new(),
  );
  assert!(matches!(
    result,
    Err(PipelineError::Config(ConfigError::EmptyRingBuffer))
  ));
}

#[test]
fn test_missing_labels_are_rejected() {
  let mut fixture = Fixture::new(2);
  fixture.config.label_path = fixture.dir.path().join("missing.txt");
  let result = Pipeline::new(
    fixture.config.clone(),
    MockEngine::detection(),
    MockSource::new(2),
    RecordingSink::new(),
  );
  assert!(matches!(result, Err(PipelineError::Label(_))));
}
