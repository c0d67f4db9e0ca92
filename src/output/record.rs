// 该文件是 Huanliu （环流） 项目的一部分。
// src/output/record.rs - 逐帧检测记录
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::{labels::Labels, model::Detections};

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
}

/// 以 JSON Lines 格式逐帧写出检测结果
pub struct Record<W: Write> {
  writer: W,
}

impl Record<BufWriter<File>> {
  pub fn create(path: &Path) -> Result<Self, RecordError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    info!("检测记录写入: {}", path.display());
    Ok(Self::new(BufWriter::new(file)))
  }
}

impl<W: Write> Record<W> {
  pub fn new(writer: W) -> Self {
    Self { writer }
  }

  pub fn to_value(
    frame_number: u64,
    width: u32,
    height: u32,
    detections: &Detections,
    labels: &Labels,
  ) -> Value {
    let items: Vec<Value> = detections
      .iter()
      .map(|item| {
        json!({
          "label": labels.name(item.class_id),
          "class_id": item.class_id,
          "score": item.score,
          "box": item.bbox.to_array(),
        })
      })
      .collect();
    json!({
      "frame": frame_number,
      "width": width,
      "height": height,
      "detections": items,
    })
  }

  pub fn record(
    &mut self,
    frame_number: u64,
    width: u32,
    height: u32,
    detections: &Detections,
    labels: &Labels,
  ) -> Result<(), RecordError> {
    let value = Self::to_value(frame_number, width, height, detections, labels);
    serde_json::to_writer(&mut self.writer, &value)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), RecordError> {
    self.writer.flush()?;
    Ok(())
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  #[test]
  fn test_json_lines() {
    let labels = Labels::parse("person\ncar\n");
    let mut detections = Detections::default();
    detections.push(1, 0.75, BoundingBox::new(1.0, 2.0, 3.0, 4.0));

    let mut record = Record::new(Vec::new());
    record.record(0, 640, 480, &detections, &labels).unwrap();
    record.record(1, 640, 480, &Detections::default(), &labels).unwrap();

    let text = String::from_utf8(record.into_inner()).unwrap();
    let lines: Vec<Value> = text
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["frame"], 0);
    assert_eq!(lines[0]["detections"][0]["label"], "car");
    assert_eq!(lines[0]["detections"][0]["class_id"], 1);
    assert_eq!(lines[0]["detections"][0]["box"][3], 4.0);
    assert_eq!(lines[1]["detections"].as_array().unwrap().len(), 0);
  }

  #[test]
  fn test_create_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("records.jsonl");
    let mut record = Record::create(&path).unwrap();
    record
      .record(3, 10, 10, &Detections::default(), &Labels::default())
      .unwrap();
    record.flush().unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("{"));
    assert!(text.ends_with("\n"));
  }
}
