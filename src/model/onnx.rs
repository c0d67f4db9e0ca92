// 该文件是 Huanliu （环流） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{Tensor, ValueType},
};
use tracing::{debug, info};

use crate::model::{EngineError, InferenceEngine};

fn backend_err(err: ort::Error) -> EngineError {
  EngineError::Backend(err.to_string())
}

/// 基于 ONNX Runtime 的推理后端
///
/// 每次推理后输出被复制到内部缓存，之后的读取不再依赖会话的输出存储。
#[derive(Default)]
pub struct OnnxEngine {
  session: Option<Session>,
  input_name: String,
  outputs: Vec<(Vec<i64>, Vec<f32>)>,
  threads: usize,
}

impl OnnxEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// 算子内线程数，0 表示由运行时决定
  pub fn with_threads(mut self, threads: usize) -> Self {
    self.threads = threads;
    self
  }

  fn session_mut(&mut self) -> Result<&mut Session, EngineError> {
    self
      .session
      .as_mut()
      .ok_or_else(|| EngineError::Backend("会话尚未初始化".to_string()))
  }

  fn output(&self, index: usize) -> Result<&(Vec<i64>, Vec<f32>), EngineError> {
    self
      .outputs
      .get(index)
      .ok_or(EngineError::OutputIndexOutOfRange {
        index,
        count: self.outputs.len(),
      })
  }
}

impl InferenceEngine for OnnxEngine {
  fn initialize(&mut self, model_path: &Path, input_shape: &[i64]) -> Result<Vec<i64>, EngineError> {
    if !model_path.exists() {
      return Err(EngineError::ModelNotFound(model_path.to_path_buf()));
    }

    let mut builder = Session::builder()
      .map_err(backend_err)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(backend_err)?;
    if self.threads > 0 {
      builder = builder.with_intra_threads(self.threads).map_err(backend_err)?;
    }
    let session = builder.commit_from_file(model_path).map_err(backend_err)?;

    let input = session
      .inputs
      .first()
      .ok_or_else(|| EngineError::Backend("模型没有输入".to_string()))?;
    self.input_name = input.name.clone();

    let model_shape: Vec<i64> = match &input.input_type {
      ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
      other => {
        return Err(EngineError::Backend(format!("不支持的输入类型: {other:?}")));
      }
    };
    debug!("模型输入 {}: {:?}", self.input_name, model_shape);

    // 调用方给出的 0 维度由模型形状补齐
    let resolved: Vec<i64> = if input_shape.len() == model_shape.len() {
      input_shape
        .iter()
        .zip(&model_shape)
        .map(|(want, model)| if *want > 0 { *want } else { *model })
        .collect()
    } else {
      model_shape
    };
    if resolved.iter().skip(2).any(|d| *d <= 0) {
      return Err(EngineError::ResolutionUndetectable);
    }

    info!(
      "ONNX 模型已加载: {}, 输入形状 {:?}, 输出 {} 个",
      model_path.display(),
      resolved,
      session.outputs.len()
    );
    self.session = Some(session);
    self.outputs.clear();
    Ok(resolved)
  }

  fn run_inference(&mut self, input: &[f32], input_shape: &[i64]) -> Result<(), EngineError> {
    let expected: i64 = input_shape.iter().product();
    if expected < 0 || expected as usize != input.len() {
      return Err(EngineError::SizeMismatch {
        expected: expected.max(0) as usize,
        actual: input.len(),
      });
    }
    let shape: Vec<usize> = input_shape.iter().map(|d| *d as usize).collect();
    let tensor =
      Tensor::from_array((shape, input.to_vec().into_boxed_slice())).map_err(backend_err)?;

    let input_name = self.input_name.clone();
    let session = self.session_mut()?;
    let outputs = session
      .run(ort::inputs![input_name => tensor])
      .map_err(backend_err)?;

    let mut cached = Vec::new();
    for (_, value) in outputs.iter() {
      let (shape, data) = value.try_extract_tensor::<f32>().map_err(backend_err)?;
      cached.push((shape.iter().copied().collect(), data.to_vec()));
    }
    drop(outputs);
    self.outputs = cached;
    Ok(())
  }

  fn output_count(&self) -> usize {
    self.outputs.len()
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
    self.output(index).map(|(shape, _)| shape.clone())
  }

  fn backend_name(&self) -> &str {
    "onnxruntime"
  }
}
