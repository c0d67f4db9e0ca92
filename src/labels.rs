// 该文件是 Huanliu （环流） 项目的一部分。
// src/labels.rs - 类别标签
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

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取标签文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("标签文件为空: {0}")]
  Empty(PathBuf),
}

/// 类别名称表，每行一个类别，行号即类别 ID
#[derive(Debug, Clone, Default)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  pub fn load(path: &Path) -> Result<Self, LabelError> {
    let content = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let labels = Self::parse(&content);
    if labels.is_empty() {
      return Err(LabelError::Empty(path.to_path_buf()));
    }
    info!("从 {} 加载了 {} 个类别标签", path.display(), labels.len());
    Ok(labels)
  }

  /// 忽略空行并去除行尾的 `\r`；只含空白的行仍占一个类别 ID
  pub fn parse(content: &str) -> Self {
    let names = content
      .lines()
      .map(|line| line.strip_suffix('\r').unwrap_or(line))
      .filter(|line| !line.is_empty())
      .map(str::to_owned)
      .collect();
    Self { names }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn get(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  /// 类别名称，越界时回退为 `class_<id>`
  pub fn name(&self, class_id: u32) -> Cow<'_, str> {
    match self.get(class_id) {
      Some(name) => Cow::Borrowed(name),
      None => Cow::Owned(format!("class_{class_id}")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_parse_skips_blank_lines() {
    let labels = Labels::parse("person\r\n\nbicycle\ncar\n");
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.get(0), Some("person"));
    assert_eq!(labels.get(1), Some("bicycle"));
    assert_eq!(labels.name(2), "car");
    assert_eq!(labels.name(7), "class_7");
  }

  #[test]
  fn test_parse_keeps_whitespace_lines() {
    let labels = Labels::parse("person\n  \ncar \r\n\ndog\n");
    assert_eq!(labels.len(), 4);
    assert_eq!(labels.get(1), Some("  "));
    assert_eq!(labels.get(2), Some("car "));
    assert_eq!(labels.name(3), "dog");
  }

  #[test]
  fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "cat\ndog").expect("write");
    let labels = Labels::load(file.path()).expect("load");
    assert_eq!(labels.get(0), Some("cat"));
    assert_eq!(labels.len(), 2);
  }

  #[test]
  fn test_load_errors() {
    assert!(matches!(
      Labels::load(Path::new("/nonexistent/labels.txt")),
      Err(LabelError::Io { .. })
    ));
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    assert!(matches!(Labels::load(file.path()), Err(LabelError::Empty(_))));
  }
}
