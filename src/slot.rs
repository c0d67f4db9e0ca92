// 该文件是 Huanliu （环流） 项目的一部分。
// src/slot.rs - 帧槽与槽池
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

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  frame::{RGB_CHANNELS, RawFrame},
  model::Detections,
  queue::{BoundedQueue, Packet},
};

#[derive(Error, Debug)]
pub enum SlotError {
  #[error("槽数量必须大于 0")]
  EmptyPool,
  #[error("模型分辨率必须大于 0")]
  ZeroResolution,
}

/// 流水线中一帧的全部可复用存储
///
/// 同一时刻只有一个阶段持有某个槽，槽在队列之间移动而不是被共享。
#[derive(Debug)]
pub struct Slot {
  pub index: usize,
  pub frame: RawFrame,
  pub orig_w: u32,
  pub orig_h: u32,
  /// 模型输入张量 (CHW)，大小固定为 `3 * res * res`
  pub tensor: Vec<f32>,
  pub detections: Detections,
  pub frame_number: u64,
}

impl Slot {
  fn new(index: usize, resolution: u32) -> Self {
    let res = resolution as usize;
    Self {
      index,
      frame: RawFrame::default(),
      orig_w: 0,
      orig_h: 0,
      tensor: vec![0.0; RGB_CHANNELS * res * res],
      detections: Detections::default(),
      frame_number: 0,
    }
  }
}

/// 固定数量的槽，构造后不再增减
pub struct SlotPool {
  count: usize,
  slots: Vec<Slot>,
}

impl SlotPool {
  pub fn new(count: usize, resolution: u32) -> Result<Self, SlotError> {
    if count == 0 {
      return Err(SlotError::EmptyPool);
    }
    if resolution == 0 {
      return Err(SlotError::ZeroResolution);
    }
    let slots = (0..count).map(|i| Slot::new(i, resolution)).collect();
    debug!("分配 {} 个帧槽, 分辨率 {}", count, resolution);
    Ok(Self { count, slots })
  }

  pub fn count(&self) -> usize {
    self.count
  }

  /// 把全部槽放入空闲队列，放不下的槽留在槽池中
  pub fn seed(&mut self, free: &BoundedQueue<Packet<Slot>>) {
    for slot in std::mem::take(&mut self.slots) {
      if let Err(packet) = free.try_push(Packet::Data(slot))
        && let Some(slot) = packet.into_data()
      {
        self.slots.push(slot);
      }
    }
    if !self.slots.is_empty() {
      warn!(
        "空闲队列容量 {} 不足, {} 个帧槽未投入使用",
        free.capacity(),
        self.slots.len()
      );
    }
  }

  /// 收回运行结束后的槽，返回收回的数量
  pub fn reclaim<I>(&mut self, slots: I) -> usize
  where
    I: IntoIterator<Item = Slot>,
  {
    let before = self.slots.len();
    self.slots.extend(slots);
    self.slots.sort_by_key(|s| s.index);
    if self.slots.len() != self.count {
      warn!("只收回了 {}/{} 个帧槽", self.slots.len(), self.count);
    }
    self.slots.len() - before
  }

  /// 当前由槽池持有（未在流水线中）的槽
  pub fn slots(&self) -> &[Slot] {
    &self.slots
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pool_allocation() {
    let pool = SlotPool::new(4, 10).expect("pool");
    assert_eq!(pool.count(), 4);
    assert_eq!(pool.slots().len(), 4);
    for (i, slot) in pool.slots().iter().enumerate() {
      assert_eq!(slot.index, i);
      assert_eq!(slot.tensor.len(), 3 * 10 * 10);
      assert!(slot.detections.is_empty());
    }
  }

  #[test]
  fn test_invalid_pool() {
    assert!(matches!(SlotPool::new(0, 10), Err(SlotError::EmptyPool)));
    assert!(matches!(SlotPool::new(2, 0), Err(SlotError::ZeroResolution)));
  }

  #[test]
  fn test_seed_and_reclaim() {
    let mut pool = SlotPool::new(3, 4).expect("pool");
    let free = BoundedQueue::new(3);
    pool.seed(&free);
    assert!(pool.slots().is_empty());
    assert_eq!(free.len(), 3);

    let first = free.pop().and_then(Packet::into_data).expect("slot");
    assert_eq!(first.index, 0);
    let rest: Vec<Slot> = free.drain().into_iter().filter_map(Packet::into_data).collect();

    assert_eq!(pool.reclaim(rest.into_iter().chain(Some(first))), 3);
    assert!(free.is_empty());
    let indices: Vec<_> = pool.slots().iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
  }

  #[test]
  fn test_seed_keeps_slots_that_do_not_fit() {
    let mut pool = SlotPool::new(3, 4).expect("pool");
    let free = BoundedQueue::new(2);
    pool.seed(&free);
    assert_eq!(free.len(), 2);
    let kept: Vec<_> = pool.slots().iter().map(|s| s.index).collect();
    assert_eq!(kept, vec![2]);

    let seeded = free.drain().into_iter().filter_map(Packet::into_data);
    assert_eq!(pool.reclaim(seeded), 2);
    assert_eq!(pool.slots().len(), 3);
  }
}
