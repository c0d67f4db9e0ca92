// 该文件是 Huanliu （环流） 项目的一部分。
// src/queue.rs - 有界阻塞队列
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

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError, TrySendError};

/// 队列中传递的消息：数据或关闭标记
#[derive(Debug)]
pub enum Packet<T> {
  Data(T),
  Shutdown,
}

impl<T> Packet<T> {
  pub fn is_shutdown(&self) -> bool {
    matches!(self, Packet::Shutdown)
  }

  pub fn into_data(self) -> Option<T> {
    match self {
      Packet::Data(value) => Some(value),
      Packet::Shutdown => None,
    }
  }
}

/// 广播式中止信号
///
/// 信号通道上从不发送消息；触发时丢弃发送端，所有接收端随即断开并保持就绪，
/// 因此任何阻塞在队列上的线程都会被唤醒。
pub struct Abort {
  trigger: Mutex<Option<Sender<()>>>,
  signal: Receiver<()>,
}

impl Default for Abort {
  fn default() -> Self {
    Self::new()
  }
}

impl Abort {
  pub fn new() -> Self {
    let (tx, rx) = crossbeam_channel::bounded(0);
    Self {
      trigger: Mutex::new(Some(tx)),
      signal: rx,
    }
  }

  /// 触发中止，可重复调用
  pub fn trigger(&self) {
    self
      .trigger
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
  }

  pub fn is_triggered(&self) -> bool {
    is_disconnected(&self.signal)
  }

  fn signal(&self) -> Receiver<()> {
    self.signal.clone()
  }
}

fn is_disconnected(signal: &Receiver<()>) -> bool {
  matches!(signal.try_recv(), Err(TryRecvError::Disconnected))
}

/// 有界阻塞 FIFO 队列
///
/// `push` 在队列满时阻塞，`pop` 在队列空时阻塞。关联的 [`Abort`] 触发后，
/// 阻塞中的 `push` 交回元素，`pop` 返回 `None`。队列同时持有两端，
/// 因此通道不会断开，收尾时可以 [`BoundedQueue::drain`] 剩余元素。
pub struct BoundedQueue<T> {
  tx: Sender<T>,
  rx: Receiver<T>,
  abort: Receiver<()>,
  capacity: usize,
}

impl<T> BoundedQueue<T> {
  /// 不受中止信号影响的队列
  pub fn new(capacity: usize) -> Self {
    Self::with_signal(capacity, crossbeam_channel::never())
  }

  pub fn with_abort(capacity: usize, abort: &Abort) -> Self {
    Self::with_signal(capacity, abort.signal())
  }

  fn with_signal(capacity: usize, abort: Receiver<()>) -> Self {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    Self {
      tx,
      rx,
      abort,
      capacity,
    }
  }

  /// 阻塞直到放入元素；中止时交回元素
  pub fn push(&self, item: T) -> Result<(), T> {
    if is_disconnected(&self.abort) {
      return Err(item);
    }
    let mut sel = Select::new();
    let send = sel.send(&self.tx);
    sel.recv(&self.abort);
    // 元素只在发送操作被选中时才交给通道
    let oper = sel.select();
    if oper.index() == send {
      oper.send(&self.tx, item).map_err(|e| e.into_inner())
    } else {
      let _ = oper.recv(&self.abort);
      Err(item)
    }
  }

  /// 阻塞直到取出元素；中止时返回 `None`
  pub fn pop(&self) -> Option<T> {
    if is_disconnected(&self.abort) {
      return None;
    }
    crossbeam_channel::select! {
      recv(self.rx) -> item => item.ok(),
      recv(self.abort) -> _ => None,
    }
  }

  /// 不阻塞地放入元素，队列已满时交回元素
  pub fn try_push(&self, item: T) -> Result<(), T> {
    self.tx.try_send(item).map_err(|e| match e {
      TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
    })
  }

  /// 取出当前排队的全部元素，不阻塞
  pub fn drain(&self) -> Vec<T> {
    self.rx.try_iter().collect()
  }

  pub fn len(&self) -> usize {
    self.rx.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rx.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}
