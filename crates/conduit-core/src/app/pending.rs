//! Pending table - 返信待ちタスクの対応表
//!
//! # 不変条件
//! 各メソッドは検索と削除を同じロックの中で行う。同じ id に対して
//! resolve / expire / fail / remove のうちエントリを見つけるのは一つだけ。

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::domain::{BridgeError, Delivery, TaskId};

pub(crate) type ReplySlot = oneshot::Receiver<Result<Delivery, BridgeError>>;

struct PendingEntry {
    tx: oneshot::Sender<Result<Delivery, BridgeError>>,
    timeout: Duration,
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<TaskId, PendingEntry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`; the returned receiver gets exactly one outcome.
    /// `timeout` is only reported back if the entry expires.
    pub(crate) fn insert(&self, id: TaskId, timeout: Duration) -> Result<ReplySlot, BridgeError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(BridgeError::DuplicateTask(id));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id, PendingEntry { tx, timeout });
        Ok(rx)
    }

    /// Hand `delivery` to the waiter for `id`. Gives the delivery back when
    /// nobody is waiting (timed out, cancelled, or never ours).
    pub fn resolve(&self, id: TaskId, delivery: Delivery) -> Result<(), Delivery> {
        let Some(entry) = self.entries.lock().remove(&id) else {
            return Err(delivery);
        };
        // a dropped receiver means the caller went away after we removed the
        // entry; the delivery is still settled by the dispatcher
        let _ = entry.tx.send(Ok(delivery));
        Ok(())
    }

    /// Time out `id`. Returns false if it was already resolved or removed.
    pub fn expire(&self, id: TaskId) -> bool {
        let Some(entry) = self.entries.lock().remove(&id) else {
            return false;
        };
        let _ = entry.tx.send(Err(BridgeError::CorrelationTimeout {
            task_id: id,
            timeout: entry.timeout,
        }));
        true
    }

    pub fn fail(&self, id: TaskId, err: BridgeError) -> bool {
        let Some(entry) = self.entries.lock().remove(&id) else {
            return false;
        };
        let _ = entry.tx.send(Err(err));
        true
    }

    /// Drop the entry without notifying anyone.
    pub fn remove(&self, id: TaskId) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Fail every entry with a fresh error from `make_err`.
    pub fn drain_all(&self, make_err: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(make_err()));
        }
        count
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
