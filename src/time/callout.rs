//! Callout queue: actions keyed by absolute expiry tick.
//!
//! Entries are ordered by `(expire, seq)`, so two callouts due on the same
//! tick fire in registration order. Expired actions are detached under the
//! lock and executed by the caller after it is released.

use crate::sync::{DispatchControl, IrqLock, SyncObject};
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Handle of a registered callout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CalloutKey {
    pub expire: u64,
    seq: u64,
}

/// What to do when a callout expires.
pub enum CalloutAction {
    /// Wake the waiters of a timer object with `Timeout`
    Timeout(Arc<SyncObject>),
    /// Run a function in interrupt context
    Call(Box<dyn FnOnce() + Send>),
}

pub struct CalloutQueue {
    tree: IrqLock<BTreeMap<CalloutKey, CalloutAction>>,
    seq: AtomicU64,
}

impl CalloutQueue {
    pub const fn new() -> Self {
        Self {
            tree: IrqLock::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn insert(
        &self,
        cpu: &dyn DispatchControl,
        expire: u64,
        action: CalloutAction,
    ) -> CalloutKey {
        let key = CalloutKey {
            expire,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.tree.lock(cpu).insert(key, action);
        key
    }

    /// Remove a callout before it fires. `None` if it already fired.
    pub fn cancel(&self, cpu: &dyn DispatchControl, key: CalloutKey) -> Option<CalloutAction> {
        self.tree.lock(cpu).remove(&key)
    }

    /// Detach every callout whose expiry is at or before `now`.
    pub fn take_expired(&self, cpu: &dyn DispatchControl, now: u64) -> Vec<CalloutAction> {
        let mut tree = self.tree.lock(cpu);
        let mut expired = Vec::new();
        while let Some(entry) = tree.first_entry() {
            if entry.key().expire > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    /// Detach every callout regardless of expiry.
    pub(crate) fn drain(&self, cpu: &dyn DispatchControl) -> Vec<CalloutAction> {
        let tree = core::mem::take(&mut *self.tree.lock(cpu));
        tree.into_values().collect()
    }

    pub fn len(&self, cpu: &dyn DispatchControl) -> usize {
        self.tree.lock(cpu).len()
    }

    pub fn is_empty(&self, cpu: &dyn DispatchControl) -> bool {
        self.tree.lock(cpu).is_empty()
    }

    /// Expiry tick of the next callout.
    pub fn next_expiry(&self, cpu: &dyn DispatchControl) -> Option<u64> {
        self.tree.lock(cpu).keys().next().map(|key| key.expire)
    }
}

impl Default for CalloutQueue {
    fn default() -> Self {
        Self::new()
    }
}
