//! Thread registry: every thread that holds an id, plus the free and
//! dormant lists and the id bitmap.

use super::{IdBitmap, IdRange, ThreadRef, Tid};
use crate::errors::{Errno, KernelResult};
use crate::sync::{DispatchControl, IrqLock};

extern crate alloc;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

pub struct ThreadRegistry {
    created: IrqLock<BTreeMap<Tid, ThreadRef>>,
    free: IrqLock<VecDeque<ThreadRef>>,
    dormant: IrqLock<VecDeque<ThreadRef>>,
    ids: IrqLock<IdBitmap>,
}

impl ThreadRegistry {
    pub fn new(reserved_ids: u64, nr_ids: u64) -> Self {
        Self {
            created: IrqLock::new(BTreeMap::new()),
            free: IrqLock::new(VecDeque::new()),
            dormant: IrqLock::new(VecDeque::new()),
            ids: IrqLock::new(IdBitmap::new(reserved_ids, nr_ids)),
        }
    }

    pub fn insert(&self, cpu: &dyn DispatchControl, thr: ThreadRef) -> KernelResult<()> {
        let mut created = self.created.lock(cpu);
        let tid = thr.tid();
        if created.contains_key(&tid) {
            return Err(Errno::Busy);
        }
        created.insert(tid, thr);
        Ok(())
    }

    pub fn remove(&self, cpu: &dyn DispatchControl, tid: Tid) -> Option<ThreadRef> {
        self.created.lock(cpu).remove(&tid)
    }

    pub fn find(&self, cpu: &dyn DispatchControl, tid: Tid) -> Option<ThreadRef> {
        self.created.lock(cpu).get(&tid).cloned()
    }

    /// Whether this exact control block is still registered.
    pub fn contains(&self, cpu: &dyn DispatchControl, thr: &ThreadRef) -> bool {
        self.created
            .lock(cpu)
            .get(&thr.tid())
            .map_or(false, |t| Arc::ptr_eq(t, thr))
    }

    pub fn len(&self, cpu: &dyn DispatchControl) -> usize {
        self.created.lock(cpu).len()
    }

    pub fn snapshot(&self, cpu: &dyn DispatchControl) -> Vec<ThreadRef> {
        self.created.lock(cpu).values().cloned().collect()
    }

    pub fn push_free(&self, cpu: &dyn DispatchControl, thr: ThreadRef) {
        self.free.lock(cpu).push_back(thr);
    }

    pub fn remove_free(&self, cpu: &dyn DispatchControl, thr: &ThreadRef) -> bool {
        remove_from(&mut self.free.lock(cpu), thr)
    }

    pub fn free_count(&self, cpu: &dyn DispatchControl) -> usize {
        self.free.lock(cpu).len()
    }

    pub fn push_dormant(&self, cpu: &dyn DispatchControl, thr: ThreadRef) {
        self.dormant.lock(cpu).push_back(thr);
    }

    pub fn remove_dormant(&self, cpu: &dyn DispatchControl, thr: &ThreadRef) -> bool {
        remove_from(&mut self.dormant.lock(cpu), thr)
    }

    pub fn is_dormant(&self, cpu: &dyn DispatchControl, thr: &ThreadRef) -> bool {
        self.dormant.lock(cpu).iter().any(|t| Arc::ptr_eq(t, thr))
    }

    pub fn drain_dormant(&self, cpu: &dyn DispatchControl) -> Vec<ThreadRef> {
        self.dormant.lock(cpu).drain(..).collect()
    }

    pub fn alloc_id(
        &self,
        cpu: &dyn DispatchControl,
        range: IdRange,
        want: Option<Tid>,
    ) -> KernelResult<Tid> {
        let mut ids = self.ids.lock(cpu);
        match want {
            Some(id) => ids.alloc_specific(range, id),
            None => ids.alloc(range),
        }
    }

    pub fn release_id(&self, cpu: &dyn DispatchControl, tid: Tid) {
        self.ids.lock(cpu).release(tid);
    }

    pub fn ids_in_use(&self, cpu: &dyn DispatchControl) -> usize {
        self.ids.lock(cpu).in_use()
    }
}

fn remove_from(queue: &mut VecDeque<ThreadRef>, thr: &ThreadRef) -> bool {
    match queue.iter().position(|t| Arc::ptr_eq(t, thr)) {
        Some(pos) => {
            queue.remove(pos);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::NullCpu;
    use crate::thread::Thread;

    #[test]
    fn test_insert_find_remove() {
        let cpu = NullCpu;
        let reg = ThreadRegistry::new(8, 64);
        let thr = Thread::new_free(None);
        thr.set_tid(reg.alloc_id(&cpu, IdRange::User, None).unwrap());
        assert_eq!(thr.tid(), 8);

        reg.insert(&cpu, thr.clone()).unwrap();
        assert_eq!(reg.insert(&cpu, thr.clone()), Err(Errno::Busy));
        assert!(reg.contains(&cpu, &thr));
        assert!(reg.find(&cpu, 8).is_some());

        assert!(reg.remove(&cpu, 8).is_some());
        assert!(reg.find(&cpu, 8).is_none());
        reg.release_id(&cpu, 8);
        assert_eq!(reg.ids_in_use(&cpu), 0);
    }

    #[test]
    fn test_lists() {
        let cpu = NullCpu;
        let reg = ThreadRegistry::new(8, 64);
        let a = Thread::new_free(None);
        let b = Thread::new_free(None);
        reg.push_free(&cpu, a.clone());
        reg.push_dormant(&cpu, b.clone());
        assert_eq!(reg.free_count(&cpu), 1);
        assert!(reg.remove_free(&cpu, &a));
        assert!(!reg.remove_free(&cpu, &a));
        assert!(!reg.remove_dormant(&cpu, &a));
        assert_eq!(reg.drain_dormant(&cpu).len(), 1);
    }
}
