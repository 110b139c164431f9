//! Thread id bitmap.
//!
//! Id 0 is the idle thread and is never handed out. Ids `1..reserved` are
//! system ids for kernel threads; `reserved..nr_ids` are user ids.

use super::Tid;
use crate::errors::{Errno, KernelResult};

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;

/// Which half of the id space to allocate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRange {
    System,
    User,
}

pub struct IdBitmap {
    words: Vec<u64>,
    reserved: u64,
    nr_ids: u64,
    used: usize,
}

impl IdBitmap {
    pub fn new(reserved: u64, nr_ids: u64) -> Self {
        let mut map = Self {
            words: vec![0; ((nr_ids + 63) / 64) as usize],
            reserved,
            nr_ids,
            used: 0,
        };
        map.set(0);
        map
    }

    fn bounds(&self, range: IdRange) -> (u64, u64) {
        match range {
            IdRange::System => (1, self.reserved),
            IdRange::User => (self.reserved, self.nr_ids),
        }
    }

    fn test(&self, id: u64) -> bool {
        self.words[(id / 64) as usize] & (1 << (id % 64)) != 0
    }

    fn set(&mut self, id: u64) {
        self.words[(id / 64) as usize] |= 1 << (id % 64);
        self.used += 1;
    }

    /// Lowest free id of `range`, `NoEntry` when the range is exhausted.
    pub fn alloc(&mut self, range: IdRange) -> KernelResult<Tid> {
        let (lo, hi) = self.bounds(range);
        let mut id = lo;
        while id < hi {
            let word = self.words[(id / 64) as usize];
            if word == u64::MAX && id % 64 == 0 {
                id += 64;
                continue;
            }
            if !self.test(id) {
                self.set(id);
                return Ok(id);
            }
            id += 1;
        }
        Err(Errno::NoEntry)
    }

    /// Claim a specific id of `range`.
    pub fn alloc_specific(&mut self, range: IdRange, id: Tid) -> KernelResult<Tid> {
        let (lo, hi) = self.bounds(range);
        if id < lo || id >= hi {
            return Err(Errno::Invalid);
        }
        if self.test(id) {
            return Err(Errno::Busy);
        }
        self.set(id);
        Ok(id)
    }

    pub fn release(&mut self, id: Tid) {
        if id == 0 || id >= self.nr_ids || !self.test(id) {
            return;
        }
        self.words[(id / 64) as usize] &= !(1 << (id % 64));
        self.used -= 1;
    }

    pub fn is_allocated(&self, id: Tid) -> bool {
        id < self.nr_ids && self.test(id)
    }

    /// Allocated ids, not counting id 0.
    pub fn in_use(&self) -> usize {
        self.used - 1
    }
}
