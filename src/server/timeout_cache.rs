// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Mutex,
    time::Duration,
};

use chrono::Utc;

/// Wall clock in whole Unix seconds, the unit every expiry is stored in.
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[derive(Debug, Default)]
struct Inner {
    /// Min-heap of (expiry, insertion seq, id). Superseded entries are
    /// lazily dropped at extraction.
    heap: BinaryHeap<Reverse<(u64, u64, u64)>>,
    /// Authoritative id → expiry view; a heap entry is live only if it
    /// matches.
    expiries: HashMap<u64, u64>,
    seq: u64,
}

/// Earliest-expiry index keyed by connection id, used by the idle reaper.
///
/// `renew` is nudged on every read and write completion; `extract` hands the
/// watcher one expired id at a time. Equal expiries extract in insertion
/// order.
#[derive(Debug)]
pub struct TimeoutCache {
    idle_timeout: u64,
    inner: Mutex<Inner>,
}

impl TimeoutCache {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: idle_timeout.as_secs(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Pushes the id's expiry to now + the configured idle timeout.
    pub fn renew(&self, id: u64) {
        self.update(id, now_secs() + self.idle_timeout);
    }

    /// Overrides the id's expiry with an absolute timestamp.
    pub fn update(&self, id: u64, expiry: u64) {
        let mut inner = self.inner.lock().expect("timeout cache lock poisoned");
        inner.expiries.insert(id, expiry);
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Reverse((expiry, seq, id)));
    }

    /// Forgets the id. It will not surface from `extract` again until
    /// renewed.
    pub fn clear(&self, id: u64) {
        let mut inner = self.inner.lock().expect("timeout cache lock poisoned");
        inner.expiries.remove(&id);
    }

    /// Removes and returns one id whose expiry is at or before `now`.
    pub fn extract(&self, now: u64) -> Option<u64> {
        let mut inner = self.inner.lock().expect("timeout cache lock poisoned");
        while let Some(&Reverse((expiry, _seq, id))) = inner.heap.peek() {
            if expiry > now {
                return None;
            }
            inner.heap.pop();
            // A heap entry is stale when a later renew/update/clear
            // superseded it.
            if inner.expiries.get(&id) == Some(&expiry) {
                inner.expiries.remove(&id);
                return Some(id);
            }
        }
        None
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner
            .lock()
            .expect("timeout cache lock poisoned")
            .expiries
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("timeout cache lock poisoned")
            .expiries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
