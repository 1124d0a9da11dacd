//! Process-wide call-id allocation.
//!
//! Call ids must be unique among in-flight calls so that responses
//! arriving on any pipe can be routed to the right task.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::RngCore;

/// Monotonic allocator of call identifiers in `[1, 2^31)`.
///
/// The counter starts from cryptographic entropy so ids do not repeat in
/// a predictable pattern across master restarts. An id stays reserved
/// until [`IdPool::release`] is called.
#[derive(Debug)]
pub struct IdPool {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    used: HashSet<u64>,
    next: u64,
}

impl IdPool {
    /// Creates a pool seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        let next = rand::rngs::OsRng.next_u64();
        Self {
            inner: Mutex::new(Inner {
                used: HashSet::new(),
                next,
            }),
        }
    }

    /// Reserves and returns the next free id.
    ///
    /// Ids are masked to 31 bits; 0 and currently-issued ids are skipped.
    #[must_use]
    pub fn acquire(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = inner.next & 0x7fff_ffff;
            inner.next = inner.next.wrapping_add(1);
            if id == 0 || inner.used.contains(&id) {
                continue;
            }
            inner.used.insert(id);
            return id;
        }
    }

    /// Returns an id to the pool.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this pool — that is a logic
    /// error in the caller, never a runtime condition.
    pub fn release(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        assert!(inner.used.remove(&id), "release of unissued call id {id}");
    }

    /// Number of currently-issued ids.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).used.len()
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}
