//! Reuse pools for receive, request and reply buffers
//!
//! A `Pool<T>` hands out `Pooled<T>` guards. Dropping a guard returns the item
//! exactly once. An empty pool allocates fresh instead of waiting.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

/// Idle items kept when no explicit cap is given
pub const DEFAULT_MAX_IDLE: usize = 256;

struct Slot<T> {
    item: T,
    uses: usize,
}

struct PoolInner<T> {
    idle: Mutex<Vec<Slot<T>>>,
    create: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    /// Uses before an item is retired, 0 = unlimited
    reuse_budget: usize,
    max_idle: usize,
    stats: PoolCounters,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    retired: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Items allocated because the pool was empty
    pub created: u64,
    /// Items handed out from the idle list
    pub reused: u64,
    /// Items dropped for exhausting their budget, corruption or the idle cap
    pub retired: u64,
    /// Items currently idle
    pub idle: usize,
}

/// Object pool with a per-item reuse budget
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Pool<T> {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.stats.created.load(Ordering::Relaxed),
            reused: self.inner.stats.reused.load(Ordering::Relaxed),
            retired: self.inner.stats.retired.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("reuse_budget", &self.inner.reuse_budget)
            .field("max_idle", &self.inner.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<C, R>(reuse_budget: usize, max_idle: usize, create: C, reset: R) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                create: Box::new(create),
                reset: Box::new(reset),
                reuse_budget,
                max_idle,
                stats: PoolCounters::default(),
            }),
        }
    }

    /// Take an item, allocating if none is idle
    pub fn take(&self) -> Pooled<T> {
        let slot = self.inner.idle.lock().pop();
        let slot = match slot {
            Some(slot) => {
                self.inner.stats.reused.fetch_add(1, Ordering::Relaxed);
                slot
            }
            None => {
                self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
                Slot {
                    item: (self.inner.create)(),
                    uses: 0,
                }
            }
        };

        Pooled {
            slot: Some(slot),
            pool: self.inner.clone(),
            corrupted: false,
        }
    }

    /// Drop every idle item
    pub fn clear(&self) {
        self.inner.idle.lock().clear();
    }
}

impl Pool<BytesMut> {
    /// Pool of byte buffers starting at `capacity`. Buffers that grew past
    /// `max_capacity` are not kept.
    pub fn buffers(capacity: usize, max_capacity: usize, reuse_budget: usize) -> Self {
        let max_capacity = max_capacity.max(capacity);
        Pool::new(
            reuse_budget,
            DEFAULT_MAX_IDLE,
            move || BytesMut::with_capacity(capacity),
            move |buf: &mut BytesMut| {
                buf.clear();
                if buf.capacity() > max_capacity {
                    *buf = BytesMut::with_capacity(capacity);
                }
            },
        )
    }
}

/// Item borrowed from a `Pool`
pub struct Pooled<T> {
    slot: Option<Slot<T>>,
    pool: Arc<PoolInner<T>>,
    corrupted: bool,
}

impl<T> Pooled<T> {
    /// Discard the item on drop instead of returning it
    pub fn mark_corrupted(&mut self) {
        self.corrupted = true;
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.slot {
            Some(slot) => &slot.item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.slot {
            Some(slot) => &mut slot.item,
            None => unreachable!("pooled item accessed after release"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(self.deref()).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut slot) = self.slot.take() else {
            return;
        };
        slot.uses += 1;

        let exhausted = self.pool.reuse_budget > 0 && slot.uses >= self.pool.reuse_budget;
        if self.corrupted || exhausted {
            self.pool.stats.retired.fetch_add(1, Ordering::Relaxed);
            return;
        }

        (self.pool.reset)(&mut slot.item);
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.max_idle {
            idle.push(slot);
        } else {
            drop(idle);
            self.pool.stats.retired.fetch_add(1, Ordering::Relaxed);
        }
    }
}
