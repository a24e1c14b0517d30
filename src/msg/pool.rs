//! Bounded message pools.
//!
//! Every message variant and every payload buffer in the pipeline is drawn
//! from its own bounded pool, created once at pipeline construction.
//! Allocation blocks the caller when a pool is exhausted: this is the
//! pipeline's backpressure, not an error. A pool sized so small that it
//! blocks in steady state is a configuration error and shows up in the
//! pool's peak-used telemetry.
//!
//! Two handle flavours exist:
//!
//! * [`Pooled<T>`]: unique ownership. Message envelopes travel the pipeline
//!   as `Pooled` values; dropping the handle clears the cell and returns it
//!   to its pool.
//! * [`Shared<T>`]: shared ownership with an atomic reference count.
//!   Payload buffers (encoded bytes, decoded samples) are `Shared` so an
//!   audio split is a cheap second reference over the same cell. The last
//!   release clears the cell and returns it to its pool.
//!
//! Cells keep their internal heap capacity across recycles, so the audio
//! path never re-allocates payload storage once the pipeline is warm.

use std::{
    fmt,
    mem::size_of,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex},
};

/// A pool cell that can be cleared for reuse.
///
/// `reset` releases per-use state but must keep heap capacity where
/// possible (e.g. `Vec::clear`, not `Vec::new`).
pub trait Reset: Send {
    fn reset(&mut self);
}

/// Telemetry snapshot for one pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolStats {
    /// Pool name, for diagnostics.
    pub name: &'static str,
    /// Total cells the pool was created with.
    pub capacity: usize,
    /// Cells currently allocated to callers.
    pub used: usize,
    /// High-water mark of `used`.
    pub peak_used: usize,
    /// Size of one cell in bytes (the envelope only, not payload heap).
    pub cell_bytes: usize,
}

struct PoolState<T> {
    free: Vec<T>,
    used: usize,
    peak_used: usize,
}

struct PoolInner<T> {
    name: &'static str,
    capacity: usize,
    cell_bytes: usize,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T: Reset> PoolInner<T> {
    fn take(&self) -> T {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(cell) = state.free.pop() {
                state.used += 1;
                if state.used > state.peak_used {
                    state.peak_used = state.used;
                }
                return cell;
            }
            trace!("pool {} exhausted; blocking allocation", self.name);
            state = self.available.wait(state).unwrap();
        }
    }

    fn put(&self, mut cell: T) {
        cell.reset();
        let mut state = self.state.lock().unwrap();
        state.free.push(cell);
        state.used -= 1;
        drop(state);
        self.available.notify_one();
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            name: self.name,
            capacity: self.capacity,
            used: state.used,
            peak_used: state.peak_used,
            cell_bytes: self.cell_bytes,
        }
    }
}

/// A bounded pool of reusable cells.
///
/// Cloning a `Pool` clones a handle to the same underlying pool.
pub struct Pool<T: Reset> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Reset> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reset> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("name", &stats.name)
            .field("capacity", &stats.capacity)
            .field("used", &stats.used)
            .finish()
    }
}

impl<T: Reset> Pool<T> {
    /// Creates a pool of `capacity` cells produced by `make`.
    pub fn new(name: &'static str, capacity: usize, make: impl Fn() -> T) -> Self {
        let free = (0..capacity).map(|_| make()).collect();
        Self {
            inner: Arc::new(PoolInner {
                name,
                capacity,
                cell_bytes: size_of::<T>(),
                state: Mutex::new(PoolState {
                    free,
                    used: 0,
                    peak_used: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Allocates a uniquely-owned cell, blocking while the pool is
    /// exhausted.
    pub fn allocate(&self) -> Pooled<T> {
        Pooled {
            value: Some(self.inner.take()),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Allocates a shared (reference-counted) cell, blocking while the
    /// pool is exhausted.
    pub fn allocate_shared(&self) -> Shared<T> {
        Shared {
            value: Some(Arc::new(self.inner.take())),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Telemetry snapshot: `used + free == capacity` holds at all times.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }
}

/// Unique handle to a pool cell.
///
/// Dereferences to the cell value; dropping the handle resets the cell and
/// returns it to its pool.
pub struct Pooled<T: Reset> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Reset> Pooled<T> {
    /// Allocates a sibling cell from the same pool this handle came from.
    pub fn sibling(&self) -> Pooled<T> {
        Pooled {
            value: Some(self.pool.take()),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("cell present until drop")
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("cell present until drop")
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.value.take() {
            self.pool.put(cell);
        }
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// Shared handle to a pool cell.
///
/// Cloning takes another reference to the same cell. The cell is reset and
/// returned to its pool when the last handle drops.
pub struct Shared<T: Reset> {
    value: Option<Arc<T>>,
    pool: Arc<PoolInner<T>>,
}

impl<T: Reset> Shared<T> {
    /// Exclusive access to the cell, available only while this is the sole
    /// reference.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        Arc::get_mut(self.value.as_mut().expect("cell present until drop"))
    }

    /// Whether this handle is the only reference to the cell.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(self.value.as_ref().expect("cell present until drop")) == 1
    }
}

impl<T: Reset> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<T: Reset> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("cell present until drop")
    }
}

impl<T: Reset> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(arc) = self.value.take() {
            // `into_inner` succeeds for exactly one of any set of handles
            // racing to drop the same cell.
            if let Some(cell) = Arc::into_inner(arc) {
                self.pool.put(cell);
            }
        }
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}
