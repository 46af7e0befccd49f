use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use crossbeam_channel::{Receiver, Sender};

use crate::{FacadeError, Result, VideoFormat};

/// Returned by [`FrameBufferPool::acquire`] when every buffer is in use.
///
/// This is backpressure, not a failure: the caller drops the frame it was
/// about to produce and tries again on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("frame buffer pool exhausted")
    }
}

/// Fixed-size, bounded pool of frame buffers sized for one [`VideoFormat`].
///
/// Buffers are allocated lazily up to `capacity` and recycled when the last
/// [`PooledBuffer`] handle is dropped. A pool is never resized; a format change
/// builds a new pool and [`retire`](Self::retire)s the old one, after which
/// buffers still in flight are freed instead of recycled.
#[derive(Clone)]
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    label: &'static str,
    frame_len: usize,
    capacity: usize,
    allocated: AtomicUsize,
    retired: AtomicBool,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl FrameBufferPool {
    /// Builds a pool for `format` and eagerly allocates `prewarm` buffers.
    ///
    /// Failing to allocate the prewarmed buffers is fatal for the caller.
    pub fn new(
        label: &'static str,
        format: &VideoFormat,
        capacity: usize,
        prewarm: usize,
    ) -> Result<Self> {
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity.max(1));
        let shared = Arc::new(PoolShared {
            label,
            frame_len: format.frame_len(),
            capacity,
            allocated: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            free_tx,
            free_rx,
        });

        for _ in 0..prewarm.min(capacity) {
            let data = allocate(shared.frame_len).ok_or(FacadeError::Allocation {
                bytes: shared.frame_len,
            })?;
            shared.allocated.fetch_add(1, Ordering::AcqRel);
            // The channel holds `capacity` slots so this cannot fail.
            let _ = shared.free_tx.try_send(data);
        }

        tracing::debug!(
            pool = label,
            frame_len = shared.frame_len,
            capacity,
            prewarm,
            "frame buffer pool ready"
        );

        Ok(Self { shared })
    }

    /// Hands out a free buffer without ever blocking.
    pub fn acquire(&self) -> std::result::Result<PooledBuffer, PoolExhausted> {
        if self.shared.retired.load(Ordering::Acquire) {
            return Err(PoolExhausted);
        }

        let data = match self.shared.free_rx.try_recv() {
            Ok(data) => data,
            Err(_) => self.grow()?,
        };

        Ok(PooledBuffer {
            data,
            pool: Arc::downgrade(&self.shared),
        })
    }

    fn grow(&self) -> std::result::Result<Vec<u8>, PoolExhausted> {
        let reserved = self
            .shared
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.shared.capacity).then_some(count + 1)
            });
        if reserved.is_err() {
            return Err(PoolExhausted);
        }

        match allocate(self.shared.frame_len) {
            Some(data) => Ok(data),
            None => {
                self.shared.allocated.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(pool = self.shared.label, "frame buffer allocation failed");
                Err(PoolExhausted)
            }
        }
    }

    /// Drops every idle buffer and stops recycling the ones still in flight.
    pub fn retire(&self) {
        self.shared.retired.store(true, Ordering::Release);
        while let Ok(data) = self.shared.free_rx.try_recv() {
            drop(data);
            self.shared.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Buffers currently allocated by the pool, idle or in flight.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Acquire)
    }

    /// Buffers currently handed out and not yet returned.
    pub fn in_flight(&self) -> usize {
        self.allocated().saturating_sub(self.shared.free_rx.len())
    }

    pub fn is_retired(&self) -> bool {
        self.shared.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("label", &self.shared.label)
            .field("frame_len", &self.shared.frame_len)
            .field("capacity", &self.shared.capacity)
            .field("allocated", &self.allocated())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A buffer on loan from a [`FrameBufferPool`]; returned to it on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Weak<PoolShared>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let data = std::mem::take(&mut self.data);
        if pool.retired.load(Ordering::Acquire) || pool.free_tx.try_send(data).is_err() {
            pool.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

fn allocate(len: usize) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).ok()?;
    data.resize(len, 0);
    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_format() -> VideoFormat {
        VideoFormat::new(16, 16, 30)
    }

    #[test]
    fn buffers_match_the_format_size() {
        let pool = FrameBufferPool::new("test", &small_format(), 2, 1).unwrap();
        let buffer = pool.acquire().unwrap();
        assert_eq!(buffer.len(), 16 * 16 * 4);
        assert_eq!(pool.frame_len(), 16 * 16 * 4);
    }

    #[test]
    fn exhausts_once_capacity_is_held() {
        let pool = FrameBufferPool::new("test", &small_format(), 3, 0).unwrap();
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

        assert_eq!(pool.acquire().unwrap_err(), PoolExhausted);
        assert_eq!(pool.in_flight(), 3);

        drop(held);
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn recycles_instead_of_reallocating() {
        let pool = FrameBufferPool::new("test", &small_format(), 4, 0).unwrap();
        for _ in 0..10 {
            let buffer = pool.acquire().unwrap();
            drop(buffer);
        }
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn retired_pool_frees_returning_buffers() {
        let pool = FrameBufferPool::new("test", &small_format(), 4, 2).unwrap();
        let in_flight = pool.acquire().unwrap();

        pool.retire();
        assert_eq!(pool.allocated(), 1);
        assert!(pool.acquire().is_err());

        drop(in_flight);
        assert_eq!(pool.allocated(), 0);
    }
}
