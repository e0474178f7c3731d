//! Process-wide slab cache for frame buffers.
//!
//! Every slab is one contiguous allocation of `k * 1024 + MAX_HEAD_SIZE` bytes,
//! so a frame header can be written directly in front of a payload stored at
//! offset [`MAX_HEAD_SIZE`] without moving the payload.
//!
//! Slabs are cached in 64 buckets of 1 KiB granularity. Requests above 64 KiB
//! are allocated exactly and dropped on return instead of being pooled.
//!
//! Each thread keeps a few slabs per bucket for itself and falls back to a
//! shared bucket behind a mutex, so the hot path never contends.

use std::{
    cell::RefCell,
    sync::{Mutex, OnceLock},
};

use crate::frame::MAX_HEAD_SIZE;

/// Number of 1 KiB buckets held by the pool.
pub const BUCKETS: usize = 64;

const PAGE: usize = 1024;

/// Per-bucket bound on the shared free list.
const SHARED_DEPTH: usize = 128;

/// Per-bucket bound on the thread-local free list.
const LOCAL_DEPTH: usize = 4;

/// Returns the bucket index for a slab of `len` bytes.
///
/// The index is `(len - MAX_HEAD_SIZE - 1) / 1024`; lengths that cannot hold
/// more than a header land in bucket 0.
#[inline]
pub fn bucket_index(len: usize) -> usize {
    len.saturating_sub(MAX_HEAD_SIZE + 1) / PAGE
}

/// Returns the exact slab size of bucket `index`.
#[inline]
pub fn bucket_size(index: usize) -> usize {
    (index + 1) * PAGE + MAX_HEAD_SIZE
}

/// Returns the slab size that serves a payload of `n` bytes.
#[inline]
fn slab_size(n: usize) -> usize {
    bucket_size(n.max(1).div_ceil(PAGE) - 1)
}

/// A bucketed slab cache.
///
/// The process-wide instance is reached through [`get`] and [`put`]; separate
/// instances are useful when a subsystem wants an isolated cache.
pub struct BufferPool {
    buckets: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Returns a slab with room for `n` payload bytes plus a frame header. The
    /// returned vector's length equals its slab size.
    ///
    /// Only freshly allocated slabs are zeroed; a reused slab still holds the
    /// bytes of its previous use.
    pub fn get(&self, n: usize) -> Vec<u8> {
        let size = slab_size(n);
        let index = bucket_index(size);
        if index >= BUCKETS {
            return vec![0u8; n + MAX_HEAD_SIZE];
        }

        let cached = self.buckets[index]
            .lock()
            .ok()
            .and_then(|mut bucket| bucket.pop());

        cached.unwrap_or_else(|| vec![0u8; size])
    }

    /// Returns a slab to its bucket. Slabs that do not match a bucket size
    /// (oversized or foreign buffers) are dropped.
    pub fn put(&self, slab: Vec<u8>) {
        if let Some((index, slab)) = normalize(slab) {
            if let Ok(mut bucket) = self.buckets[index].lock() {
                if bucket.len() < SHARED_DEPTH {
                    bucket.push(slab);
                }
            }
        }
    }
}

/// Validates a returned slab and restores its full length.
fn normalize(mut slab: Vec<u8>) -> Option<(usize, Vec<u8>)> {
    let cap = slab.capacity();
    let index = bucket_index(cap);
    if index >= BUCKETS {
        return None;
    }
    let size = bucket_size(index);
    if cap < size {
        return None;
    }
    slab.resize(size, 0);
    Some((index, slab))
}

fn shared() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

thread_local! {
    static LOCAL: RefCell<Vec<Vec<Vec<u8>>>> = RefCell::new(vec![Vec::new(); BUCKETS]);
}

/// Takes a slab for `n` payload bytes from the process-wide pool.
pub fn get(n: usize) -> Vec<u8> {
    let index = bucket_index(slab_size(n));
    if index < BUCKETS {
        let local = LOCAL
            .try_with(|local| local.borrow_mut()[index].pop())
            .ok()
            .flatten();
        if let Some(slab) = local {
            return slab;
        }
    }
    shared().get(n)
}

/// Returns a slab to the process-wide pool.
pub fn put(slab: Vec<u8>) {
    let Some((index, slab)) = normalize(slab) else {
        return;
    };

    let overflow = LOCAL
        .try_with(|local| {
            let mut local = local.borrow_mut();
            if local[index].len() < LOCAL_DEPTH {
                local[index].push(slab);
                None
            } else {
                Some(slab)
            }
        })
        .unwrap_or(None);

    if let Some(slab) = overflow {
        shared().put(slab);
    }
}
