// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::{
    fail::Fail,
    memory::Buffer,
    queue::BoundedQueue,
};
use ::libc::{
    EINVAL,
    ENOMEM,
};
use ::std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// State shared between a [BufferPool] and every [Buffer] it handed out.
pub struct PoolShared {
    /// Free slots. Owning a slot's storage is what makes it outstanding, so two live buffers can never alias.
    free: BoundedQueue<Box<[u8]>>,
    /// Number of slots carved at creation.
    amount: usize,
    /// Size of every slot, in bytes.
    slot_size: usize,
    /// Headroom reserved in front of the data of freshly acquired buffers.
    headroom: usize,
    /// Number of acquisitions served from the heap.
    fallbacks: AtomicUsize,
}

/// A pool of equally sized packet buffers. Cloning the pool shares it.
#[derive(Clone)]
pub struct BufferPool(Arc<PoolShared>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl PoolShared {
    pub(super) fn give_back(&self, storage: Box<[u8]>) {
        if storage.len() != self.slot_size {
            panic!("give_back(): buffer of {} bytes does not belong to this pool", storage.len());
        }
        if self.free.push(storage).is_err() {
            panic!("give_back(): free list overflow, a slot was returned twice");
        }
    }
}

impl BufferPool {
    /// Carves `amount` slots of `slot_size` bytes. Acquired buffers keep `headroom` bytes free for headers.
    pub fn new(amount: usize, slot_size: usize, headroom: usize) -> Result<Self, Fail> {
        if amount == 0 || slot_size == 0 {
            return Err(Fail::new(EINVAL, "pool must hold at least one non-empty slot"));
        }
        if headroom >= slot_size {
            return Err(Fail::new(EINVAL, "headroom must be smaller than the slot size"));
        }
        let free: BoundedQueue<Box<[u8]>> = BoundedQueue::new(amount.next_power_of_two())?;
        for _ in 0..amount {
            if free.push(vec![0u8; slot_size].into_boxed_slice()).is_err() {
                return Err(Fail::new(ENOMEM, "free list cannot hold every slot"));
            }
        }
        trace!("new(): amount={} slot_size={} headroom={}", amount, slot_size, headroom);
        Ok(Self(Arc::new(PoolShared {
            free,
            amount,
            slot_size,
            headroom,
            fallbacks: AtomicUsize::new(0),
        })))
    }

    /// Acquires a buffer with `size` valid bytes. Never blocks: when the pool is exhausted, or `size` does not fit in
    /// a slot, the buffer is heap allocated and flagged as not pool-owned.
    pub fn acquire(&self, size: usize) -> Buffer {
        let headroom: usize = self.0.headroom;
        if headroom + size <= self.0.slot_size {
            if let Some(storage) = self.0.free.pop() {
                return Buffer::from_pool(storage, headroom, size, self.0.clone());
            }
            warn!("acquire(): pool exhausted, falling back to heap (outstanding={})", self.outstanding());
        } else {
            debug!("acquire(): {} bytes do not fit in a {} byte slot", size, self.0.slot_size);
        }
        self.0.fallbacks.fetch_add(1, Ordering::Relaxed);
        Buffer::new_heap(headroom, size)
    }

    /// Acquires a buffer spanning all the room a slot has after the headroom. Used to receive frames of unknown size.
    pub fn acquire_max(&self) -> Buffer {
        self.acquire(self.0.slot_size - self.0.headroom)
    }

    /// Returns a buffer to the pool. Heap buffers are freed.
    pub fn release(&self, buf: Buffer) {
        buf.release()
    }

    /// Number of pool-owned buffers currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.0.amount - self.0.free.len()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.0.free.len()
    }

    pub fn amount(&self) -> usize {
        self.0.amount
    }

    pub fn slot_size(&self) -> usize {
        self.0.slot_size
    }

    pub fn headroom(&self) -> usize {
        self.0.headroom
    }

    /// Number of acquisitions that were served from the heap.
    pub fn heap_fallbacks(&self) -> usize {
        self.0.fallbacks.load(Ordering::Relaxed)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
