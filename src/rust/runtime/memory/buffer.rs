// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::pool::PoolShared,
};
use ::libc::EINVAL;
use ::std::{
    fmt,
    ops::{
        Deref,
        DerefMut,
    },
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A view into pooled or heap memory.
///
/// The storage is split in three regions: headroom (`0..head`), valid data (`head..head + len`) and tailroom. Headers
/// are stripped from the front with [Buffer::adjust] and attached with [Buffer::prepend], so inbound parsing and
/// outbound serialization never copy the payload.
///
/// A buffer that came from a [super::BufferPool] returns its storage to that pool when released (or dropped). Heap
/// buffers are simply freed.
pub struct Buffer {
    storage: Option<Box<[u8]>>,
    head: usize,
    len: usize,
    origin: Option<Arc<PoolShared>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Buffer {
    /// Creates a zeroed heap buffer with `headroom` reserved bytes in front of `len` valid bytes.
    pub fn new_heap(headroom: usize, len: usize) -> Self {
        Self {
            storage: Some(vec![0u8; headroom + len].into_boxed_slice()),
            head: headroom,
            len,
            origin: None,
        }
    }

    /// Creates a heap buffer holding a copy of `slice`, with no headroom.
    pub fn from_slice(slice: &[u8]) -> Self {
        Self::from_slice_with_headroom(0, slice)
    }

    /// Creates a heap buffer holding a copy of `slice`, preceded by `headroom` reserved bytes.
    pub fn from_slice_with_headroom(headroom: usize, slice: &[u8]) -> Self {
        let mut buf: Buffer = Self::new_heap(headroom, slice.len());
        buf.copy_from_slice(slice);
        buf
    }

    /// Wraps storage handed out by a pool.
    pub(super) fn from_pool(storage: Box<[u8]>, headroom: usize, len: usize, origin: Arc<PoolShared>) -> Self {
        debug_assert!(headroom + len <= storage.len());
        Self {
            storage: Some(storage),
            head: headroom,
            len,
            origin: Some(origin),
        }
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.len())
    }

    /// Bytes available in front of the valid region.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes available after the valid region.
    pub fn tailroom(&self) -> usize {
        self.capacity() - self.head - self.len
    }

    /// Whether this buffer's storage belongs to a pool.
    pub fn is_pool_owned(&self) -> bool {
        self.origin.is_some()
    }

    /// Removes `nbytes` from the beginning of the valid region.
    pub fn adjust(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.len {
            return Err(Fail::new(EINVAL, "tried to remove more bytes than are present"));
        }
        self.head += nbytes;
        self.len -= nbytes;
        Ok(())
    }

    /// Removes `nbytes` from the end of the valid region.
    pub fn trim(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.len {
            return Err(Fail::new(EINVAL, "tried to remove more bytes than are present"));
        }
        self.len -= nbytes;
        Ok(())
    }

    /// Grows the valid region by `nbytes` into the headroom. The new bytes hold whatever the headroom contained.
    pub fn prepend(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.head {
            return Err(Fail::new(EINVAL, "tried to prepend more bytes than the headroom holds"));
        }
        self.head -= nbytes;
        self.len += nbytes;
        Ok(())
    }

    /// Grows the valid region by `nbytes` into the tailroom.
    pub fn append(&mut self, nbytes: usize) -> Result<(), Fail> {
        if nbytes > self.tailroom() {
            return Err(Fail::new(EINVAL, "tried to append more bytes than the tailroom holds"));
        }
        self.len += nbytes;
        Ok(())
    }

    /// Explicitly hands the buffer back to its origin pool, or frees it if it was heap allocated.
    pub fn release(self) {
        drop(self)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.storage {
            Some(ref storage) => &storage[self.head..self.head + self.len],
            None => &[],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (head, len): (usize, usize) = (self.head, self.len);
        match self.storage {
            Some(ref mut storage) => &mut storage[head..head + len],
            None => &mut [],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(storage), Some(origin)) = (self.storage.take(), self.origin.take()) {
            origin.give_back(storage);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("headroom", &self.head)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("pooled", &self.is_pool_owned())
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}

impl Eq for Buffer {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
