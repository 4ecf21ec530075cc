//! Buffer pool and slot management.
//!
//! A [`BufferPool`] is one page-aligned, registered block split into
//! fixed-size slots. A [`SlotPool`] hands out slot indices and is the only
//! flow control of a connection: once all `max_inflight` indices are taken,
//! [`SlotPool::acquire`] suspends until one is released.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use verbs::{AccessFlags, MemoryRegion, ProtectionDomain};

use crate::error::{Error, Result};

/// Alignment of pool memory.
pub const PAGE_SIZE: usize = 4096;

/// Registered memory split into `num_slots` slots of `slot_size` bytes.
pub struct BufferPool {
    buffer: *mut u8,
    buffer_size: usize,
    mr: ManuallyDrop<MemoryRegion>,
    num_slots: usize,
    slot_size: usize,
}

// The pool owns its allocation; slot access is coordinated by the callers of
// the unsafe accessors.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Allocate and register a zeroed pool.
    pub fn new(pd: &Arc<ProtectionDomain>, num_slots: usize, slot_size: usize) -> Result<Self> {
        if num_slots == 0 || slot_size == 0 {
            return Err(Error::Config("buffer pool must have non-empty slots".into()));
        }
        let buffer_size = num_slots
            .checked_mul(slot_size)
            .ok_or_else(|| Error::Config("buffer pool size overflows".into()))?;

        let buffer = unsafe {
            let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, buffer_size);
            if ret != 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(ret)));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, buffer_size);
            ptr as *mut u8
        };

        let mr = match unsafe { pd.register(buffer, buffer_size, AccessFlags::LOCAL_WRITE) } {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { libc::free(buffer as *mut std::ffi::c_void) };
                return Err(e.into());
            }
        };

        Ok(Self {
            buffer,
            buffer_size,
            mr: ManuallyDrop::new(mr),
            num_slots,
            slot_size,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Memory region covering the whole pool.
    pub fn mr(&self) -> &MemoryRegion {
        &self.mr
    }

    /// Byte offset of slot `index` within the pool.
    pub fn slot_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.num_slots);
        index * self.slot_size
    }

    /// Slot `index` as a slice.
    ///
    /// # Safety
    /// The caller must own the slot and no work request may be writing it.
    pub unsafe fn slot(&self, index: usize) -> &[u8] {
        assert!(index < self.num_slots, "slot index {} out of range", index);
        unsafe { std::slice::from_raw_parts(self.buffer.add(self.slot_offset(index)), self.slot_size) }
    }

    /// Slot `index` as a mutable slice.
    ///
    /// # Safety
    /// The caller must own the slot exclusively and no work request may be
    /// reading or writing it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, index: usize) -> &mut [u8] {
        assert!(index < self.num_slots, "slot index {} out of range", index);
        unsafe {
            std::slice::from_raw_parts_mut(self.buffer.add(self.slot_offset(index)), self.slot_size)
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        tracing::trace!(bytes = self.buffer_size, "releasing buffer pool");
        // Deregister before freeing so no peer can copy into released memory.
        unsafe {
            ManuallyDrop::drop(&mut self.mr);
            libc::free(self.buffer as *mut std::ffi::c_void);
        }
    }
}

/// Hands out slot indices `0..num_slots`, at most one holder per index.
pub struct SlotPool {
    permits: Semaphore,
    free_list: Mutex<Vec<usize>>,
    num_slots: usize,
}

impl SlotPool {
    pub fn new(num_slots: usize) -> Self {
        Self {
            permits: Semaphore::new(num_slots),
            free_list: Mutex::new((0..num_slots).rev().collect()),
            num_slots,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a free slot, waiting while all are held.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the pool is closed.
    pub async fn acquire(&self) -> Result<SlotGuard<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        permit.forget();
        let index = self
            .free_list
            .lock()
            .pop()
            .ok_or_else(|| Error::Config("slot free list out of sync with permits".into()))?;
        Ok(SlotGuard {
            pool: self,
            index,
            armed: true,
        })
    }

    /// Return slot `index`.
    pub fn release(&self, index: usize) {
        debug_assert!(index < self.num_slots);
        self.free_list.lock().push(index);
        self.permits.add_permits(1);
    }

    /// Wake all waiters with an error and refuse further acquisitions.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A held slot. Released on drop unless [`SlotGuard::detach`]ed.
pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
    index: usize,
    armed: bool,
}

impl SlotGuard<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Keep the slot held after the guard is gone. Whoever learns that the
    /// slot is reusable must call [`SlotPool::release`] for it.
    pub fn detach(mut self) -> usize {
        self.armed = false;
        self.index
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.index);
        }
    }
}
