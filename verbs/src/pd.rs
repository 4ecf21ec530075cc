//! Protection Domain and Memory Region management.
//!
//! Memory must be registered within a protection domain before a queue pair
//! created in that domain can gather from or scatter into it. Every work
//! request names its buffer by `(addr, length, lkey)`; the domain checks the
//! range against the registration before the device touches the memory.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::device::Device;
use crate::qp::Sge;

bitflags! {
    /// Memory access flags for Memory Region registration.
    ///
    /// Local read access is always enabled.
    ///
    /// # Important
    /// If `REMOTE_WRITE` is set, then `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access (required for receive buffers).
        const LOCAL_WRITE = 1 << 0;
        /// Enable remote write access.
        const REMOTE_WRITE = 1 << 1;
        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
    }
}

static NEXT_KEY: AtomicU32 = AtomicU32::new(0x100);

struct RegionEntry {
    addr: u64,
    len: usize,
    access: AccessFlags,
}

/// Protection Domain.
pub struct ProtectionDomain {
    device: Arc<Device>,
    regions: Mutex<HashMap<u32, RegionEntry>>,
}

impl Device {
    /// Allocate a Protection Domain on this device.
    pub fn alloc_pd(self: &Arc<Self>) -> io::Result<Arc<ProtectionDomain>> {
        Ok(Arc::new(ProtectionDomain {
            device: Arc::clone(self),
            regions: Mutex::new(HashMap::new()),
        }))
    }
}

impl ProtectionDomain {
    /// Device this domain was allocated on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Register a memory region.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - `addr` points to `len` bytes of valid memory
    /// - the memory stays valid until the returned `MemoryRegion` is dropped
    /// - nothing else accesses the memory while a work request that names it
    ///   is outstanding
    ///
    /// # Errors
    /// Returns `InvalidInput` for a null or empty range, or when
    /// `REMOTE_WRITE` is requested without `LOCAL_WRITE`.
    pub unsafe fn register(
        self: &Arc<Self>,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "memory region must be non-empty",
            ));
        }
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "REMOTE_WRITE requires LOCAL_WRITE",
            ));
        }

        let lkey = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().insert(
            lkey,
            RegionEntry {
                addr: addr as u64,
                len,
                access,
            },
        );

        Ok(MemoryRegion {
            pd: Arc::clone(self),
            addr: addr as u64,
            len,
            lkey,
        })
    }

    /// Run `f` with a pointer to the memory named by `sge`.
    ///
    /// The registration lock is held while `f` runs, so the region cannot be
    /// deregistered (and its memory released) underneath the copy.
    pub(crate) fn with_sge<R>(
        &self,
        sge: &Sge,
        write: bool,
        f: impl FnOnce(*mut u8) -> R,
    ) -> io::Result<R> {
        let regions = self.regions.lock();
        let entry = regions.get(&sge.lkey).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("unknown lkey {:#x}", sge.lkey),
            )
        })?;

        if write && !entry.access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "memory region is not locally writable",
            ));
        }

        let end = sge.addr.checked_add(sge.length as u64);
        let region_end = entry.addr + entry.len as u64;
        match end {
            Some(end) if sge.addr >= entry.addr && end <= region_end => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "sge [{:#x}, +{}) outside memory region [{:#x}, +{})",
                        sge.addr, sge.length, entry.addr, entry.len
                    ),
                ));
            }
        }

        Ok(f(sge.addr as *mut u8))
    }

    fn deregister(&self, lkey: u32) {
        self.regions.lock().remove(&lkey);
    }
}

/// Registered memory region.
///
/// Deregistered when dropped.
pub struct MemoryRegion {
    pd: Arc<ProtectionDomain>,
    addr: u64,
    len: usize,
    lkey: u32,
}

impl MemoryRegion {
    /// Local key.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// Remote key. The software device uses one key for both.
    pub fn rkey(&self) -> u32 {
        self.lkey
    }

    /// Start address of the region.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty (never true for a registered region).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Scatter/gather element covering `len` bytes at `offset`.
    pub fn sge(&self, offset: usize, len: usize) -> Sge {
        Sge {
            addr: self.addr + offset as u64,
            length: len as u32,
            lkey: self.lkey,
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.pd.deregister(self.lkey);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let device = Device::open(0, 1).unwrap();
        let pd = device.alloc_pd().unwrap();
        let mut buf = vec![0u8; 64];
        let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::LOCAL_WRITE) }
            .unwrap();

        let sge = mr.sge(16, 16);
        let ptr = pd.with_sge(&sge, true, |ptr| ptr as u64).unwrap();
        assert_eq!(ptr, buf.as_ptr() as u64 + 16);

        let out_of_range = mr.sge(60, 8);
        assert!(pd.with_sge(&out_of_range, false, |_| ()).is_err());
    }

    #[test]
    fn test_read_only_region_rejects_write() {
        let device = Device::open(0, 1).unwrap();
        let pd = device.alloc_pd().unwrap();
        let mut buf = vec![0u8; 32];
        let mr =
            unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::empty()) }.unwrap();
        assert!(pd.with_sge(&mr.sge(0, 8), true, |_| ()).is_err());
        assert!(pd.with_sge(&mr.sge(0, 8), false, |_| ()).is_ok());
    }

    #[test]
    fn test_drop_deregisters() {
        let device = Device::open(0, 1).unwrap();
        let pd = device.alloc_pd().unwrap();
        let mut buf = vec![0u8; 32];
        let mr = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::LOCAL_WRITE) }
            .unwrap();
        let sge = mr.sge(0, 8);
        drop(mr);
        let err = pd.with_sge(&sge, false, |_| ()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_remote_write_requires_local_write() {
        let device = Device::open(0, 1).unwrap();
        let pd = device.alloc_pd().unwrap();
        let mut buf = vec![0u8; 32];
        let res = unsafe { pd.register(buf.as_mut_ptr(), buf.len(), AccessFlags::REMOTE_WRITE) };
        assert!(res.is_err());
    }
}
