//! Device and port management.
//!
//! Opening a device assigns it a fabric-unique LID, the way a subnet manager
//! would for a physical port. The GID is derived from the LID with the
//! link-local `fe80::/64` prefix.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// 128-bit global identifier.
pub type Gid = [u8; 16];

/// Highest unicast LID.
const MAX_UNICAST_LID: u16 = 0xBFFF;

static NEXT_LID: AtomicU16 = AtomicU16::new(1);

/// Port attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    /// Local identifier assigned to the port.
    pub lid: u16,
    /// Global identifier of the port.
    pub gid: Gid,
    /// Active MTU in bytes.
    pub active_mtu: u32,
}

/// An opened device port.
///
/// Protection domains and completion queues are created from a device.
pub struct Device {
    device_nr: u32,
    port_nr: u8,
    port_attr: PortAttr,
}

impl Device {
    /// Open device `device_nr` on port `port_nr`.
    ///
    /// # Errors
    /// Returns `InvalidInput` for port 0 and an error once the LID space of
    /// the fabric is exhausted.
    pub fn open(device_nr: u32, port_nr: u8) -> io::Result<Arc<Self>> {
        if port_nr == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "port numbers start at 1",
            ));
        }

        let lid = NEXT_LID.fetch_add(1, Ordering::Relaxed);
        if lid == 0 || lid > MAX_UNICAST_LID {
            return Err(io::Error::other("LID space exhausted"));
        }

        let mut gid = [0u8; 16];
        gid[0] = 0xfe;
        gid[1] = 0x80;
        gid[8..12].copy_from_slice(&device_nr.to_be_bytes());
        gid[12] = port_nr;
        gid[14..16].copy_from_slice(&lid.to_be_bytes());

        tracing::debug!(device_nr, port_nr, lid, "opened software device");

        Ok(Arc::new(Self {
            device_nr,
            port_nr,
            port_attr: PortAttr {
                lid,
                gid,
                active_mtu: 4096,
            },
        }))
    }

    /// Device index this handle was opened with.
    pub fn device_nr(&self) -> u32 {
        self.device_nr
    }

    /// Port number this handle was opened with.
    pub fn port_nr(&self) -> u8 {
        self.port_nr
    }

    /// Query the port attributes.
    pub fn query_port(&self) -> PortAttr {
        self.port_attr
    }

    /// Local identifier of the port.
    pub fn lid(&self) -> u16 {
        self.port_attr.lid
    }

    /// Global identifier of the port.
    pub fn gid(&self) -> Gid {
        self.port_attr.gid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_assigns_distinct_lids() {
        let a = Device::open(0, 1).unwrap();
        let b = Device::open(0, 1).unwrap();
        assert_ne!(a.lid(), b.lid());
        assert_ne!(a.gid(), b.gid());
        assert_eq!(&a.gid()[..2], &[0xfe, 0x80]);
    }

    #[test]
    fn test_open_rejects_port_zero() {
        let err = Device::open(0, 0).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
