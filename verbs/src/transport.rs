//! Queue pair connection information.
//!
//! `QpInfo` is what two peers exchange out of band before connecting their
//! queue pairs. The encoded form is a fixed 26-byte big-endian record:
//!
//! ```text
//! 0      2          6          10                      26
//! ┌──────┬──────────┬──────────┬───────────────────────┐
//! │ lid  │  qp_num  │   psn    │          gid          │
//! └──────┴──────────┴──────────┴───────────────────────┘
//! ```

use std::io;

use crate::device::Gid;

/// Addressing information of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInfo {
    /// Local identifier of the port the queue pair lives on.
    pub lid: u16,
    /// Queue pair number.
    pub qp_num: u32,
    /// Initial packet sequence number.
    pub psn: u32,
    /// Global identifier of the port.
    pub gid: Gid,
}

impl QpInfo {
    /// Size of the encoded record in bytes.
    pub const ENCODED_LEN: usize = 26;

    /// Encode into the wire layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..2].copy_from_slice(&self.lid.to_be_bytes());
        buf[2..6].copy_from_slice(&self.qp_num.to_be_bytes());
        buf[6..10].copy_from_slice(&self.psn.to_be_bytes());
        buf[10..26].copy_from_slice(&self.gid);
        buf
    }

    /// Decode from the wire layout.
    ///
    /// # Errors
    /// Returns `InvalidData` if `buf` is not exactly [`Self::ENCODED_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "qp info must be {} bytes, got {}",
                    Self::ENCODED_LEN,
                    buf.len()
                ),
            ));
        }
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[10..26]);
        Ok(Self {
            lid: u16::from_be_bytes([buf[0], buf[1]]),
            qp_num: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            psn: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            gid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let info = QpInfo {
            lid: 0x0102,
            qp_num: 0x0304_0506,
            psn: 0x0708_090a,
            gid: [0xff; 16],
        };
        let buf = info.encode();
        assert_eq!(&buf[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(QpInfo::decode(&buf).unwrap(), info);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let err = QpInfo::decode(&[0u8; 25]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
