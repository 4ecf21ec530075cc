//! Bootstrap handshake.
//!
//! Endpoints are negotiated over an ordinary byte stream before any verbs
//! traffic flows. All integers are big-endian.
//!
//! ```text
//! Handshake record (multi-endpoint connect only, connector → acceptor):
//! ┌──────────────────┬──────────────────────────────┐
//! │ endpoint_count:4 │         session_id:8         │
//! └──────────────────┴──────────────────────────────┘
//!
//! Endpoint descriptor (once per endpoint, in both directions):
//! ┌────────────┬──────────────────┬─────────────┬───────────┐
//! │ body_len:4 │  QpInfo (26)     │ ud_len:4    │ user data │
//! └────────────┴──────────────────┴─────────────┴───────────┘
//!               ╰──────────────── body_len ───────────────╯
//! ```
//!
//! The connector writes each descriptor first and then reads the acceptor's.
//! Exchanges are strictly sequential on one stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use verbs::QpInfo;

use crate::error::{Error, Result};

/// Largest user-data blob accepted in a descriptor.
pub const MAX_USER_DATA: usize = 64 * 1024;

/// Request for a multi-endpoint connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Handshake {
    /// Number of endpoints to establish.
    pub endpoint_count: u32,
    /// Caller-chosen id tagging every endpoint of the session.
    pub session_id: u64,
}

impl Handshake {
    /// Size of the encoded record in bytes.
    pub const ENCODED_LEN: usize = 12;

    pub fn new(endpoint_count: u32, session_id: u64) -> Self {
        Self {
            endpoint_count,
            session_id,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..4].copy_from_slice(&self.endpoint_count.to_be_bytes());
        buf[4..].copy_from_slice(&self.session_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut count = [0u8; 4];
        let mut sid = [0u8; 8];
        count.copy_from_slice(&buf[..4]);
        sid.copy_from_slice(&buf[4..]);
        Self {
            endpoint_count: u32::from_be_bytes(count),
            session_id: u64::from_be_bytes(sid),
        }
    }
}

/// Connection parameters of one endpoint plus opaque user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub qp: QpInfo,
    pub user_data: Vec<u8>,
}

/// Write a handshake record.
pub async fn send_handshake<W>(stream: &mut W, handshake: &Handshake) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&handshake.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a handshake record.
pub async fn recv_handshake<R>(stream: &mut R) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; Handshake::ENCODED_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(Handshake::decode(&buf))
}

/// Write one endpoint descriptor.
pub async fn send_endpoint<W>(stream: &mut W, desc: &EndpointDescriptor) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if desc.user_data.len() > MAX_USER_DATA {
        return Err(Error::Handshake(format!(
            "user data of {} bytes exceeds {}",
            desc.user_data.len(),
            MAX_USER_DATA
        )));
    }
    let ud_len = desc.user_data.len() as u32;
    let body_len = (QpInfo::ENCODED_LEN + 4) as u32 + ud_len;

    let mut frame = Vec::with_capacity(4 + body_len as usize);
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(&desc.qp.encode());
    frame.extend_from_slice(&ud_len.to_be_bytes());
    frame.extend_from_slice(&desc.user_data);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one endpoint descriptor.
pub async fn recv_endpoint<R>(stream: &mut R) -> Result<EndpointDescriptor>
where
    R: AsyncRead + Unpin,
{
    let body_len = stream.read_u32().await? as usize;
    let fixed = QpInfo::ENCODED_LEN + 4;
    if body_len < fixed || body_len > fixed + MAX_USER_DATA {
        return Err(Error::Handshake(format!(
            "invalid descriptor length {}",
            body_len
        )));
    }

    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;

    let qp = QpInfo::decode(&body[..QpInfo::ENCODED_LEN])
        .map_err(|e| Error::Handshake(e.to_string()))?;
    let mut ud_len = [0u8; 4];
    ud_len.copy_from_slice(&body[QpInfo::ENCODED_LEN..fixed]);
    let ud_len = u32::from_be_bytes(ud_len) as usize;
    if fixed + ud_len != body_len {
        return Err(Error::Handshake(format!(
            "user data length {} disagrees with descriptor length {}",
            ud_len, body_len
        )));
    }

    body.drain(..fixed);
    Ok(EndpointDescriptor {
        qp,
        user_data: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qp_info(qp_num: u32) -> QpInfo {
        QpInfo {
            lid: 7,
            qp_num,
            psn: 0x1234,
            gid: [0xab; 16],
        }
    }

    #[test]
    fn test_record_layout() {
        let hs = Handshake::new(3, 0x0102_0304_0506_0708);
        assert_eq!(
            hs.encode(),
            [0, 0, 0, 3, 1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(Handshake::decode(&hs.encode()), hs);
    }

    #[tokio::test]
    async fn test_descriptor_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let desc = EndpointDescriptor {
            qp: qp_info(0x55),
            user_data: b"tenant-a".to_vec(),
        };
        send_endpoint(&mut a, &desc).await.unwrap();
        let got = recv_endpoint(&mut b).await.unwrap();
        assert_eq!(got, desc);
    }

    #[tokio::test]
    async fn test_handshake_then_descriptors_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        send_handshake(&mut a, &Handshake::new(2, 99)).await.unwrap();
        for qpn in [1, 2] {
            let desc = EndpointDescriptor {
                qp: qp_info(qpn),
                user_data: Vec::new(),
            };
            send_endpoint(&mut a, &desc).await.unwrap();
        }

        let hs = recv_handshake(&mut b).await.unwrap();
        assert_eq!(hs, Handshake::new(2, 99));
        assert_eq!(recv_endpoint(&mut b).await.unwrap().qp.qp_num, 1);
        assert_eq!(recv_endpoint(&mut b).await.unwrap().qp.qp_num, 2);
    }

    #[tokio::test]
    async fn test_inconsistent_lengths_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut frame = Vec::new();
        frame.extend_from_slice(&34u32.to_be_bytes());
        frame.extend_from_slice(&qp_info(1).encode());
        frame.extend_from_slice(&9u32.to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        a.write_all(&frame).await.unwrap();
        assert!(matches!(
            recv_endpoint(&mut b).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_user_data_rejected() {
        let (mut a, _b) = tokio::io::duplex(16);
        let desc = EndpointDescriptor {
            qp: qp_info(1),
            user_data: vec![0u8; MAX_USER_DATA + 1],
        };
        assert!(matches!(
            send_endpoint(&mut a, &desc).await,
            Err(Error::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(recv_handshake(&mut b).await, Err(Error::Io(_))));
    }
}
