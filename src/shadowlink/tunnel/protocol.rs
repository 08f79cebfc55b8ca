//! Open record written at the start of every relayed logical stream.
//!
//! Layout: `magic[4] | version:u8 | service:u16be | varint len | target`.
//! An empty target asks the receiver to resolve the service index against
//! its own PortMap table.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAGIC_TCP: &[u8; 4] = b"SLTC";
const MAGIC_UDP: &[u8; 4] = b"SLUD";
const PROTOCOL_V1: u8 = 1;

pub const MAX_TARGET_BYTES: u32 = 1024;
pub const MAX_DATAGRAM_BYTES: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("malformed varint")]
    BadVarint,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Tcp => "tcp",
            StreamKind::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub kind: StreamKind,
    pub service: u16,
    /// `host:port` to dial; empty means "look up `service` locally".
    pub target: String,
}

pub async fn write_open_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    rec: &OpenRecord,
) -> Result<(), ProtocolError> {
    let target = rec.target.trim().as_bytes();
    let len: u32 = target.len().try_into().unwrap_or(u32::MAX);
    if len > MAX_TARGET_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    // One write so the record travels in a single data frame.
    let mut buf = Vec::with_capacity(4 + 1 + 2 + 5 + target.len());
    buf.extend_from_slice(match rec.kind {
        StreamKind::Tcp => MAGIC_TCP,
        StreamKind::Udp => MAGIC_UDP,
    });
    buf.push(PROTOCOL_V1);
    buf.extend_from_slice(&rec.service.to_be_bytes());
    put_varint(&mut buf, len);
    buf.extend_from_slice(target);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_open_record<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<OpenRecord, ProtocolError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    let kind = match &magic {
        m if m == MAGIC_TCP => StreamKind::Tcp,
        m if m == MAGIC_UDP => StreamKind::Udp,
        _ => return Err(ProtocolError::BadMagic),
    };

    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion(ver));
    }

    let service = r.read_u16().await?;
    let len = read_varint(r).await?;
    if len > MAX_TARGET_BYTES {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    let target = String::from_utf8_lossy(&buf).trim().to_string();

    Ok(OpenRecord {
        kind,
        service,
        target,
    })
}

fn put_varint(buf: &mut Vec<u8>, mut v: u32) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = r.read_u8().await?;
        result |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(ProtocolError::BadVarint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_record_roundtrip_trims_target() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let rec = OpenRecord {
            kind: StreamKind::Udp,
            service: 513,
            target: "  127.0.0.1:53 ".into(),
        };
        write_open_record(&mut a, &rec).await.unwrap();

        let got = read_open_record(&mut b).await.unwrap();
        assert_eq!(got.kind, StreamKind::Udp);
        assert_eq!(got.service, 513);
        assert_eq!(got.target, "127.0.0.1:53");
    }

    #[tokio::test]
    async fn empty_target_means_lookup_by_index() {
        let mut wire = Vec::new();
        let rec = OpenRecord {
            kind: StreamKind::Tcp,
            service: 2,
            target: String::new(),
        };
        write_open_record(&mut wire, &rec).await.unwrap();
        assert_eq!(wire, b"SLTC\x01\x00\x02\x00");
        assert_eq!(read_open_record(&mut &wire[..]).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn long_target_uses_multibyte_varint() {
        let mut wire = Vec::new();
        let rec = OpenRecord {
            kind: StreamKind::Tcp,
            service: 0,
            target: "a".repeat(300),
        };
        write_open_record(&mut wire, &rec).await.unwrap();
        assert_eq!(&wire[7..9], &[0xac, 0x02]);
        assert_eq!(read_open_record(&mut &wire[..]).await.unwrap().target.len(), 300);
    }

    #[tokio::test]
    async fn rejects_bad_magic_version_and_size() {
        let bad: &[u8] = b"HTTP\x01\x00\x00\x00";
        assert!(matches!(
            read_open_record(&mut &bad[..]).await,
            Err(ProtocolError::BadMagic)
        ));

        let bad: &[u8] = b"SLTC\x02\x00\x00\x00";
        assert!(matches!(
            read_open_record(&mut &bad[..]).await,
            Err(ProtocolError::BadVersion(2))
        ));

        let mut wire = b"SLTC\x01\x00\x00".to_vec();
        put_varint(&mut wire, MAX_TARGET_BYTES + 1);
        assert!(matches!(
            read_open_record(&mut &wire[..]).await,
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
