use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::shadowlink::tunnel::protocol::{MAX_DATAGRAM_BYTES, ProtocolError};

/// Datagram framing over a logical stream.
///
/// Each datagram is encoded as: `u32be len` + `payload`. The halves are
/// separate so a UDP relay can pump both directions concurrently.
pub struct DatagramReader<R> {
    inner: R,
}

impl<R> DatagramReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub async fn read_datagram(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let n = self.inner.read_u32().await?;
        if n > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        let n = n as usize;
        if n > out.len() {
            // Drain to keep stream aligned.
            let mut drain = vec![0u8; n];
            self.inner.read_exact(&mut drain).await?;
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "short buffer",
            )));
        }
        self.inner.read_exact(&mut out[..n]).await?;
        Ok(n)
    }
}

pub struct DatagramWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W> DatagramWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    pub async fn write_datagram(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let n: u32 = payload
            .len()
            .try_into()
            .map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX))?;
        if n > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(n));
        }
        // Prefix and payload in one write keep a datagram inside one frame.
        self.buf.clear();
        self.buf.extend_from_slice(&n.to_be_bytes());
        self.buf.extend_from_slice(payload);
        self.inner.write_all(&self.buf).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_keep_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let mut w = DatagramWriter::new(a);
        let mut r = DatagramReader::new(b);

        w.write_datagram(b"one").await.unwrap();
        w.write_datagram(b"").await.unwrap();
        w.write_datagram(b"three").await.unwrap();

        let mut buf = [0u8; 64];
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        assert_eq!(r.read_datagram(&mut buf).await.unwrap(), 0);
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"three");
    }

    #[tokio::test]
    async fn oversized_datagram_is_drained() {
        let (a, b) = tokio::io::duplex(1024);
        let mut w = DatagramWriter::new(a);
        let mut r = DatagramReader::new(b);

        w.write_datagram(&[9u8; 16]).await.unwrap();
        w.write_datagram(b"ok").await.unwrap();

        let mut small = [0u8; 4];
        assert!(r.read_datagram(&mut small).await.is_err());
        let n = r.read_datagram(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ok");
    }
}
