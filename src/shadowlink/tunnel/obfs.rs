//! Wire-shape obfuscation between the secure channel and the multiplexer.
//!
//! Outbound data frames may be preceded by a burst of padding frames and
//! delayed by a random jitter. Inbound padding is dropped before the
//! multiplexer sees it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rand::{RngExt, rng};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::shadowlink::tunnel::{
    error::TunnelError,
    frame::{Frame, FrameType},
    secure::{OpenedReader, SealedWriter},
};

const MAX_BURST: usize = 3;

/// Frames leaving a physical connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TunnelError>;
}

/// Frames arriving on a physical connection, padding already removed.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv_frame(&mut self) -> Result<Frame, TunnelError>;
}

#[derive(Debug, Clone)]
pub struct ObfsConfig {
    pub enabled: bool,
    pub min_padding: usize,
    pub max_padding: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub burst_chance: f64,
}

impl ObfsConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            min_padding: 0,
            max_padding: 0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            burst_chance: 0.0,
        }
    }

    /// Padding frame sizes to emit ahead of the next data frame.
    fn plan_burst(&self) -> Vec<usize> {
        if !self.enabled || self.burst_chance <= 0.0 || self.max_padding == 0 {
            return Vec::new();
        }
        let mut r = rng();
        if !r.random_bool(self.burst_chance.min(1.0)) {
            return Vec::new();
        }
        let count = r.random_range(1..=MAX_BURST);
        let lo = self.min_padding.min(self.max_padding);
        (0..count)
            .map(|_| r.random_range(lo..=self.max_padding))
            .collect()
    }

    fn plan_delay(&self) -> Duration {
        if !self.enabled || self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let lo = self.min_delay.min(self.max_delay).as_millis() as u64;
        let hi = self.max_delay.as_millis() as u64;
        Duration::from_millis(rng().random_range(lo..=hi))
    }
}

pub struct ObfsWriter<W> {
    inner: SealedWriter<W>,
    cfg: ObfsConfig,
    buf: BytesMut,
}

impl<W> ObfsWriter<W> {
    pub fn new(inner: SealedWriter<W>, cfg: ObfsConfig) -> Self {
        Self {
            inner,
            cfg,
            buf: BytesMut::new(),
        }
    }
}

impl<W> ObfsWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), TunnelError> {
        self.buf.clear();
        frame.encode(&mut self.buf);
        self.inner.write_record(&self.buf).await
    }
}

#[async_trait]
impl<W> FrameSink for ObfsWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        if frame.kind == FrameType::Data {
            for len in self.cfg.plan_burst() {
                self.write_frame(&Frame::padding(len)).await?;
            }
            let delay = self.cfg.plan_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.write_frame(&frame).await
    }
}

pub struct ObfsReader<R> {
    inner: OpenedReader<R>,
    max_payload: usize,
}

impl<R> ObfsReader<R> {
    pub fn new(inner: OpenedReader<R>, max_payload: usize) -> Self {
        Self { inner, max_payload }
    }
}

#[async_trait]
impl<R> FrameSource for ObfsReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv_frame(&mut self) -> Result<Frame, TunnelError> {
        loop {
            let record = self.inner.read_record().await?;
            let frame = Frame::decode(record, self.max_payload)?;
            if frame.kind == FrameType::Padding {
                if frame.stream_id != 0 {
                    return Err(TunnelError::protocol("padding frame with stream id"));
                }
                continue;
            }
            return Ok(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::shadowlink::tunnel::secure::{Algorithm, SALT_LEN, derive_keys, max_record_body};

    fn pair(
        cfg: ObfsConfig,
    ) -> (
        ObfsWriter<tokio::io::DuplexStream>,
        ObfsReader<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let tx = derive_keys(b"psk", &[3u8; SALT_LEN], Algorithm::ChaCha20Poly1305).unwrap();
        let rx = derive_keys(b"psk", &[3u8; SALT_LEN], Algorithm::ChaCha20Poly1305).unwrap();
        let w = ObfsWriter::new(SealedWriter::new(a, tx.client_to_server), cfg);
        let r = ObfsReader::new(
            OpenedReader::new(b, rx.client_to_server, max_record_body(70_000)),
            70_000,
        );
        (w, r)
    }

    fn noisy() -> ObfsConfig {
        ObfsConfig {
            enabled: true,
            min_padding: 1,
            max_padding: 512,
            min_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(3),
            burst_chance: 1.0,
        }
    }

    #[tokio::test]
    async fn padding_and_jitter_are_transparent() {
        let (mut w, mut r) = pair(noisy());
        let payloads: Vec<Bytes> = [0usize, 1, 17, 1024, 65_536]
            .iter()
            .enumerate()
            .map(|(i, n)| Bytes::from(vec![i as u8; *n]))
            .collect();

        let sent = payloads.clone();
        let writer = tokio::spawn(async move {
            for (i, p) in sent.into_iter().enumerate() {
                w.send_frame(Frame::data(i as u32 * 2 + 1, p)).await.unwrap();
            }
            w.send_frame(Frame::ping(9)).await.unwrap();
        });

        for (i, p) in payloads.iter().enumerate() {
            let f = r.recv_frame().await.unwrap();
            assert_eq!(f.kind, FrameType::Data);
            assert_eq!(f.stream_id, i as u32 * 2 + 1);
            assert_eq!(&f.payload, p);
        }
        assert_eq!(r.recv_frame().await.unwrap().kind, FrameType::Ping);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_config_writes_no_padding() {
        let cfg = ObfsConfig::disabled();
        assert!(cfg.plan_burst().is_empty());
        assert!(cfg.plan_delay().is_zero());

        let cfg = noisy();
        for _ in 0..32 {
            let burst = cfg.plan_burst();
            assert!((1..=MAX_BURST).contains(&burst.len()));
            assert!(burst.iter().all(|n| (1..=512).contains(n)));
            assert!(cfg.plan_delay() <= Duration::from_millis(3));
        }
    }

    #[tokio::test]
    async fn padding_with_stream_id_is_a_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let tx = derive_keys(b"psk", &[3u8; SALT_LEN], Algorithm::Aes256Gcm).unwrap();
        let rx = derive_keys(b"psk", &[3u8; SALT_LEN], Algorithm::Aes256Gcm).unwrap();
        let mut w = SealedWriter::new(a, tx.client_to_server);
        let mut r = ObfsReader::new(
            OpenedReader::new(b, rx.client_to_server, 4096),
            1024,
        );

        let mut buf = BytesMut::new();
        Frame {
            stream_id: 5,
            kind: FrameType::Padding,
            payload: Bytes::from_static(b"xx"),
        }
        .encode(&mut buf);
        w.write_record(&buf).await.unwrap();

        assert!(matches!(
            r.recv_frame().await,
            Err(TunnelError::Protocol(_))
        ));
    }
}
