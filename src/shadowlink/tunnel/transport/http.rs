//! HTTP/1.1 mimicry.
//!
//! The dialer sends a request head and the listener answers `200 OK`; after
//! that the connection carries tunnel records, optionally wrapped in chunked
//! transfer framing where every write becomes one chunk.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rand::{RngExt, rng};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use crate::shadowlink::net;
use crate::shadowlink::tunnel::transport::{BoxedStream, StreamLayer, TransportError};

const MAX_HEAD: u64 = 16 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone)]
pub struct MimicOptions {
    /// Wrap plain tcp/kcp transports; `http`/`https` always mimic.
    pub enabled: bool,
    pub fake_domain: String,
    pub fake_path: String,
    pub user_agent: String,
    /// Chunk bodies when mimicking over tcp/kcp; `http`/`https` always chunk.
    pub chunked_encoding: bool,
    pub session_cookie: bool,
    /// `"Name: value"` lines added to the request.
    pub custom_headers: Vec<String>,
}

impl Default for MimicOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            fake_domain: String::new(),
            fake_path: "/".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            chunked_encoding: false,
            session_cookie: false,
            custom_headers: Vec::new(),
        }
    }
}

impl MimicOptions {
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.custom_headers.iter().filter_map(|h| {
            let (name, value) = h.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name, value.trim()))
        })
    }

    fn path(&self) -> String {
        let p = self.fake_path.trim();
        if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{p}")
        }
    }
}

pub struct MimicLayer {
    opts: MimicOptions,
    chunked: bool,
}

impl MimicLayer {
    /// Mimicry added on top of a plain transport; chunking follows the options.
    pub fn new(opts: MimicOptions) -> Self {
        let chunked = opts.chunked_encoding;
        Self { opts, chunked }
    }

    /// The `http`/`https` transports: bodies are always chunked.
    pub fn http(opts: MimicOptions) -> Self {
        Self {
            opts,
            chunked: true,
        }
    }

    fn request_head(&self, addr: &str) -> String {
        let host = if self.opts.fake_domain.trim().is_empty() {
            net::host_of(addr).to_string()
        } else {
            self.opts.fake_domain.trim().to_string()
        };
        let mut head = format!("POST {} HTTP/1.1\r\nHost: {host}\r\n", self.opts.path());
        if !self.opts.user_agent.trim().is_empty() {
            head.push_str(&format!("User-Agent: {}\r\n", self.opts.user_agent.trim()));
        }
        head.push_str("Accept: */*\r\nContent-Type: application/octet-stream\r\n");
        if self.chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        if self.opts.session_cookie {
            let sid: u64 = rng().random();
            head.push_str(&format!("Cookie: sid={sid:016x}\r\n"));
        }
        for (name, value) in self.opts.header_pairs() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn response_head(&self) -> String {
        let mut head = String::from(
            "HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Type: application/octet-stream\r\nCache-Control: no-store\r\n",
        );
        if self.chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        if self.opts.session_cookie {
            let sid: u64 = rng().random();
            head.push_str(&format!("Set-Cookie: sid={sid:016x}; Path=/; HttpOnly\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn wrap(&self, stream: BufReader<BoxedStream>) -> BoxedStream {
        if self.chunked {
            Box::new(ChunkedStream::new(stream))
        } else {
            Box::new(stream)
        }
    }
}

/// Read an HTTP head (start line plus headers) without consuming body bytes.
async fn read_head(rd: &mut BufReader<BoxedStream>) -> Result<Vec<String>, TransportError> {
    let mut lines = Vec::new();
    let mut budget = MAX_HEAD;
    loop {
        let mut line = String::new();
        let n = (&mut *rd)
            .take(budget)
            .read_line(&mut line)
            .await
            .map_err(|e| TransportError::Handshake(format!("http head: {e}")))?;
        if n == 0 {
            let reason = if budget == 0 {
                "http head too large"
            } else {
                "connection closed during http head"
            };
            return Err(TransportError::Handshake(reason.into()));
        }
        budget -= n as u64;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(lines);
        }
        lines.push(line.to_string());
    }
}

async fn write_head(stream: &mut BufReader<BoxedStream>, head: &str) -> Result<(), TransportError> {
    let inner = stream.get_mut();
    inner
        .write_all(head.as_bytes())
        .await
        .map_err(|e| TransportError::Handshake(format!("http head: {e}")))?;
    inner
        .flush()
        .await
        .map_err(|e| TransportError::Handshake(format!("http head: {e}")))
}

#[async_trait]
impl StreamLayer for MimicLayer {
    async fn connect(&self, stream: BoxedStream, addr: &str) -> Result<BoxedStream, TransportError> {
        let mut rd = BufReader::new(stream);
        write_head(&mut rd, &self.request_head(addr)).await?;

        let head = read_head(&mut rd).await?;
        let status = head
            .first()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or_default();
        if status != "200" {
            return Err(TransportError::Handshake(format!(
                "http status {:?}",
                head.first().map(String::as_str).unwrap_or_default()
            )));
        }
        Ok(self.wrap(rd))
    }

    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError> {
        let mut rd = BufReader::new(stream);
        let head = read_head(&mut rd).await?;
        let path = head
            .first()
            .and_then(|l| l.split_whitespace().nth(1))
            .unwrap_or_default();
        let path = path.split('?').next().unwrap_or_default();

        if path != self.opts.path() {
            let body = "<html><body><h1>404 Not Found</h1></body></html>";
            let resp = format!(
                "HTTP/1.1 404 Not Found\r\nServer: nginx\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = write_head(&mut rd, &resp).await;
            return Err(TransportError::Handshake(format!(
                "unexpected http path {path:?}"
            )));
        }

        write_head(&mut rd, &self.response_head()).await?;
        Ok(self.wrap(rd))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
    Done,
}

/// Chunked transfer framing over a byte stream. Each `poll_write` becomes one
/// chunk; shutdown writes the terminating zero chunk.
///
/// A `poll_write` that returned `Pending` part-way through a chunk must be
/// retried with the same buffer, as `write_all` does.
pub struct ChunkedStream<S> {
    inner: S,
    wbuf: Vec<u8>,
    wpos: usize,
    pending: usize,
    finished: bool,
    rbuf: BytesMut,
    state: ChunkState,
}

impl<S> ChunkedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            wbuf: Vec::new(),
            wpos: 0,
            pending: 0,
            finished: false,
            rbuf: BytesMut::new(),
            state: ChunkState::Size,
        }
    }
}

impl<S> ChunkedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.wpos < self.wbuf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf[self.wpos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wpos += n;
        }
        self.wbuf.clear();
        self.wpos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> ChunkedStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Pull more raw bytes; returns false on EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        let mut tmp = [0u8; 8 * 1024];
        let mut rb = ReadBuf::new(&mut tmp);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
        if rb.filled().is_empty() {
            return Poll::Ready(Ok(false));
        }
        self.rbuf.extend_from_slice(rb.filled());
        Poll::Ready(Ok(true))
    }

    fn take_line(&mut self) -> io::Result<Option<String>> {
        let Some(pos) = self.rbuf.windows(2).position(|w| w == b"\r\n") else {
            if self.rbuf.len() > MAX_CHUNK_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk line too long",
                ));
            }
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&self.rbuf[..pos]).into_owned();
        self.rbuf.advance(pos + 2);
        Ok(Some(line))
    }
}

fn parse_chunk_size(line: &str) -> io::Result<usize> {
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))
}

impl<S> AsyncRead for ChunkedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match this.state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Size | ChunkState::Trailer => {
                    if let Some(line) = this.take_line()? {
                        this.state = match this.state {
                            ChunkState::Size => match parse_chunk_size(&line)? {
                                0 => ChunkState::Trailer,
                                n => ChunkState::Data(n),
                            },
                            _ if line.is_empty() => ChunkState::Done,
                            other => other,
                        };
                        continue;
                    }
                }
                ChunkState::Data(left) => {
                    if !this.rbuf.is_empty() {
                        let n = left.min(this.rbuf.len()).min(buf.remaining());
                        buf.put_slice(&this.rbuf[..n]);
                        this.rbuf.advance(n);
                        this.state = if n == left {
                            ChunkState::DataCrlf
                        } else {
                            ChunkState::Data(left - n)
                        };
                        return Poll::Ready(Ok(()));
                    }
                }
                ChunkState::DataCrlf => {
                    if this.rbuf.len() >= 2 {
                        if &this.rbuf[..2] != b"\r\n" {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing chunk terminator",
                            )));
                        }
                        this.rbuf.advance(2);
                        this.state = ChunkState::Size;
                        continue;
                    }
                }
            }

            if !ready!(this.poll_fill(cx))? {
                // EOF between chunks is a plain close; inside one it is not.
                if this.state == ChunkState::Size && this.rbuf.is_empty() {
                    this.state = ChunkState::Done;
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

impl<S> AsyncWrite for ChunkedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if this.wbuf.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.wbuf.extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
            this.wbuf.extend_from_slice(buf);
            this.wbuf.extend_from_slice(b"\r\n");
            this.pending = buf.len();
        }
        ready!(this.poll_drain(cx))?;
        Poll::Ready(Ok(std::mem::take(&mut this.pending)))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            this.wbuf.extend_from_slice(b"0\r\n\r\n");
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
