//! WebSocket stream layer.
//!
//! The dialer performs an HTTP upgrade against `fake_path` and both sides then
//! exchange binary messages; the wrapper exposes them as a plain byte stream.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderName, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
    },
};

use crate::shadowlink::net;
use crate::shadowlink::tunnel::transport::{
    BoxedStream, StreamLayer, TransportError, http::MimicOptions,
};

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

pub struct WsLayer {
    opts: WsOptions,
    mimic: MimicOptions,
}

impl WsLayer {
    pub fn new(opts: WsOptions, mimic: MimicOptions) -> Self {
        Self { opts, mimic }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut cfg = WebSocketConfig::default();
        if self.opts.write_buffer_size > 0 {
            cfg.write_buffer_size = self.opts.write_buffer_size;
            cfg.max_write_buffer_size = cfg.max_write_buffer_size.max(self.opts.write_buffer_size * 2);
        }
        cfg
    }

    fn path(&self) -> String {
        let p = self.mimic.fake_path.trim();
        if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{p}")
        }
    }
}

#[async_trait]
impl StreamLayer for WsLayer {
    async fn connect(&self, stream: BoxedStream, addr: &str) -> Result<BoxedStream, TransportError> {
        let host = if self.mimic.fake_domain.trim().is_empty() {
            net::host_of(addr).to_string()
        } else {
            self.mimic.fake_domain.trim().to_string()
        };
        let url = format!("ws://{host}{}", self.path());
        let mut req = url
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("websocket request: {e}")))?;

        let headers = req.headers_mut();
        if !self.mimic.user_agent.trim().is_empty() {
            if let Ok(v) = HeaderValue::from_str(self.mimic.user_agent.trim()) {
                headers.insert("user-agent", v);
            }
        }
        for (name, value) in self.mimic.header_pairs() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.insert(n, v);
                }
                _ => tracing::debug!(header = %name, "tunnel: skipping invalid websocket header"),
            }
        }

        let (ws, _resp) =
            tokio_tungstenite::client_async_with_config(req, stream, Some(self.ws_config()))
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Http(resp) => {
                        TransportError::Handshake(format!("websocket status {}", resp.status()))
                    }
                    other => TransportError::Handshake(format!("websocket: {other}")),
                })?;
        Ok(Box::new(WsStream::new(ws, self.opts.read_buffer_size)))
    }

    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError> {
        let expected = self.path();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == expected {
                return Ok(resp);
            }
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        };
        let ws =
            tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(self.ws_config()))
                .await
                .map_err(|e| TransportError::Handshake(format!("websocket: {e}")))?;
        Ok(Box::new(WsStream::new(ws, self.opts.read_buffer_size)))
    }
}

/// Binary WebSocket messages as an `AsyncRead + AsyncWrite` byte stream.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
}

impl<S> WsStream<S> {
    fn new(inner: WebSocketStream<S>, read_capacity: usize) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(read_capacity),
        }
    }
}

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::from(io::ErrorKind::BrokenPipe)
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => self.read_buf.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => self.read_buf.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_io_error)?;
        self.inner
            .start_send_unpin(Message::Binary(buf.to_vec()))
            .map_err(ws_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.inner.poll_close_unpin(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_io_error(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn custom_path_and_headers_are_accepted() {
        let mimic = MimicOptions {
            fake_path: "tunnel".into(),
            custom_headers: vec!["X-Edge: 1".into()],
            ..MimicOptions::default()
        };
        let server = WsLayer::new(WsOptions::default(), mimic.clone());
        let client = WsLayer::new(WsOptions::default(), mimic);
        let (a, b) = tokio::io::duplex(64 * 1024);

        let srv = tokio::spawn(async move {
            let mut s = server.accept(Box::new(b)).await.unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"abc");
        });
        let mut c = client.connect(Box::new(a), "edge.example:443").await.unwrap();
        // Two writes arrive as two messages and are read back as one stream.
        c.write_all(b"a").await.unwrap();
        c.write_all(b"bc").await.unwrap();
        c.flush().await.unwrap();
        srv.await.unwrap();
    }
}
