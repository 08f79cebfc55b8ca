use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::shadowlink::net::SocketOptions;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial {addr}: timed out after {after:?}")]
    Timeout { addr: String, after: Duration },
    #[error("resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("accept: {0}")]
    Accept(io::Error),
    #[error("listener closed")]
    Closed,
    #[error("tls: {0}")]
    Tls(String),
    #[error("unknown transport {0:?} (expected tcp|kcp|ws|wss|http|https)")]
    Unknown(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_secure(&self) -> bool;
    fn supports_udp(&self) -> bool;
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, TransportError>;
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr), TransportError>;
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Stop accepting. Connections already handed out keep running.
    async fn close(&self);
}

/// A handshake stacked on top of an established byte stream.
#[async_trait]
pub trait StreamLayer: Send + Sync {
    async fn connect(&self, stream: BoxedStream, addr: &str) -> Result<BoxedStream, TransportError>;
    async fn accept(&self, stream: BoxedStream) -> Result<BoxedStream, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub tls: tls::TlsOptions,
    pub kcp: kcp::KcpOptions,
    pub websocket: websocket::WsOptions,
    pub mimic: http::MimicOptions,
    pub socket: SocketOptions,
    /// Upper bound for inbound stream-layer handshakes.
    pub handshake_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls: tls::TlsOptions::default(),
            kcp: kcp::KcpOptions::default(),
            websocket: websocket::WsOptions::default(),
            mimic: http::MimicOptions::default(),
            socket: SocketOptions::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub fn parse_transport(name: &str) -> Result<&'static str, TransportError> {
    let n = name.trim().to_ascii_lowercase();
    Ok(match n.as_str() {
        "" | "tcp" => "tcp",
        "kcp" => "kcp",
        "ws" => "ws",
        "wss" => "wss",
        "http" => "http",
        "https" => "https",
        _ => return Err(TransportError::Unknown(name.to_string())),
    })
}

pub mod http;
pub mod kcp;
pub mod tcp;
pub mod tls;
pub mod websocket;

pub fn transport_by_name(
    name: &str,
    opts: &TransportOptions,
) -> Result<Arc<dyn Transport>, TransportError> {
    let name = parse_transport(name)?;

    let base: Arc<dyn Transport> = match name {
        "kcp" => Arc::new(kcp::KcpTransport::new(opts.kcp.clone())),
        _ => Arc::new(tcp::TcpTransport::new(opts.socket.clone())),
    };

    let mut layers: Vec<Arc<dyn StreamLayer>> = Vec::new();
    if matches!(name, "wss" | "https") || opts.tls.enabled {
        layers.push(Arc::new(tls::TlsLayer::new(opts.tls.clone())));
    }
    match name {
        "ws" | "wss" => layers.push(Arc::new(websocket::WsLayer::new(
            opts.websocket.clone(),
            opts.mimic.clone(),
        ))),
        "http" | "https" => layers.push(Arc::new(http::MimicLayer::http(opts.mimic.clone()))),
        _ if opts.mimic.enabled => {
            layers.push(Arc::new(http::MimicLayer::new(opts.mimic.clone())))
        }
        _ => {}
    }

    if layers.is_empty() {
        return Ok(base);
    }
    Ok(Arc::new(Layered {
        name,
        base,
        layers: layers.into(),
        secure: matches!(name, "wss" | "https") || opts.tls.enabled,
        handshake_timeout: opts.handshake_timeout,
    }))
}

/// A base medium (TCP or KCP) with stream layers applied in order on dial and
/// on accept.
pub struct Layered {
    name: &'static str,
    base: Arc<dyn Transport>,
    layers: Arc<[Arc<dyn StreamLayer>]>,
    secure: bool,
    handshake_timeout: Duration,
}

#[async_trait]
impl Transport for Layered {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn supports_udp(&self) -> bool {
        self.base.supports_udp()
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, TransportError> {
        // The base dial enforces its own timeout; layers get whatever is left
        // of the budget and a stall there is a failed handshake.
        let started = tokio::time::Instant::now();
        let stream = self.base.dial(addr, timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        let upgrade = async {
            let mut stream = stream;
            for layer in self.layers.iter() {
                stream = layer.connect(stream, addr).await?;
            }
            Ok(stream)
        };
        tokio::time::timeout(remaining, upgrade)
            .await
            .map_err(|_| {
                TransportError::Handshake(format!("{} upgrade to {addr} timed out", self.name))
            })?
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let base = self.base.listen(addr).await?;
        let local = base.local_addr();
        let base: Arc<dyn TransportListener> = Arc::from(base);
        let (tx, rx) = mpsc::channel(64);

        let accept_loop = tokio::spawn(layered_accept_loop(
            self.name,
            base.clone(),
            self.layers.clone(),
            self.handshake_timeout,
            tx,
        ));

        Ok(Box::new(LayeredListener {
            base,
            local,
            incoming: Mutex::new(rx),
            accept_loop,
        }))
    }
}

async fn layered_accept_loop(
    name: &'static str,
    base: Arc<dyn TransportListener>,
    layers: Arc<[Arc<dyn StreamLayer>]>,
    handshake_timeout: Duration,
    tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
) {
    loop {
        let (stream, peer) = match base.accept().await {
            Ok(v) => v,
            Err(TransportError::Closed) => return,
            Err(err) => {
                tracing::warn!(transport = name, err = %err, "tunnel: accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let layers = layers.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let handshake = async {
                let mut stream = stream;
                for layer in layers.iter() {
                    stream = layer.accept(stream).await?;
                }
                Ok::<_, TransportError>(stream)
            };
            match tokio::time::timeout(handshake_timeout, handshake).await {
                Ok(Ok(stream)) => {
                    let _ = tx.send((stream, peer)).await;
                }
                Ok(Err(err)) => {
                    tracing::debug!(transport = name, peer = %peer, err = %err, "tunnel: inbound handshake failed");
                }
                Err(_) => {
                    tracing::debug!(transport = name, peer = %peer, "tunnel: inbound handshake timed out");
                }
            }
        });
    }
}

struct LayeredListener {
    base: Arc<dyn TransportListener>,
    local: Option<SocketAddr>,
    incoming: Mutex<mpsc::Receiver<(BoxedStream, SocketAddr)>>,
    accept_loop: JoinHandle<()>,
}

#[async_trait]
impl TransportListener for LayeredListener {
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr), TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    async fn close(&self) {
        self.base.close().await;
        self.accept_loop.abort();
        self.incoming.lock().await.close();
    }
}

impl Drop for LayeredListener {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}
