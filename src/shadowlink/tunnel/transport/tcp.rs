use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, watch},
};

use crate::shadowlink::net::{self, SocketOptions};
use crate::shadowlink::tunnel::transport::{
    BoxedStream, Transport, TransportError, TransportListener,
};

pub struct TcpTransport {
    socket: SocketOptions,
}

impl TcpTransport {
    pub fn new(socket: SocketOptions) -> Self {
        Self { socket }
    }
}

/// Resolve and connect with a deadline, keeping refusal, DNS failure and
/// timeout apart.
pub async fn connect(
    addr: &str,
    timeout: Duration,
    socket: &SocketOptions,
) -> Result<TcpStream, TransportError> {
    let target = tokio::time::timeout(timeout, net::resolve_socket_addr(addr))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            after: timeout,
        })?
        .map_err(|e| TransportError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            after: timeout,
        })?
        .map_err(|source| TransportError::Dial {
            addr: addr.to_string(),
            source,
        })?;

    if let Err(err) = net::apply_tcp_options(&stream, socket) {
        tracing::debug!(addr = %addr, err = %err, "tunnel: tcp socket options not applied");
    }
    Ok(stream)
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn supports_udp(&self) -> bool {
        false
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, TransportError> {
        let stream = connect(addr, timeout, &self.socket).await?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = ln.local_addr().ok();
        let (closed, _) = watch::channel(false);
        Ok(Box::new(TcpTransportListener {
            ln: Mutex::new(Some(ln)),
            local,
            closed,
            socket: self.socket.clone(),
        }))
    }
}

pub struct TcpTransportListener {
    ln: Mutex<Option<TcpListener>>,
    local: Option<SocketAddr>,
    closed: watch::Sender<bool>,
    socket: SocketOptions,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let guard = self.ln.lock().await;
        let Some(ln) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            res = ln.accept() => {
                let (stream, peer) = res.map_err(TransportError::Accept)?;
                if let Err(err) = net::apply_tcp_options(&stream, &self.socket) {
                    tracing::debug!(peer = %peer, err = %err, "tunnel: tcp socket options not applied");
                }
                Ok((Box::new(stream) as BoxedStream, peer))
            }
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        // Dropping the listener releases the port once any pending accept
        // has observed the close flag.
        self.ln.lock().await.take();
    }
}
