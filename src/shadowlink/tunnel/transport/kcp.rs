use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use crate::shadowlink::net;
use crate::shadowlink::tunnel::transport::{
    BoxedStream, Transport, TransportError, TransportListener,
};

#[derive(Debug, Clone)]
pub struct KcpOptions {
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: bool,
    pub sndwnd: u16,
    pub rcvwnd: u16,
    pub mtu: usize,
}

impl Default for KcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            nc: true,
            sndwnd: 1024,
            rcvwnd: 1024,
            mtu: 1350,
        }
    }
}

impl KcpOptions {
    fn to_config(&self) -> KcpConfig {
        KcpConfig {
            mtu: self.mtu,
            nodelay: KcpNoDelayConfig {
                nodelay: self.nodelay,
                interval: self.interval,
                resend: self.resend,
                nc: self.nc,
            },
            wnd_size: (self.sndwnd, self.rcvwnd),
            stream: true,
            ..KcpConfig::default()
        }
    }
}

/// Reliable UDP via KCP in stream mode.
pub struct KcpTransport {
    kcp: KcpConfig,
}

impl KcpTransport {
    pub fn new(opts: KcpOptions) -> Self {
        Self {
            kcp: opts.to_config(),
        }
    }
}

#[async_trait]
impl Transport for KcpTransport {
    fn name(&self) -> &'static str {
        "kcp"
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedStream, TransportError> {
        let connect = async {
            let remote = net::resolve_socket_addr(addr)
                .await
                .map_err(|e| TransportError::Resolve {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
            KcpStream::connect(&self.kcp, remote)
                .await
                .map_err(|e| TransportError::Dial {
                    addr: addr.to_string(),
                    source: io::Error::other(e),
                })
        };
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout {
                addr: addr.to_string(),
                after: timeout,
            })??;
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let bind_addr: SocketAddr = net::normalize_bind_addr(addr).parse().map_err(|_| {
            TransportError::Resolve {
                addr: addr.to_string(),
                reason: "kcp listen address must be ip:port".into(),
            }
        })?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                source: io::Error::other(e),
            })?;
        let local = ln.local_addr().ok();
        let (closed, _) = watch::channel(false);
        Ok(Box::new(KcpTransportListener {
            ln: Mutex::new(Some(ln)),
            local,
            closed,
        }))
    }
}

pub struct KcpTransportListener {
    ln: Mutex<Option<KcpListener>>,
    local: Option<SocketAddr>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl TransportListener for KcpTransportListener {
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut guard = self.ln.lock().await;
        let Some(ln) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        tokio::select! {
            res = ln.accept() => {
                let (stream, peer) = res.map_err(|e| TransportError::Accept(io::Error::other(e)))?;
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
        self.ln.lock().await.take();
    }
}
