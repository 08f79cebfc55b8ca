use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_util::task::TaskTracker;

use crate::shadowlink::{
    config::{Config, PortMap},
    net::{self, SocketOptions},
    tunnel::{
        connection::{ChannelConfig, PhysicalConnection, establish},
        flows::{self, UdpIngressOptions},
        mux::Role,
        protocol::{self, OpenRecord, StreamKind},
        relay::{self, RelayOptions, Targets},
        secure::SaltCache,
        sessions::ConnectionSet,
        stopped,
        transport::{BoxedStream, TransportError, TransportListener, transport_by_name},
    },
};

const SALT_TTL: Duration = Duration::from_secs(15 * 60);
const SALT_CACHE_CAP: usize = 64 * 1024;
/// Time given to in-flight streams once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The server side: accepts physical connections from clients and exposes
/// every PortMap through them.
pub struct Server {
    cfg: Arc<Config>,
    transport: &'static str,
    listener: Box<dyn TransportListener>,
    tcp_maps: Vec<(Arc<PortMap>, TcpListener)>,
    udp_maps: Vec<(Arc<PortMap>, UdpSocket)>,
    conns: Arc<ConnectionSet>,
}

impl Server {
    /// Bind the tunnel listener and every PortMap socket.
    pub async fn bind(cfg: Arc<Config>) -> anyhow::Result<Self> {
        let tr = transport_by_name(&cfg.transport.kind, &cfg.transport_options())?;
        let listener = tr
            .listen(&cfg.listen)
            .await
            .with_context(|| format!("tunnel: listen on {}", cfg.listen))?;

        let mut tcp_maps = Vec::new();
        let mut udp_maps = Vec::new();
        for pm in &cfg.maps {
            let bind = net::normalize_bind_addr(&pm.bind);
            let pm = Arc::new(pm.clone());
            if pm.protocol.carries_tcp() {
                let ln = TcpListener::bind(bind.as_ref())
                    .await
                    .with_context(|| format!("tunnel: bind tcp map {}", pm.bind))?;
                tcp_maps.push((pm.clone(), ln));
            }
            if pm.protocol.carries_udp() {
                let sock = UdpSocket::bind(bind.as_ref())
                    .await
                    .with_context(|| format!("tunnel: bind udp map {}", pm.bind))?;
                udp_maps.push((pm.clone(), sock));
            }
        }

        Ok(Self {
            transport: tr.name(),
            cfg,
            listener,
            tcp_maps,
            udp_maps,
            conns: Arc::new(ConnectionSet::new()),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Bound TCP PortMap addresses by service index.
    pub fn tcp_map_addrs(&self) -> Vec<(u16, SocketAddr)> {
        self.tcp_maps
            .iter()
            .filter_map(|(pm, ln)| ln.local_addr().ok().map(|a| (pm.index, a)))
            .collect()
    }

    /// Bound UDP PortMap addresses by service index.
    pub fn udp_map_addrs(&self) -> Vec<(u16, SocketAddr)> {
        self.udp_maps
            .iter()
            .filter_map(|(pm, s)| s.local_addr().ok().map(|a| (pm.index, a)))
            .collect()
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        self.conns.clone()
    }

    /// Serve until `shutdown` flips, then drain.
    ///
    /// Draining stops accepting new clients and new PortMap connections, lets
    /// open streams finish for up to five seconds and then closes every
    /// physical connection.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let cfg = self.cfg;
        let conns = self.conns;
        let listener: Arc<dyn TransportListener> = Arc::from(self.listener);
        let relays = TaskTracker::new();

        tracing::info!(
            addr = ?listener.local_addr(),
            transport = %self.transport,
            maps = cfg.maps.len(),
            "tunnel: listening"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(
            listener.clone(),
            conns.clone(),
            Inbound {
                channel: cfg.channel_config(),
                relay: cfg.relay_options(),
                maps: cfg.maps.clone().into(),
                salts: Arc::new(SaltCache::new(SALT_TTL, SALT_CACHE_CAP)),
            },
            cfg.performance.max_connections,
            relays.clone(),
            shutdown.clone(),
        ));

        for (pm, ln) in self.tcp_maps {
            tracing::info!(index = pm.index, bind = %pm.bind, target = %pm.target, "tunnel: tcp map ready");
            tasks.spawn(serve_tcp_map(
                ln,
                pm,
                conns.clone(),
                cfg.performance.connection_timeout,
                cfg.socket_options(),
                relays.clone(),
                shutdown.clone(),
            ));
        }
        for (pm, sock) in self.udp_maps {
            tracing::info!(index = pm.index, bind = %pm.bind, target = %pm.target, "tunnel: udp map ready");
            tasks.spawn(flows::serve_udp(
                Arc::new(sock),
                conns.clone(),
                UdpIngressOptions {
                    service: pm.index,
                    target: pm.target.clone(),
                    flow_timeout: cfg.performance.udp_flow_timeout,
                    cleanup_interval: cfg.performance.cleanup_interval,
                    max_flows: cfg.performance.max_udp_flows,
                },
                shutdown.clone(),
            ));
        }

        stopped(&mut shutdown).await;
        tracing::info!("tunnel: server shutting down");
        let deadline = Instant::now() + DRAIN_TIMEOUT;

        listener.close().await;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    tasks.abort_all();
                    break;
                }
                res = tasks.join_next() => {
                    if res.is_none() {
                        break;
                    }
                }
            }
        }

        if !conns.wait_idle(deadline).await {
            tracing::warn!(
                conns = conns.len(),
                "tunnel: drain timed out, closing connections with open streams"
            );
        }
        conns.close_all();

        relays.close();
        if tokio::time::timeout_at(deadline, relays.wait()).await.is_err() {
            tracing::warn!(pending = relays.len(), "tunnel: relays still running after drain");
        }
        Ok(())
    }
}

/// Bind and serve in one call.
pub async fn start_server(cfg: Arc<Config>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    Server::bind(cfg).await?.serve(shutdown).await
}

#[derive(Clone)]
struct Inbound {
    channel: ChannelConfig,
    relay: RelayOptions,
    maps: Arc<[PortMap]>,
    salts: Arc<SaltCache>,
}

async fn accept_loop(
    listener: Arc<dyn TransportListener>,
    conns: Arc<ConnectionSet>,
    inbound: Inbound,
    max_connections: usize,
    relays: TaskTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    let limit = Arc::new(Semaphore::new(max_connections.max(1)));
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            res = listener.accept() => {
                let (stream, remote) = match res {
                    Ok(v) => v,
                    Err(TransportError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(err = %err, "tunnel: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let Ok(permit) = limit.clone().try_acquire_owned() else {
                    tracing::warn!(client = %remote, max_connections, "tunnel: connection limit reached, dropping");
                    continue;
                };
                relays.spawn(handle_connection(
                    stream,
                    remote,
                    permit,
                    conns.clone(),
                    inbound.clone(),
                    relays.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
}

async fn handle_connection(
    stream: BoxedStream,
    remote: SocketAddr,
    _permit: OwnedSemaphorePermit,
    conns: Arc<ConnectionSet>,
    inbound: Inbound,
    relays: TaskTracker,
    shutdown: watch::Receiver<bool>,
) {
    let session = match establish(stream, Role::Server, &inbound.channel, Some(inbound.salts.as_ref())).await {
        Ok(s) => s,
        Err(err) if err.is_authentication() => {
            tracing::warn!(client = %remote, err = %err, "tunnel: client failed authentication");
            return;
        }
        Err(err) => {
            tracing::debug!(client = %remote, err = %err, "tunnel: handshake failed");
            return;
        }
    };

    let conn = Arc::new(PhysicalConnection::new("inbound", Some(remote), session));
    conns.insert(conn.clone());
    metrics::counter!("shadowlink_sessions_accepted_total").increment(1);
    metrics::gauge!("shadowlink_sessions_active").increment(1.0);
    tracing::info!(conn = conn.id, client = %remote, "tunnel: client connected");
    if *shutdown.borrow() {
        // Handshake finished after the drain already closed the set.
        conn.close();
    }

    // Streams the client opens towards us resolve against our own PortMaps.
    while let Ok(stream) = conn.session.accept_stream().await {
        let maps = inbound.maps.clone();
        let relay_opts = inbound.relay.clone();
        relays.spawn(async move {
            let id = stream.id();
            if let Err(err) = relay::serve_stream(stream, Targets::PortMaps(&maps), &relay_opts).await {
                if err.is_disconnect() {
                    tracing::debug!(stream = id, err = %err, "tunnel: relay ended");
                } else {
                    tracing::warn!(stream = id, err = %err, "tunnel: relay failed");
                }
            }
        });
    }

    conns.remove(conn.id);
    metrics::gauge!("shadowlink_sessions_active").decrement(1.0);
    tracing::info!(
        conn = conn.id,
        client = %remote,
        reason = ?conn.session.close_reason(),
        "tunnel: client disconnected"
    );
}

async fn serve_tcp_map(
    ln: TcpListener,
    pm: Arc<PortMap>,
    conns: Arc<ConnectionSet>,
    wait: Duration,
    socket: SocketOptions,
    relays: TaskTracker,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            res = ln.accept() => {
                let (inbound, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(bind = %pm.bind, err = %err, "tunnel: tcp map accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                relays.spawn(relay_inbound_tcp(inbound, peer, pm.clone(), conns.clone(), wait, socket.clone()));
            }
        }
    }
}

async fn relay_inbound_tcp(
    mut inbound: TcpStream,
    peer: SocketAddr,
    pm: Arc<PortMap>,
    conns: Arc<ConnectionSet>,
    wait: Duration,
    socket: SocketOptions,
) {
    if let Err(err) = net::apply_tcp_options(&inbound, &socket) {
        tracing::debug!(client = %peer, err = %err, "tunnel: tcp socket options not applied");
    }

    let (mut stream, conn) = match conns.open_stream(wait).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(client = %peer, bind = %pm.bind, err = %err, "tunnel: no tunnel connection for inbound tcp");
            return;
        }
    };
    let record = OpenRecord {
        kind: StreamKind::Tcp,
        service: pm.index,
        target: pm.target.clone(),
    };
    if let Err(err) = protocol::write_open_record(&mut stream, &record).await {
        tracing::debug!(client = %peer, conn = conn.id, err = %err, "tunnel: open record not sent");
        return;
    }

    match tokio::io::copy_bidirectional(&mut inbound, &mut stream).await {
        Ok((up, down)) => {
            tracing::debug!(client = %peer, conn = conn.id, up, down, "tunnel: tcp map relay done");
        }
        Err(err) => {
            tracing::debug!(client = %peer, conn = conn.id, err = %err, "tunnel: tcp map relay ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::shadowlink::config::parse_yaml;

    #[tokio::test]
    async fn inbound_tcp_without_client_is_closed_after_timeout() {
        let cfg = parse_yaml(
            r#"
mode: server
listen: "127.0.0.1:0"
encryption: {psk: "0123456789abcdef"}
maps: [{protocol: tcp, bind: "127.0.0.1:0", target: "127.0.0.1:9"}]
performance: {connection_timeout: 1}
"#,
        )
        .unwrap();
        let server = Server::bind(Arc::new(cfg)).await.unwrap();
        let (_, map_addr) = server.tcp_map_addrs()[0];
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(server.serve(stop_rx));

        let mut c = TcpStream::connect(map_addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(3), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bad_handshake_never_joins_the_connection_set() {
        let cfg = parse_yaml(
            r#"
mode: server
listen: "127.0.0.1:0"
encryption: {psk: "0123456789abcdef"}
performance: {connection_timeout: 1}
"#,
        )
        .unwrap();
        let server = Server::bind(Arc::new(cfg)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let conns = server.connections();
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = tokio::spawn(server.serve(stop_rx));

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(&[0u8; 32]).await.unwrap();
        let _ = c.write_all(b"garbage that is not a sealed record at all").await;
        let mut buf = [0u8; 64];
        let _ = tokio::time::timeout(Duration::from_secs(3), c.read(&mut buf)).await;
        assert!(conns.is_empty());

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }
}
