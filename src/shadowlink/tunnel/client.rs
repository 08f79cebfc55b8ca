use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use crate::shadowlink::{
    config::Config,
    tunnel::{
        pool::{PathOptions, Pool, PoolOptions},
        transport::transport_by_name,
    },
};

/// The client side: keeps a pool of physical connections to the server and
/// relays every stream the server opens through them.
pub struct Client {
    pool: Arc<Pool>,
}

impl Client {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let topts = cfg.transport_options();
        let mut paths = Vec::with_capacity(cfg.paths.len());
        for (i, p) in cfg.paths.iter().enumerate() {
            let transport = transport_by_name(&p.transport, &topts)
                .with_context(|| format!("tunnel: path {i} ({})", p.address))?;
            tracing::info!(
                path = i,
                address = %p.address,
                transport = transport.name(),
                pool_size = p.pool_size,
                aggressive = p.aggressive_pool,
                "tunnel: client path"
            );
            paths.push(PathOptions {
                label: format!("{}#{i}", p.address),
                transport,
                address: p.address.clone(),
                pool_size: p.pool_size,
                aggressive: p.aggressive_pool,
                retry_interval: p.retry_interval,
                dial_timeout: p.dial_timeout,
            });
        }

        let pool = Pool::new(
            paths,
            PoolOptions {
                channel: cfg.channel_config(),
                relay: cfg.relay_options(),
                cleanup_interval: cfg.performance.cleanup_interval,
                session_timeout: cfg.performance.session_timeout,
            },
        );
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub fn pool(&self) -> Arc<Pool> {
        self.pool.clone()
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.pool.run(shutdown).await.map_err(|err| {
            let msg = format!("tunnel: client stopped: {err}");
            anyhow::Error::new(err).context(msg)
        })
    }
}

pub async fn start_client(cfg: Arc<Config>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    Client::new(&cfg)?.run(shutdown).await
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream, UdpSocket},
    };

    use super::*;
    use crate::shadowlink::{
        config::parse_yaml,
        tunnel::{
            protocol::{self, OpenRecord, StreamKind},
            error::TunnelError,
            server::Server,
            sessions::ConnectionSet,
        },
    };

    const PSK: &str = "correct horse battery staple";

    async fn tcp_echo() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn wait_for_connections(conns: &ConnectionSet, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conns.len() < n {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("client connections did not come up");
    }

    fn server_yaml(transport: &str, tcp_target: SocketAddr, udp_target: SocketAddr) -> String {
        format!(
            r#"
mode: server
listen: "127.0.0.1:0"
transport: {{type: {transport}}}
encryption: {{psk: "{PSK}"}}
maps:
  - {{protocol: tcp, bind: "127.0.0.1:0", target: "{tcp_target}"}}
  - {{protocol: udp, bind: "127.0.0.1:0", target: "{udp_target}"}}
"#
        )
    }

    fn client_yaml(transport: &str, server: SocketAddr, psk: &str) -> String {
        format!(
            r#"
mode: client
transport: {{type: {transport}}}
encryption: {{psk: "{psk}"}}
paths:
  - {{address: "{server}", pool_size: 2, retry_interval_ms: 100}}
"#
        )
    }

    async fn round_trip(transport: &str) {
        let tcp_target = tcp_echo().await;
        let udp_target = udp_echo().await;

        let server_cfg = parse_yaml(&server_yaml(transport, tcp_target, udp_target)).unwrap();
        let server = Server::bind(Arc::new(server_cfg)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (_, tcp_map) = server.tcp_map_addrs()[0];
        let (_, udp_map) = server.udp_map_addrs()[0];
        let server_conns = server.connections();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.serve(stop_rx.clone()));

        let client_cfg = parse_yaml(&client_yaml(transport, server_addr, PSK)).unwrap();
        let client_task = tokio::spawn(start_client(Arc::new(client_cfg), stop_rx));
        wait_for_connections(&server_conns, 2).await;

        // TCP PortMap through the tunnel.
        let mut c = TcpStream::connect(tcp_map).await.unwrap();
        c.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");
        drop(c);

        // UDP PortMap through the tunnel.
        let u = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        u.send_to(b"ping", udp_map).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), u.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(7), server_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(7), client_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn port_maps_round_trip_over_tcp() {
        round_trip("tcp").await;
    }

    #[tokio::test]
    async fn port_maps_round_trip_over_websocket() {
        round_trip("ws").await;
    }

    #[tokio::test]
    async fn client_opened_stream_reaches_server_port_map() {
        let tcp_target = tcp_echo().await;
        let udp_target = udp_echo().await;
        let server_cfg = parse_yaml(&server_yaml("tcp", tcp_target, udp_target)).unwrap();
        let server = Server::bind(Arc::new(server_cfg)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.serve(stop_rx.clone()));

        let client_cfg = parse_yaml(&client_yaml("tcp", server_addr, PSK)).unwrap();
        let client = Arc::new(Client::new(&client_cfg).unwrap());
        let running = {
            let client = client.clone();
            tokio::spawn(async move { client.run(stop_rx).await })
        };

        let (mut st, _) = client
            .pool()
            .open_stream(Duration::from_secs(5))
            .await
            .unwrap();
        protocol::write_open_record(
            &mut st,
            &OpenRecord {
                kind: StreamKind::Tcp,
                service: 0,
                target: String::new(),
            },
        )
        .await
        .unwrap();
        st.write_all(b"reverse").await.unwrap();
        let mut buf = [0u8; 7];
        st.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reverse");
        drop(st);

        stop_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_psk_never_joins_the_server() {
        let tcp_target = tcp_echo().await;
        let udp_target = udp_echo().await;
        let server_cfg = parse_yaml(&server_yaml("tcp", tcp_target, udp_target)).unwrap();
        let server = Server::bind(Arc::new(server_cfg)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let server_conns = server.connections();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.serve(stop_rx));

        // The client is never told to stop: it must give up on its own.
        let (_client_stop, client_rx) = watch::channel(false);
        let client_cfg = parse_yaml(&client_yaml("tcp", server_addr, "not the right key")).unwrap();
        let client_task = tokio::spawn(start_client(Arc::new(client_cfg), client_rx));

        let err = tokio::time::timeout(Duration::from_secs(10), client_task)
            .await
            .expect("client kept retrying a rejected key")
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err.downcast_ref::<TunnelError>(), Some(TunnelError::Authentication(_))),
            "{err:#}"
        );
        assert!(err.to_string().contains("authentication failed"), "{err}");
        assert!(server_conns.is_empty());

        stop_tx.send(true).unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_shutdown_lets_open_streams_finish() {
        let tcp_target = tcp_echo().await;
        let udp_target = udp_echo().await;
        let server_cfg = parse_yaml(&server_yaml("tcp", tcp_target, udp_target)).unwrap();
        let server = Server::bind(Arc::new(server_cfg)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (_, tcp_map) = server.tcp_map_addrs()[0];
        let server_conns = server.connections();
        let (server_stop, server_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.serve(server_rx));

        let (client_stop, client_rx) = watch::channel(false);
        let client_cfg = parse_yaml(&client_yaml("tcp", server_addr, PSK)).unwrap();
        let client_task = tokio::spawn(start_client(Arc::new(client_cfg), client_rx));
        wait_for_connections(&server_conns, 2).await;

        let mut c = TcpStream::connect(tcp_map).await.unwrap();
        c.write_all(b"before").await.unwrap();
        let mut buf = [0u8; 6];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"before");

        server_stop.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The open stream keeps working while the server drains.
        c.write_all(b"during").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), c.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"during");
        assert!(!server_task.is_finished());

        // New PortMap connections are no longer accepted.
        let refused = match TcpStream::connect(tcp_map).await {
            Err(_) => true,
            Ok(mut late) => {
                let mut one = [0u8; 1];
                matches!(
                    tokio::time::timeout(Duration::from_secs(2), late.read(&mut one)).await,
                    Ok(Ok(0) | Err(_))
                )
            }
        };
        assert!(refused);

        // Once the last stream ends the drain completes well before its cap.
        drop(c);
        tokio::time::timeout(Duration::from_secs(3), server_task)
            .await
            .expect("drain did not finish once streams were idle")
            .unwrap()
            .unwrap();

        client_stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(7), client_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
