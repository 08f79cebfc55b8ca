//! Receiving end of a relayed logical stream: read the open record, dial the
//! target and splice bytes or datagrams until either side is done.

use std::{sync::Mutex, time::Duration};

use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::UdpSocket,
    time::Instant,
};

use crate::shadowlink::{
    config::PortMap,
    net::{self, SocketOptions},
    tunnel::{
        datagram::{DatagramReader, DatagramWriter},
        error::TunnelError,
        protocol::{self, MAX_DATAGRAM_BYTES, OpenRecord, ProtocolError, StreamKind},
        stream::LogicalStream,
        transport::{TransportError, tcp},
    },
};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub connect_timeout: Duration,
    /// Bound on waiting for the open record of a new stream.
    pub open_timeout: Duration,
    pub socket: SocketOptions,
    pub udp_flow_timeout: Duration,
    /// Receive buffer for relay UDP sockets; zero keeps the OS default.
    pub udp_buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            open_timeout: Duration::from_secs(10),
            socket: SocketOptions::default(),
            udp_flow_timeout: Duration::from_secs(60),
            udp_buffer_size: 0,
        }
    }
}

/// How a receiver turns an open record into a dial target.
#[derive(Debug, Clone, Copy)]
pub enum Targets<'a> {
    /// Client side: the server names the target.
    FromPeer,
    /// Server side: only the local PortMap table is consulted.
    PortMaps(&'a [PortMap]),
}

impl Targets<'_> {
    pub fn resolve(&self, rec: &OpenRecord) -> Result<String, TunnelError> {
        match self {
            Targets::FromPeer if !rec.target.is_empty() => Ok(rec.target.clone()),
            Targets::FromPeer => Err(TunnelError::protocol(format!(
                "no target for service {}",
                rec.service
            ))),
            Targets::PortMaps(_) if !rec.target.is_empty() => Err(TunnelError::protocol(
                "explicit targets are not accepted",
            )),
            Targets::PortMaps(maps) => {
                let pm = maps
                    .iter()
                    .find(|pm| pm.index == rec.service)
                    .ok_or_else(|| TunnelError::protocol(format!("unknown service {}", rec.service)))?;
                let allowed = match rec.kind {
                    StreamKind::Tcp => pm.protocol.carries_tcp(),
                    StreamKind::Udp => pm.protocol.carries_udp(),
                };
                if !allowed {
                    return Err(TunnelError::protocol(format!(
                        "service {} does not carry {}",
                        rec.service,
                        rec.kind.as_str()
                    )));
                }
                Ok(pm.target.clone())
            }
        }
    }
}

/// Serve one accepted stream to completion.
pub async fn serve_stream(
    mut stream: LogicalStream,
    targets: Targets<'_>,
    opts: &RelayOptions,
) -> Result<(), TunnelError> {
    let rec = tokio::time::timeout(opts.open_timeout, protocol::read_open_record(&mut stream))
        .await
        .map_err(|_| TunnelError::protocol("timed out waiting for open record"))??;
    let target = targets.resolve(&rec)?;

    tracing::debug!(
        stream = stream.id(),
        kind = rec.kind.as_str(),
        service = rec.service,
        target = %target,
        "tunnel: relaying stream"
    );

    match rec.kind {
        StreamKind::Tcp => relay_tcp(stream, &target, opts).await,
        StreamKind::Udp => relay_udp(stream, &target, opts).await,
    }
}

async fn relay_tcp(
    mut stream: LogicalStream,
    target: &str,
    opts: &RelayOptions,
) -> Result<(), TunnelError> {
    let mut upstream = tcp::connect(target, opts.connect_timeout, &opts.socket).await?;
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => {
            tracing::debug!(target = %target, up, down, "tunnel: tcp relay done");
            Ok(())
        }
        Err(err) => {
            let _ = upstream.shutdown().await;
            Err(err.into())
        }
    }
}

async fn relay_udp(
    stream: LogicalStream,
    target: &str,
    opts: &RelayOptions,
) -> Result<(), TunnelError> {
    let addr = net::resolve_socket_addr(target)
        .await
        .map_err(|e| TransportError::Resolve {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
    let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let sock = UdpSocket::bind(bind).await?;
    if opts.udp_buffer_size > 0 {
        if let Err(err) = socket2::SockRef::from(&sock).set_recv_buffer_size(opts.udp_buffer_size) {
            tracing::debug!(err = %err, "tunnel: could not set udp receive buffer");
        }
    }
    sock.connect(addr).await?;

    let (rd, wr) = tokio::io::split(stream);
    let last = Mutex::new(Instant::now());
    let res = tokio::select! {
        r = stream_to_socket(DatagramReader::new(rd), &sock, &last) => r,
        r = socket_to_stream(&sock, DatagramWriter::new(wr), &last) => r,
        _ = idle_watch(&last, opts.udp_flow_timeout) => {
            tracing::debug!(target = %target, "tunnel: udp relay idle, closing");
            Ok(())
        }
    };
    res.map_err(TunnelError::from)
}

fn touch(last: &Mutex<Instant>) {
    *last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
}

async fn stream_to_socket(
    mut reader: DatagramReader<ReadHalf<LogicalStream>>,
    sock: &UdpSocket,
    last: &Mutex<Instant>,
) -> Result<(), ProtocolError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
    loop {
        let n = reader.read_datagram(&mut buf).await?;
        sock.send(&buf[..n]).await?;
        touch(last);
    }
}

async fn socket_to_stream(
    sock: &UdpSocket,
    mut writer: DatagramWriter<WriteHalf<LogicalStream>>,
    last: &Mutex<Instant>,
) -> Result<(), ProtocolError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
    loop {
        let n = sock.recv(&mut buf).await?;
        writer.write_datagram(&buf[..n]).await?;
        touch(last);
    }
}

async fn idle_watch(last: &Mutex<Instant>, idle: Duration) {
    let idle = idle.max(Duration::from_millis(10));
    loop {
        let seen = *last.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = seen + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::shadowlink::{
        config::PortProtocol,
        tunnel::mux::{MuxConfig, testing::session_pair},
    };

    fn maps(target: &str) -> Vec<PortMap> {
        vec![PortMap {
            index: 3,
            protocol: PortProtocol::Tcp,
            bind: "127.0.0.1:0".into(),
            target: target.into(),
        }]
    }

    #[test]
    fn targets_resolve_by_side() {
        let table = maps("10.0.0.1:22");
        let by_index = OpenRecord {
            kind: StreamKind::Tcp,
            service: 3,
            target: String::new(),
        };
        assert_eq!(Targets::PortMaps(&table).resolve(&by_index).unwrap(), "10.0.0.1:22");
        assert!(Targets::FromPeer.resolve(&by_index).is_err());

        let explicit = OpenRecord {
            target: "192.168.1.5:80".into(),
            ..by_index.clone()
        };
        assert_eq!(Targets::FromPeer.resolve(&explicit).unwrap(), "192.168.1.5:80");
        assert!(Targets::PortMaps(&table).resolve(&explicit).is_err());

        let udp = OpenRecord {
            kind: StreamKind::Udp,
            ..by_index.clone()
        };
        assert!(Targets::PortMaps(&table).resolve(&udp).is_err());
        let unknown = OpenRecord {
            service: 9,
            ..by_index
        };
        assert!(Targets::PortMaps(&table).resolve(&unknown).is_err());
    }

    #[tokio::test]
    async fn tcp_stream_is_spliced_to_target() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = s.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });

        let (opener, receiver) = session_pair(MuxConfig::default());
        let relay = tokio::spawn(async move {
            let st = receiver.accept_stream().await.unwrap();
            serve_stream(st, Targets::FromPeer, &RelayOptions::default()).await
        });

        let mut st = opener.open_stream().unwrap();
        protocol::write_open_record(
            &mut st,
            &OpenRecord {
                kind: StreamKind::Tcp,
                service: 0,
                target,
            },
        )
        .await
        .unwrap();
        st.write_all(b"hello relay").await.unwrap();
        st.shutdown().await.unwrap();
        let mut got = Vec::new();
        st.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello relay");
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_stream_relays_datagrams_and_idles_out() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((n, from)) = target.recv_from(&mut buf).await else {
                    return;
                };
                let mut out = buf[..n].to_vec();
                out.reverse();
                let _ = target.send_to(&out, from).await;
            }
        });

        let (opener, receiver) = session_pair(MuxConfig::default());
        let relay = tokio::spawn(async move {
            let st = receiver.accept_stream().await.unwrap();
            let opts = RelayOptions {
                udp_flow_timeout: Duration::from_millis(200),
                ..RelayOptions::default()
            };
            serve_stream(st, Targets::FromPeer, &opts).await
        });

        let mut st = opener.open_stream().unwrap();
        protocol::write_open_record(
            &mut st,
            &OpenRecord {
                kind: StreamKind::Udp,
                service: 0,
                target: target_addr,
            },
        )
        .await
        .unwrap();
        let (rd, wr) = tokio::io::split(st);
        let mut rd = DatagramReader::new(rd);
        let mut wr = DatagramWriter::new(wr);

        wr.write_datagram(b"abc").await.unwrap();
        let mut buf = [0u8; 64];
        let n = rd.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"cba");

        // No traffic: the relay closes on its own.
        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
