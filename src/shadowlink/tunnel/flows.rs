//! UDP PortMap ingress: a flow table keyed by client source address with
//! idle eviction and a size cap.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::UdpSocket,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::shadowlink::tunnel::{
    datagram::{DatagramReader, DatagramWriter},
    protocol::{self, MAX_DATAGRAM_BYTES, OpenRecord, ProtocolError, StreamKind},
    sessions::ConnectionSet,
    stopped,
    stream::LogicalStream,
};

/// Packets queued per flow while its stream is being opened or is slow.
const FLOW_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub bind_port: u16,
}

struct Entry<V> {
    value: V,
    last_seen: Instant,
}

/// Flow bookkeeping with explicit clocks so sweeps are deterministic.
pub struct FlowTable<V> {
    entries: HashMap<FlowKey, Entry<V>>,
    max_flows: usize,
}

impl<V> FlowTable<V> {
    pub fn new(max_flows: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_flows: max_flows.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a flow and mark it active.
    pub fn touch(&mut self, key: &FlowKey, now: Instant) -> Option<&mut V> {
        let e = self.entries.get_mut(key)?;
        e.last_seen = now;
        Some(&mut e.value)
    }

    /// Insert a flow. At capacity the least recently active flow is evicted
    /// and returned.
    pub fn insert(&mut self, key: FlowKey, value: V, now: Instant) -> Option<(FlowKey, V)> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_flows {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| *k);
            if let Some(k) = oldest {
                evicted = self.entries.remove(&k).map(|e| (k, e.value));
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                last_seen: now,
            },
        );
        evicted
    }

    /// Move each flow's last activity forward to what `seen` reports for it.
    pub fn refresh_with(&mut self, seen: impl Fn(&V) -> Instant) {
        for e in self.entries.values_mut() {
            e.last_seen = e.last_seen.max(seen(&e.value));
        }
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove flows idle for at least `idle`.
    pub fn sweep(&mut self, now: Instant, idle: Duration) -> Vec<(FlowKey, V)> {
        let expired: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) >= idle)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct UdpIngressOptions {
    pub service: u16,
    pub target: String,
    pub flow_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_flows: usize,
}

/// When a flow last sent a reply back to its client.
struct ReplyClock(Mutex<Instant>);

impl ReplyClock {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn mark(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A live flow: packets go to the stream task through `tx`.
struct Flow {
    tx: mpsc::Sender<Bytes>,
    replies: Arc<ReplyClock>,
    task: JoinHandle<()>,
}

impl Drop for Flow {
    fn drop(&mut self) {
        // Dropping the stream halves inside the task resets the stream.
        self.task.abort();
    }
}

/// Serve one UDP PortMap socket until shutdown.
pub async fn serve_udp(
    sock: Arc<UdpSocket>,
    conns: Arc<ConnectionSet>,
    opts: UdpIngressOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let bind_port = sock.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut table: FlowTable<Flow> = FlowTable::new(opts.max_flows);
    let mut tick = tokio::time::interval(opts.cleanup_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tick.tick() => {
                // Replies count as activity too.
                table.refresh_with(|flow| flow.replies.last());
                for (key, _flow) in table.sweep(Instant::now(), opts.flow_timeout) {
                    tracing::debug!(client = %key.src, bind_port = key.bind_port, "tunnel: udp flow idle, closing");
                    metrics::counter!("shadowlink_udp_flows_evicted_total").increment(1);
                }
                metrics::gauge!("shadowlink_udp_flows_active").set(table.len() as f64);
            }
            res = sock.recv_from(&mut buf) => {
                let (n, src) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // ICMP errors from earlier sends surface here on some platforms.
                        tracing::debug!(err = %err, bind_port, "tunnel: udp recv error");
                        continue;
                    }
                };
                let key = FlowKey { src, bind_port };
                let pkt = Bytes::copy_from_slice(&buf[..n]);
                let now = Instant::now();

                if let Some(flow) = table.touch(&key, now) {
                    if !flow.tx.is_closed() {
                        if flow.tx.try_send(pkt).is_err() {
                            tracing::debug!(client = %src, "tunnel: udp flow queue full, dropping packet");
                        }
                        continue;
                    }
                    table.remove(&key);
                }

                let Some((stream, conn)) = conns.try_open_stream() else {
                    tracing::debug!(client = %src, bind_port, "tunnel: no tunnel connection for udp flow, dropping packet");
                    metrics::counter!("shadowlink_udp_packets_dropped_total").increment(1);
                    continue;
                };
                tracing::debug!(client = %src, bind_port, conn = conn.id, stream = stream.id(), "tunnel: udp flow opened");

                let (tx, rx) = mpsc::channel(FLOW_QUEUE);
                let _ = tx.try_send(pkt);
                let record = OpenRecord {
                    kind: StreamKind::Udp,
                    service: opts.service,
                    target: opts.target.clone(),
                };
                let replies = Arc::new(ReplyClock::new());
                let task = tokio::spawn(run_flow(stream, record, src, sock.clone(), rx, replies.clone()));
                if let Some((old, _flow)) = table.insert(key, Flow { tx, replies, task }, now) {
                    tracing::debug!(client = %old.src, bind_port, "tunnel: udp flow table full, evicting least recently active flow");
                    metrics::counter!("shadowlink_udp_flows_evicted_total").increment(1);
                }
                metrics::gauge!("shadowlink_udp_flows_active").set(table.len() as f64);
            }
        }
    }

    metrics::gauge!("shadowlink_udp_flows_active").set(0.0);
}

async fn run_flow(
    mut stream: LogicalStream,
    record: OpenRecord,
    peer: SocketAddr,
    sock: Arc<UdpSocket>,
    rx: mpsc::Receiver<Bytes>,
    replies: Arc<ReplyClock>,
) {
    if let Err(err) = protocol::write_open_record(&mut stream, &record).await {
        tracing::debug!(client = %peer, err = %err, "tunnel: udp flow open failed");
        return;
    }
    let (rd, wr) = tokio::io::split(stream);
    let res = tokio::select! {
        r = pump_to_stream(rx, DatagramWriter::new(wr)) => r,
        r = pump_to_client(DatagramReader::new(rd), &sock, peer, &replies) => r,
    };
    if let Err(err) = res {
        tracing::debug!(client = %peer, err = %err, "tunnel: udp flow ended");
    }
}

async fn pump_to_stream(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: DatagramWriter<WriteHalf<LogicalStream>>,
) -> Result<(), ProtocolError> {
    while let Some(pkt) = rx.recv().await {
        writer.write_datagram(&pkt).await?;
    }
    writer.shutdown().await
}

async fn pump_to_client(
    mut reader: DatagramReader<ReadHalf<LogicalStream>>,
    sock: &UdpSocket,
    peer: SocketAddr,
    replies: &ReplyClock,
) -> Result<(), ProtocolError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES as usize];
    loop {
        let n = reader.read_datagram(&mut buf).await?;
        sock.send_to(&buf[..n], peer).await?;
        replies.mark();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::shadowlink::tunnel::{
        connection::PhysicalConnection,
        mux::{MuxConfig, testing::session_pair},
    };

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            bind_port: 5353,
        }
    }

    #[test]
    fn touch_keeps_flow_alive_across_sweeps() {
        let t0 = Instant::now();
        let idle = Duration::from_secs(60);
        let mut table = FlowTable::new(16);
        table.insert(key(1), "a", t0);
        table.insert(key(2), "b", t0);

        assert!(table.touch(&key(1), t0 + Duration::from_secs(50)).is_some());
        let swept = table.sweep(t0 + Duration::from_secs(70), idle);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, key(2));
        assert_eq!(table.len(), 1);
        assert!(table.touch(&key(1), t0 + Duration::from_secs(71)).is_some());
    }

    #[test]
    fn full_table_evicts_least_recently_active() {
        let t0 = Instant::now();
        let mut table = FlowTable::new(2);
        assert!(table.insert(key(1), 1, t0).is_none());
        assert!(table.insert(key(2), 2, t0 + Duration::from_secs(1)).is_none());
        // Source 1 becomes the most recently active.
        table.touch(&key(1), t0 + Duration::from_secs(2));

        let evicted = table.insert(key(3), 3, t0 + Duration::from_secs(3));
        assert_eq!(evicted, Some((key(2), 2)));
        assert_eq!(table.len(), 2);
        assert!(table.touch(&key(1), t0).is_some());
        assert!(table.touch(&key(3), t0).is_some());
    }

    #[test]
    fn refresh_only_moves_activity_forward() {
        let t0 = Instant::now();
        let idle = Duration::from_secs(60);
        let mut table = FlowTable::new(4);
        table.insert(key(1), t0 + Duration::from_secs(50), t0);
        table.insert(key(2), t0 + Duration::from_secs(90), t0 + Duration::from_secs(80));
        table.refresh_with(|seen| *seen);
        table.refresh_with(|_| t0);

        let swept = table.sweep(t0 + Duration::from_secs(115), idle);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, key(1));
        assert!(table.touch(&key(2), t0).is_some());
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let t0 = Instant::now();
        let mut table = FlowTable::new(1);
        table.insert(key(1), 1, t0);
        assert!(table.insert(key(1), 2, t0).is_none());
        assert_eq!(table.remove(&key(1)), Some(2));
        assert!(table.is_empty());
    }

    async fn recv_stream(
        peer: &crate::shadowlink::tunnel::mux::Session,
    ) -> (u32, DatagramReader<ReadHalf<LogicalStream>>, DatagramWriter<WriteHalf<LogicalStream>>) {
        let mut st = tokio::time::timeout(Duration::from_secs(2), peer.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let rec = protocol::read_open_record(&mut st).await.unwrap();
        assert_eq!(rec.kind, StreamKind::Udp);
        assert_eq!(rec.service, 4);
        assert_eq!(rec.target, "127.0.0.1:53");
        let id = st.id();
        let (rd, wr) = tokio::io::split(st);
        (id, DatagramReader::new(rd), DatagramWriter::new(wr))
    }

    #[tokio::test]
    async fn same_source_shares_a_stream_until_idle() {
        let (local, remote) = session_pair(MuxConfig::default());
        let conns = Arc::new(ConnectionSet::new());
        conns.insert(Arc::new(PhysicalConnection::new("test", None, local)));

        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ingress = sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve_udp(
            sock,
            conns.clone(),
            UdpIngressOptions {
                service: 4,
                target: "127.0.0.1:53".into(),
                flow_timeout: Duration::from_millis(300),
                cleanup_interval: Duration::from_millis(50),
                max_flows: 16,
            },
            stop_rx,
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"one", ingress).await.unwrap();
        let (first_id, mut rd, mut wr) = recv_stream(&remote).await;
        let mut buf = [0u8; 64];
        let n = rd.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");

        // Replies reach the sending socket.
        wr.write_datagram(b"pong").await.unwrap();
        let mut reply = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..n], b"pong");
        assert_eq!(from, ingress);

        client.send_to(b"two", ingress).await.unwrap();
        let n = rd.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");

        // Idle past the timeout: the flow is swept and its stream reset.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rd.read_datagram(&mut buf).await.is_err());

        client.send_to(b"three", ingress).await.unwrap();
        let (second_id, mut rd2, _wr2) = recv_stream(&remote).await;
        assert_ne!(first_id, second_id);
        let n = rd2.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"three");

        stop_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn replies_alone_keep_a_flow_open() {
        let (local, remote) = session_pair(MuxConfig::default());
        let conns = Arc::new(ConnectionSet::new());
        conns.insert(Arc::new(PhysicalConnection::new("test", None, local)));

        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ingress = sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve_udp(
            sock,
            conns.clone(),
            UdpIngressOptions {
                service: 4,
                target: "127.0.0.1:53".into(),
                flow_timeout: Duration::from_millis(300),
                cleanup_interval: Duration::from_millis(50),
                max_flows: 16,
            },
            stop_rx,
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"subscribe", ingress).await.unwrap();
        let (_, mut rd, mut wr) = recv_stream(&remote).await;
        let mut buf = [0u8; 64];
        let n = rd.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"subscribe");

        // Stream replies for well over the idle timeout without any upstream packet.
        let mut reply = [0u8; 64];
        for _ in 0..10 {
            wr.write_datagram(b"tick").await.unwrap();
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&reply[..n], b"tick");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // The flow survived: the next packet rides the same stream.
        client.send_to(b"again", ingress).await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), rd.read_datagram(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"again");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), remote.accept_stream())
                .await
                .is_err(),
            "flow was reopened on a new stream"
        );

        stop_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn packet_without_connection_is_dropped() {
        let conns = Arc::new(ConnectionSet::new());
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let ingress = sock.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve_udp(
            sock,
            conns.clone(),
            UdpIngressOptions {
                service: 0,
                target: String::new(),
                flow_timeout: Duration::from_secs(60),
                cleanup_interval: Duration::from_secs(1),
                max_flows: 4,
            },
            stop_rx,
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"lost", ingress).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A connection arriving later serves the next packet.
        let (local, remote) = session_pair(MuxConfig::default());
        conns.insert(Arc::new(PhysicalConnection::new("late", None, local)));
        client.send_to(b"kept", ingress).await.unwrap();
        let mut st = tokio::time::timeout(Duration::from_secs(2), remote.accept_stream())
            .await
            .unwrap()
            .unwrap();
        protocol::read_open_record(&mut st).await.unwrap();
        let mut rd = DatagramReader::new(st);
        let mut buf = [0u8; 16];
        let n = rd.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"kept");

        stop_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
