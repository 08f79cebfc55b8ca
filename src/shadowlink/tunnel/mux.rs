//! SMUX-style session: many logical streams over one framed connection.
//!
//! Each session runs a read loop, a writer task that owns the frame sink and
//! a maintenance task for keep-alives and idle streams. Clients allocate odd
//! stream ids and servers even ids, so neither side has to coordinate.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{Notify, mpsc, watch};

use crate::shadowlink::tunnel::{
    error::TunnelError,
    frame::{Frame, FrameType},
    obfs::{FrameSink, FrameSource},
    stream::{Delivery, LogicalStream, StreamShared},
};

/// Per-direction window every stream starts with.
pub const INITIAL_WINDOW: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to the ids this side allocates.
    fn allocates(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id % 2 == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub keepalive: Duration,
    /// A ping left unanswered this long marks the connection dead.
    pub keepalive_timeout: Duration,
    pub max_frame_payload: usize,
    /// Receive window advertised per stream (`max_stream_buffer`).
    pub stream_window: u64,
    /// Session-wide cap on buffered, unread bytes (`max_recv_buffer`).
    pub max_recv_buffer: usize,
    /// Zero disables idle stream resets.
    pub stream_idle_timeout: Duration,
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            max_frame_payload: 32 * 1024,
            stream_window: 1024 * 1024,
            max_recv_buffer: 4 * 1024 * 1024,
            stream_idle_timeout: Duration::from_secs(300),
            accept_backlog: 1024,
        }
    }
}

impl MuxConfig {
    fn tick(&self) -> Duration {
        let mut tick = self.keepalive.min(Duration::from_secs(1));
        if !self.stream_idle_timeout.is_zero() {
            tick = tick.min(self.stream_idle_timeout / 2);
        }
        tick.max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// The peer went away or the link failed.
    Lost,
    KeepaliveTimeout,
    Protocol(String),
    Authentication(&'static str),
}

impl CloseReason {
    fn from_error(err: &TunnelError) -> Self {
        match err {
            TunnelError::Authentication(m) => CloseReason::Authentication(m),
            TunnelError::Protocol(m) => CloseReason::Protocol(m.clone()),
            _ => CloseReason::Lost,
        }
    }

    pub fn to_error(&self) -> TunnelError {
        match self {
            CloseReason::Authentication(m) => TunnelError::Authentication(m),
            CloseReason::Protocol(m) => TunnelError::Protocol(m.clone()),
            _ => TunnelError::ConnectionLost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the peer's first frame.
    Handshaking,
    Ready,
    Closed(CloseReason),
}

struct State {
    streams: HashMap<u32, Arc<StreamShared>>,
    next_id: u32,
    accept_tx: Option<mpsc::Sender<LogicalStream>>,
    ping_sent: Option<Instant>,
    next_nonce: u64,
}

/// Session internals shared with stream handles.
pub(crate) struct Core {
    role: Role,
    pub(crate) cfg: MuxConfig,
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Frame>,
    buffered: AtomicUsize,
    recv_space: Notify,
    phase: watch::Sender<Phase>,
    last_activity: Mutex<Instant>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for the writer task. False once the writer is gone.
    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Return session receive budget consumed by a reader.
    pub(crate) fn release(&self, n: usize) {
        self.buffered.fetch_sub(n, Ordering::AcqRel);
        self.recv_space.notify_one();
    }

    pub(crate) fn forget(&self, id: u32) {
        self.lock().streams.remove(&id);
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn is_closed(&self) -> bool {
        matches!(*self.phase.borrow(), Phase::Closed(_))
    }

    fn shutdown(&self, reason: CloseReason) {
        let mut first = false;
        self.phase.send_if_modified(|p| {
            if matches!(p, Phase::Closed(_)) {
                return false;
            }
            *p = Phase::Closed(reason.clone());
            first = true;
            true
        });
        if !first {
            return;
        }

        let streams: Vec<_> = {
            let mut st = self.lock();
            st.accept_tx = None;
            st.streams.drain().map(|(_, s)| s).collect()
        };
        for s in streams {
            let dropped = s.lose();
            if dropped > 0 {
                self.buffered.fetch_sub(dropped, Ordering::AcqRel);
            }
        }
        self.recv_space.notify_one();
    }

    async fn wait_closed(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|p| matches!(p, Phase::Closed(_))).await;
    }
}

/// One multiplexed session over a physical connection.
pub struct Session {
    core: Arc<Core>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<LogicalStream>>,
}

impl Session {
    /// Start the session tasks. The first frame sent is a ping so the peer
    /// can confirm the keys before it puts the connection into service.
    pub fn spawn(
        role: Role,
        cfg: MuxConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Arc<Session> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_backlog.max(1));
        let (phase, _) = watch::channel(Phase::Handshaking);

        let core = Arc::new(Core {
            role,
            cfg,
            state: Mutex::new(State {
                streams: HashMap::new(),
                next_id: role.first_id(),
                accept_tx: Some(accept_tx),
                ping_sent: None,
                next_nonce: 1,
            }),
            tx,
            buffered: AtomicUsize::new(0),
            recv_space: Notify::new(),
            phase,
            last_activity: Mutex::new(Instant::now()),
        });

        core.send(Frame::ping(0));
        tokio::spawn(write_loop(core.clone(), rx, sink));
        tokio::spawn(read_loop(core.clone(), source));
        tokio::spawn(maintain(core.clone()));

        Arc::new(Session {
            core,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Resolves once the peer's first frame authenticated, or with the reason
    /// the session closed before that.
    pub async fn ready(&self) -> Result<(), TunnelError> {
        let mut rx = self.core.phase.subscribe();
        let phase = rx
            .wait_for(|p| !matches!(p, Phase::Handshaking))
            .await
            .map_err(|_| TunnelError::ConnectionLost)?
            .clone();
        match phase {
            Phase::Closed(reason) => Err(reason.to_error()),
            _ => Ok(()),
        }
    }

    pub fn open_stream(&self) -> Result<LogicalStream, TunnelError> {
        if self.core.is_closed() {
            return Err(TunnelError::ConnectionLost);
        }
        let shared = {
            let mut st = self.core.lock();
            let id = st.next_id;
            st.next_id = id
                .checked_add(2)
                .ok_or_else(|| TunnelError::protocol("stream ids exhausted"))?;
            let shared = StreamShared::new(id);
            st.streams.insert(id, shared.clone());
            shared
        };

        let id = shared.id;
        if !self.core.send(Frame::open(id)) {
            self.core.forget(id);
            return Err(TunnelError::ConnectionLost);
        }
        if let Some(limit) = shared.advertise(self.core.cfg.stream_window) {
            self.core.send(Frame::window_update(id, limit));
        }
        metrics::counter!("shadowlink_streams_opened_total").increment(1);
        Ok(LogicalStream::new(shared, self.core.clone()))
    }

    pub async fn accept_stream(&self) -> Result<LogicalStream, TunnelError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(TunnelError::ConnectionLost)
    }

    pub fn close(&self) {
        self.core.shutdown(CloseReason::Local);
    }

    pub async fn closed(&self) -> CloseReason {
        self.core.wait_closed().await;
        self.close_reason().unwrap_or(CloseReason::Lost)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match &*self.core.phase.borrow() {
            Phase::Closed(r) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn num_streams(&self) -> usize {
        self.core.lock().streams.len()
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .core
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.core.shutdown(CloseReason::Local);
    }
}

async fn write_loop(
    core: Arc<Core>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut sink: Box<dyn FrameSink>,
) {
    loop {
        let frame = tokio::select! {
            f = rx.recv() => f,
            _ = core.wait_closed() => None,
        };
        let Some(frame) = frame else {
            return;
        };
        let is_data = frame.kind == FrameType::Data;
        if let Err(err) = sink.send_frame(frame).await {
            tracing::debug!(err = %err, "tunnel: session write failed");
            core.shutdown(CloseReason::from_error(&err));
            return;
        }
        if is_data {
            core.touch();
        }
    }
}

async fn read_loop(core: Arc<Core>, mut source: Box<dyn FrameSource>) {
    loop {
        let res = tokio::select! {
            r = source.recv_frame() => r,
            _ = core.wait_closed() => return,
        };
        let frame = match res {
            Ok(f) => f,
            Err(err) => {
                if err.is_authentication() {
                    metrics::counter!("shadowlink_auth_failures_total").increment(1);
                }
                tracing::debug!(err = %err, "tunnel: session read failed");
                core.shutdown(CloseReason::from_error(&err));
                return;
            }
        };

        core.phase.send_if_modified(|p| {
            if *p == Phase::Handshaking {
                *p = Phase::Ready;
                return true;
            }
            false
        });
        core.touch();

        if frame.kind == FrameType::Data && !wait_recv_space(&core).await {
            return;
        }
        if let Err(err) = handle_frame(&core, frame) {
            tracing::debug!(err = %err, "tunnel: closing session on protocol error");
            core.shutdown(CloseReason::from_error(&err));
            return;
        }
    }
}

/// Pause the read loop while the session receive buffer is full. Returns
/// false when the session closed meanwhile.
async fn wait_recv_space(core: &Core) -> bool {
    loop {
        if core.is_closed() {
            return false;
        }
        if core.buffered.load(Ordering::Acquire) < core.cfg.max_recv_buffer {
            return true;
        }
        tokio::select! {
            _ = core.recv_space.notified() => {}
            _ = core.wait_closed() => return false,
        }
    }
}

fn handle_frame(core: &Arc<Core>, frame: Frame) -> Result<(), TunnelError> {
    let id = frame.stream_id;
    match frame.kind {
        FrameType::Open => {
            if core.role.allocates(id) {
                return Err(TunnelError::protocol(format!(
                    "peer opened stream {id} with our parity"
                )));
            }
            let shared = StreamShared::new(id);
            let accept_tx = {
                let mut st = core.lock();
                if st.streams.contains_key(&id) {
                    return Err(TunnelError::protocol(format!("duplicate stream id {id}")));
                }
                st.streams.insert(id, shared.clone());
                st.accept_tx.clone()
            };
            let stream = LogicalStream::new(shared.clone(), core.clone());
            let accepted = match accept_tx {
                Some(tx) => tx.try_send(stream).is_ok(),
                None => false,
            };
            // A rejected stream was dropped above, which resets it.
            if accepted {
                if let Some(limit) = shared.advertise(core.cfg.stream_window) {
                    core.send(Frame::window_update(id, limit));
                }
                metrics::counter!("shadowlink_streams_accepted_total").increment(1);
            }
        }
        FrameType::Data => {
            let stream = core.lock().streams.get(&id).cloned();
            let Some(stream) = stream else {
                return Ok(());
            };
            let len = frame.payload.len();
            if let Delivery::Buffered = stream.deliver(frame.payload)? {
                core.buffered.fetch_add(len, Ordering::AcqRel);
            }
        }
        FrameType::Close => {
            let stream = core.lock().streams.get(&id).cloned();
            if let Some(stream) = stream {
                if stream.remote_close() {
                    core.forget(id);
                }
            }
        }
        FrameType::Reset => {
            let stream = core.lock().streams.remove(&id);
            if let Some(stream) = stream {
                let dropped = stream.reset();
                if dropped > 0 {
                    core.release(dropped);
                }
            }
        }
        FrameType::Ping => {
            if let Some(nonce) = frame.value_u64() {
                core.send(Frame::pong(nonce));
            }
        }
        FrameType::Pong => {
            core.lock().ping_sent = None;
        }
        FrameType::WindowUpdate => {
            let stream = core.lock().streams.get(&id).cloned();
            if let (Some(stream), Some(limit)) = (stream, frame.value_u64()) {
                stream.raise_send_limit(limit);
            }
        }
        FrameType::Padding => {}
    }
    Ok(())
}

/// Keep-alive pings, dead-peer detection and idle stream resets.
async fn maintain(core: Arc<Core>) {
    let mut ticker = tokio::time::interval(core.cfg.tick());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = core.wait_closed() => return,
        }
        let now = Instant::now();

        let ping = {
            let mut st = core.lock();
            match st.ping_sent {
                Some(at) if now.duration_since(at) > core.cfg.keepalive_timeout => {
                    drop(st);
                    tracing::debug!("tunnel: keepalive timed out");
                    core.shutdown(CloseReason::KeepaliveTimeout);
                    return;
                }
                Some(_) => None,
                None => {
                    let idle = now.duration_since(
                        *core.last_activity.lock().unwrap_or_else(|e| e.into_inner()),
                    );
                    if idle >= core.cfg.keepalive {
                        st.ping_sent = Some(now);
                        st.next_nonce += 1;
                        Some(st.next_nonce)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(nonce) = ping {
            core.send(Frame::ping(nonce));
        }

        if !core.cfg.stream_idle_timeout.is_zero() {
            let idle: Vec<_> = core
                .lock()
                .streams
                .values()
                .filter(|s| now.duration_since(s.lock().last_activity) > core.cfg.stream_idle_timeout)
                .cloned()
                .collect();
            for s in idle {
                tracing::debug!(stream = s.id, "tunnel: resetting idle stream");
                core.forget(s.id);
                core.send(Frame::reset(s.id));
                let dropped = s.reset();
                if dropped > 0 {
                    core.release(dropped);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;

    use super::*;

    pub struct ChanSink(pub mpsc::UnboundedSender<Frame>);
    pub struct ChanSource(pub mpsc::UnboundedReceiver<Frame>);

    #[async_trait]
    impl FrameSink for ChanSink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
            self.0.send(frame).map_err(|_| TunnelError::ConnectionLost)
        }
    }

    #[async_trait]
    impl FrameSource for ChanSource {
        async fn recv_frame(&mut self) -> Result<Frame, TunnelError> {
            self.0.recv().await.ok_or(TunnelError::ConnectionLost)
        }
    }

    /// Client and server sessions wired back to back in memory.
    pub fn session_pair(cfg: MuxConfig) -> (Arc<Session>, Arc<Session>) {
        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
        let client = Session::spawn(
            Role::Client,
            cfg.clone(),
            Box::new(ChanSource(s2c_rx)),
            Box::new(ChanSink(c2s_tx)),
        );
        let server = Session::spawn(
            Role::Server,
            cfg,
            Box::new(ChanSource(c2s_rx)),
            Box::new(ChanSink(s2c_tx)),
        );
        (client, server)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::testing::*;
    use super::*;
    use crate::shadowlink::tunnel::stream::StreamState;

    #[tokio::test]
    async fn parity_and_ordered_delivery() {
        let (client, server) = session_pair(MuxConfig::default());
        client.ready().await.unwrap();
        server.ready().await.unwrap();

        let mut a = client.open_stream().unwrap();
        let mut b = client.open_stream().unwrap();
        assert_eq!((a.id(), b.id()), (1, 3));
        let mut s = server.open_stream().unwrap();
        assert_eq!(s.id(), 2);

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.shutdown().await.unwrap();
            a
        });

        let mut sa = server.accept_stream().await.unwrap();
        assert_eq!(sa.id(), 1);
        let mut got = Vec::new();
        sa.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        let a = writer.await.unwrap();
        assert_eq!(a.state(), StreamState::HalfClosedLocal);
        assert_eq!(sa.state(), StreamState::HalfClosedRemote);

        b.write_all(b"x").await.unwrap();
        let mut sb = server.accept_stream().await.unwrap();
        let mut one = [0u8; 1];
        sb.read_exact(&mut one).await.unwrap();

        s.write_all(b"from server").await.unwrap();
        let mut cs = client.accept_stream().await.unwrap();
        assert_eq!(cs.id(), 2);
        let mut buf = [0u8; 11];
        cs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from server");
    }

    #[tokio::test]
    async fn sender_waits_for_window() {
        let cfg = MuxConfig {
            stream_window: INITIAL_WINDOW,
            ..MuxConfig::default()
        };
        let (client, server) = session_pair(cfg);
        let mut a = client.open_stream().unwrap();

        let writer = tokio::spawn(async move {
            a.write_all(&vec![1u8; INITIAL_WINDOW as usize + 10]).await.unwrap();
            a
        });
        let mut sa = server.accept_stream().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Nothing beyond the window is in flight until the reader consumes.
        assert!(!writer.is_finished());

        let mut buf = vec![0u8; INITIAL_WINDOW as usize + 10];
        sa.read_exact(&mut buf).await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn excess_data_is_a_protocol_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let cfg = MuxConfig {
            stream_window: INITIAL_WINDOW,
            ..MuxConfig::default()
        };
        let server = Session::spawn(
            Role::Server,
            cfg,
            Box::new(ChanSource(rx)),
            Box::new(ChanSink(out_tx)),
        );
        tx.send(Frame::ping(0)).unwrap();
        tx.send(Frame::open(1)).unwrap();
        let chunk = Bytes::from(vec![0u8; 32 * 1024]);
        for _ in 0..3 {
            tx.send(Frame::data(1, chunk.clone())).unwrap();
        }
        let reason = server.closed().await;
        assert!(matches!(reason, CloseReason::Protocol(_)), "{reason:?}");
    }

    #[tokio::test]
    async fn wrong_parity_and_duplicate_open_are_rejected() {
        for frames in [
            vec![Frame::open(2)],
            vec![Frame::open(1), Frame::open(1)],
        ] {
            let (tx, rx) = mpsc::unbounded_channel();
            let (out_tx, _out_rx) = mpsc::unbounded_channel();
            let server = Session::spawn(
                Role::Server,
                MuxConfig::default(),
                Box::new(ChanSource(rx)),
                Box::new(ChanSink(out_tx)),
            );
            for f in frames {
                tx.send(f).unwrap();
            }
            let reason = server.closed().await;
            assert!(matches!(reason, CloseReason::Protocol(_)), "{reason:?}");
        }
    }

    #[tokio::test]
    async fn session_close_fails_streams_with_connection_lost() {
        let (client, server) = session_pair(MuxConfig::default());
        let mut a = client.open_stream().unwrap();
        a.write_all(b"hi").await.unwrap();
        let _sa = server.accept_stream().await.unwrap();

        server.close();
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            TunnelError::from(err),
            TunnelError::ConnectionLost
        ));
        assert!(client.is_closed());
        assert_eq!(client.num_streams(), 0);
        assert!(client.open_stream().is_err());
    }

    #[tokio::test]
    async fn dropped_stream_resets_peer() {
        let (client, server) = session_pair(MuxConfig::default());
        let a = client.open_stream().unwrap();
        let mut sa = server.accept_stream().await.unwrap();
        drop(a);

        let mut buf = [0u8; 1];
        let err = sa.read(&mut buf).await.unwrap_err();
        assert!(matches!(TunnelError::from(err), TunnelError::StreamReset));
        assert_eq!(client.num_streams(), 0);
    }

    #[tokio::test]
    async fn full_close_forgets_stream() {
        let (client, server) = session_pair(MuxConfig::default());
        let mut a = client.open_stream().unwrap();
        let mut sa = server.accept_stream().await.unwrap();
        a.shutdown().await.unwrap();
        sa.shutdown().await.unwrap();

        let mut buf = Vec::new();
        sa.read_to_end(&mut buf).await.unwrap();
        a.read_to_end(&mut buf).await.unwrap();
        assert_eq!(a.state(), StreamState::Closed);
        assert_eq!(client.num_streams(), 0);
        assert_eq!(server.num_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_kills_session() {
        let (_tx, rx) = mpsc::unbounded_channel::<Frame>();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let cfg = MuxConfig {
            keepalive: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(3),
            ..MuxConfig::default()
        };
        let session = Session::spawn(
            Role::Client,
            cfg,
            Box::new(ChanSource(rx)),
            Box::new(ChanSink(out_tx)),
        );
        let reason = session.closed().await;
        assert_eq!(reason, CloseReason::KeepaliveTimeout);

        let mut pings = 0;
        while let Ok(f) = out_rx.try_recv() {
            if f.kind == FrameType::Ping {
                pings += 1;
            }
        }
        assert!(pings >= 2, "initial ping plus keepalive, got {pings}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_is_reset() {
        let cfg = MuxConfig {
            stream_idle_timeout: Duration::from_secs(2),
            keepalive: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(120),
            ..MuxConfig::default()
        };
        let (client, server) = session_pair(cfg);
        let mut a = client.open_stream().unwrap();
        let _sa = server.accept_stream().await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut buf = [0u8; 1];
        let err = a.read(&mut buf).await.unwrap_err();
        assert!(matches!(TunnelError::from(err), TunnelError::StreamReset));
    }
}
