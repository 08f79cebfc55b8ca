//! Client connection pool: a fixed set of dialing slots per path, optional
//! growth under load, and stream placement across every live connection.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use rand::{RngExt, rng};
use tokio::{
    sync::{Notify, watch},
    task::JoinSet,
    time::Instant,
};
use tokio_util::task::TaskTracker;

use crate::shadowlink::tunnel::{
    connection::{ChannelConfig, PhysicalConnection, establish},
    error::TunnelError,
    mux::Role,
    relay::{self, RelayOptions, Targets},
    sessions::ConnectionSet,
    stopped,
    stream::LogicalStream,
    transport::Transport,
};

/// Consecutive handshake failures before a path is reported degraded.
const DEGRADED_AFTER: u32 = 5;
/// Consecutive authentication failures per path before giving up.
const AUTH_FATAL_AFTER: u32 = 3;
/// Streams per connection that trigger growth of an aggressive pool.
const GROWTH_THRESHOLD: usize = 32;
const MAX_BACKOFF_FACTOR: u32 = 8;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PathOptions {
    pub label: String,
    pub transport: Arc<dyn Transport>,
    pub address: String,
    pub pool_size: usize,
    pub aggressive: bool,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub channel: ChannelConfig,
    pub relay: RelayOptions,
    pub cleanup_interval: Duration,
    /// Extra connections idle this long are closed.
    pub session_timeout: Duration,
}

#[derive(Default)]
struct PathHealth {
    handshake_failures: AtomicU32,
    auth_failures: AtomicU32,
    degraded: AtomicBool,
}

pub struct Pool {
    paths: Vec<Arc<PathOptions>>,
    health: Vec<PathHealth>,
    opts: PoolOptions,
    conns: Arc<ConnectionSet>,
    stop: watch::Sender<bool>,
    fatal: Notify,
    relays: TaskTracker,
}

impl Pool {
    pub fn new(paths: Vec<PathOptions>, opts: PoolOptions) -> Self {
        let health = paths.iter().map(|_| PathHealth::default()).collect();
        let (stop, _) = watch::channel(false);
        Self {
            paths: paths.into_iter().map(Arc::new).collect(),
            health,
            opts,
            conns: Arc::new(ConnectionSet::new()),
            stop,
            fatal: Notify::new(),
            relays: TaskTracker::new(),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        self.conns.clone()
    }

    /// Open a stream on the least-loaded live connection.
    pub async fn open_stream(
        &self,
        wait: Duration,
    ) -> Result<(LogicalStream, Arc<PhysicalConnection>), TunnelError> {
        self.conns.open_stream(wait).await
    }

    /// Run every slot until shutdown. Returns an error only when every path
    /// keeps failing authentication.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let mut tasks = JoinSet::new();
        for (pi, path) in self.paths.iter().enumerate() {
            for slot in 0..path.pool_size.max(1) {
                tasks.spawn(self.clone().slot_worker(pi, slot));
            }
            if path.aggressive {
                tasks.spawn(self.clone().health_sweeper(pi));
            }
        }

        let result = tokio::select! {
            _ = stopped(&mut shutdown) => Ok(()),
            _ = self.fatal.notified() => Err(TunnelError::Authentication("every path failed authentication")),
        };

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        if result.is_ok() && !self.conns.wait_idle(deadline).await {
            tracing::warn!("tunnel: drain timed out, closing connections with open streams");
        }

        self.stop.send_replace(true);
        self.conns.close_all();

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
        self.relays.close();
        if tokio::time::timeout_at(deadline, self.relays.wait()).await.is_err() {
            tracing::warn!(pending = self.relays.len(), "tunnel: relays still running after drain");
        }
        result
    }

    async fn connect(&self, path: &PathOptions) -> Result<Arc<PhysicalConnection>, TunnelError> {
        let stream = path.transport.dial(&path.address, path.dial_timeout).await?;
        let session = match establish(stream, Role::Client, &self.opts.channel, None).await {
            Ok(s) => s,
            Err(TunnelError::ConnectionLost) => {
                return Err(TunnelError::Handshake("connection closed during handshake".into()));
            }
            Err(err) => return Err(err),
        };
        metrics::counter!("shadowlink_sessions_dialed_total").increment(1);
        Ok(Arc::new(PhysicalConnection::new(path.label.clone(), None, session)))
    }

    fn record_success(&self, pi: usize) {
        let h = &self.health[pi];
        h.handshake_failures.store(0, Ordering::Relaxed);
        h.auth_failures.store(0, Ordering::Relaxed);
        if h.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!(path = %self.paths[pi].label, "tunnel: path recovered");
        }
    }

    /// Track a failed attempt. Returns true when the pool must give up.
    fn record_failure(&self, pi: usize, err: &TunnelError) -> bool {
        let h = &self.health[pi];
        if !(err.is_handshake() || err.is_authentication()) {
            return false;
        }

        let n = h.handshake_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= DEGRADED_AFTER && !h.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(path = %self.paths[pi].label, failures = n, "tunnel: path degraded");
        }

        if err.is_authentication() {
            h.auth_failures.fetch_add(1, Ordering::Relaxed);
            let all_failing = self
                .health
                .iter()
                .all(|h| h.auth_failures.load(Ordering::Relaxed) >= AUTH_FATAL_AFTER);
            if all_failing {
                tracing::error!("tunnel: authentication failed on every path, giving up");
                self.fatal.notify_one();
                return true;
            }
        }
        false
    }

    fn is_degraded(&self, pi: usize) -> bool {
        self.health[pi].degraded.load(Ordering::Relaxed)
    }

    async fn slot_worker(self: Arc<Self>, pi: usize, slot: usize) {
        let path = self.paths[pi].clone();
        let mut stop = self.stop.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *stop.borrow() {
                break;
            }
            let attempt = tokio::select! {
                r = self.connect(&path) => r,
                _ = stopped(&mut stop) => break,
            };

            let delay = match attempt {
                Ok(conn) => {
                    failures = 0;
                    self.record_success(pi);
                    tracing::info!(path = %path.label, slot, conn = conn.id, "tunnel: connection established");
                    self.conns.insert(conn.clone());
                    metrics::gauge!("shadowlink_sessions_active").increment(1.0);

                    self.serve(&conn, &mut stop).await;

                    self.conns.remove(conn.id);
                    conn.close();
                    metrics::gauge!("shadowlink_sessions_active").decrement(1.0);
                    if *stop.borrow() {
                        break;
                    }
                    let reason = conn.session.close_reason();
                    tracing::info!(path = %path.label, slot, conn = conn.id, reason = ?reason, "tunnel: connection lost, redialing");
                    redial_delay(path.retry_interval)
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    if self.record_failure(pi, &err) {
                        break;
                    }
                    let delay = if self.is_degraded(pi) {
                        backoff_delay(path.retry_interval, MAX_BACKOFF_FACTOR.ilog2() + 1)
                    } else {
                        backoff_delay(path.retry_interval, failures)
                    };
                    tracing::warn!(
                        err = %err,
                        path = %path.label,
                        slot,
                        retry_in = %humantime::format_duration(delay),
                        "tunnel: dial failed"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut stop) => break,
            }
        }
    }

    /// Relay streams the server opens on `conn` until it closes or the pool stops.
    async fn serve(&self, conn: &Arc<PhysicalConnection>, stop: &mut watch::Receiver<bool>) {
        loop {
            tokio::select! {
                res = conn.session.accept_stream() => {
                    let Ok(stream) = res else {
                        break;
                    };
                    let relay_opts = self.opts.relay.clone();
                    self.relays.spawn(async move {
                        let id = stream.id();
                        if let Err(err) = relay::serve_stream(stream, Targets::FromPeer, &relay_opts).await {
                            if err.is_disconnect() {
                                tracing::debug!(stream = id, err = %err, "tunnel: relay ended");
                            } else {
                                tracing::warn!(stream = id, err = %err, "tunnel: relay failed");
                            }
                        }
                    });
                }
                _ = stopped(stop) => break,
            }
        }
    }

    /// Grow a path when every connection is busy and retire idle extras.
    async fn health_sweeper(self: Arc<Self>, pi: usize) {
        let path = self.paths[pi].clone();
        let mut stop = self.stop.subscribe();
        let mut tick = tokio::time::interval(self.opts.cleanup_interval.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut extras: Vec<(Arc<PhysicalConnection>, Option<Instant>)> = Vec::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = stopped(&mut stop) => break,
            }

            let now = Instant::now();
            extras.retain_mut(|(conn, idle_since)| {
                if !conn.is_alive() {
                    return false;
                }
                if conn.num_streams() > 0 {
                    *idle_since = None;
                    return true;
                }
                let since = *idle_since.get_or_insert(now);
                if now.duration_since(since) >= self.opts.session_timeout {
                    tracing::info!(path = %path.label, conn = conn.id, "tunnel: closing idle extra connection");
                    self.conns.remove(conn.id);
                    conn.close();
                    return false;
                }
                true
            });

            let live: Vec<_> = self
                .conns
                .snapshot()
                .into_iter()
                .filter(|c| c.label == path.label)
                .collect();
            let busy = !live.is_empty() && live.iter().all(|c| c.num_streams() >= GROWTH_THRESHOLD);
            if !busy || extras.len() >= path.pool_size {
                continue;
            }

            let attempt = tokio::select! {
                r = self.connect(&path) => r,
                _ = stopped(&mut stop) => break,
            };
            match attempt {
                Ok(conn) => {
                    tracing::info!(path = %path.label, conn = conn.id, extras = extras.len() + 1, "tunnel: pool grown under load");
                    self.conns.insert(conn.clone());
                    extras.push((conn.clone(), None));
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let mut stop = pool.stop.subscribe();
                        pool.serve(&conn, &mut stop).await;
                        pool.conns.remove(conn.id);
                        conn.close();
                    });
                }
                Err(err) => {
                    tracing::warn!(err = %err, path = %path.label, "tunnel: pool growth dial failed");
                }
            }
        }
    }
}

/// Delay before redialing a connection that was up: uniform below `retry`.
fn redial_delay(retry: Duration) -> Duration {
    let ms = retry.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng().random_range(0..ms))
}

/// Exponential backoff from `base`, capped at 8x, with 25% downward jitter.
fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(MAX_BACKOFF_FACTOR.ilog2());
    let full = base.saturating_mul(1 << exp);
    let ms = full.as_millis() as u64;
    if ms == 0 {
        return full;
    }
    Duration::from_millis(rng().random_range(ms - ms / 4..=ms))
}
