use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::Notify;

use crate::shadowlink::tunnel::{
    connection::PhysicalConnection, error::TunnelError, stream::LogicalStream,
};

const IDLE_POLL: Duration = Duration::from_millis(50);

/// Live physical connections available for stream placement.
///
/// The client pool and the server's accepted-connection set both use it.
/// Placement picks the connection with the fewest open streams.
#[derive(Default)]
pub struct ConnectionSet {
    conns: Mutex<Vec<Arc<PhysicalConnection>>>,
    changed: Notify,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<PhysicalConnection>>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, conn: Arc<PhysicalConnection>) {
        self.lock().push(conn);
        self.changed.notify_waiters();
    }

    pub fn remove(&self, id: u64) -> Option<Arc<PhysicalConnection>> {
        let mut conns = self.lock();
        let pos = conns.iter().position(|c| c.id == id)?;
        Some(conns.swap_remove(pos))
    }

    /// Number of live connections; dead ones are pruned on the way.
    pub fn len(&self) -> usize {
        let mut conns = self.lock();
        conns.retain(|c| c.is_alive());
        conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<PhysicalConnection>> {
        let mut conns = self.lock();
        conns.retain(|c| c.is_alive());
        conns.clone()
    }

    pub fn least_loaded(&self) -> Option<Arc<PhysicalConnection>> {
        let mut conns = self.lock();
        conns.retain(|c| c.is_alive());
        conns.iter().min_by_key(|c| c.num_streams()).cloned()
    }

    /// Open a stream on the least-loaded live connection without waiting.
    pub fn try_open_stream(
        &self,
    ) -> Option<(LogicalStream, Arc<PhysicalConnection>)> {
        loop {
            let conn = self.least_loaded()?;
            match conn.session.open_stream() {
                Ok(stream) => return Some((stream, conn)),
                Err(err) => {
                    tracing::debug!(conn = conn.id, err = %err, "tunnel: dropping connection that refused a stream");
                    self.remove(conn.id);
                }
            }
        }
    }

    /// Open a stream, waiting up to `wait` for a connection to appear.
    pub async fn open_stream(
        &self,
        wait: Duration,
    ) -> Result<(LogicalStream, Arc<PhysicalConnection>), TunnelError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.try_open_stream() {
                return Ok(found);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TunnelError::PoolExhausted(wait));
                }
            }
        }
    }

    /// Wait until no live connection carries a stream, or `deadline` passes.
    /// Returns whether the set went idle in time.
    pub async fn wait_idle(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            if self.snapshot().iter().all(|c| c.num_streams() == 0) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    pub fn close_all(&self) {
        let conns: Vec<_> = self.lock().drain(..).collect();
        for c in conns {
            c.close();
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowlink::tunnel::mux::{MuxConfig, testing::session_pair};

    fn conn_pair(label: &str) -> (Arc<PhysicalConnection>, Arc<PhysicalConnection>) {
        let (c, s) = session_pair(MuxConfig::default());
        (
            Arc::new(PhysicalConnection::new(label, None, c)),
            Arc::new(PhysicalConnection::new(label, None, s)),
        )
    }

    #[tokio::test]
    async fn placement_prefers_fewest_streams() {
        let set = ConnectionSet::new();
        let (a, _a_peer) = conn_pair("a");
        let (b, _b_peer) = conn_pair("b");
        set.insert(a.clone());
        set.insert(b.clone());

        let (_s1, c1) = set.try_open_stream().unwrap();
        let (_s2, c2) = set.try_open_stream().unwrap();
        assert_ne!(c1.id, c2.id);
        let (_s3, _) = set.try_open_stream().unwrap();
        assert_eq!(a.num_streams() + b.num_streams(), 3);
        assert!(a.num_streams().abs_diff(b.num_streams()) <= 1);
    }

    #[tokio::test]
    async fn dead_connections_are_skipped() {
        let set = ConnectionSet::new();
        let (a, _a_peer) = conn_pair("a");
        let (b, _b_peer) = conn_pair("b");
        set.insert(a.clone());
        set.insert(b.clone());
        a.close();

        for _ in 0..3 {
            let (_s, c) = set.try_open_stream().unwrap();
            assert_eq!(c.id, b.id);
        }
        assert_eq!(set.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_set_times_out_with_pool_exhausted() {
        let set = ConnectionSet::new();
        let err = set.open_stream(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, TunnelError::PoolExhausted(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn waiter_wakes_when_a_connection_arrives() {
        let set = Arc::new(ConnectionSet::new());
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.open_stream(Duration::from_secs(5)).await.map(|(_, c)| c.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (a, _a_peer) = conn_pair("a");
        set.insert(a.clone());
        assert_eq!(waiter.await.unwrap().unwrap(), a.id);
    }

    #[tokio::test]
    async fn wait_idle_follows_open_streams() {
        let set = ConnectionSet::new();
        let (a, _a_peer) = conn_pair("a");
        set.insert(a.clone());
        assert!(set.wait_idle(tokio::time::Instant::now()).await);

        let (stream, _) = set.try_open_stream().unwrap();
        let soon = tokio::time::Instant::now() + Duration::from_millis(100);
        assert!(!set.wait_idle(soon).await);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            drop(stream);
        });
        let later = tokio::time::Instant::now() + Duration::from_secs(5);
        assert!(set.wait_idle(later).await);
        release.await.unwrap();
    }
}
