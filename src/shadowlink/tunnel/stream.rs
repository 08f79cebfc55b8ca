//! Logical streams carried by a multiplexed session.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
    time::Instant,
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::shadowlink::tunnel::{
    error::TunnelError,
    frame::Frame,
    mux::{Core, INITIAL_WINDOW},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

pub(crate) struct StreamInner {
    recv: VecDeque<Bytes>,
    recv_buffered: usize,
    /// Bytes received in total and the cumulative limit advertised to the peer.
    recv_total: u64,
    recv_consumed: u64,
    recv_limit: u64,
    send_sent: u64,
    send_limit: u64,
    remote_closed: bool,
    local_closed: bool,
    reset: bool,
    lost: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    pub(crate) last_activity: Instant,
}

impl StreamInner {
    fn state(&self) -> StreamState {
        if self.reset || self.lost {
            return StreamState::Closed;
        }
        match (self.local_closed, self.remote_closed) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    fn wake(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// State shared between a stream handle and the session read loop.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    inner: Mutex<StreamInner>,
}

/// Outcome of delivering a data frame to a stream.
pub(crate) enum Delivery {
    Buffered,
    /// The stream is gone locally; the bytes were dropped.
    Dropped,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                recv: VecDeque::new(),
                recv_buffered: 0,
                recv_total: 0,
                recv_consumed: 0,
                recv_limit: INITIAL_WINDOW,
                send_sent: 0,
                send_limit: INITIAL_WINDOW,
                remote_closed: false,
                local_closed: false,
                reset: false,
                lost: false,
                read_waker: None,
                write_waker: None,
                last_activity: Instant::now(),
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state()
    }

    /// Raise the advertised receive limit to `limit` and return it, when the
    /// window grows beyond the protocol default.
    pub(crate) fn advertise(&self, window: u64) -> Option<u64> {
        let mut inner = self.lock();
        let limit = inner.recv_consumed + window;
        if limit <= inner.recv_limit {
            return None;
        }
        inner.recv_limit = limit;
        Some(limit)
    }

    pub(crate) fn deliver(&self, payload: Bytes) -> Result<Delivery, TunnelError> {
        let mut inner = self.lock();
        if inner.reset || inner.lost {
            return Ok(Delivery::Dropped);
        }
        if inner.remote_closed {
            return Err(TunnelError::protocol(format!(
                "data on stream {} after close",
                self.id
            )));
        }
        let len = payload.len() as u64;
        if inner.recv_total + len > inner.recv_limit {
            return Err(TunnelError::protocol(format!(
                "stream {} exceeded its receive window",
                self.id
            )));
        }
        inner.recv_total += len;
        if !payload.is_empty() {
            inner.recv_buffered += payload.len();
            inner.recv.push_back(payload);
        }
        inner.last_activity = Instant::now();
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        Ok(Delivery::Buffered)
    }

    pub(crate) fn raise_send_limit(&self, limit: u64) {
        let mut inner = self.lock();
        if limit > inner.send_limit {
            inner.send_limit = limit;
            if let Some(w) = inner.write_waker.take() {
                w.wake();
            }
        }
    }

    /// Remote half-close. Returns true when both halves are now closed.
    pub(crate) fn remote_close(&self) -> bool {
        let mut inner = self.lock();
        inner.remote_closed = true;
        inner.last_activity = Instant::now();
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        inner.local_closed
    }

    /// Mark the stream reset (by the peer, or locally for idleness) and
    /// return how many buffered bytes were discarded.
    pub(crate) fn reset(&self) -> usize {
        let mut inner = self.lock();
        inner.reset = true;
        let dropped = std::mem::take(&mut inner.recv_buffered);
        inner.recv.clear();
        inner.wake();
        dropped
    }

    /// The session died under the stream. Returns discarded buffered bytes.
    pub(crate) fn lose(&self) -> usize {
        let mut inner = self.lock();
        inner.lost = true;
        let dropped = std::mem::take(&mut inner.recv_buffered);
        inner.recv.clear();
        inner.wake();
        dropped
    }
}

/// One logical, bidirectional byte stream.
///
/// Dropping a stream that is not fully closed resets it on the wire.
pub struct LogicalStream {
    shared: Arc<StreamShared>,
    core: Arc<Core>,
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

fn stream_error(kind: io::ErrorKind, err: TunnelError) -> io::Error {
    io::Error::new(kind, err)
}

impl LogicalStream {
    pub(crate) fn new(shared: Arc<StreamShared>, core: Arc<Core>) -> Self {
        Self { shared, core }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();

        if let Some(front) = inner.recv.front_mut() {
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                inner.recv.pop_front();
            }
            inner.recv_buffered -= n;
            inner.recv_consumed += n as u64;

            // Replenish once half the window has been consumed.
            let window = this.core.cfg.stream_window.max(INITIAL_WINDOW);
            let update = if inner.recv_limit - inner.recv_consumed <= window / 2
                && !inner.remote_closed
            {
                inner.recv_limit = inner.recv_consumed + window;
                Some(inner.recv_limit)
            } else {
                None
            };
            drop(inner);

            this.core.release(n);
            if let Some(limit) = update {
                this.core.send(Frame::window_update(this.shared.id, limit));
            }
            return Poll::Ready(Ok(()));
        }

        if inner.reset {
            return Poll::Ready(Err(stream_error(
                io::ErrorKind::ConnectionReset,
                TunnelError::StreamReset,
            )));
        }
        if inner.lost {
            return Poll::Ready(Err(stream_error(
                io::ErrorKind::ConnectionAborted,
                TunnelError::ConnectionLost,
            )));
        }
        if inner.remote_closed {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();

        if inner.reset {
            return Poll::Ready(Err(stream_error(
                io::ErrorKind::ConnectionReset,
                TunnelError::StreamReset,
            )));
        }
        if inner.lost {
            return Poll::Ready(Err(stream_error(
                io::ErrorKind::ConnectionAborted,
                TunnelError::ConnectionLost,
            )));
        }
        if inner.local_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let available = inner.send_limit.saturating_sub(inner.send_sent);
        if available == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = (buf.len() as u64)
            .min(available)
            .min(this.core.cfg.max_frame_payload as u64) as usize;
        inner.send_sent += n as u64;
        inner.last_activity = Instant::now();
        drop(inner);

        if !this
            .core
            .send(Frame::data(this.shared.id, Bytes::copy_from_slice(&buf[..n])))
        {
            return Poll::Ready(Err(stream_error(
                io::ErrorKind::ConnectionAborted,
                TunnelError::ConnectionLost,
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();
        if inner.local_closed || inner.reset || inner.lost {
            return Poll::Ready(Ok(()));
        }
        inner.local_closed = true;
        let done = inner.remote_closed;
        drop(inner);

        this.core.send(Frame::close(this.shared.id));
        if done {
            this.core.forget(this.shared.id);
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        if self.shared.state() != StreamState::Closed {
            self.core.send(Frame::reset(self.shared.id));
        }
        let dropped = self.shared.lose();
        if dropped > 0 {
            self.core.release(dropped);
        }
        self.core.forget(self.shared.id);
    }
}
