use std::{borrow::Cow, io, net::SocketAddr, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

pub const DEFAULT_PORT: u16 = 8443;

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Append `port` when `addr` carries no port (or an empty one).
pub fn with_default_port(addr: &str, port: u16) -> String {
    let addr = addr.trim();
    if addr.is_empty() || addr == ":" {
        return format!("0.0.0.0:{port}");
    }
    if addr.parse::<SocketAddr>().is_ok() {
        return addr.to_string();
    }
    // Bracketed IPv6 without port, or a bare IPv6 literal.
    if addr.starts_with('[') && addr.ends_with(']') {
        return format!("{addr}:{port}");
    }
    if addr.matches(':').count() > 1 {
        return format!("[{addr}]:{port}");
    }
    if let Some(host) = addr.strip_suffix(':') {
        return format!("{host}:{port}");
    }
    if addr.contains(':') {
        return addr.to_string();
    }
    format!("{addr}:{port}")
}

/// Host part of a `host:port` string, without IPv6 brackets.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    let host = match addr.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !h.is_empty() => h,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

pub async fn resolve_socket_addr(addr: &str) -> io::Result<SocketAddr> {
    let addr = normalize_bind_addr(addr);
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr.as_ref()).await?;
    it.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve {addr:?}"),
        )
    })
}

/// Socket tuning applied to TCP sockets carrying tunnel or relayed traffic.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
    pub read_buffer: usize,
    pub write_buffer: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
            read_buffer: 0,
            write_buffer: 0,
        }
    }
}

pub fn apply_tcp_options(stream: &TcpStream, opts: &SocketOptions) -> io::Result<()> {
    if opts.nodelay {
        stream.set_nodelay(true)?;
    }
    let sock = SockRef::from(stream);
    if let Some(idle) = opts.keepalive.filter(|d| !d.is_zero()) {
        let ka = TcpKeepalive::new().with_time(idle).with_interval(idle);
        sock.set_tcp_keepalive(&ka)?;
    }
    if opts.read_buffer > 0 {
        sock.set_recv_buffer_size(opts.read_buffer)?;
    }
    if opts.write_buffer > 0 {
        sock.set_send_buffer_size(opts.write_buffer)?;
    }
    Ok(())
}
