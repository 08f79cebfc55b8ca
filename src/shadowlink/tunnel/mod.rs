//! Reverse tunnel data plane: transports, the secure channel, the stream
//! multiplexer and the two roles built on top of them.

pub mod client;
pub mod connection;
pub mod datagram;
pub mod error;
pub mod flows;
pub mod frame;
pub mod mux;
pub mod obfs;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod secure;
pub mod server;
pub mod sessions;
pub mod stream;
pub mod transport;

pub use client::start_client;
pub use server::start_server;

/// Resolves once `flag` is raised or its sender is gone.
///
/// Safe to use as a `select!` arm in spawned tasks: the borrowed value from
/// the watch channel never lives across an await of the caller.
pub(crate) async fn stopped(flag: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = flag.wait_for(|v| *v).await;
}
