//! Physical connections: transport stream, secure channel, obfuscator and
//! multiplexer session stacked together.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::shadowlink::tunnel::{
    error::TunnelError,
    frame::HEADER_LEN,
    mux::{MuxConfig, Role, Session},
    obfs::{ObfsConfig, ObfsReader, ObfsWriter},
    secure::{self, Algorithm, OpenedReader, SALT_LEN, SaltCache, SealedWriter},
    transport::BoxedStream,
};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub psk: Arc<[u8]>,
    pub algorithm: Algorithm,
    pub obfs: ObfsConfig,
    pub mux: MuxConfig,
    /// Bound on salt exchange plus the first authenticated frame.
    pub handshake_timeout: Duration,
}

impl ChannelConfig {
    fn max_payload(&self) -> usize {
        let padding = if self.obfs.enabled {
            self.obfs.max_padding
        } else {
            0
        };
        self.mux.max_frame_payload.max(padding)
    }
}

/// Bring up the secure channel and session on an established transport
/// stream. The dialer (`Role::Client`) sends the session salt; the listener
/// checks it against `salts` to refuse replayed connections.
pub async fn establish(
    stream: BoxedStream,
    role: Role,
    cfg: &ChannelConfig,
    salts: Option<&SaltCache>,
) -> Result<Arc<Session>, TunnelError> {
    let (mut rd, mut wr) = tokio::io::split(stream);

    let salt = match role {
        Role::Client => {
            let salt = secure::new_salt()?;
            tokio::time::timeout(cfg.handshake_timeout, async {
                wr.write_all(&salt).await?;
                wr.flush().await
            })
            .await
            .map_err(|_| TunnelError::Handshake("timed out sending session salt".into()))??;
            salt
        }
        Role::Server => {
            let mut salt = [0u8; SALT_LEN];
            tokio::time::timeout(cfg.handshake_timeout, rd.read_exact(&mut salt))
                .await
                .map_err(|_| TunnelError::Handshake("timed out waiting for session salt".into()))??;
            if let Some(cache) = salts {
                if !cache.insert(salt, Instant::now()) {
                    metrics::counter!("shadowlink_auth_failures_total").increment(1);
                    return Err(TunnelError::Authentication("replayed session salt"));
                }
            }
            salt
        }
    };

    let keys = secure::derive_keys(&cfg.psk, &salt, cfg.algorithm)?;
    let (send_key, recv_key) = match role {
        Role::Client => (keys.client_to_server, keys.server_to_client),
        Role::Server => (keys.server_to_client, keys.client_to_server),
    };

    let max_payload = cfg.max_payload();
    let reader = ObfsReader::new(
        OpenedReader::new(rd, recv_key, secure::max_record_body(HEADER_LEN + max_payload)),
        max_payload,
    );
    let writer = ObfsWriter::new(SealedWriter::new(wr, send_key), cfg.obfs.clone());
    let session = Session::spawn(role, cfg.mux.clone(), Box::new(reader), Box::new(writer));

    match tokio::time::timeout(cfg.handshake_timeout, session.ready()).await {
        Ok(Ok(())) => Ok(session),
        Ok(Err(err)) => {
            session.close();
            Err(err)
        }
        Err(_) => {
            session.close();
            Err(TunnelError::Handshake("peer sent no authenticated frame".into()))
        }
    }
}

/// A live physical connection and its identity.
pub struct PhysicalConnection {
    pub id: u64,
    pub label: String,
    pub created: Instant,
    pub remote: Option<SocketAddr>,
    pub session: Arc<Session>,
}

impl PhysicalConnection {
    pub fn new(label: impl Into<String>, remote: Option<SocketAddr>, session: Arc<Session>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            created: Instant::now(),
            remote,
            session,
        }
    }

    pub fn num_streams(&self) -> usize {
        self.session.num_streams()
    }

    pub fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    pub fn close(&self) {
        self.session.close();
    }
}

impl std::fmt::Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}
