//! Authenticated encryption over a raw byte stream.
//!
//! Record layout (big endian): `len:u32 | counter:u64 | ciphertext | tag`,
//! where `len` counts everything after itself. The AAD is `len || counter`
//! and the nonce is `0u32 || counter`. Counters start at 0 per direction and
//! must advance by exactly one per record.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use bytes::Bytes;
use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
    hkdf::{HKDF_SHA256, Salt},
    rand::{SecureRandom, SystemRandom},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::shadowlink::tunnel::error::TunnelError;

pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
const COUNTER_LEN: usize = 8;
const RECORD_HEADER_LEN: usize = 4 + COUNTER_LEN;

const INFO_CLIENT_TO_SERVER: &[u8] = b"shadowlink v1 client->server";
const INFO_SERVER_TO_CLIENT: &[u8] = b"shadowlink v1 server->client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-gcm" | "aes-256-gcm" | "aes256gcm" => Some(Algorithm::Aes256Gcm),
            "chacha20-poly1305" | "chacha20" => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    fn aead(&self) -> &'static aead::Algorithm {
        match self {
            Algorithm::Aes256Gcm => &aead::AES_256_GCM,
            Algorithm::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }
}

/// Per-connection directional keys.
pub struct SessionKeys {
    pub client_to_server: LessSafeKey,
    pub server_to_client: LessSafeKey,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Derive both directional keys from the PSK and the dialer's session salt.
pub fn derive_keys(
    psk: &[u8],
    salt: &[u8; SALT_LEN],
    algorithm: Algorithm,
) -> Result<SessionKeys, TunnelError> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(psk);
    let expand = |info: &'static [u8]| -> Result<LessSafeKey, TunnelError> {
        let info = [info];
        let okm = prk
            .expand(&info, algorithm.aead())
            .map_err(|_| TunnelError::Authentication("key derivation failed"))?;
        Ok(LessSafeKey::new(UnboundKey::from(okm)))
    };
    Ok(SessionKeys {
        client_to_server: expand(INFO_CLIENT_TO_SERVER)?,
        server_to_client: expand(INFO_SERVER_TO_CLIENT)?,
    })
}

pub fn new_salt() -> Result<[u8; SALT_LEN], TunnelError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| TunnelError::Authentication("system randomness unavailable"))?;
    Ok(salt)
}

fn nonce_for(counter: u64) -> Nonce {
    let mut n = [0u8; aead::NONCE_LEN];
    n[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(n)
}

/// Largest record body a reader accepts for a given plaintext limit.
pub fn max_record_body(max_plaintext: usize) -> usize {
    COUNTER_LEN + max_plaintext + TAG_LEN
}

pub struct SealedWriter<W> {
    inner: W,
    key: LessSafeKey,
    counter: u64,
    buf: Vec<u8>,
}

impl<W> SealedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, key: LessSafeKey) -> Self {
        Self {
            inner,
            key,
            counter: 0,
            buf: Vec::new(),
        }
    }

    /// Seal and write one record. The record is handed to the inner stream in
    /// a single write so chunked transports frame it as one chunk.
    pub async fn write_record(&mut self, plaintext: &[u8]) -> Result<(), TunnelError> {
        let counter = self.counter;
        self.counter = counter
            .checked_add(1)
            .ok_or(TunnelError::Authentication("record counter exhausted"))?;

        let body_len = COUNTER_LEN + plaintext.len() + TAG_LEN;
        let body_len: u32 = body_len
            .try_into()
            .map_err(|_| TunnelError::protocol("record too large"))?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        header[..4].copy_from_slice(&body_len.to_be_bytes());
        header[4..].copy_from_slice(&counter.to_be_bytes());

        self.buf.clear();
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(plaintext);
        let tag = self
            .key
            .seal_in_place_separate_tag(
                nonce_for(counter),
                Aad::from(header),
                &mut self.buf[RECORD_HEADER_LEN..],
            )
            .map_err(|_| TunnelError::Authentication("seal failed"))?;
        self.buf.extend_from_slice(tag.as_ref());

        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct OpenedReader<R> {
    inner: R,
    key: LessSafeKey,
    next: u64,
    max_body: usize,
    buf: Vec<u8>,
}

impl<R> OpenedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, key: LessSafeKey, max_body: usize) -> Self {
        Self {
            inner,
            key,
            next: 0,
            max_body,
            buf: Vec::new(),
        }
    }

    /// Read, verify and decrypt the next record. Nothing is returned unless
    /// both the counter and the tag check out.
    pub async fn read_record(&mut self) -> Result<Bytes, TunnelError> {
        let body_len = self.inner.read_u32().await? as usize;
        if !(COUNTER_LEN + TAG_LEN..=self.max_body).contains(&body_len) {
            return Err(TunnelError::Authentication("record length out of range"));
        }

        self.buf.resize(body_len, 0);
        self.inner.read_exact(&mut self.buf).await?;

        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&self.buf[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter < self.next {
            return Err(TunnelError::Authentication("replayed record"));
        }
        if counter > self.next {
            return Err(TunnelError::Authentication("record counter gap"));
        }

        let mut aad = [0u8; RECORD_HEADER_LEN];
        aad[..4].copy_from_slice(&(body_len as u32).to_be_bytes());
        aad[4..].copy_from_slice(&counter_bytes);

        let plaintext = self
            .key
            .open_in_place(
                nonce_for(counter),
                Aad::from(aad),
                &mut self.buf[COUNTER_LEN..],
            )
            .map_err(|_| TunnelError::Authentication("record tag mismatch"))?;
        let out = Bytes::copy_from_slice(plaintext);

        self.next += 1;
        Ok(out)
    }
}

/// Remembers recently seen session salts so a recorded connection cannot be
/// replayed against the listener.
pub struct SaltCache {
    seen: Mutex<HashMap<[u8; SALT_LEN], Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl SaltCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the salt was already seen within the ttl.
    pub fn insert(&self, salt: [u8; SALT_LEN], now: Instant) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = seen.get(&salt) {
            if now.duration_since(*at) < self.ttl {
                return false;
            }
        }

        if seen.len() >= self.capacity {
            let ttl = self.ttl;
            seen.retain(|_, at| now.duration_since(*at) < ttl);
        }
        if seen.len() >= self.capacity {
            if let Some(oldest) = seen.iter().min_by_key(|(_, at)| **at).map(|(k, _)| *k) {
                seen.remove(&oldest);
            }
        }
        seen.insert(salt, now);
        true
    }
}
