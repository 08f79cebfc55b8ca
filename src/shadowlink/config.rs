use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::shadowlink::{
    net::{self, DEFAULT_PORT, SocketOptions},
    tunnel::{
        connection::ChannelConfig,
        mux::MuxConfig,
        obfs::ObfsConfig,
        relay::RelayOptions,
        secure::Algorithm,
        transport::{
            TransportOptions, http::MimicOptions, kcp::KcpOptions, parse_transport,
            tls::TlsOptions, websocket::WsOptions,
        },
    },
};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_FRAME_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already folds SHADOWLINK_CONFIG into the flag; this covers callers
    // that bypass the CLI.
    if let Some(p) = std::env::var_os("SHADOWLINK_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("shadowlink.yaml")));
        }
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["shadowlink.yaml", "shadowlink.yml", "shadowlink.toml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/shadowlink/shadowlink.yaml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "shadowlink", "shadowlink")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("shadowlink.yaml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .yaml/.yml or .toml)", ext),
    };

    Ok(Config::from_file_config(fc)?)
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid mode {0:?}: must be 'server' or 'client'")]
    InvalidMode(String),
    #[error("missing listen address for server mode")]
    MissingListen,
    #[error("missing connection paths for client mode")]
    MissingPaths,
    #[error("missing pre-shared key (encryption.psk)")]
    MissingPsk,
    #[error("unknown transport {0:?} (expected tcp|kcp|ws|wss|http|https)")]
    UnknownTransport(String),
    #[error("unknown encryption algorithm {0:?} (expected aes-gcm|chacha20-poly1305)")]
    UnknownAlgorithm(String),
    #[error("unknown profile {0:?} (expected balanced|latency|throughput|gaming|lowcpu)")]
    UnknownProfile(String),
    #[error("maps[{index}]: unknown protocol {value:?} (expected tcp|udp|both)")]
    UnknownPortProtocol { index: usize, value: String },
    #[error("maps[{0}]: empty bind address")]
    EmptyBind(usize),
    #[error("maps[{0}]: empty target address")]
    EmptyTarget(usize),
    #[error("too many port maps: {0}")]
    TooManyMaps(usize),
    #[error("paths[{0}]: empty address")]
    EmptyPathAddress(usize),
    #[error("obfuscation: min_padding {min} exceeds max_padding {max}")]
    PaddingRange { min: usize, max: usize },
    #[error("obfuscation: min_delay_ms {min} exceeds max_delay_ms {max}")]
    DelayRange { min: u64, max: u64 },
    #[error("obfuscation: burst_chance {0} outside [0, 1]")]
    BurstChance(f64),
    #[error("multiplexer: frame_size must be positive")]
    FrameSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Balanced,
    Latency,
    Throughput,
    Gaming,
    LowCpu,
}

impl Profile {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "" | "balanced" => Profile::Balanced,
            "latency" => Profile::Latency,
            "throughput" => Profile::Throughput,
            "gaming" => Profile::Gaming,
            "lowcpu" => Profile::LowCpu,
            _ => return None,
        })
    }

    fn multiplexer(self) -> MultiplexerConfig {
        let (keepalive, recv, stream, frame) = match self {
            Profile::Balanced => (10, 4 << 20, 1 << 20, DEFAULT_FRAME_SIZE),
            Profile::Latency => (5, 2 << 20, 512 << 10, 16 * 1024),
            Profile::Throughput => (15, 16 << 20, 4 << 20, 65535),
            Profile::Gaming => (5, 1 << 20, 256 << 10, 8 * 1024),
            Profile::LowCpu => (30, 4 << 20, 1 << 20, DEFAULT_FRAME_SIZE),
        };
        MultiplexerConfig {
            keepalive: Duration::from_secs(keepalive),
            max_recv_buffer: recv,
            max_stream_buffer: stream,
            frame_size: frame,
        }
    }

    fn kcp(self) -> KcpOptions {
        let base = KcpOptions::default();
        match self {
            Profile::Balanced => base,
            Profile::Latency => KcpOptions {
                interval: 5,
                sndwnd: 512,
                rcvwnd: 512,
                ..base
            },
            Profile::Throughput => KcpOptions {
                interval: 20,
                sndwnd: 2048,
                rcvwnd: 2048,
                ..base
            },
            Profile::Gaming => KcpOptions {
                interval: 5,
                sndwnd: 256,
                rcvwnd: 256,
                ..base
            },
            Profile::LowCpu => KcpOptions {
                nodelay: false,
                interval: 40,
                resend: 0,
                nc: false,
                sndwnd: 512,
                rcvwnd: 512,
                ..base
            },
        }
    }

    fn obfuscation(self) -> ObfsConfig {
        let (max_padding, max_delay_ms, burst) = match self {
            Profile::Balanced => (256, 5, 0.1),
            Profile::Latency | Profile::Gaming => (128, 0, 0.05),
            Profile::Throughput => (512, 2, 0.05),
            Profile::LowCpu => (128, 0, 0.02),
        };
        ObfsConfig {
            enabled: false,
            min_padding: 16,
            max_padding,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(max_delay_ms),
            burst_chance: burst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Both,
}

impl PortProtocol {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "" | "tcp" => PortProtocol::Tcp,
            "udp" => PortProtocol::Udp,
            "both" => PortProtocol::Both,
            _ => return None,
        })
    }

    pub fn carries_tcp(self) -> bool {
        matches!(self, PortProtocol::Tcp | PortProtocol::Both)
    }

    pub fn carries_udp(self) -> bool {
        matches!(self, PortProtocol::Udp | PortProtocol::Both)
    }
}

/// A server-side listener relayed to a target reached through the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    /// Position in the config; sent on the wire as the service index.
    pub index: u16,
    pub protocol: PortProtocol,
    pub bind: String,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct PathConfig {
    pub transport: String,
    pub address: String,
    pub pool_size: usize,
    pub aggressive_pool: bool,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: String,
    pub tls: TlsOptions,
    pub kcp: KcpOptions,
    pub websocket: WsOptions,
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    pub keepalive: Duration,
    pub max_recv_buffer: usize,
    pub max_stream_buffer: usize,
    pub frame_size: usize,
}

#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Duration,
    pub tcp_read_buffer: usize,
    pub tcp_write_buffer: usize,
    pub max_connections: usize,
    pub cleanup_interval: Duration,
    pub session_timeout: Duration,
    pub connection_timeout: Duration,
    pub stream_timeout: Duration,
    pub max_udp_flows: usize,
    pub udp_flow_timeout: Duration,
    pub udp_buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub verbose: bool,
    pub profile: Profile,
    pub listen: String,
    pub maps: Vec<PortMap>,
    pub paths: Vec<PathConfig>,
    pub transport: TransportConfig,
    pub psk: Arc<[u8]>,
    pub algorithm: Algorithm,
    pub multiplexer: MultiplexerConfig,
    pub obfuscation: ObfsConfig,
    pub http_mimic: MimicOptions,
    pub performance: PerformanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<String>,
    #[serde(default)]
    verbose: bool,
    profile: Option<String>,
    listen: Option<String>,
    #[serde(default)]
    maps: Vec<FilePortMap>,
    #[serde(default)]
    paths: Vec<FilePath>,
    transport: Option<FileTransport>,
    encryption: Option<FileEncryption>,
    multiplexer: Option<FileMultiplexer>,
    obfuscation: Option<FileObfuscation>,
    http_mimic: Option<FileHttpMimic>,
    performance: Option<FilePerformance>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePortMap {
    protocol: Option<String>,
    bind: String,
    target: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePath {
    transport: Option<String>,
    address: String,
    pool_size: Option<usize>,
    #[serde(default)]
    aggressive_pool: bool,
    retry_interval_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTransport {
    #[serde(rename = "type")]
    kind: Option<String>,
    tls: Option<FileTls>,
    kcp: Option<FileKcp>,
    websocket: Option<FileWebSocket>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    #[serde(default)]
    enabled: bool,
    cert_file: Option<String>,
    key_file: Option<String>,
    ca_file: Option<String>,
    #[serde(default)]
    insecure: bool,
    server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileKcp {
    nodelay: Option<i32>,
    interval: Option<i32>,
    resend: Option<i32>,
    nc: Option<i32>,
    sndwnd: Option<u16>,
    rcvwnd: Option<u16>,
    mtu: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileWebSocket {
    read_buffer_size: Option<usize>,
    write_buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEncryption {
    psk: Option<String>,
    algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMultiplexer {
    keepalive: Option<u64>,
    max_recv_buffer: Option<usize>,
    max_stream_buffer: Option<usize>,
    frame_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileObfuscation {
    #[serde(default)]
    enabled: bool,
    min_padding: Option<usize>,
    max_padding: Option<usize>,
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    burst_chance: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHttpMimic {
    #[serde(default)]
    enabled: bool,
    fake_domain: Option<String>,
    fake_path: Option<String>,
    user_agent: Option<String>,
    #[serde(default)]
    chunked_encoding: bool,
    #[serde(default)]
    session_cookie: bool,
    #[serde(default)]
    custom_headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePerformance {
    tcp_nodelay: Option<bool>,
    tcp_keepalive: Option<u64>,
    tcp_read_buffer: Option<usize>,
    tcp_write_buffer: Option<usize>,
    max_connections: Option<usize>,
    cleanup_interval: Option<u64>,
    session_timeout: Option<u64>,
    connection_timeout: Option<u64>,
    stream_timeout: Option<u64>,
    max_udp_flows: Option<usize>,
    udp_flow_timeout: Option<u64>,
    udp_buffer_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn trimmed(s: &Option<String>) -> String {
    s.as_deref().unwrap_or("").trim().to_string()
}

fn lowered(s: &Option<String>) -> String {
    trimmed(s).to_ascii_lowercase()
}

/// Zero in the file means "use the default".
fn positive<T: PartialEq + Default>(v: Option<T>, default: T) -> T {
    match v {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}

fn secs(v: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(positive(v, default))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Result<Config, ConfigError> {
        let mode = match lowered(&fc.mode).as_str() {
            "server" => Mode::Server,
            "client" => Mode::Client,
            _ => return Err(ConfigError::InvalidMode(trimmed(&fc.mode))),
        };
        let profile_name = lowered(&fc.profile);
        let profile =
            Profile::parse(&profile_name).ok_or(ConfigError::UnknownProfile(profile_name))?;

        // --- Encryption ---
        let enc = fc.encryption.as_ref();
        let psk = enc.map(|e| trimmed(&e.psk)).unwrap_or_default();
        if psk.is_empty() {
            return Err(ConfigError::MissingPsk);
        }
        let algorithm = match enc.map(|e| lowered(&e.algorithm)).unwrap_or_default() {
            a if a.is_empty() => Algorithm::ChaCha20Poly1305,
            a => Algorithm::parse(&a).ok_or(ConfigError::UnknownAlgorithm(a))?,
        };

        // --- Transport ---
        let ft = fc.transport.as_ref();
        let kind = ft.map(|t| lowered(&t.kind)).unwrap_or_default();
        let kind = parse_transport(&kind)
            .map_err(|_| ConfigError::UnknownTransport(kind.clone()))?
            .to_string();
        let tls = ft
            .and_then(|t| t.tls.as_ref())
            .map(|t| TlsOptions {
                enabled: t.enabled,
                cert_file: trimmed(&t.cert_file),
                key_file: trimmed(&t.key_file),
                ca_file: trimmed(&t.ca_file),
                insecure: t.insecure,
                server_name: trimmed(&t.server_name),
            })
            .unwrap_or_default();
        let mut kcp = profile.kcp();
        if let Some(k) = ft.and_then(|t| t.kcp.as_ref()) {
            if let Some(v) = k.nodelay {
                kcp.nodelay = v != 0;
            }
            if let Some(v) = k.interval.filter(|v| *v > 0) {
                kcp.interval = v;
            }
            if let Some(v) = k.resend {
                kcp.resend = v;
            }
            if let Some(v) = k.nc {
                kcp.nc = v != 0;
            }
            kcp.sndwnd = positive(k.sndwnd, kcp.sndwnd);
            kcp.rcvwnd = positive(k.rcvwnd, kcp.rcvwnd);
            kcp.mtu = positive(k.mtu, kcp.mtu);
        }
        let mut websocket = WsOptions::default();
        if let Some(w) = ft.and_then(|t| t.websocket.as_ref()) {
            websocket.read_buffer_size = positive(w.read_buffer_size, websocket.read_buffer_size);
            websocket.write_buffer_size =
                positive(w.write_buffer_size, websocket.write_buffer_size);
        }

        // --- Server ---
        let listen = match (mode, trimmed(&fc.listen)) {
            (Mode::Server, l) if l.is_empty() => return Err(ConfigError::MissingListen),
            (_, l) if l.is_empty() => l,
            (_, l) => net::with_default_port(&l, DEFAULT_PORT),
        };
        if fc.maps.len() > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::TooManyMaps(fc.maps.len()));
        }
        let mut maps = Vec::with_capacity(fc.maps.len());
        for (i, m) in fc.maps.iter().enumerate() {
            let value = lowered(&m.protocol);
            let protocol = PortProtocol::parse(&value)
                .ok_or(ConfigError::UnknownPortProtocol { index: i, value })?;
            let bind = m.bind.trim().to_string();
            if bind.is_empty() {
                return Err(ConfigError::EmptyBind(i));
            }
            let target = m.target.trim().to_string();
            if target.is_empty() {
                return Err(ConfigError::EmptyTarget(i));
            }
            maps.push(PortMap {
                index: i as u16,
                protocol,
                bind,
                target,
            });
        }

        // --- Client ---
        if mode == Mode::Client && fc.paths.is_empty() {
            return Err(ConfigError::MissingPaths);
        }
        let mut paths = Vec::with_capacity(fc.paths.len());
        for (i, p) in fc.paths.iter().enumerate() {
            let address = p.address.trim();
            if address.is_empty() {
                return Err(ConfigError::EmptyPathAddress(i));
            }
            let transport = match lowered(&p.transport) {
                t if t.is_empty() => kind.clone(),
                t => parse_transport(&t)
                    .map_err(|_| ConfigError::UnknownTransport(t.clone()))?
                    .to_string(),
            };
            paths.push(PathConfig {
                transport,
                address: net::with_default_port(address, DEFAULT_PORT),
                pool_size: positive(p.pool_size, DEFAULT_POOL_SIZE),
                aggressive_pool: p.aggressive_pool,
                retry_interval: Duration::from_millis(positive(p.retry_interval_ms, 3000)),
                dial_timeout: Duration::from_millis(positive(p.dial_timeout_ms, 10_000)),
            });
        }

        // --- Multiplexer ---
        let mut multiplexer = profile.multiplexer();
        if let Some(m) = &fc.multiplexer {
            if m.frame_size == Some(0) {
                return Err(ConfigError::FrameSize);
            }
            multiplexer.keepalive = secs(m.keepalive, multiplexer.keepalive.as_secs());
            multiplexer.max_recv_buffer = positive(m.max_recv_buffer, multiplexer.max_recv_buffer);
            multiplexer.max_stream_buffer =
                positive(m.max_stream_buffer, multiplexer.max_stream_buffer);
            multiplexer.frame_size = positive(m.frame_size, multiplexer.frame_size);
        }

        // --- Obfuscation ---
        let mut obfuscation = profile.obfuscation();
        if let Some(o) = &fc.obfuscation {
            obfuscation.enabled = o.enabled;
            obfuscation.min_padding = o.min_padding.unwrap_or(obfuscation.min_padding);
            obfuscation.max_padding = o.max_padding.unwrap_or(obfuscation.max_padding);
            obfuscation.min_delay = o
                .min_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(obfuscation.min_delay);
            obfuscation.max_delay = o
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(obfuscation.max_delay);
            obfuscation.burst_chance = o.burst_chance.unwrap_or(obfuscation.burst_chance);
        }
        if obfuscation.min_padding > obfuscation.max_padding {
            return Err(ConfigError::PaddingRange {
                min: obfuscation.min_padding,
                max: obfuscation.max_padding,
            });
        }
        if obfuscation.min_delay > obfuscation.max_delay {
            return Err(ConfigError::DelayRange {
                min: obfuscation.min_delay.as_millis() as u64,
                max: obfuscation.max_delay.as_millis() as u64,
            });
        }
        if !(0.0..=1.0).contains(&obfuscation.burst_chance) {
            return Err(ConfigError::BurstChance(obfuscation.burst_chance));
        }

        // --- HTTP mimicry ---
        let mut http_mimic = MimicOptions::default();
        if let Some(h) = &fc.http_mimic {
            http_mimic.enabled = h.enabled;
            http_mimic.fake_domain = trimmed(&h.fake_domain);
            let path = trimmed(&h.fake_path);
            if !path.is_empty() {
                http_mimic.fake_path = path;
            }
            let ua = trimmed(&h.user_agent);
            if !ua.is_empty() {
                http_mimic.user_agent = ua;
            }
            http_mimic.chunked_encoding = h.chunked_encoding;
            http_mimic.session_cookie = h.session_cookie;
            http_mimic.custom_headers = h
                .custom_headers
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // --- Performance ---
        let fp = fc.performance.as_ref();
        let performance = PerformanceConfig {
            tcp_nodelay: fp.and_then(|p| p.tcp_nodelay).unwrap_or(true),
            tcp_keepalive: secs(fp.and_then(|p| p.tcp_keepalive), 30),
            tcp_read_buffer: fp.and_then(|p| p.tcp_read_buffer).unwrap_or(0),
            tcp_write_buffer: fp.and_then(|p| p.tcp_write_buffer).unwrap_or(0),
            max_connections: positive(fp.and_then(|p| p.max_connections), 1024),
            cleanup_interval: secs(fp.and_then(|p| p.cleanup_interval), 10),
            session_timeout: secs(fp.and_then(|p| p.session_timeout), 30),
            connection_timeout: secs(fp.and_then(|p| p.connection_timeout), 10),
            stream_timeout: secs(fp.and_then(|p| p.stream_timeout), 300),
            max_udp_flows: positive(fp.and_then(|p| p.max_udp_flows), 4096),
            udp_flow_timeout: secs(fp.and_then(|p| p.udp_flow_timeout), 60),
            udp_buffer_size: positive(fp.and_then(|p| p.udp_buffer_size), 4 << 20),
        };

        // --- Logging ---
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            let level = lowered(&l.level);
            if !level.is_empty() {
                logging.level = level;
            }
            let format = lowered(&l.format);
            if !format.is_empty() {
                logging.format = format;
            }
            let output = trimmed(&l.output);
            if !output.is_empty() {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        Ok(Config {
            mode,
            verbose: fc.verbose,
            profile,
            listen,
            maps,
            paths,
            transport: TransportConfig {
                kind,
                tls,
                kcp,
                websocket,
            },
            psk: Arc::from(psk.as_bytes()),
            algorithm,
            multiplexer,
            obfuscation,
            http_mimic,
            performance,
            logging,
        })
    }

    /// Settings that are legal but probably not what the operator meant.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self.mode {
            Mode::Server if !self.paths.is_empty() => {
                out.push("paths are ignored in server mode".to_string())
            }
            Mode::Server if self.maps.is_empty() => {
                out.push("no maps configured; nothing will be exposed".to_string())
            }
            Mode::Client if !self.maps.is_empty() => {
                out.push("maps are ignored in client mode".to_string())
            }
            _ => {}
        }
        if self.psk.len() < 16 {
            out.push("encryption.psk is shorter than 16 bytes".to_string());
        }
        if self.transport.tls.insecure {
            out.push("transport.tls.insecure disables certificate verification".to_string());
        }
        if self.multiplexer.keepalive >= self.performance.session_timeout {
            out.push(format!(
                "multiplexer.keepalive ({}s) is not below performance.session_timeout ({}s)",
                self.multiplexer.keepalive.as_secs(),
                self.performance.session_timeout.as_secs()
            ));
        }
        out
    }

    pub fn socket_options(&self) -> SocketOptions {
        let p = &self.performance;
        SocketOptions {
            nodelay: p.tcp_nodelay,
            keepalive: Some(p.tcp_keepalive),
            read_buffer: p.tcp_read_buffer,
            write_buffer: p.tcp_write_buffer,
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            tls: self.transport.tls.clone(),
            kcp: self.transport.kcp.clone(),
            websocket: self.transport.websocket.clone(),
            mimic: self.http_mimic.clone(),
            socket: self.socket_options(),
            handshake_timeout: self.performance.connection_timeout,
        }
    }

    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            keepalive: self.multiplexer.keepalive,
            keepalive_timeout: self.performance.session_timeout,
            max_frame_payload: self.multiplexer.frame_size,
            stream_window: self.multiplexer.max_stream_buffer as u64,
            max_recv_buffer: self.multiplexer.max_recv_buffer,
            stream_idle_timeout: self.performance.stream_timeout,
            ..MuxConfig::default()
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            psk: self.psk.clone(),
            algorithm: self.algorithm,
            obfs: self.obfuscation.clone(),
            mux: self.mux_config(),
            handshake_timeout: self.performance.connection_timeout,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            connect_timeout: self.performance.connection_timeout,
            open_timeout: self.performance.connection_timeout,
            socket: self.socket_options(),
            udp_flow_timeout: self.performance.udp_flow_timeout,
            udp_buffer_size: self.performance.udp_buffer_size,
        }
    }
}

#[cfg(test)]
pub(crate) fn parse_yaml(s: &str) -> Result<Config, anyhow::Error> {
    let fc: FileConfig = serde_yaml::from_str(s)?;
    Ok(Config::from_file_config(fc)?)
}
