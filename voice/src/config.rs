//! Connection configuration and credentials.

use std::time::Duration;

use voicenext_common::EncryptionMode;

use crate::codec::AudioFormat;
use crate::error::{VoiceError, VoiceResult};

/// Port used when the endpoint string carries none
pub const DEFAULT_GATEWAY_PORT: u16 = 443;

/// Voice gateway protocol version requested in the URL
pub const GATEWAY_VERSION: u8 = 4;

/// Credentials handed over by the outer gateway client when a voice
/// channel join completes.
#[derive(Debug, Clone)]
pub struct VoiceCredentials {
    // ---
    /// Guild (server) the voice channel belongs to
    pub guild_id: u64,

    /// Our own user id
    pub user_id: u64,

    /// Session id from the voice state update
    pub session_id: String,

    /// Voice token from the voice server update
    pub token: String,

    /// Voice server endpoint, `host` or `host:port`
    pub endpoint: String,
}

impl VoiceCredentials {
    // ---
    /// Parses [`Self::endpoint`] into host and port.
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty or the port is not a number.
    pub fn gateway_endpoint(&self) -> VoiceResult<ConnectionEndpoint> {
        // ---
        ConnectionEndpoint::parse(&self.endpoint, DEFAULT_GATEWAY_PORT)
    }
}

/// A host/port pair announced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    // ---
    pub hostname: String,
    pub port: u16,
}

impl ConnectionEndpoint {
    // ---
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        // ---
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Splits `host[:port]` at the last colon.
    pub fn parse(value: &str, default_port: u16) -> VoiceResult<Self> {
        // ---
        let value = value.trim();
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    VoiceError::InvalidArgument(format!("invalid endpoint port in '{value}'"))
                })?;
                (host, port)
            }
            None => (value, default_port),
        };

        if host.is_empty() {
            return Err(VoiceError::InvalidArgument(format!(
                "missing endpoint host in '{value}'"
            )));
        }

        Ok(Self::new(host, port))
    }

    /// `host:port` form accepted by `tokio::net::lookup_host`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Connect retry policy: exponential backoff with an optional cap.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    // ---
    /// Delay before the second attempt; doubles after each failure
    pub initial_delay: Duration,

    /// Total attempts per (re)connect; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    // ---
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // ---
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1u32 << shift)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        // ---
        Self {
            initial_delay: Duration::from_millis(7500),
            max_attempts: Some(5),
        }
    }
}

/// Voice connection configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    // ---
    /// PCM format fed to the encoder and produced by decoders
    pub audio_format: AudioFormat,

    /// Decode inbound voice; costs CPU and exposes other users' audio
    pub enable_incoming: bool,

    /// Capacity of the outbound frame queue
    pub packet_queue_size: usize,

    /// Client-side encryption preference, first match wins
    pub encryption_modes: Vec<EncryptionMode>,

    /// Connect / reconnect backoff
    pub reconnect: ReconnectPolicy,

    /// Interval between UDP keepalives
    pub keepalive_interval: Duration,

    /// Use `wss://` for the signaling socket
    pub use_tls: bool,
}

impl VoiceConfig {
    // ---
    /// Signaling socket URL for an endpoint.
    pub fn gateway_url(&self, endpoint: &ConnectionEndpoint) -> String {
        // ---
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/?v={GATEWAY_VERSION}",
            endpoint.hostname, endpoint.port
        )
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        // ---
        Self {
            audio_format: AudioFormat::default(),
            enable_incoming: false,
            packet_queue_size: 25,
            encryption_modes: EncryptionMode::DEFAULT_PREFERENCE.to_vec(),
            reconnect: ReconnectPolicy::default(),
            keepalive_interval: Duration::from_secs(5),
            use_tls: true,
        }
    }
}
