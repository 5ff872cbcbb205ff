//! Voice signaling wire format.
//!
//! Every message is a `{"op": <int>, "d": <payload>}` JSON envelope.
//! Inbound envelopes decode into [`VoiceDispatch`]; outbound ones are built
//! from [`GatewayCommand`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::VoiceCredentials;
use crate::error::{VoiceError, VoiceResult};

/// Signaling opcodes
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_CONNECTED: u8 = 12;
    pub const CLIENT_DISCONNECTED: u8 = 13;
}

/// Signaling close codes with special handling
pub mod close_code {
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const SESSION_NO_LONGER_VALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const DISCONNECTED: u16 = 4014;
    pub const UNKNOWN_ENCRYPTION_MODE: u16 = 4016;
}

/// What to do after the signaling socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and send RESUME
    Resume,

    /// Reconnect and send IDENTIFY
    Reidentify,

    /// Give up
    Fatal,
}

impl CloseAction {
    // ---
    pub fn for_code(code: Option<u16>) -> Self {
        // ---
        match code {
            Some(close_code::SESSION_NO_LONGER_VALID) | Some(close_code::SESSION_TIMEOUT) => {
                CloseAction::Reidentify
            }
            Some(close_code::AUTHENTICATION_FAILED)
            | Some(close_code::DISCONNECTED)
            | Some(close_code::UNKNOWN_ENCRYPTION_MODE) => CloseAction::Fatal,
            _ => CloseAction::Resume,
        }
    }
}

/// Raw `{op, d}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    // ---
    pub op: u8,

    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds; the server sends a float
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    // ---
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,

    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptionPayload {
    // ---
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingPayload {
    // ---
    #[serde(default, deserialize_with = "optional_snowflake")]
    pub user_id: Option<u64>,

    pub ssrc: u32,

    #[serde(deserialize_with = "flag")]
    pub speaking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConnectedPayload {
    // ---
    #[serde(deserialize_with = "snowflake")]
    pub user_id: u64,

    pub audio_ssrc: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnectedPayload {
    #[serde(deserialize_with = "snowflake")]
    pub user_id: u64,
}

/// Decoded inbound signaling message.
#[derive(Debug, Clone)]
pub enum VoiceDispatch {
    Hello(HelloPayload),
    Ready(ReadyPayload),
    SessionDescription(SessionDescriptionPayload),
    Speaking(SpeakingPayload),
    HeartbeatAck,
    Resumed,
    ClientConnected(ClientConnectedPayload),
    ClientDisconnected(ClientDisconnectedPayload),
    Unknown { op: u8 },
}

impl VoiceDispatch {
    // ---
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Protocol`] if the envelope or the payload for a
    /// known opcode is malformed.
    pub fn decode(text: &str) -> VoiceResult<Self> {
        // ---
        let envelope: GatewayPayload = serde_json::from_str(text).map_err(VoiceError::protocol)?;
        trace!(op = envelope.op, "signaling payload received");
        Self::from_payload(envelope)
    }

    pub fn from_payload(envelope: GatewayPayload) -> VoiceResult<Self> {
        // ---
        fn payload<T: for<'de> Deserialize<'de>>(op: u8, d: Value) -> VoiceResult<T> {
            serde_json::from_value(d)
                .map_err(|e| VoiceError::Protocol(format!("malformed payload for op {op}: {e}")))
        }

        let GatewayPayload { op, d } = envelope;
        let dispatch = match op {
            opcode::HELLO => VoiceDispatch::Hello(payload(op, d)?),
            opcode::READY => VoiceDispatch::Ready(payload(op, d)?),
            opcode::SESSION_DESCRIPTION => VoiceDispatch::SessionDescription(payload(op, d)?),
            opcode::SPEAKING => VoiceDispatch::Speaking(payload(op, d)?),
            opcode::HEARTBEAT_ACK => VoiceDispatch::HeartbeatAck,
            opcode::RESUMED => VoiceDispatch::Resumed,
            opcode::CLIENT_CONNECTED => VoiceDispatch::ClientConnected(payload(op, d)?),
            opcode::CLIENT_DISCONNECTED => VoiceDispatch::ClientDisconnected(payload(op, d)?),
            op => VoiceDispatch::Unknown { op },
        };
        Ok(dispatch)
    }
}

/// Outbound signaling message.
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    Identify {
        server_id: u64,
        user_id: u64,
        session_id: String,
        token: String,
    },
    Resume {
        server_id: u64,
        session_id: String,
        token: String,
    },
    SelectProtocol {
        address: String,
        port: u16,
        mode: String,
    },
    /// Unix time in milliseconds
    Heartbeat(u64),
    Speaking {
        speaking: bool,
        ssrc: u32,
    },
}

impl GatewayCommand {
    // ---
    pub fn identify(creds: &VoiceCredentials) -> Self {
        // ---
        GatewayCommand::Identify {
            server_id: creds.guild_id,
            user_id: creds.user_id,
            session_id: creds.session_id.clone(),
            token: creds.token.clone(),
        }
    }

    pub fn resume(creds: &VoiceCredentials) -> Self {
        // ---
        GatewayCommand::Resume {
            server_id: creds.guild_id,
            session_id: creds.session_id.clone(),
            token: creds.token.clone(),
        }
    }

    pub fn opcode(&self) -> u8 {
        // ---
        match self {
            GatewayCommand::Identify { .. } => opcode::IDENTIFY,
            GatewayCommand::Resume { .. } => opcode::RESUME,
            GatewayCommand::SelectProtocol { .. } => opcode::SELECT_PROTOCOL,
            GatewayCommand::Heartbeat(_) => opcode::HEARTBEAT,
            GatewayCommand::Speaking { .. } => opcode::SPEAKING,
        }
    }

    /// The full `{op, d}` envelope.
    pub fn to_payload(&self) -> GatewayPayload {
        // ---
        let d = match self {
            GatewayCommand::Identify {
                server_id,
                user_id,
                session_id,
                token,
            } => json!({
                "server_id": server_id.to_string(),
                "user_id": user_id.to_string(),
                "session_id": session_id,
                "token": token,
            }),
            GatewayCommand::Resume {
                server_id,
                session_id,
                token,
            } => json!({
                "server_id": server_id.to_string(),
                "session_id": session_id,
                "token": token,
            }),
            GatewayCommand::SelectProtocol {
                address,
                port,
                mode,
            } => json!({
                "protocol": "udp",
                "data": {
                    "address": address,
                    "port": port,
                    "mode": mode,
                },
            }),
            GatewayCommand::Heartbeat(nonce) => json!(nonce),
            GatewayCommand::Speaking { speaking, ssrc } => json!({
                "speaking": if *speaking { 1 } else { 0 },
                "delay": 0,
                "ssrc": ssrc,
            }),
        };

        GatewayPayload {
            op: self.opcode(),
            d,
        }
    }

    pub fn to_json(&self) -> String {
        // `Value` serialization cannot fail.
        serde_json::to_string(&self.to_payload()).unwrap_or_default()
    }
}

/// Tracks our speaking flag and sends SPEAKING only when it changes.
#[derive(Debug)]
pub struct SpeakingSignal {
    // ---
    speaking: AtomicBool,
    ssrc: AtomicU32,
    outbound: mpsc::UnboundedSender<GatewayCommand>,
}

impl SpeakingSignal {
    // ---
    pub fn new(outbound: mpsc::UnboundedSender<GatewayCommand>) -> Self {
        // ---
        Self {
            speaking: AtomicBool::new(false),
            ssrc: AtomicU32::new(0),
            outbound,
        }
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.ssrc.store(ssrc, Ordering::Release);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    /// Returns whether a SPEAKING message was queued.
    pub fn set(&self, speaking: bool) -> bool {
        // ---
        if self.speaking.swap(speaking, Ordering::AcqRel) == speaking {
            return false;
        }

        let ssrc = self.ssrc.load(Ordering::Acquire);
        debug!(speaking, ssrc, "speaking state changed");
        self.outbound
            .send(GatewayCommand::Speaking { speaking, ssrc })
            .is_ok()
    }

    /// Forgets the current flag without signaling, e.g. after a reconnect.
    pub fn reset(&self) {
        self.speaking.store(false, Ordering::Release);
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Str(String),
    Int(u64),
}

fn snowflake<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    // ---
    match StringOrInt::deserialize(de)? {
        StringOrInt::Int(v) => Ok(v),
        StringOrInt::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn optional_snowflake<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    // ---
    match Option::<StringOrInt>::deserialize(de)? {
        None => Ok(None),
        Some(StringOrInt::Int(v)) => Ok(Some(v)),
        Some(StringOrInt::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoolOrInt {
    Bool(bool),
    Int(u64),
}

fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    // ---
    Ok(match BoolOrInt::deserialize(de)? {
        BoolOrInt::Bool(b) => b,
        BoolOrInt::Int(v) => v != 0,
    })
}
