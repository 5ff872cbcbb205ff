//! Wire-level building blocks shared by the voice transport.
//!
//! This crate holds the pieces that only deal in bytes: RTP header framing,
//! the XSalsa20-Poly1305 nonce schemes, plus the process-wide observability
//! and CLI policies used by the `voicenext` crate and its binary.

pub mod cli;
pub mod crypto;
pub mod observability;
pub mod rtp;

pub use cli::ColorWhen;
pub use crypto::{EncryptionManager, EncryptionMode, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use rtp::RtpHeader;
