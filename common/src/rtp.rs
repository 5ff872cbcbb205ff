//! RTP header framing for voice datagrams.
//!
//! Implements the fixed 12-byte RTP header (RFC 3550) as used by the voice
//! media path, plus removal of the one-byte header extension block
//! (RFC 5285 §4.2) that some senders put in front of the Opus payload.

use anyhow::Result;

use crate::crypto::EncryptionMode;

/// Size of the fixed RTP header in bytes
pub const HEADER_SIZE: usize = 12;

/// Smallest datagram that can carry a header plus at least one payload byte
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + 1;

/// Flags byte: V=2, no padding, no extension, no CSRC
pub const RTP_NO_EXTENSION: u8 = 0x80;

/// Flags byte: V=2, extension bit set
pub const RTP_EXTENSION: u8 = 0x90;

/// Payload type used for Opus on the voice server
pub const PAYLOAD_TYPE: u8 = 0x78;

/// Profile marker of a one-byte header extension block
const ONE_BYTE_EXTENSION_PROFILE: [u8; 2] = [0xBE, 0xDE];

/// Decoded RTP header fields.
///
/// # Wire Format
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    // ---
    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in sample units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// Whether the extension bit was set on the wire
    pub has_extension: bool,
}

impl RtpHeader {
    // ---
    /// Creates a header for an outgoing packet (extension bit clear).
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        // ---
        Self {
            sequence,
            timestamp,
            ssrc,
            has_extension: false,
        }
    }

    /// Writes the header into the first [`HEADER_SIZE`] bytes of `target`.
    ///
    /// # Errors
    ///
    /// Returns error if `target` is shorter than the header.
    pub fn encode(&self, target: &mut [u8]) -> Result<()> {
        // ---
        if target.len() < HEADER_SIZE {
            anyhow::bail!("header buffer too small: {} bytes", target.len());
        }

        target[0] = if self.has_extension {
            RTP_EXTENSION
        } else {
            RTP_NO_EXTENSION
        };
        target[1] = PAYLOAD_TYPE;
        target[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        target[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        target[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        Ok(())
    }

    /// Returns the header as a fresh 12-byte array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        // ---
        let mut buf = [0u8; HEADER_SIZE];
        // Length is statically correct
        let _ = self.encode(&mut buf);
        buf
    }

    /// Parses the header at the start of a received datagram.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Datagram is shorter than [`MIN_PACKET_SIZE`] (13 bytes)
    /// - The flags/payload-type bytes don't match the voice RTP pattern
    pub fn decode(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < MIN_PACKET_SIZE {
            anyhow::bail!("packet too small: {} bytes", data.len());
        }

        if !is_rtp_header(data) {
            anyhow::bail!(
                "not an RTP voice packet: flags=0x{:02X} pt=0x{:02X}",
                data[0],
                data[1]
            );
        }

        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            has_extension: data[0] == RTP_EXTENSION,
        })
    }
}

/// Checks the version/flags and payload-type bytes of a datagram.
pub fn is_rtp_header(data: &[u8]) -> bool {
    // ---
    data.len() >= HEADER_SIZE
        && (data[0] == RTP_NO_EXTENSION || data[0] == RTP_EXTENSION)
        && data[1] == PAYLOAD_TYPE
}

/// Total datagram size for an encrypted payload of `payload_len` bytes.
///
/// Header + payload + whatever nonce suffix the mode appends.
pub fn calculate_packet_size(payload_len: usize, mode: EncryptionMode) -> usize {
    // ---
    HEADER_SIZE + payload_len + mode.nonce_suffix_len()
}

/// Returns the encrypted payload region of a datagram for the given mode.
///
/// # Errors
///
/// Returns error if the datagram cannot hold the header plus nonce suffix.
pub fn encrypted_payload(data: &[u8], mode: EncryptionMode) -> Result<&[u8]> {
    // ---
    let suffix = mode.nonce_suffix_len();
    if data.len() < HEADER_SIZE + suffix {
        anyhow::bail!(
            "packet too small for {}: {} bytes",
            mode.name(),
            data.len()
        );
    }

    Ok(&data[HEADER_SIZE..data.len() - suffix])
}

/// Skips a one-byte header extension block at the start of `payload`.
///
/// The block is `0xBE 0xDE`, a 16-bit element count, then that many
/// elements of `(id << 4 | len - 1)` followed by `len` data bytes, then
/// zero padding. Payloads without the profile marker are returned as-is.
pub fn strip_extension(payload: &[u8]) -> &[u8] {
    // ---
    if payload.len() < 4 || payload[..2] != ONE_BYTE_EXTENSION_PROFILE {
        return payload;
    }

    let elements = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let mut i = 4;

    for _ in 0..elements {
        if i >= payload.len() {
            break;
        }
        // ID nibble is unused; low nibble is length - 1
        let len = (payload[i] & 0x0F) as usize + 1;
        i += 1 + len;
    }

    while i < payload.len() && payload[i] == 0 {
        i += 1;
    }

    &payload[i.min(payload.len())..]
}
