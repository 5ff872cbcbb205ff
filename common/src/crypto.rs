//! Voice payload encryption.
//!
//! Every voice datagram payload is sealed with XSalsa20-Poly1305 (NaCl
//! secretbox layout: tag first, then ciphertext). The three negotiable modes
//! differ only in where the 24-byte nonce comes from and whether it travels
//! on the wire.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};

use crate::rtp::HEADER_SIZE;

/// Secret key length announced in SESSION_DESCRIPTION
pub const KEY_SIZE: usize = 32;

/// XSalsa20 nonce length
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag length
pub const TAG_SIZE: usize = 16;

/// Bytes of the lite counter appended to each packet
const LITE_NONCE_SIZE: usize = 4;

/// Negotiable encryption modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// Nonce is the RTP header, zero-padded; nothing appended
    XSalsa20Poly1305,

    /// Random nonce appended in full after the ciphertext
    XSalsa20Poly1305Suffix,

    /// Incrementing 32-bit counter; 4 bytes appended after the ciphertext
    XSalsa20Poly1305Lite,
}

impl EncryptionMode {
    // ---
    /// Client preference used when none is configured.
    pub const DEFAULT_PREFERENCE: [EncryptionMode; 3] = [
        EncryptionMode::XSalsa20Poly1305Lite,
        EncryptionMode::XSalsa20Poly1305Suffix,
        EncryptionMode::XSalsa20Poly1305,
    ];

    /// Wire name used in READY / SELECT_PROTOCOL / SESSION_DESCRIPTION.
    pub fn name(self) -> &'static str {
        // ---
        match self {
            EncryptionMode::XSalsa20Poly1305 => "xsalsa20_poly1305",
            EncryptionMode::XSalsa20Poly1305Suffix => "xsalsa20_poly1305_suffix",
            EncryptionMode::XSalsa20Poly1305Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Parses a wire name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        // ---
        Self::DEFAULT_PREFERENCE
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(name))
    }

    /// Number of nonce bytes this mode appends to each datagram.
    pub fn nonce_suffix_len(self) -> usize {
        // ---
        match self {
            EncryptionMode::XSalsa20Poly1305 => 0,
            EncryptionMode::XSalsa20Poly1305Suffix => NONCE_SIZE,
            EncryptionMode::XSalsa20Poly1305Lite => LITE_NONCE_SIZE,
        }
    }

    /// Picks the first mode of `preference` that the server advertises.
    pub fn select<S: AsRef<str>>(preference: &[EncryptionMode], advertised: &[S]) -> Option<Self> {
        // ---
        preference.iter().copied().find(|mode| {
            advertised
                .iter()
                .any(|name| mode.name().eq_ignore_ascii_case(name.as_ref()))
        })
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Seals and opens voice payloads for one negotiated mode.
///
/// Built once per session description; the lite counter lives here so
/// encryption only needs `&self`.
pub struct EncryptionManager {
    // ---
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
    lite_counter: AtomicU32,
}

impl EncryptionManager {
    // ---
    /// Creates a manager from the 32-byte session secret.
    ///
    /// # Errors
    ///
    /// Returns error if the key is not [`KEY_SIZE`] bytes.
    pub fn new(secret_key: &[u8], mode: EncryptionMode) -> Result<Self> {
        // ---
        if secret_key.len() != KEY_SIZE {
            anyhow::bail!(
                "invalid secret key length: expected {}, got {}",
                KEY_SIZE,
                secret_key.len()
            );
        }

        let cipher = XSalsa20Poly1305::new_from_slice(secret_key)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to initialise XSalsa20-Poly1305")?;

        Ok(Self {
            cipher,
            mode,
            lite_counter: AtomicU32::new(0),
        })
    }

    /// The mode this manager was built for.
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Produces the nonce for the next outgoing packet.
    ///
    /// `header` is the already-encoded RTP header of that packet.
    pub fn generate_nonce(&self, header: &[u8]) -> [u8; NONCE_SIZE] {
        // ---
        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            EncryptionMode::XSalsa20Poly1305 => {
                let len = header.len().min(HEADER_SIZE);
                nonce[..len].copy_from_slice(&header[..len]);
            }
            EncryptionMode::XSalsa20Poly1305Suffix => {
                OsRng.fill_bytes(&mut nonce);
            }
            EncryptionMode::XSalsa20Poly1305Lite => {
                let counter = self.lite_counter.fetch_add(1, Ordering::Relaxed);
                nonce[..LITE_NONCE_SIZE].copy_from_slice(&counter.to_be_bytes());
            }
        }
        nonce
    }

    /// Appends whatever part of the nonce this mode puts on the wire.
    pub fn append_nonce(&self, nonce: &[u8; NONCE_SIZE], packet: &mut Vec<u8>) {
        // ---
        match self.mode {
            EncryptionMode::XSalsa20Poly1305 => {}
            EncryptionMode::XSalsa20Poly1305Suffix => packet.extend_from_slice(nonce),
            EncryptionMode::XSalsa20Poly1305Lite => {
                packet.extend_from_slice(&nonce[..LITE_NONCE_SIZE])
            }
        }
    }

    /// Recovers the nonce of a received datagram (inverse of `append_nonce`).
    ///
    /// # Errors
    ///
    /// Returns error if the datagram is too short to carry it.
    pub fn extract_nonce(&self, packet: &[u8]) -> Result<[u8; NONCE_SIZE]> {
        // ---
        let mut nonce = [0u8; NONCE_SIZE];
        let suffix = self.mode.nonce_suffix_len();

        if packet.len() < HEADER_SIZE + suffix {
            anyhow::bail!("packet too small for nonce: {} bytes", packet.len());
        }

        match self.mode {
            EncryptionMode::XSalsa20Poly1305 => {
                nonce[..HEADER_SIZE].copy_from_slice(&packet[..HEADER_SIZE]);
            }
            EncryptionMode::XSalsa20Poly1305Suffix | EncryptionMode::XSalsa20Poly1305Lite => {
                nonce[..suffix].copy_from_slice(&packet[packet.len() - suffix..]);
            }
        }
        Ok(nonce)
    }

    /// Seals `plaintext`; output is `plaintext.len() + TAG_SIZE` bytes.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        // ---
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| anyhow::anyhow!("voice payload encryption failed"))
    }

    /// Opens `ciphertext`; fails if the tag does not authenticate.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        // ---
        if ciphertext.len() < TAG_SIZE {
            anyhow::bail!("ciphertext shorter than tag: {} bytes", ciphertext.len());
        }

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("voice payload failed authentication"))
    }
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
