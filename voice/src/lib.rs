//! Client-side voice transport.
//!
//! A [`VoiceConnection`] drives the JSON signaling socket through
//! identify / ready / session-description, discovers its external UDP
//! address, then paces encrypted Opus frames out of a bounded queue.
//! With incoming audio enabled it also decrypts and decodes what other
//! participants send, concealing lost packets.
//!
//! ```no_run
//! # async fn demo() -> voicenext::VoiceResult<()> {
//! use voicenext::{VoiceConfig, VoiceConnection, VoiceCredentials};
//!
//! let credentials = VoiceCredentials {
//!     guild_id: 1,
//!     user_id: 2,
//!     session_id: "session".into(),
//!     token: "token".into(),
//!     endpoint: "voice.example.com:443".into(),
//! };
//! let connection = VoiceConnection::new(credentials, VoiceConfig::default());
//! connection.connect().await?;
//!
//! let mut sink = connection.transmit_sink(None)?;
//! sink.write(&vec![0i16; 48_000 * 2]).await?;
//! sink.flush().await?;
//! connection.wait_for_playback_finish().await;
//! connection.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gate;
pub mod gateway;
pub mod pool;
pub mod receive;
pub mod transmit;
pub mod udp;

pub use audio::{read_wav, write_wav, AudioClip};
pub use codec::{AudioFormat, OpusCodec, VoiceApplication, VoiceCodec, VoiceDecoder, VoiceEncoder};
pub use config::{ConnectionEndpoint, ReconnectPolicy, VoiceConfig, VoiceCredentials};
pub use connection::{ConnectionState, VoiceConnection, VoiceConnectionBuilder};
pub use error::{VoiceError, VoiceResult};
pub use events::{
    ConnectionClosedEvent, EventRegistry, HandlerId, IdOnlyResolver, SocketErrorEvent,
    UserIdentity, UserJoinedEvent, UserLeftEvent, UserResolver, UserSpeakingEvent, VoiceEvents,
    VoiceReceivedEvent,
};
pub use transmit::{RawVoicePacket, TransmitSink};
pub use voicenext_common::{EncryptionMode, MetricsContext};

/// Deterministic codec for unit tests: a "packet" is `FAKE` followed by
/// the little-endian per-channel sample count.
#[cfg(test)]
pub(crate) mod test_support {
    // ---
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    use crate::codec::{AudioFormat, VoiceCodec, VoiceDecoder, VoiceEncoder};

    const MAGIC: &[u8; 4] = b"FAKE";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DecodeCall {
        Decode,
        Fec,
        Plc,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeCodec {
        // ---
        calls: Arc<Mutex<Vec<DecodeCall>>>,
    }

    impl FakeCodec {
        // ---
        pub fn packet_for(samples_per_channel: usize) -> Vec<u8> {
            // ---
            let mut packet = MAGIC.to_vec();
            packet.extend_from_slice(&(samples_per_channel as u32).to_le_bytes());
            packet
        }

        /// Decoder calls across every decoder this codec created.
        pub fn calls(&self) -> Vec<DecodeCall> {
            self.calls.lock().clone()
        }
    }

    fn parse(packet: &[u8]) -> Result<usize> {
        // ---
        match packet {
            [m0, m1, m2, m3, a, b, c, d] if [*m0, *m1, *m2, *m3] == *MAGIC => {
                Ok(u32::from_le_bytes([*a, *b, *c, *d]) as usize)
            }
            _ => bail!("not a fake packet ({} bytes)", packet.len()),
        }
    }

    impl VoiceCodec for FakeCodec {
        // ---
        fn audio_format(&self) -> AudioFormat {
            AudioFormat::default()
        }

        fn create_encoder(&self) -> Result<Box<dyn VoiceEncoder>> {
            Ok(Box::new(FakeEncoder {
                channels: self.audio_format().channels as usize,
            }))
        }

        fn create_decoder(&self) -> Result<Box<dyn VoiceDecoder>> {
            // ---
            Ok(Box::new(FakeDecoder {
                channels: self.audio_format().channels as usize,
                last: 960,
                calls: self.calls.clone(),
            }))
        }
    }

    struct FakeEncoder {
        channels: usize,
    }

    impl VoiceEncoder for FakeEncoder {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
            Ok(FakeCodec::packet_for(pcm.len() / self.channels))
        }
    }

    struct FakeDecoder {
        // ---
        channels: usize,
        last: usize,
        calls: Arc<Mutex<Vec<DecodeCall>>>,
    }

    impl VoiceDecoder for FakeDecoder {
        // ---
        fn decode(&mut self, packet: &[u8], fec: bool) -> Result<Vec<i16>> {
            // ---
            let samples = parse(packet)?;
            if fec {
                self.calls.lock().push(DecodeCall::Fec);
                return Ok(vec![0; self.last * self.channels]);
            }

            self.calls.lock().push(DecodeCall::Decode);
            self.last = samples;
            Ok(vec![1; samples * self.channels])
        }

        fn last_packet_sample_count(&self) -> usize {
            self.last
        }

        fn process_packet_loss(&mut self, samples_per_channel: usize) -> Result<Vec<i16>> {
            // ---
            self.calls.lock().push(DecodeCall::Plc);
            Ok(vec![0; samples_per_channel * self.channels])
        }
    }
}
