//! Opus codec adapter.
//!
//! The connection only talks to the codec through [`VoiceCodec`],
//! [`VoiceEncoder`] and [`VoiceDecoder`]; [`OpusCodec`] is the production
//! implementation over the `opus` crate.

use anyhow::{Context, Result};
use opus::{Application, Channels, Decoder, Encoder};

/// Frame durations (ms) Opus accepts for a single packet
pub const ALLOWED_DURATIONS_MS: [u32; 5] = [5, 10, 20, 40, 60];

/// Frame duration used for silence and the default sink
pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;

/// Largest Opus packet we ever produce
pub const MAX_PACKET_SIZE: usize = 4000;

/// Longest frame Opus can decode (120 ms at 48 kHz), per channel
const MAX_DECODE_SAMPLES_PER_CHANNEL: usize = 5760;

/// Encoder tuning preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceApplication {
    /// Speech; favours intelligibility
    Voice,

    /// General audio and music
    #[default]
    Music,

    /// Lowest algorithmic delay
    LowLatency,
}

impl From<VoiceApplication> for Application {
    fn from(app: VoiceApplication) -> Self {
        // ---
        match app {
            VoiceApplication::Voice => Application::Voip,
            VoiceApplication::Music => Application::Audio,
            VoiceApplication::LowLatency => Application::LowDelay,
        }
    }
}

/// PCM format exchanged with the codec: interleaved 16-bit samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    // ---
    pub sample_rate: u32,
    pub channels: u16,
    pub application: VoiceApplication,
}

impl Default for AudioFormat {
    fn default() -> Self {
        // ---
        Self {
            sample_rate: 48_000,
            channels: 2,
            application: VoiceApplication::default(),
        }
    }
}

impl AudioFormat {
    // ---
    /// Samples per channel in a frame of `duration_ms`.
    pub fn samples_per_channel(&self, duration_ms: u32) -> usize {
        (self.sample_rate as usize * duration_ms as usize) / 1000
    }

    /// Interleaved samples in a frame of `duration_ms`.
    pub fn sample_count(&self, duration_ms: u32) -> usize {
        self.samples_per_channel(duration_ms) * self.channels as usize
    }

    /// Bytes of 16-bit PCM in a frame of `duration_ms`.
    pub fn frame_size(&self, duration_ms: u32) -> usize {
        self.sample_count(duration_ms) * 2
    }

    /// Duration in milliseconds of `sample_count` interleaved samples.
    pub fn duration_ms(&self, sample_count: usize) -> u32 {
        // ---
        let per_channel = sample_count / self.channels.max(1) as usize;
        ((per_channel * 1000) / self.sample_rate.max(1) as usize) as u32
    }

    /// Whether Opus can carry a frame of this duration.
    pub fn is_allowed_duration(duration_ms: u32) -> bool {
        ALLOWED_DURATIONS_MS.contains(&duration_ms)
    }

    /// A frame of digital silence.
    pub fn silence(&self, duration_ms: u32) -> Vec<i16> {
        vec![0; self.sample_count(duration_ms)]
    }

    fn opus_channels(&self) -> Result<Channels> {
        // ---
        match self.channels {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            n => anyhow::bail!("unsupported channel count {n} (Opus supports 1 or 2)"),
        }
    }
}

/// Creates encoders and per-sender decoders for one connection.
pub trait VoiceCodec: Send + Sync {
    /// PCM format both directions use.
    fn audio_format(&self) -> AudioFormat;

    fn create_encoder(&self) -> Result<Box<dyn VoiceEncoder>>;

    fn create_decoder(&self) -> Result<Box<dyn VoiceDecoder>>;
}

/// Turns one PCM frame into one Opus packet.
pub trait VoiceEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

/// Per-SSRC decoder state.
pub trait VoiceDecoder: Send {
    /// Decodes `packet`. With `fec`, recovers the frame preceding
    /// `packet` from its in-band FEC data, sized to
    /// [`Self::last_packet_sample_count`].
    fn decode(&mut self, packet: &[u8], fec: bool) -> Result<Vec<i16>>;

    /// Samples per channel of the last decoded packet.
    fn last_packet_sample_count(&self) -> usize;

    /// Synthesises a concealment frame of `samples_per_channel`.
    fn process_packet_loss(&mut self, samples_per_channel: usize) -> Result<Vec<i16>>;
}

/// [`VoiceCodec`] backed by libopus.
#[derive(Debug, Clone)]
pub struct OpusCodec {
    // ---
    format: AudioFormat,
}

impl OpusCodec {
    // ---
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl Default for OpusCodec {
    fn default() -> Self {
        Self::new(AudioFormat::default())
    }
}

impl VoiceCodec for OpusCodec {
    // ---
    fn audio_format(&self) -> AudioFormat {
        self.format
    }

    fn create_encoder(&self) -> Result<Box<dyn VoiceEncoder>> {
        // ---
        Ok(Box::new(OpusVoiceEncoder::new(self.format)?))
    }

    fn create_decoder(&self) -> Result<Box<dyn VoiceDecoder>> {
        // ---
        Ok(Box::new(OpusVoiceDecoder::new(self.format)?))
    }
}

/// Opus encoder for one outbound stream.
pub struct OpusVoiceEncoder {
    // ---
    encoder: Encoder,
    format: AudioFormat,
}

impl OpusVoiceEncoder {
    // ---
    /// # Errors
    ///
    /// Returns error if the format has an unsupported channel count or
    /// libopus rejects the sample rate.
    pub fn new(format: AudioFormat) -> Result<Self> {
        // ---
        let encoder = Encoder::new(
            format.sample_rate,
            format.opus_channels()?,
            format.application.into(),
        )
        .context("failed to create Opus encoder")?;

        Ok(Self { encoder, format })
    }
}

impl VoiceEncoder for OpusVoiceEncoder {
    /// Expects exactly one frame of an allowed duration.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        // ---
        let duration = self.format.duration_ms(pcm.len());
        if !AudioFormat::is_allowed_duration(duration)
            || pcm.len() != self.format.sample_count(duration)
        {
            anyhow::bail!(
                "invalid frame size: {} samples is not a 5, 10, 20, 40 or 60 ms frame",
                pcm.len()
            );
        }

        let mut output = vec![0u8; MAX_PACKET_SIZE];
        let len = self
            .encoder
            .encode(pcm, &mut output)
            .context("Opus encoding failed")?;

        output.truncate(len);
        Ok(output)
    }
}

/// Opus decoder for one remote SSRC.
pub struct OpusVoiceDecoder {
    // ---
    decoder: Decoder,
    format: AudioFormat,
    last_sample_count: usize,
}

impl OpusVoiceDecoder {
    // ---
    pub fn new(format: AudioFormat) -> Result<Self> {
        // ---
        let decoder = Decoder::new(format.sample_rate, format.opus_channels()?)
            .context("failed to create Opus decoder")?;

        Ok(Self {
            decoder,
            format,
            last_sample_count: format.samples_per_channel(DEFAULT_FRAME_DURATION_MS),
        })
    }

    fn output_buffer(&self, samples_per_channel: usize) -> Vec<i16> {
        vec![0i16; samples_per_channel * self.format.channels as usize]
    }
}

impl VoiceDecoder for OpusVoiceDecoder {
    fn decode(&mut self, packet: &[u8], fec: bool) -> Result<Vec<i16>> {
        // ---
        let per_channel = if fec {
            self.last_sample_count
        } else {
            MAX_DECODE_SAMPLES_PER_CHANNEL
        };
        let mut output = self.output_buffer(per_channel);

        let decoded = self
            .decoder
            .decode(packet, &mut output, fec)
            .context("Opus decoding failed")?;

        output.truncate(decoded * self.format.channels as usize);
        if !fec {
            self.last_sample_count = decoded;
        }
        Ok(output)
    }

    fn last_packet_sample_count(&self) -> usize {
        self.last_sample_count
    }

    fn process_packet_loss(&mut self, samples_per_channel: usize) -> Result<Vec<i16>> {
        // ---
        let mut output = self.output_buffer(samples_per_channel);

        // An empty packet asks libopus for concealment.
        let decoded = self
            .decoder
            .decode(&[], &mut output, false)
            .context("Opus PLC failed")?;

        output.truncate(decoded * self.format.channels as usize);
        Ok(output)
    }
}
