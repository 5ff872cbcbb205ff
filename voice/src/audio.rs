//! WAV loading and recording for the CLI.
//!
//! Converts any 16-bit PCM or 32-bit float WAV into interleaved samples in
//! the connection's [`AudioFormat`].

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::info;

use crate::codec::AudioFormat;

/// Decoded audio ready for a [`crate::TransmitSink`].
#[derive(Debug)]
pub struct AudioClip {
    // ---
    /// Interleaved PCM in [`Self::format`]
    pub samples: Vec<i16>,

    pub format: AudioFormat,
}

impl AudioClip {
    // ---
    /// Returns the total duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        // ---
        let per_channel = self.samples.len() / self.format.channels.max(1) as usize;
        per_channel as f64 / self.format.sample_rate as f64
    }
}

/// Reads a WAV file and converts it to `target`.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be opened
/// - WAV format is invalid
/// - Sample format is unsupported
pub fn read_wav<P: AsRef<Path>>(path: P, target: AudioFormat) -> Result<AudioClip> {
    // ---
    let path = path.as_ref();
    info!("Reading WAV file: {}", path.display());

    let mut reader = WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;

    let spec = reader.spec();
    info!(
        "WAV format: {}Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let raw: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 16-bit PCM WAV samples")?,

        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read 32-bit float WAV samples")?
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect(),

        (SampleFormat::Int, bits) => {
            anyhow::bail!("unsupported integer PCM WAV format: {bits}-bit (only 16-bit PCM is supported)");
        }

        (SampleFormat::Float, bits) => {
            anyhow::bail!("unsupported float WAV format: {bits}-bit (only 32-bit float is supported)");
        }
    };

    let samples = convert(&raw, &spec, &target)?;
    info!(
        "Converted to {}Hz/{}ch: {} samples",
        target.sample_rate,
        target.channels,
        samples.len()
    );

    Ok(AudioClip {
        samples,
        format: target,
    })
}

/// Writes `clip` as a 16-bit PCM WAV file.
pub fn write_wav<P: AsRef<Path>>(path: P, clip: &AudioClip) -> Result<()> {
    // ---
    let path = path.as_ref();
    let spec = WavSpec {
        channels: clip.format.channels,
        sample_rate: clip.format.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV file: {}", path.display()))?;
    for &sample in &clip.samples {
        writer.write_sample(sample).context("failed to write WAV sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;

    info!("Wrote {:.2}s of audio to {}", clip.duration_secs(), path.display());
    Ok(())
}

fn convert(samples: &[i16], spec: &WavSpec, target: &AudioFormat) -> Result<Vec<i16>> {
    // ---
    if spec.channels == 0 {
        anyhow::bail!("WAV file declares zero channels");
    }

    // Resample each channel on its own, then remap channel layout.
    let channels = deinterleave(samples, spec.channels as usize);
    let resampled: Vec<Vec<i16>> = channels
        .iter()
        .map(|ch| resample_linear(ch, spec.sample_rate, target.sample_rate))
        .collect();

    let mapped = remap_channels(resampled, target.channels as usize);
    Ok(interleave(&mapped))
}

fn deinterleave(samples: &[i16], channels: usize) -> Vec<Vec<i16>> {
    // ---
    let mut out = vec![Vec::with_capacity(samples.len() / channels); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            out[ch].push(s);
        }
    }
    out
}

fn interleave(channels: &[Vec<i16>]) -> Vec<i16> {
    // ---
    let len = channels.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(len * channels.len());
    for i in 0..len {
        for ch in channels {
            out.push(ch[i]);
        }
    }
    out
}

/// Mono is duplicated to every output channel; anything else is averaged
/// down to mono first when the counts differ.
fn remap_channels(channels: Vec<Vec<i16>>, target: usize) -> Vec<Vec<i16>> {
    // ---
    if channels.len() == target {
        return channels;
    }

    let mono = if channels.len() == 1 {
        channels.into_iter().next().unwrap_or_default()
    } else {
        average(&channels)
    };
    vec![mono; target]
}

fn average(channels: &[Vec<i16>]) -> Vec<i16> {
    // ---
    let len = channels.iter().map(Vec::len).min().unwrap_or(0);
    (0..len)
        .map(|i| {
            let sum: i32 = channels.iter().map(|ch| ch[i] as i32).sum();
            (sum / channels.len() as i32) as i16
        })
        .collect()
}

/// Linear interpolation; adequate for voice, not for music mastering.
fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    // ---
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            if idx >= last {
                samples[last]
            } else {
                let frac = pos - idx as f64;
                let s0 = samples[idx] as f64;
                let s1 = samples[idx + 1] as f64;
                (s0 + (s1 - s0) * frac) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn spec(sample_rate: u32, channels: u16) -> WavSpec {
        // ---
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_mono_is_duplicated_to_stereo() {
        // ---
        let out = convert(&[1, 2, 3], &spec(48_000, 1), &AudioFormat::default()).unwrap();
        assert_eq!(out, vec![1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_quad_is_averaged() {
        // ---
        let out = convert(&[100, 200, 300, 400], &spec(48_000, 4), &AudioFormat::default())
            .unwrap();
        assert_eq!(out, vec![250, 250]);
    }

    #[test]
    fn test_resample_upsample_doubles() {
        // ---
        let resampled = resample_linear(&[0, 1000, 2000], 24_000, 48_000);
        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[1], 500);
    }

    #[test]
    fn test_resample_same_rate() {
        // ---
        assert_eq!(resample_linear(&[1, 2, 3], 48_000, 48_000), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_wav_file() {
        // ---
        let path = std::env::temp_dir().join(format!("voicenext-audio-{}.wav", std::process::id()));
        {
            let mut writer = hound::WavWriter::create(&path, spec(48_000, 2)).unwrap();
            for i in 0..1920 {
                writer.write_sample((i % 100) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let clip = read_wav(&path, AudioFormat::default()).unwrap();
        assert_eq!(clip.samples.len(), 1920);
        assert!((clip.duration_secs() - 0.02).abs() < 1e-9);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_recorded_mono_plays_back_as_stereo() {
        // ---
        let path = std::env::temp_dir().join(format!("voicenext-record-{}.wav", std::process::id()));
        let mono = AudioFormat {
            channels: 1,
            ..AudioFormat::default()
        };
        let recorded = AudioClip {
            samples: vec![7; 960],
            format: mono,
        };
        write_wav(&path, &recorded).unwrap();

        let clip = read_wav(&path, AudioFormat::default()).unwrap();
        assert_eq!(clip.samples.len(), 1920);
        assert!(clip.samples.iter().all(|&s| s == 7));

        std::fs::remove_file(&path).ok();
    }
}
