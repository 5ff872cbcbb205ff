//! Outbound pacing pipeline.
//!
//! Producers push PCM frames into a bounded [`TransmitQueue`]. A single
//! [`TransmitPipeline`] task drains it, encodes, encrypts and sends one
//! RTP datagram per frame, sleeping so that frames leave at the rate their
//! durations dictate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use voicenext_common::{rtp, EncryptionManager, MetricsContext, RtpHeader, TAG_SIZE};

use crate::codec::{AudioFormat, VoiceEncoder, DEFAULT_FRAME_DURATION_MS};
use crate::error::{VoiceError, VoiceResult};
use crate::gate::PauseGate;
use crate::gateway::SpeakingSignal;
use crate::pool::{BufferPool, PooledBuffer};
use crate::udp::UdpSession;

/// Pacing granularity in milliseconds
pub const RESOLUTION_MS: u32 = 5;

/// Resolution units to wait when the queue is empty (20 ms)
pub const IDLE_UNITS: u32 = 4;

/// Silence frames sent after the last real frame
pub const TRAILING_SILENCE_FRAMES: usize = 3;

/// Shared slot for the session's encryption, filled by SESSION_DESCRIPTION.
pub type CryptoSlot = Arc<RwLock<Option<Arc<EncryptionManager>>>>;

/// One PCM frame waiting to be sent.
#[derive(Debug, Clone)]
pub struct RawVoicePacket {
    // ---
    /// Interleaved samples, exactly one frame of `duration_ms`
    pub pcm: Vec<i16>,
    pub duration_ms: u32,
    pub silence: bool,
}

impl RawVoicePacket {
    // ---
    pub fn new(pcm: Vec<i16>, duration_ms: u32) -> Self {
        // ---
        Self {
            pcm,
            duration_ms,
            silence: false,
        }
    }

    /// A 20 ms frame of silence in `format`.
    pub fn silence(format: &AudioFormat) -> Self {
        // ---
        Self {
            pcm: format.silence(DEFAULT_FRAME_DURATION_MS),
            duration_ms: DEFAULT_FRAME_DURATION_MS,
            silence: true,
        }
    }
}

/// Bounded frame queue plus the playback state around it.
#[derive(Debug)]
pub struct TransmitQueue {
    // ---
    tx: mpsc::Sender<RawVoicePacket>,
    rx: Mutex<mpsc::Receiver<RawVoicePacket>>,
    depth: AtomicUsize,
    gate: PauseGate,
    playing: watch::Sender<bool>,
    closed: CancellationToken,
}

impl TransmitQueue {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (playing, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            gate: PauseGate::default(),
            playing,
            closed: CancellationToken::new(),
        }
    }

    /// Waits for room in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Disposed`] once the queue is closed.
    pub async fn enqueue(&self, packet: RawVoicePacket) -> VoiceResult<()> {
        // ---
        if self.is_closed() {
            return Err(VoiceError::Disposed);
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        self.set_playing(true);
        let sent = tokio::select! {
            _ = self.closed.cancelled() => false,
            res = self.tx.send(packet) => res.is_ok(),
        };
        if !sent {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(VoiceError::Disposed);
        }
        Ok(())
    }

    /// Enqueues without waiting; returns `false` if the queue is full.
    pub fn try_enqueue(&self, packet: RawVoicePacket) -> bool {
        // ---
        if self.is_closed() {
            return false;
        }
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.set_playing(true);
        if self.tx.try_send(packet).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Frames enqueued and not yet taken by the pipeline.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    pub fn is_playing(&self) -> bool {
        *self.playing.borrow()
    }

    /// Resolves once every queued frame and the trailing silence have been
    /// sent, or the queue is closed. Returns immediately when idle.
    pub async fn wait_for_playback_finish(&self) {
        // ---
        let mut rx = self.playing.subscribe();
        loop {
            if rx.wait_for(|playing| !*playing).await.is_err() {
                return;
            }
            if self.depth() == 0 || self.is_closed() {
                return;
            }
            // Stopped with frames still queued; wait for the pipeline to pick them up.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Rejects further frames and releases playback waiters.
    pub fn close(&self) {
        // ---
        self.closed.cancel();
        self.gate.resume();
        self.playing.send_modify(|p| *p = false);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn set_playing(&self, playing: bool) {
        self.playing.send_if_modified(|p| std::mem::replace(p, playing) != playing);
    }
}

/// Packetizer and pacer for one session.
pub struct TransmitPipeline {
    // ---
    queue: Arc<TransmitQueue>,
    encoder: Box<dyn VoiceEncoder>,
    format: AudioFormat,
    crypto: CryptoSlot,
    udp: Arc<UdpSession>,
    speaking: Arc<SpeakingSignal>,
    pool: BufferPool,
    metrics: Option<MetricsContext>,

    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl TransmitPipeline {
    // ---
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TransmitQueue>,
        encoder: Box<dyn VoiceEncoder>,
        format: AudioFormat,
        crypto: CryptoSlot,
        udp: Arc<UdpSession>,
        speaking: Arc<SpeakingSignal>,
        pool: BufferPool,
        ssrc: u32,
    ) -> Self {
        // ---
        Self {
            queue,
            encoder,
            format,
            crypto,
            udp,
            speaking,
            pool,
            metrics: None,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<MetricsContext>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Encodes and encrypts one frame into a pooled datagram buffer.
    ///
    /// Sequence and timestamp advance even when encryption fails.
    pub fn prepare_packet(&mut self, packet: &RawVoicePacket) -> VoiceResult<PooledBuffer> {
        // ---
        let started = Instant::now();
        let opus = self.encoder.encode(&packet.pcm).map_err(VoiceError::codec)?;
        if let Some(m) = &self.metrics {
            m.encode_seconds.observe(started.elapsed().as_secs_f64());
        }

        let header = RtpHeader::new(self.sequence, self.timestamp, self.ssrc).to_bytes();
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(self.format.samples_per_channel(packet.duration_ms) as u32);

        let crypto = self.crypto.read().clone().ok_or(VoiceError::NotInitialized)?;
        let nonce = crypto.generate_nonce(&header);
        let sealed = crypto.encrypt(&opus, &nonce).map_err(VoiceError::crypto)?;

        let mut buf = self.pool.rent();
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&sealed);
        crypto.append_nonce(&nonce, &mut buf);

        debug_assert_eq!(
            buf.len(),
            rtp::calculate_packet_size(opus.len() + TAG_SIZE, crypto.mode())
        );
        Ok(buf)
    }

    /// Runs until `cancel` fires or the queue is closed.
    pub async fn run(mut self, cancel: CancellationToken) {
        // ---
        let queue = self.queue.clone();
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => return,
            rx = queue.rx.lock() => rx,
        };
        let mut synchronizer = Instant::now();
        debug!(ssrc = self.ssrc, "transmit loop started");

        loop {
            let paused = !queue.gate().is_open();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.gate().wait() => {}
            }
            if paused {
                synchronizer = Instant::now();
            }

            let next = match rx.try_recv() {
                Ok(packet) => {
                    queue.depth.fetch_sub(1, Ordering::AcqRel);
                    queue.set_playing(true);
                    Some(packet)
                }
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            if let Some(m) = &self.metrics {
                m.transmit_queue_depth.set(queue.depth() as i64);
            }

            let prepared = match &next {
                Some(packet) => match self.prepare_packet(packet) {
                    Ok(buf) => Some(buf),
                    Err(e) => {
                        warn!("Dropping outbound frame: {e}");
                        None
                    }
                },
                None => None,
            };

            let units = match (&next, &prepared) {
                (Some(packet), Some(_)) => packet.duration_ms / RESOLUTION_MS,
                _ => IDLE_UNITS,
            };
            let window = Duration::from_millis((units * RESOLUTION_MS) as u64);
            let elapsed = Instant::now().saturating_duration_since(synchronizer);
            if elapsed < window {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(window - elapsed) => {}
                }
            }
            synchronizer += window;

            let Some(packet) = next else {
                continue;
            };
            let Some(data) = prepared else {
                if queue.depth() == 0 {
                    self.finish_playback();
                }
                continue;
            };

            self.speaking.set(true);
            match self.udp.send(&data).await {
                Ok(n) => {
                    trace!(len = n, silence = packet.silence, "voice packet sent");
                    if let Some(m) = &self.metrics {
                        m.packets_sent_total.inc();
                        m.bytes_sent_total.inc_by(n as u64);
                    }
                }
                Err(e) => warn!("Failed to send voice packet: {e}"),
            }
            drop(data);

            if queue.depth() == 0 {
                if !packet.silence {
                    for _ in 0..TRAILING_SILENCE_FRAMES {
                        queue.try_enqueue(RawVoicePacket::silence(&self.format));
                    }
                } else {
                    self.finish_playback();
                }
            }
        }

        debug!(ssrc = self.ssrc, "transmit loop stopped");
    }

    fn finish_playback(&self) {
        // ---
        self.speaking.set(false);
        self.queue.set_playing(false);
    }
}

/// Writer that slices arbitrary PCM into fixed-duration frames.
pub struct TransmitSink {
    // ---
    queue: Arc<TransmitQueue>,
    format: AudioFormat,
    duration_ms: u32,
    frame_len: usize,
    pending: Vec<i16>,
    volume: f32,
}

impl TransmitSink {
    // ---
    /// Largest accepted volume multiplier
    pub const MAX_VOLUME: f32 = 2.5;

    /// # Errors
    ///
    /// Returns [`VoiceError::InvalidArgument`] unless `duration_ms` is one
    /// of 5, 10, 20, 40 or 60.
    pub fn new(
        queue: Arc<TransmitQueue>,
        format: AudioFormat,
        duration_ms: u32,
    ) -> VoiceResult<Self> {
        // ---
        if !AudioFormat::is_allowed_duration(duration_ms) {
            return Err(VoiceError::InvalidArgument(format!(
                "invalid frame duration {duration_ms} ms (allowed: 5, 10, 20, 40, 60)"
            )));
        }

        let frame_len = format.sample_count(duration_ms);
        Ok(Self {
            queue,
            format,
            duration_ms,
            frame_len,
            pending: Vec::with_capacity(frame_len),
            volume: 1.0,
        })
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) -> VoiceResult<()> {
        // ---
        if !(0.0..=Self::MAX_VOLUME).contains(&volume) {
            return Err(VoiceError::InvalidArgument(format!(
                "volume {volume} outside 0.0..={}",
                Self::MAX_VOLUME
            )));
        }
        self.volume = volume;
        Ok(())
    }

    /// Buffers `pcm` and enqueues every complete frame, waiting for queue
    /// space as needed.
    pub async fn write(&mut self, pcm: &[i16]) -> VoiceResult<()> {
        // ---
        self.pending.extend_from_slice(pcm);
        while self.pending.len() >= self.frame_len {
            let frame: Vec<i16> = self.pending.drain(..self.frame_len).collect();
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Pads the partial frame with silence and enqueues it.
    pub async fn flush(&mut self) -> VoiceResult<()> {
        // ---
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(self.frame_len, 0);
        self.send_frame(frame).await
    }

    pub fn pause(&self) {
        self.queue.gate().pause();
    }

    pub fn resume(&self) {
        self.queue.gate().resume();
    }

    async fn send_frame(&self, mut frame: Vec<i16>) -> VoiceResult<()> {
        // ---
        if (self.volume - 1.0).abs() > f32::EPSILON {
            for s in frame.iter_mut() {
                *s = (*s as f32 * self.volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }
        self.queue
            .enqueue(RawVoicePacket::new(frame, self.duration_ms))
            .await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::VoiceCodec;
    use crate::config::ConnectionEndpoint;
    use crate::gateway::GatewayCommand;
    use crate::test_support::FakeCodec;
    use tokio::net::UdpSocket;
    use voicenext_common::EncryptionMode;

    const KEY: [u8; 32] = [7u8; 32];

    struct Harness {
        queue: Arc<TransmitQueue>,
        server: UdpSocket,
        commands: mpsc::UnboundedReceiver<GatewayCommand>,
        pipeline: TransmitPipeline,
    }

    async fn harness(mode: EncryptionMode) -> Harness {
        // ---
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ConnectionEndpoint::new("127.0.0.1", server.local_addr().unwrap().port());
        let udp = Arc::new(UdpSession::connect(&endpoint).await.unwrap());

        let (tx, commands) = mpsc::unbounded_channel();
        let speaking = Arc::new(SpeakingSignal::new(tx));
        speaking.set_ssrc(42);

        let crypto: CryptoSlot = Arc::new(RwLock::new(Some(Arc::new(
            EncryptionManager::new(&KEY, mode).unwrap(),
        ))));
        let queue = Arc::new(TransmitQueue::new(25));
        let codec = FakeCodec::default();

        let pipeline = TransmitPipeline::new(
            queue.clone(),
            codec.create_encoder().unwrap(),
            codec.audio_format(),
            crypto,
            udp,
            speaking,
            BufferPool::new(512, 8),
            42,
        );

        Harness {
            queue,
            server,
            commands,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_prepare_packet_layout() {
        // ---
        let mut h = harness(EncryptionMode::XSalsa20Poly1305Lite).await;
        let format = FakeCodec::default().audio_format();

        let first = h.pipeline.prepare_packet(&RawVoicePacket::new(format.silence(20), 20)).unwrap();
        let header = RtpHeader::decode(&first).unwrap();
        assert_eq!((header.sequence, header.timestamp, header.ssrc), (0, 0, 42));
        drop(first);

        let second = h.pipeline.prepare_packet(&RawVoicePacket::new(format.silence(20), 20)).unwrap();
        let header = RtpHeader::decode(&second).unwrap();
        assert_eq!((header.sequence, header.timestamp), (1, 960));

        // Lite nonce counter rides in the last four bytes.
        assert_eq!(&second[second.len() - 4..], &1u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_prepare_requires_session_key() {
        // ---
        let mut h = harness(EncryptionMode::XSalsa20Poly1305).await;
        *h.pipeline.crypto.write() = None;
        let pool = h.pipeline.pool.clone();

        let format = FakeCodec::default().audio_format();
        let err = h.pipeline.prepare_packet(&RawVoicePacket::new(format.silence(20), 20));
        assert!(matches!(err, Err(VoiceError::NotInitialized)));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pacing_and_trailing_silence() {
        // ---
        let h = harness(EncryptionMode::XSalsa20Poly1305Suffix).await;
        let format = FakeCodec::default().audio_format();
        let Harness {
            queue,
            server,
            mut commands,
            pipeline,
        } = h;

        for _ in 0..3 {
            queue.enqueue(RawVoicePacket::new(format.silence(20), 20)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pipeline.run(cancel.clone()));

        // 3 frames plus 3 trailing silence frames.
        let mut buf = [0u8; 2048];
        let mut arrivals = Vec::new();
        for _ in 0..6 {
            let len = tokio::time::timeout(Duration::from_secs(2), server.recv(&mut buf))
                .await
                .expect("packet in time")
                .unwrap();
            assert!(len > rtp::HEADER_SIZE);
            arrivals.push(Instant::now());
        }

        let total = arrivals[5].duration_since(arrivals[0]);
        assert!(total >= Duration::from_millis(90), "sent too fast: {total:?}");
        assert!(total <= Duration::from_millis(250), "sent too slow: {total:?}");

        queue.wait_for_playback_finish().await;
        assert!(!queue.is_playing());
        assert_eq!(queue.depth(), 0);

        let flags: Vec<bool> = std::iter::from_fn(|| commands.try_recv().ok())
            .map(|c| match c {
                GatewayCommand::Speaking { speaking, ssrc } => {
                    assert_eq!(ssrc, 42);
                    speaking
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(flags, vec![true, false]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_holds_frames() {
        // ---
        let h = harness(EncryptionMode::XSalsa20Poly1305).await;
        let format = FakeCodec::default().audio_format();
        h.queue.gate().pause();
        h.queue.enqueue(RawVoicePacket::new(format.silence(20), 20)).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.pipeline.run(cancel.clone()));

        let mut buf = [0u8; 2048];
        let early = tokio::time::timeout(Duration::from_millis(80), h.server.recv(&mut buf)).await;
        assert!(early.is_err(), "paused pipeline must not send");
        assert_eq!(h.queue.depth(), 1);

        h.queue.gate().resume();
        tokio::time::timeout(Duration::from_secs(1), h.server.recv(&mut buf))
            .await
            .expect("resumed pipeline sends")
            .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_restarts_pacing_clock() {
        // ---
        let h = harness(EncryptionMode::XSalsa20Poly1305Lite).await;
        let format = FakeCodec::default().audio_format();
        h.queue.gate().pause();
        for _ in 0..10 {
            h.queue.enqueue(RawVoicePacket::new(format.silence(20), 20)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.pipeline.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.queue.gate().resume();

        let mut buf = [0u8; 2048];
        let mut arrivals = Vec::new();
        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(2), h.server.recv(&mut buf))
                .await
                .expect("packet in time")
                .unwrap();
            arrivals.push(Instant::now());
        }

        // Nine 20 ms windows between the first and the tenth frame.
        let span = arrivals[9].duration_since(arrivals[0]);
        assert!(span >= Duration::from_millis(150), "burst after resume: {span:?}");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_last_frame_ends_playback() {
        // ---
        let mut h = harness(EncryptionMode::XSalsa20Poly1305).await;
        let format = FakeCodec::default().audio_format();
        *h.pipeline.crypto.write() = None;

        let speaking = h.pipeline.speaking.clone();
        assert!(speaking.set(true));
        h.queue.enqueue(RawVoicePacket::new(format.silence(20), 20)).await.unwrap();
        assert!(h.queue.is_playing());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.pipeline.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(1), h.queue.wait_for_playback_finish())
            .await
            .expect("playback ends after the frame is dropped");
        assert!(!h.queue.is_playing());
        assert_eq!(h.queue.depth(), 0);
        assert!(!speaking.is_speaking());

        let flags: Vec<bool> = std::iter::from_fn(|| h.commands.try_recv().ok())
            .filter_map(|c| match c {
                GatewayCommand::Speaking { speaking, .. } => Some(speaking),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_covers_frames_still_queued() {
        // ---
        let h = harness(EncryptionMode::XSalsa20Poly1305).await;
        let format = FakeCodec::default().audio_format();
        h.queue.enqueue(RawVoicePacket::new(format.silence(20), 20)).await.unwrap();
        assert!(h.queue.is_playing());

        // Nothing drains the queue yet.
        let early =
            tokio::time::timeout(Duration::from_millis(60), h.queue.wait_for_playback_finish())
                .await;
        assert!(early.is_err(), "wait returned with a frame still queued");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.pipeline.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(1), h.queue.wait_for_playback_finish())
            .await
            .expect("playback finishes");

        let mut buf = [0u8; 2048];
        let len = tokio::time::timeout(Duration::from_millis(100), h.server.recv(&mut buf))
            .await
            .expect("queued frame was sent")
            .unwrap();
        assert!(len > rtp::HEADER_SIZE);
        assert_eq!(h.queue.depth(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sink_frames_and_flush() {
        // ---
        let queue = Arc::new(TransmitQueue::new(25));
        let format = AudioFormat::default();
        let mut sink = TransmitSink::new(queue.clone(), format, 20).unwrap();

        sink.write(&vec![1i16; 1920 + 100]).await.unwrap();
        assert_eq!(queue.depth(), 1);

        sink.flush().await.unwrap();
        assert_eq!(queue.depth(), 2);

        let mut rx = queue.rx.lock().await;
        assert_eq!(rx.try_recv().unwrap().pcm.len(), 1920);
        let tail = rx.try_recv().unwrap();
        assert_eq!(tail.pcm.len(), 1920);
        assert_eq!(tail.pcm[99], 1);
        assert_eq!(tail.pcm[100], 0);
    }

    #[test]
    fn test_sink_rejects_bad_duration_and_volume() {
        // ---
        let queue = Arc::new(TransmitQueue::new(1));
        assert!(TransmitSink::new(queue.clone(), AudioFormat::default(), 30).is_err());

        let mut sink = TransmitSink::new(queue, AudioFormat::default(), 60).unwrap();
        assert!(sink.set_volume(3.0).is_err());
        assert!(sink.set_volume(0.5).is_ok());
        assert_eq!(sink.volume(), 0.5);
    }

    #[tokio::test]
    async fn test_sink_applies_volume() {
        // ---
        let queue = Arc::new(TransmitQueue::new(4));
        let format = AudioFormat::default();
        let mut sink = TransmitSink::new(queue.clone(), format, 10).unwrap();
        sink.set_volume(2.0).unwrap();
        sink.write(&vec![20_000i16; format.sample_count(10)]).await.unwrap();

        let packet = queue.rx.lock().await.try_recv().unwrap();
        assert!(packet.pcm.iter().all(|&s| s == i16::MAX));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_frames() {
        // ---
        let queue = Arc::new(TransmitQueue::new(1));
        let format = AudioFormat::default();
        queue.enqueue(RawVoicePacket::silence(&format)).await.unwrap();

        // Blocked on a full queue until closed.
        let q = queue.clone();
        let blocked = tokio::spawn(async move { q.enqueue(RawVoicePacket::silence(&format)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(matches!(blocked.await.unwrap(), Err(VoiceError::Disposed)));
        assert!(!queue.try_enqueue(RawVoicePacket::silence(&format)));
        assert_eq!(queue.depth(), 1);
        queue.wait_for_playback_finish().await;
    }

    #[test]
    fn test_try_enqueue_full_queue() {
        // ---
        let queue = TransmitQueue::new(1);
        let format = AudioFormat::default();
        assert!(queue.try_enqueue(RawVoicePacket::silence(&format)));
        assert!(!queue.try_enqueue(RawVoicePacket::silence(&format)));
        assert_eq!(queue.depth(), 1);
    }
}
