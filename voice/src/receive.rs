//! Inbound decode pipeline.
//!
//! Every voice datagram is matched to a per-SSRC [`AudioSender`], checked
//! for ordering, decrypted and decoded. Holes in the sequence are filled
//! with FEC or loss-concealment frames before the real frame.

use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use voicenext_common::{rtp, MetricsContext, RtpHeader};

use crate::codec::{AudioFormat, VoiceCodec, VoiceDecoder};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{UserIdentity, VoiceEvents, VoiceReceivedEvent};
use crate::transmit::CryptoSlot;
use crate::udp::{KeepaliveTracker, UdpSession, KEEPALIVE_PACKET_SIZE, MAX_DATAGRAM_SIZE};

/// Gaps this large are logged as a warning
pub const LARGE_GAP_WARNING: usize = 5;

/// Marker of an extra two-byte prefix some clients put before the Opus data
const PAYLOAD_PREFIX_MARKER: u8 = 0x90;

/// Remote sender state, keyed by SSRC.
pub struct AudioSender {
    // ---
    pub ssrc: u32,
    pub user: Option<UserIdentity>,
    decoder: Mutex<Box<dyn VoiceDecoder>>,
    last_sequence: Option<u16>,
}

impl AudioSender {
    // ---
    pub fn new(ssrc: u32, decoder: Box<dyn VoiceDecoder>) -> Self {
        // ---
        Self {
            ssrc,
            user: None,
            decoder: Mutex::new(decoder),
            last_sequence: None,
        }
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }

    /// Packets missing between the last accepted sequence and `sequence`,
    /// or `None` if `sequence` is not newer.
    fn gap_before(&self, sequence: u16) -> Option<usize> {
        // ---
        let Some(last) = self.last_sequence else {
            return Some(0);
        };

        let delta = sequence.wrapping_sub(last);
        if delta == 0 || delta >= 0x8000 {
            return None;
        }
        Some(delta as usize - 1)
    }
}

/// SSRC → sender map shared by the signaling and receive sides.
pub struct SenderTable {
    // ---
    senders: DashMap<u32, AudioSender>,
    codec: Arc<dyn VoiceCodec>,
}

impl SenderTable {
    // ---
    pub fn new(codec: Arc<dyn VoiceCodec>) -> Self {
        // ---
        Self {
            senders: DashMap::new(),
            codec,
        }
    }

    /// Existing sender for `ssrc`, or a new one with a fresh decoder.
    pub fn get_or_create(&self, ssrc: u32) -> VoiceResult<RefMut<'_, u32, AudioSender>> {
        // ---
        self.senders
            .entry(ssrc)
            .or_try_insert_with(|| -> anyhow::Result<AudioSender> {
                trace!(ssrc, "new audio sender");
                Ok(AudioSender::new(ssrc, self.codec.create_decoder()?))
            })
            .map_err(VoiceError::codec)
    }

    /// Ties `user` to `ssrc`, creating the sender if needed. An identity
    /// already attached is kept.
    pub fn attach_user(&self, ssrc: u32, user: UserIdentity) -> VoiceResult<()> {
        // ---
        match self.senders.entry(ssrc) {
            Entry::Occupied(mut e) => {
                let sender = e.get_mut();
                if sender.user.is_none() {
                    sender.user = Some(user);
                }
            }
            Entry::Vacant(e) => {
                let decoder = self.codec.create_decoder().map_err(VoiceError::codec)?;
                let mut sender = AudioSender::new(ssrc, decoder);
                sender.user = Some(user);
                e.insert(sender);
            }
        }
        Ok(())
    }

    /// Drops the sender belonging to `user_id`; returns its SSRC.
    pub fn remove_user(&self, user_id: u64) -> Option<u32> {
        // ---
        let ssrc = self
            .senders
            .iter()
            .find(|s| s.user.as_ref().is_some_and(|u| u.id == user_id))
            .map(|s| *s.key())?;
        self.senders.remove(&ssrc).map(|(ssrc, _)| ssrc)
    }

    pub fn user(&self, ssrc: u32) -> Option<UserIdentity> {
        self.senders.get(&ssrc).and_then(|s| s.user.clone())
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.senders.contains_key(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Removes every sender, dropping their decoders.
    pub fn clear(&self) {
        self.senders.clear();
    }
}

/// Result of one accepted datagram.
#[derive(Debug, Clone)]
pub struct InboundVoice {
    // ---
    pub ssrc: u32,
    pub user: Option<UserIdentity>,

    /// Decrypted Opus payload
    pub opus: Vec<u8>,

    /// FEC or concealment frames for the gap before this packet, oldest first
    pub concealed: Vec<Vec<i16>>,

    pub pcm: Vec<i16>,
}

/// Stateless driver over the sender table.
pub struct InboundPipeline {
    // ---
    senders: Arc<SenderTable>,
    crypto: CryptoSlot,
    format: AudioFormat,
    metrics: Option<MetricsContext>,
}

impl InboundPipeline {
    // ---
    pub fn new(senders: Arc<SenderTable>, crypto: CryptoSlot, format: AudioFormat) -> Self {
        // ---
        Self {
            senders,
            crypto,
            format,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<MetricsContext>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Handles one voice datagram.
    ///
    /// Returns `Ok(None)` for duplicates and late packets. The sender's
    /// last sequence advances even when decryption or decoding fails.
    pub fn process(&self, datagram: &[u8]) -> VoiceResult<Option<InboundVoice>> {
        // ---
        let header = RtpHeader::decode(datagram).map_err(VoiceError::protocol)?;
        let crypto = self.crypto.read().clone().ok_or(VoiceError::NotInitialized)?;

        let mut sender = self.senders.get_or_create(header.ssrc)?;
        let Some(gap) = sender.gap_before(header.sequence) else {
            trace!(ssrc = header.ssrc, seq = header.sequence, "discarding out-of-order packet");
            if let Some(m) = &self.metrics {
                m.packets_dropped_total.inc();
            }
            return Ok(None);
        };

        if gap >= LARGE_GAP_WARNING {
            warn!(ssrc = header.ssrc, gap, "5 or more voice packets were dropped when receiving");
        }

        let decoder = sender.decoder.get_mut().as_mut();
        let decoded = self.decrypt_and_decode(&crypto, datagram, &header, gap, decoder);
        sender.last_sequence = Some(header.sequence);
        let user = sender.user.clone();
        drop(sender);

        let (opus, concealed, pcm) = decoded?;
        if let Some(m) = &self.metrics {
            m.packets_received_total.inc();
            m.bytes_received_total.inc_by(datagram.len() as u64);
            m.packets_lost_total.inc_by(gap as u64);
        }

        Ok(Some(InboundVoice {
            ssrc: header.ssrc,
            user,
            opus,
            concealed,
            pcm,
        }))
    }

    #[allow(clippy::type_complexity)]
    fn decrypt_and_decode(
        &self,
        crypto: &voicenext_common::EncryptionManager,
        datagram: &[u8],
        header: &RtpHeader,
        gap: usize,
        decoder: &mut dyn VoiceDecoder,
    ) -> VoiceResult<(Vec<u8>, Vec<Vec<i16>>, Vec<i16>)> {
        // ---
        let nonce = crypto.extract_nonce(datagram).map_err(VoiceError::crypto)?;
        let sealed = rtp::encrypted_payload(datagram, crypto.mode()).map_err(VoiceError::protocol)?;
        let plain = crypto.decrypt(sealed, &nonce).map_err(|e| {
            if let Some(m) = &self.metrics {
                m.decrypt_failures_total.inc();
            }
            VoiceError::crypto(e)
        })?;

        let mut opus: &[u8] = &plain;
        if header.has_extension {
            opus = rtp::strip_extension(opus);
        }
        if opus.len() >= 2 && opus[0] == PAYLOAD_PREFIX_MARKER {
            opus = &opus[2..];
        }

        let started = Instant::now();
        let mut concealed = Vec::with_capacity(gap);
        if gap == 1 {
            concealed.push(decoder.decode(opus, true).map_err(VoiceError::codec)?);
        } else if gap > 1 {
            let samples = decoder.last_packet_sample_count();
            for _ in 0..gap {
                concealed.push(decoder.process_packet_loss(samples).map_err(VoiceError::codec)?);
            }
        }

        let pcm = decoder.decode(opus, false).map_err(VoiceError::codec)?;
        if let Some(m) = &self.metrics {
            m.decode_seconds.observe(started.elapsed().as_secs_f64());
        }

        Ok((opus.to_vec(), concealed, pcm))
    }
}

/// Surfaces concealment frames first, then the real frame.
pub fn emit_voice(events: &VoiceEvents, format: AudioFormat, voice: InboundVoice) {
    // ---
    let InboundVoice {
        ssrc,
        user,
        opus,
        concealed,
        pcm,
    } = voice;

    for frame in concealed {
        events.voice_received.invoke(&VoiceReceivedEvent {
            ssrc,
            user: user.clone(),
            duration_ms: format.duration_ms(frame.len()),
            pcm: frame,
            opus: Vec::new(),
            format,
        });
    }

    events.voice_received.invoke(&VoiceReceivedEvent {
        ssrc,
        user,
        duration_ms: format.duration_ms(pcm.len()),
        pcm,
        opus,
        format,
    });
}

/// Reads the UDP socket until cancelled: keepalive replies update the RTT,
/// everything else goes to `inbound` when incoming audio is enabled.
pub async fn run_receive_loop(
    udp: Arc<UdpSession>,
    keepalive: Arc<KeepaliveTracker>,
    inbound: Option<InboundPipeline>,
    events: Arc<VoiceEvents>,
    metrics: Option<MetricsContext>,
    cancel: CancellationToken,
) {
    // ---
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    debug!(incoming = inbound.is_some(), "receive loop started");

    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            res = udp.recv(&mut buf) => match res {
                Ok(len) => len,
                Err(e) => {
                    warn!("UDP receive failed: {e}");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        if len == KEEPALIVE_PACKET_SIZE {
            if let (Some(rtt), Some(m)) = (keepalive.handle_reply(datagram), &metrics) {
                m.udp_rtt_ms.set(rtt.as_millis() as i64);
            }
            continue;
        }

        let Some(pipeline) = &inbound else {
            continue;
        };

        match pipeline.process(datagram) {
            Ok(Some(voice)) => emit_voice(&events, pipeline.format(), voice),
            Ok(None) => {}
            Err(e) => debug!("Dropped inbound voice packet: {e}"),
        }
    }

    debug!("receive loop stopped");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::{DecodeCall, FakeCodec};
    use parking_lot::RwLock;
    use voicenext_common::{EncryptionManager, EncryptionMode};

    const KEY: [u8; 32] = [3u8; 32];

    struct Fixture {
        codec: FakeCodec,
        senders: Arc<SenderTable>,
        pipeline: InboundPipeline,
        sealer: EncryptionManager,
    }

    fn fixture(mode: EncryptionMode) -> Fixture {
        // ---
        let codec = FakeCodec::default();
        let senders = Arc::new(SenderTable::new(Arc::new(codec.clone())));
        let crypto: CryptoSlot = Arc::new(RwLock::new(Some(Arc::new(
            EncryptionManager::new(&KEY, mode).unwrap(),
        ))));
        let pipeline = InboundPipeline::new(senders.clone(), crypto, codec.audio_format());

        Fixture {
            codec,
            senders,
            pipeline,
            sealer: EncryptionManager::new(&KEY, mode).unwrap(),
        }
    }

    /// Seals a FakeCodec payload for one 20 ms frame.
    fn datagram(f: &Fixture, seq: u16, ssrc: u32, prefix: &[u8]) -> Vec<u8> {
        // ---
        let header = RtpHeader::new(seq, seq as u32 * 960, ssrc);
        let mut header_bytes = header.to_bytes();
        if !prefix.is_empty() && prefix[0] == 0xBE {
            header_bytes[0] = rtp::RTP_EXTENSION;
        }

        let mut payload = prefix.to_vec();
        payload.extend_from_slice(&FakeCodec::packet_for(960));

        let nonce = f.sealer.generate_nonce(&header_bytes);
        let mut out = header_bytes.to_vec();
        out.extend_from_slice(&f.sealer.encrypt(&payload, &nonce).unwrap());
        f.sealer.append_nonce(&nonce, &mut out);
        out
    }

    #[test]
    fn test_in_order_packets_have_no_gap() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305Lite);
        for seq in [1u16, 2, 3] {
            let voice = f.pipeline.process(&datagram(&f, seq, 9, &[])).unwrap().unwrap();
            assert!(voice.concealed.is_empty());
            assert_eq!(voice.pcm.len(), 1920);
        }
        assert_eq!(f.codec.calls(), vec![DecodeCall::Decode; 3]);
    }

    #[test]
    fn test_gap_fill_fec_then_plc() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305Suffix);

        // 1, 2, 4: one missing → FEC
        for seq in [1u16, 2] {
            f.pipeline.process(&datagram(&f, seq, 9, &[])).unwrap();
        }
        let voice = f.pipeline.process(&datagram(&f, 4, 9, &[])).unwrap().unwrap();
        assert_eq!(voice.concealed.len(), 1);
        assert_eq!(voice.concealed[0].len(), 1920);

        // 4 → 8: three missing → PLC ×3
        let voice = f.pipeline.process(&datagram(&f, 8, 9, &[])).unwrap().unwrap();
        assert_eq!(voice.concealed.len(), 3);

        assert_eq!(
            f.codec.calls(),
            vec![
                DecodeCall::Decode,
                DecodeCall::Decode,
                DecodeCall::Fec,
                DecodeCall::Decode,
                DecodeCall::Plc,
                DecodeCall::Plc,
                DecodeCall::Plc,
                DecodeCall::Decode,
            ]
        );
    }

    #[test]
    fn test_out_of_order_is_discarded_without_state_change() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305);
        f.pipeline.process(&datagram(&f, 5, 9, &[])).unwrap();

        assert!(f.pipeline.process(&datagram(&f, 3, 9, &[])).unwrap().is_none());
        assert!(f.pipeline.process(&datagram(&f, 5, 9, &[])).unwrap().is_none());
        assert_eq!(f.senders.get_or_create(9).unwrap().last_sequence(), Some(5));
        assert_eq!(f.codec.calls(), vec![DecodeCall::Decode]);
    }

    #[test]
    fn test_sequence_wraparound_is_in_order() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305Lite);
        f.pipeline.process(&datagram(&f, u16::MAX, 9, &[])).unwrap();
        let voice = f.pipeline.process(&datagram(&f, 0, 9, &[])).unwrap().unwrap();
        assert!(voice.concealed.is_empty());
    }

    #[test]
    fn test_failed_decrypt_still_advances_sequence() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305Lite);
        let mut bad = datagram(&f, 10, 9, &[]);
        bad[rtp::HEADER_SIZE] ^= 0xFF;

        assert!(matches!(f.pipeline.process(&bad), Err(VoiceError::Crypto(_))));
        assert_eq!(f.senders.get_or_create(9).unwrap().last_sequence(), Some(10));
    }

    #[test]
    fn test_extension_and_prefix_are_stripped() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305Lite);
        // One element, len 1 (0x10 → id 1, len-1 0), one data byte, padding
        let extension = [0xBE, 0xDE, 0x00, 0x01, 0x10, 0xAA, 0x00, 0x00];
        let voice = f.pipeline.process(&datagram(&f, 1, 9, &extension)).unwrap().unwrap();
        assert_eq!(voice.opus, FakeCodec::packet_for(960));

        let voice = f.pipeline.process(&datagram(&f, 2, 9, &[0x90, 0x01])).unwrap().unwrap();
        assert_eq!(voice.opus, FakeCodec::packet_for(960));
    }

    #[test]
    fn test_short_and_foreign_datagrams_rejected() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305);
        assert!(matches!(f.pipeline.process(&[0x80; 12]), Err(VoiceError::Protocol(_))));
        assert!(matches!(f.pipeline.process(&[0x00; 40]), Err(VoiceError::Protocol(_))));
        assert!(f.senders.is_empty());
    }

    #[test]
    fn test_sender_table_users() {
        // ---
        let table = SenderTable::new(Arc::new(FakeCodec::default()));
        table.get_or_create(1).unwrap();
        table.attach_user(1, UserIdentity::new(100)).unwrap();
        table.attach_user(1, UserIdentity::new(200)).unwrap();
        table.attach_user(2, UserIdentity::new(300)).unwrap();

        assert_eq!(table.user(1).map(|u| u.id), Some(100));
        assert_eq!(table.len(), 2);

        assert_eq!(table.remove_user(300), Some(2));
        assert_eq!(table.remove_user(300), None);
        assert!(!table.contains(2));

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_concealment_events_come_first() {
        // ---
        let events = VoiceEvents::default();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o = order.clone();
        events.voice_received.add(move |e| {
            o.lock().push(e.opus.is_empty());
            Ok(())
        });

        let format = AudioFormat::default();
        emit_voice(
            &events,
            format,
            InboundVoice {
                ssrc: 1,
                user: None,
                opus: vec![1],
                concealed: vec![format.silence(20), format.silence(20)],
                pcm: format.silence(20),
            },
        );
        assert_eq!(*order.lock(), vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_sender_table_is_shared_across_tasks() {
        // ---
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SenderTable>();

        let f = fixture(EncryptionMode::XSalsa20Poly1305);
        let packet = datagram(&f, 0, 11, &[]);
        let senders = f.senders.clone();
        let pipeline = Arc::new(f.pipeline);
        let voice = tokio::spawn(async move { pipeline.process(&packet) })
            .await
            .unwrap()
            .unwrap()
            .expect("first packet accepted");
        assert_eq!(voice.pcm.len(), 1920);
        assert!(senders.contains(11));
    }

    #[test]
    fn test_no_sender_created_without_session_key() {
        // ---
        let f = fixture(EncryptionMode::XSalsa20Poly1305);
        let packet = datagram(&f, 0, 12, &[]);
        *f.pipeline.crypto.write() = None;

        assert!(matches!(f.pipeline.process(&packet), Err(VoiceError::NotInitialized)));
        assert!(f.senders.is_empty());
    }
}
