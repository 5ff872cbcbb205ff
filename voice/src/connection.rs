//! Voice connection lifecycle.
//!
//! A [`VoiceConnection`] owns one signaling session runner plus the media
//! tasks it starts. Task layout, all under one root cancellation token:
//!
//! ```text
//! gateway runner ── per-socket session ── heartbeat
//!        └── media (per READY) ── transmit / receive / keepalive
//! ```
//!
//! The signaling socket may reconnect (RESUME or IDENTIFY) without tearing
//! down the UDP side; a fresh READY replaces the media tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use voicenext_common::{EncryptionManager, EncryptionMode, MetricsContext};

use crate::codec::{OpusCodec, VoiceCodec, DEFAULT_FRAME_DURATION_MS};
use crate::config::{ConnectionEndpoint, VoiceConfig, VoiceCredentials};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{
    ConnectionClosedEvent, IdOnlyResolver, SocketErrorEvent, UserIdentity, UserJoinedEvent,
    UserLeftEvent, UserResolver, UserSpeakingEvent, VoiceEvents,
};
use crate::gateway::{
    CloseAction, GatewayCommand, ReadyPayload, SessionDescriptionPayload, SpeakingSignal,
    VoiceDispatch,
};
use crate::pool::BufferPool;
use crate::receive::{run_receive_loop, InboundPipeline, SenderTable};
use crate::transmit::{CryptoSlot, RawVoicePacket, TransmitPipeline, TransmitQueue, TransmitSink};
use crate::udp::{run_keepalive, KeepaliveTracker, UdpSession};

/// Used until HELLO tells us the real interval
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(41_250);

/// Pooled datagram buffers kept idle
const POOLED_BUFFERS: usize = 8;

/// Capacity of a pooled buffer; fits any Opus packet plus framing
const POOLED_BUFFER_CAPACITY: usize = 4096;

/// Silence frames queued once the session key arrives
const INITIAL_SILENCE_FRAMES: usize = 3;

/// Signaling state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Identifying,
    AwaitingReady,
    IpDiscovery,
    AwaitingSessionDescription,
    Ready,
    Reconnecting,
    Closed,
}

/// How a signaling socket session ended without an error.
enum SessionEnd {
    Cancelled,
    Closed(Option<u16>),
}

/// State owned by the signaling side; survives socket reconnects.
#[derive(Default)]
struct SessionState {
    // ---
    resume: bool,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Option<Instant>,
    ssrc: u32,
    udp_endpoint: Option<ConnectionEndpoint>,
    proposed_mode: Option<EncryptionMode>,
    udp: Option<Arc<UdpSession>>,
    heartbeat_cancel: Option<CancellationToken>,
    media_cancel: Option<CancellationToken>,
    keepalive_cancel: Option<CancellationToken>,
}

struct Inner {
    // ---
    credentials: VoiceCredentials,
    config: VoiceConfig,
    codec: Arc<dyn VoiceCodec>,
    resolver: Arc<dyn UserResolver>,
    metrics: Option<MetricsContext>,
    events: Arc<VoiceEvents>,

    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    failure: Mutex<Option<VoiceError>>,

    outbound: mpsc::UnboundedSender<GatewayCommand>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<GatewayCommand>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    session: Mutex<SessionState>,
    speaking: Arc<SpeakingSignal>,
    queue: Arc<TransmitQueue>,
    senders: Arc<SenderTable>,
    crypto: CryptoSlot,
    keepalive: Arc<KeepaliveTracker>,
    pool: BufferPool,
    ws_rtt_ms: AtomicU64,
}

/// Builder for [`VoiceConnection`].
pub struct VoiceConnectionBuilder {
    // ---
    credentials: VoiceCredentials,
    config: VoiceConfig,
    codec: Option<Arc<dyn VoiceCodec>>,
    resolver: Arc<dyn UserResolver>,
    metrics: Option<MetricsContext>,
}

impl VoiceConnectionBuilder {
    // ---
    pub fn config(mut self, config: VoiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`OpusCodec`] in the configured audio format.
    pub fn codec(mut self, codec: Arc<dyn VoiceCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn UserResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> VoiceConnection {
        // ---
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(OpusCodec::new(self.config.audio_format)));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let inner = Inner {
            speaking: Arc::new(SpeakingSignal::new(outbound.clone())),
            queue: Arc::new(TransmitQueue::new(self.config.packet_queue_size)),
            senders: Arc::new(SenderTable::new(codec.clone())),
            crypto: Arc::new(RwLock::new(None)),
            keepalive: Arc::new(KeepaliveTracker::new()),
            pool: BufferPool::new(POOLED_BUFFER_CAPACITY, POOLED_BUFFERS),
            credentials: self.credentials,
            config: self.config,
            codec,
            resolver: self.resolver,
            metrics: self.metrics,
            events: Arc::new(VoiceEvents::default()),
            state,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            failure: Mutex::new(None),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            runner: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            session: Mutex::new(SessionState::default()),
            ws_rtt_ms: AtomicU64::new(0),
        };

        VoiceConnection {
            inner: Arc::new(inner),
        }
    }
}

/// Client side of one voice channel connection.
///
/// Dropping the handle cancels every background task.
pub struct VoiceConnection {
    // ---
    inner: Arc<Inner>,
}

impl VoiceConnection {
    // ---
    pub fn builder(credentials: VoiceCredentials) -> VoiceConnectionBuilder {
        // ---
        VoiceConnectionBuilder {
            credentials,
            config: VoiceConfig::default(),
            codec: None,
            resolver: Arc::new(IdOnlyResolver),
            metrics: None,
        }
    }

    pub fn new(credentials: VoiceCredentials, config: VoiceConfig) -> Self {
        Self::builder(credentials).config(config).build()
    }

    /// Opens the signaling socket and waits until the session key has
    /// arrived and audio can flow.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection: authentication or
    /// negotiation failure, a fatal close code, or exhausted retries.
    pub async fn connect(&self) -> VoiceResult<()> {
        // ---
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(VoiceError::Disposed);
        }

        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| VoiceError::InvalidArgument("connect() was already called".into()))?;

        let mut state_rx = self.inner.state.subscribe();
        let runner = tokio::spawn(run_gateway(self.inner.clone(), outbound_rx));
        *self.inner.runner.lock() = Some(runner);

        let reached = state_rx
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed);

        match reached {
            ConnectionState::Ready => Ok(()),
            _ => Err(self.inner.failure.lock().take().unwrap_or(VoiceError::Disposed)),
        }
    }

    /// Tears the connection down. Safe to call more than once.
    pub async fn disconnect(&self) {
        // ---
        self.inner.shutdown(None, "disconnect requested");

        let runner = self.inner.runner.lock().take();
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                warn!("gateway runner ended abnormally: {e}");
            }
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("voice task ended abnormally: {e}");
            }
        }
        self.inner.senders.clear();
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &VoiceEvents {
        &self.inner.events
    }

    pub fn credentials(&self) -> &VoiceCredentials {
        &self.inner.credentials
    }

    /// Our SSRC, once READY has been received.
    pub fn ssrc(&self) -> Option<u32> {
        // ---
        let session = self.inner.session.lock();
        session.udp_endpoint.as_ref().map(|_| session.ssrc)
    }

    /// Mode fixed by the server's session description.
    pub fn encryption_mode(&self) -> Option<EncryptionMode> {
        self.inner.crypto.read().as_ref().map(|c| c.mode())
    }

    /// New sink writing into this connection's frame queue.
    ///
    /// `duration_ms` defaults to 20 and must be 5, 10, 20, 40 or 60.
    pub fn transmit_sink(&self, duration_ms: Option<u32>) -> VoiceResult<TransmitSink> {
        // ---
        self.ensure_alive()?;
        TransmitSink::new(
            self.inner.queue.clone(),
            self.inner.codec.audio_format(),
            duration_ms.unwrap_or(DEFAULT_FRAME_DURATION_MS),
        )
    }

    /// Queues one frame, waiting for room.
    pub async fn enqueue(&self, packet: RawVoicePacket) -> VoiceResult<()> {
        // ---
        self.ensure_alive()?;
        self.inner.queue.enqueue(packet).await
    }

    pub fn pause(&self) {
        self.inner.queue.gate().pause();
    }

    pub fn resume(&self) {
        self.inner.queue.gate().resume();
    }

    pub fn is_paused(&self) -> bool {
        !self.inner.queue.gate().is_open()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.queue.is_playing()
    }

    /// Resolves once queued audio and its trailing silence have been sent.
    pub async fn wait_for_playback_finish(&self) {
        self.inner.queue.wait_for_playback_finish().await;
    }

    /// Last signaling heartbeat round trip, in milliseconds.
    pub fn ws_ping(&self) -> u64 {
        self.inner.ws_rtt_ms.load(Ordering::Relaxed)
    }

    /// Last UDP keepalive round trip, in milliseconds.
    pub fn udp_ping(&self) -> u64 {
        self.inner.keepalive.rtt_ms()
    }

    /// Sends SPEAKING if the flag differs from the last one sent.
    pub fn send_speaking(&self, speaking: bool) -> VoiceResult<()> {
        // ---
        self.ensure_alive()?;
        if self.state() != ConnectionState::Ready {
            return Err(VoiceError::NotInitialized);
        }
        self.inner.speaking.set(speaking);
        Ok(())
    }

    /// Remote senders currently tracked.
    pub fn sender_count(&self) -> usize {
        self.inner.senders.len()
    }

    fn ensure_alive(&self) -> VoiceResult<()> {
        // ---
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(VoiceError::Disposed);
        }
        Ok(())
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.inner.shutdown(None, "connection dropped");
    }
}

impl Inner {
    // ---
    fn set_state(&self, state: ConnectionState) {
        // ---
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "voice connection state");
        }
    }

    /// Records the first terminal error for `connect()` to return.
    fn fail(&self, error: VoiceError) {
        // ---
        error!("voice connection failed: {error}");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    /// Runs exactly once; later calls are no-ops.
    fn shutdown(&self, code: Option<u16>, reason: &str) {
        // ---
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(guild = self.credentials.guild_id, "closing voice connection: {reason}");
        self.cancel.cancel();
        self.queue.close();
        *self.crypto.write() = None;
        self.speaking.reset();

        {
            let mut session = self.session.lock();
            session.udp = None;
            session.heartbeat_cancel = None;
            session.media_cancel = None;
            session.keepalive_cancel = None;
        }
        // Without a key no datagram can register a sender past this point.
        self.senders.clear();

        self.set_state(ConnectionState::Closed);
        self.events.connection_closed.invoke(&ConnectionClosedEvent {
            code,
            reason: reason.to_string(),
        });
    }

    /// Spawns a child task that `disconnect()` joins.
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // ---
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(task));
    }

    fn send(&self, command: GatewayCommand) {
        // ---
        if self.outbound.send(command).is_err() {
            debug!("signaling queue closed; dropping outbound command");
        }
    }

    fn start_heartbeat(self: &Arc<Self>, session_cancel: &CancellationToken) {
        // ---
        let token = session_cancel.child_token();
        if let Some(previous) = self.session.lock().heartbeat_cancel.replace(token.clone()) {
            previous.cancel();
        }
        self.spawn(run_heartbeat(self.clone(), token));
    }

    async fn handle_text(
        self: &Arc<Self>,
        text: &str,
        session_cancel: &CancellationToken,
    ) -> VoiceResult<()> {
        // ---
        let dispatch = match VoiceDispatch::decode(text) {
            Ok(d) => d,
            Err(e) => {
                warn!("Ignoring malformed signaling payload: {e}");
                return Ok(());
            }
        };

        match dispatch {
            VoiceDispatch::Hello(hello) => {
                trace!("Received HELLO (OP8)");
                if hello.heartbeat_interval.is_finite() && hello.heartbeat_interval > 0.0 {
                    self.session.lock().heartbeat_interval =
                        Some(Duration::from_secs_f64(hello.heartbeat_interval / 1000.0));
                }
            }

            VoiceDispatch::Ready(ready) => {
                trace!("Received READY (OP2)");
                self.on_ready(ready, session_cancel).await?;
            }

            VoiceDispatch::SessionDescription(description) => {
                trace!("Received SESSION_DESCRIPTION (OP4)");
                self.on_session_description(description)?;
            }

            VoiceDispatch::Speaking(speaking) => {
                trace!("Received SPEAKING (OP5)");
                let user = match speaking.user_id {
                    Some(id) => self.resolver.resolve_user(id).await,
                    None => None,
                };

                let tracked = match &user {
                    Some(user) => self.senders.attach_user(speaking.ssrc, user.clone()),
                    None => self.senders.get_or_create(speaking.ssrc).map(|_| ()),
                };
                if let Err(e) = tracked {
                    warn!(ssrc = speaking.ssrc, "could not track speaking user: {e}");
                }

                self.events.user_speaking.invoke(&UserSpeakingEvent {
                    ssrc: speaking.ssrc,
                    user: user.or_else(|| self.senders.user(speaking.ssrc)),
                    speaking: speaking.speaking,
                });
            }

            VoiceDispatch::HeartbeatAck => {
                let sent = self.session.lock().last_heartbeat;
                if let Some(sent) = sent {
                    let rtt = sent.elapsed().as_millis() as u64;
                    self.ws_rtt_ms.store(rtt, Ordering::Relaxed);
                    if let Some(m) = &self.metrics {
                        m.ws_rtt_ms.set(rtt as i64);
                    }
                    trace!("Received HEARTBEAT_ACK (OP6, {rtt}ms)");
                }
            }

            VoiceDispatch::Resumed => {
                trace!("Received RESUMED (OP9)");
                self.start_heartbeat(session_cancel);
                if self.crypto.read().is_some() {
                    self.set_state(ConnectionState::Ready);
                }
            }

            VoiceDispatch::ClientConnected(joined) => {
                trace!("Received CLIENT_CONNECTED (OP12)");
                let user = self
                    .resolver
                    .resolve_user(joined.user_id)
                    .await
                    .unwrap_or_else(|| UserIdentity::new(joined.user_id));

                if let Err(e) = self.senders.attach_user(joined.audio_ssrc, user.clone()) {
                    warn!(ssrc = joined.audio_ssrc, "could not create audio sender: {e}");
                }
                self.events.user_joined.invoke(&UserJoinedEvent {
                    ssrc: joined.audio_ssrc,
                    user,
                });
            }

            VoiceDispatch::ClientDisconnected(left) => {
                trace!("Received CLIENT_DISCONNECTED (OP13)");
                let ssrc = self.senders.remove_user(left.user_id);
                let user = self
                    .resolver
                    .resolve_user(left.user_id)
                    .await
                    .unwrap_or_else(|| UserIdentity::new(left.user_id));

                self.events.user_left.invoke(&UserLeftEvent { ssrc, user });
            }

            VoiceDispatch::Unknown { op } => {
                debug!("Received unknown voice opcode (OP{op})");
            }
        }

        Ok(())
    }

    async fn on_ready(
        self: &Arc<Self>,
        ready: ReadyPayload,
        session_cancel: &CancellationToken,
    ) -> VoiceResult<()> {
        // ---
        self.set_state(ConnectionState::IpDiscovery);
        let endpoint = ConnectionEndpoint::new(ready.ip.clone(), ready.port);
        self.speaking.set_ssrc(ready.ssrc);
        self.start_heartbeat(session_cancel);

        let mode = EncryptionMode::select(&self.config.encryption_modes, &ready.modes)
            .ok_or_else(|| {
                VoiceError::Negotiation(format!(
                    "no supported encryption mode among {:?}",
                    ready.modes
                ))
            })?;

        let previous_media = {
            let mut session = self.session.lock();
            session.ssrc = ready.ssrc;
            session.udp_endpoint = Some(endpoint.clone());
            session.proposed_mode = Some(mode);
            session.keepalive_cancel = None;
            session.media_cancel.take()
        };
        if let Some(previous) = previous_media {
            previous.cancel();
        }

        info!(ssrc = ready.ssrc, "voice READY, UDP endpoint {}", endpoint.authority());
        let udp = Arc::new(UdpSession::connect(&endpoint).await?);
        let external = udp.discover(ready.ssrc, &self.cancel).await?;

        self.send(GatewayCommand::SelectProtocol {
            address: external.hostname,
            port: external.port,
            mode: mode.name().to_string(),
        });

        let media = self.cancel.child_token();
        let encoder = self.codec.create_encoder().map_err(VoiceError::codec)?;
        let format = self.codec.audio_format();

        let pipeline = TransmitPipeline::new(
            self.queue.clone(),
            encoder,
            format,
            self.crypto.clone(),
            udp.clone(),
            self.speaking.clone(),
            self.pool.clone(),
            ready.ssrc,
        )
        .with_metrics(self.metrics.clone());
        self.spawn(pipeline.run(media.child_token()));

        let inbound = self.config.enable_incoming.then(|| {
            InboundPipeline::new(self.senders.clone(), self.crypto.clone(), format)
                .with_metrics(self.metrics.clone())
        });
        self.spawn(run_receive_loop(
            udp.clone(),
            self.keepalive.clone(),
            inbound,
            self.events.clone(),
            self.metrics.clone(),
            media.child_token(),
        ));

        {
            let mut session = self.session.lock();
            session.udp = Some(udp);
            session.media_cancel = Some(media);
        }

        self.set_state(ConnectionState::AwaitingSessionDescription);
        Ok(())
    }

    fn on_session_description(&self, description: SessionDescriptionPayload) -> VoiceResult<()> {
        // ---
        let mode = EncryptionMode::from_name(&description.mode).ok_or_else(|| {
            VoiceError::Negotiation(format!("server chose unknown mode '{}'", description.mode))
        })?;

        let manager =
            EncryptionManager::new(&description.secret_key, mode).map_err(VoiceError::crypto)?;
        *self.crypto.write() = Some(Arc::new(manager));

        let (udp, media, proposed) = {
            let session = self.session.lock();
            (session.udp.clone(), session.media_cancel.clone(), session.proposed_mode)
        };
        if proposed.is_some_and(|p| p != mode) {
            info!("server overrode encryption mode: proposed {proposed:?}, using {mode}");
        }

        if let (Some(udp), Some(media)) = (udp, media) {
            let token = media.child_token();
            if let Some(previous) = self.session.lock().keepalive_cancel.replace(token.clone()) {
                previous.cancel();
            }
            self.spawn(run_keepalive(
                udp,
                self.keepalive.clone(),
                self.config.keepalive_interval,
                token,
            ));
        }

        let format = self.codec.audio_format();
        for _ in 0..INITIAL_SILENCE_FRAMES {
            self.queue.try_enqueue(RawVoicePacket::silence(&format));
        }

        info!(%mode, "voice session ready");
        self.set_state(ConnectionState::Ready);
        Ok(())
    }
}

async fn run_heartbeat(inner: Arc<Inner>, cancel: CancellationToken) {
    // ---
    loop {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let interval = {
            let mut session = inner.session.lock();
            session.last_heartbeat = Some(Instant::now());
            session.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
        };
        trace!("Sent HEARTBEAT (OP3)");
        inner.send(GatewayCommand::Heartbeat(nonce));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Keeps a signaling socket open, reconnecting per the close policy and
/// retry limits, until the connection ends.
async fn run_gateway(inner: Arc<Inner>, mut outbound: mpsc::UnboundedReceiver<GatewayCommand>) {
    // ---
    let mut failures = 0u32;
    let mut first = true;
    let mut close_code = None;

    let reason = loop {
        if inner.cancel.is_cancelled() {
            break "disconnect requested".to_string();
        }

        inner.set_state(if first {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        first = false;

        let mut established = false;
        let outcome = run_session(&inner, &mut outbound, &mut established).await;
        if established {
            failures = 0;
        }
        inner.session.lock().resume |= established;

        match outcome {
            Ok(SessionEnd::Cancelled) => break "disconnect requested".to_string(),

            Ok(SessionEnd::Closed(code)) => {
                info!("Voice WebSocket closed ({code:?})");
                close_code = code;
                match CloseAction::for_code(code) {
                    CloseAction::Fatal => {
                        let code = code.unwrap_or_default();
                        inner.fail(VoiceError::SessionClosed(code));
                        break format!("server closed the session with code {code}");
                    }
                    CloseAction::Reidentify => inner.session.lock().resume = false,
                    CloseAction::Resume => {}
                }
                if established {
                    continue;
                }
                failures += 1;
            }

            Err(e) => {
                let recoverable = e.is_recoverable();
                inner.events.socket_error.invoke(&SocketErrorEvent {
                    message: e.to_string(),
                    recoverable,
                });
                if !recoverable {
                    let reason = e.to_string();
                    inner.fail(e);
                    break reason;
                }
                warn!("voice signaling session failed: {e}");
                if established {
                    continue;
                }
                failures += 1;
            }
        }

        if !inner.config.reconnect.allows(failures) {
            inner.fail(VoiceError::RetriesExhausted(failures));
            break format!("gave up after {failures} attempts");
        }

        let delay = inner.config.reconnect.delay_for(failures);
        debug!("reconnecting in {delay:?} (attempt {})", failures + 1);
        tokio::select! {
            _ = inner.cancel.cancelled() => break "disconnect requested".to_string(),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    inner.shutdown(close_code, &reason);
}

/// Discards commands queued for a dead socket. A dropped SPEAKING update
/// never reached the server, so the flag is forgotten and the next
/// transition is sent again.
fn drain_stale_commands(
    outbound: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    speaking: &SpeakingSignal,
) -> usize {
    // ---
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    speaking.reset();
    if dropped > 0 {
        debug!(dropped, "discarded stale signaling commands");
    }
    dropped
}

/// One signaling socket from connect to close.
async fn run_session(
    inner: &Arc<Inner>,
    outbound: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    established: &mut bool,
) -> VoiceResult<SessionEnd> {
    // ---
    let endpoint = inner.credentials.gateway_endpoint()?;
    let url = inner.config.gateway_url(&endpoint);
    if inner.config.use_tls {
        // Fails harmlessly if a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    debug!("Connecting to {url}");
    let (ws, _response) = tokio::select! {
        _ = inner.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        res = connect_async(url.as_str()) => res?,
    };
    let (mut write, mut read) = ws.split();

    drain_stale_commands(outbound, &inner.speaking);

    let session_cancel = inner.cancel.child_token();
    let _guard = session_cancel.clone().drop_guard();

    let resume = inner.session.lock().resume;
    inner.set_state(ConnectionState::Identifying);
    let hello = if resume {
        GatewayCommand::resume(&inner.credentials)
    } else {
        GatewayCommand::identify(&inner.credentials)
    };
    write.send(Message::Text(hello.to_json().into())).await?;
    if !resume {
        inner.set_state(ConnectionState::AwaitingReady);
    }

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Cancelled);
            }

            Some(command) = outbound.recv() => {
                trace!(op = command.opcode(), "signaling payload sent");
                write.send(Message::Text(command.to_json().into())).await?;
            }

            message = read.next() => match message {
                None => return Ok(SessionEnd::Closed(None)),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    inner.handle_text(text.as_str(), &session_cancel).await?;
                    if *inner.state.borrow() == ConnectionState::Ready {
                        *established = true;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    return Ok(SessionEnd::Closed(code));
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::FakeCodec;

    fn credentials(endpoint: &str) -> VoiceCredentials {
        // ---
        VoiceCredentials {
            guild_id: 1,
            user_id: 2,
            session_id: "session".into(),
            token: "token".into(),
            endpoint: endpoint.into(),
        }
    }

    fn connection(endpoint: &str, config: VoiceConfig) -> VoiceConnection {
        // ---
        VoiceConnection::builder(credentials(endpoint))
            .config(config)
            .codec(Arc::new(FakeCodec::default()))
            .build()
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        // ---
        let conn = connection("127.0.0.1:9", VoiceConfig::default());
        let closed = Arc::new(AtomicU64::new(0));
        let c = closed.clone();
        conn.events().connection_closed.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        conn.disconnect().await;
        conn.disconnect().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(conn.connect().await, Err(VoiceError::Disposed)));
        assert!(matches!(
            conn.enqueue(RawVoicePacket::silence(&FakeCodec::default().audio_format())).await,
            Err(VoiceError::Disposed)
        ));
        assert!(conn.transmit_sink(None).is_err());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_fails_fast() {
        // ---
        let conn = connection("host:notaport", VoiceConfig::default());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, VoiceError::InvalidArgument(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        // ---
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let mut config = VoiceConfig {
            use_tls: false,
            ..VoiceConfig::default()
        };
        config.reconnect.initial_delay = Duration::from_millis(5);
        config.reconnect.max_attempts = Some(2);

        let conn = connection(&format!("127.0.0.1:{port}"), config);
        let errors = Arc::new(AtomicU64::new(0));
        let e = errors.clone();
        conn.events().socket_error.add(move |ev| {
            assert!(ev.recoverable);
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = tokio::time::timeout(Duration::from_secs(5), conn.connect())
            .await
            .expect("gives up in time")
            .unwrap_err();
        assert!(matches!(err, VoiceError::RetriesExhausted(2)));
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        // ---
        let conn = connection("127.0.0.1:9", VoiceConfig::default());
        *conn.inner.outbound_rx.lock() = None;
        assert!(matches!(conn.connect().await, Err(VoiceError::InvalidArgument(_))));
    }

    #[test]
    fn test_send_speaking_requires_ready() {
        // ---
        let conn = connection("127.0.0.1:9", VoiceConfig::default());
        assert!(matches!(conn.send_speaking(true), Err(VoiceError::NotInitialized)));
        assert_eq!(conn.ws_ping(), 0);
        assert_eq!(conn.udp_ping(), 0);
        assert_eq!(conn.ssrc(), None);
    }

    #[test]
    fn test_stale_speaking_update_is_sent_again() {
        // ---
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = SpeakingSignal::new(tx);
        signal.set_ssrc(5);
        assert!(signal.set(true));

        assert_eq!(drain_stale_commands(&mut rx, &signal), 1);
        assert!(!signal.is_speaking());

        assert!(signal.set(true));
        assert!(matches!(
            rx.try_recv(),
            Ok(GatewayCommand::Speaking { speaking: true, ssrc: 5 })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_no_senders_or_key() {
        // ---
        let conn = connection("127.0.0.1:9", VoiceConfig::default());
        conn.inner.senders.attach_user(9, UserIdentity::new(77)).unwrap();
        assert_eq!(conn.sender_count(), 1);

        conn.disconnect().await;
        assert_eq!(conn.sender_count(), 0);
        assert!(conn.inner.crypto.read().is_none());
    }
}
