
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dtls::crypto::Certificate;
use ice::agent::Agent;
use ice::candidate::candidate_base::unmarshal_candidate;
use ice::candidate::Candidate;
use ice::state::ConnectionState;
use log::{debug, info, trace, warn};
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Notify};
use util::{Conn, Marshal};

use crate::config::GatewayConfig;
use crate::data_channel::DataTransport;
use crate::dtls_srtp::{certificate_fingerprint, DtlsRole, DtlsSrtp};
use crate::error::{Error, Result};
use crate::ice_agent::{self, ICE_FAILED_GRACE};
use crate::mux::endpoint::Endpoint;
use crate::mux::mux_func::{is_rtcp, match_dtls, match_srtp_or_srtcp};
use crate::mux::Mux;
use crate::plugin::{Plugin, PluginSession};
use crate::rtp_engine::{self, parse_rtp_stream_id, parse_transport_wide_seq};
use crate::sdp_utils::{self, Jsep, LocalSdpOptions};
use crate::session::SessionEvent;
use crate::stream::{SsrcClass, Stream};
use crate::trickle::{PendingTrickle, TrickleCandidate};
use crate::RECEIVE_MTU;

/// WebRTC-related lifecycle flags of a handle.
pub mod flags {
    pub const PROCESSING_OFFER: u32 = 1 << 0;
    pub const START: u32 = 1 << 1;
    pub const READY: u32 = 1 << 2;
    pub const STOP: u32 = 1 << 3;
    pub const ALERT: u32 = 1 << 4;
    pub const TRICKLE: u32 = 1 << 7;
    pub const ALL_TRICKLES: u32 = 1 << 8;
    pub const TRICKLE_SYNCED: u32 = 1 << 9;
    pub const DATA_CHANNELS: u32 = 1 << 10;
    pub const CLEANING: u32 = 1 << 11;
    pub const HAS_AUDIO: u32 = 1 << 12;
    pub const HAS_VIDEO: u32 = 1 << 13;
    pub const GOT_OFFER: u32 = 1 << 14;
    pub const GOT_ANSWER: u32 = 1 << 15;
    pub const HAS_AGENT: u32 = 1 << 16;
    pub const ICE_RESTART: u32 = 1 << 17;
    pub const RESEND_TRICKLES: u32 = 1 << 18;
    pub const RFC4588_RTX: u32 = 1 << 19;
}

/// Atomic flag bitmap; lifecycle progress is test-and-set so every
/// transition happens exactly once.
pub struct WebrtcFlags(AtomicU32);

impl WebrtcFlags {
    fn new() -> Self {
        WebrtcFlags(AtomicU32::new(0))
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.0.load(Ordering::SeqCst) & flag != 0
    }

    pub fn set(&self, flag: u32) {
        self.0.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear(&self, flag: u32) {
        self.0.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Sets the flag, returning true when this call made the transition.
    pub fn try_set(&self, flag: u32) -> bool {
        self.0.fetch_or(flag, Ordering::SeqCst) & flag == 0
    }
}

/// How long a missing sequence must stay missing before it is NACKed.
const NACK_HOLD: Duration = Duration::from_millis(40);
/// After this, a missing sequence is abandoned.
const NACK_GIVE_UP: Duration = Duration::from_secs(1);
/// A NACKed sequence is retransmitted at most once per this interval.
const RETRANSMIT_MIN_INTERVAL: Duration = Duration::from_millis(200);
/// Buffered outgoing packets older than this no longer answer NACKs.
const RETRANSMIT_MAX_AGE: Duration = Duration::from_secs(1);
/// Spacing of transport-wide CC feedback.
const TWCC_FEEDBACK_INTERVAL: Duration = Duration::from_millis(100);
/// Outbound queue bound; the oldest packet is evicted on overflow.
const MAX_QUEUED_PACKETS: usize = 1024;

enum QueuedPacket {
    Rtp {
        video: bool,
        packet: rtp::packet::Packet,
        retransmit: bool,
    },
    Rtcp {
        data: Bytes,
    },
    Data {
        data: Bytes,
    },
    Hangup,
}

/// Bounded outbound queue feeding the send worker; overflow evicts the
/// oldest packet and is counted, never blocking the producer.
struct SendQueue {
    inner: StdMutex<VecDeque<QueuedPacket>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SendQueue {
    fn new() -> Self {
        SendQueue {
            inner: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, packet: QueuedPacket) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= MAX_QUEUED_PACKETS {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(packet);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> QueuedPacket {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.inner.lock().unwrap().pop_front() {
                return packet;
            }
            notified.await;
        }
    }
}

/// One PeerConnection: the binding of a signaling session, an ICE agent,
/// a DTLS-SRTP transport and an attached plugin, plus the send queue and
/// every per-peer state machine in between.
pub struct Handle {
    pub handle_id: u64,
    pub session_id: u64,
    pub opaque_id: Option<String>,
    pub created: Instant,
    flags: WebrtcFlags,
    config: Arc<GatewayConfig>,
    certificate: Certificate,

    plugin: StdMutex<Option<Arc<dyn Plugin>>>,
    plugin_session: StdMutex<Option<Arc<PluginSession>>>,

    stream: StdMutex<Option<Stream>>,
    agent: StdMutex<Option<Arc<Agent>>>,
    /// Written once per negotiation, read on every packet.
    transport: ArcSwapOption<DtlsSrtp>,
    media_endpoint: ArcSwapOption<Endpoint>,
    mux: tokio::sync::Mutex<Option<Mux>>,
    data_transport: StdMutex<Option<Arc<DataTransport>>>,

    local_sdp: StdMutex<Option<String>>,
    remote_sdp: StdMutex<Option<String>>,
    hangup_reason: StdMutex<Option<String>>,
    pending_trickles: StdMutex<Vec<PendingTrickle>>,
    gathering_done: StdMutex<Option<watch::Receiver<bool>>>,

    queued_packets: SendQueue,
    send_worker_started: AtomicBool,
    setup_media_fired: AtomicBool,
    hangup_media_fired: AtomicBool,
    controlling: AtomicBool,
    connect_cancel: StdMutex<Option<tokio::sync::mpsc::Sender<()>>>,
    srtp_soft_errors: AtomicU32,
    media_notified: [AtomicBool; 2],
    last_twcc_flush: StdMutex<Option<Instant>>,

    event_tx: UnboundedSender<SessionEvent>,
}

impl Handle {
    pub fn new(
        handle_id: u64,
        session_id: u64,
        opaque_id: Option<String>,
        config: Arc<GatewayConfig>,
        certificate: Certificate,
        event_tx: UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Handle {
            handle_id,
            session_id,
            opaque_id,
            created: Instant::now(),
            flags: WebrtcFlags::new(),
            config,
            certificate,
            plugin: StdMutex::new(None),
            plugin_session: StdMutex::new(None),
            stream: StdMutex::new(None),
            agent: StdMutex::new(None),
            transport: ArcSwapOption::empty(),
            media_endpoint: ArcSwapOption::empty(),
            mux: tokio::sync::Mutex::new(None),
            data_transport: StdMutex::new(None),
            local_sdp: StdMutex::new(None),
            remote_sdp: StdMutex::new(None),
            hangup_reason: StdMutex::new(None),
            pending_trickles: StdMutex::new(vec![]),
            gathering_done: StdMutex::new(None),
            queued_packets: SendQueue::new(),
            send_worker_started: AtomicBool::new(false),
            setup_media_fired: AtomicBool::new(false),
            hangup_media_fired: AtomicBool::new(false),
            controlling: AtomicBool::new(false),
            connect_cancel: StdMutex::new(None),
            srtp_soft_errors: AtomicU32::new(0),
            media_notified: [AtomicBool::new(false), AtomicBool::new(false)],
            last_twcc_flush: StdMutex::new(None),
            event_tx,
        })
    }

    pub fn flags(&self) -> &WebrtcFlags {
        &self.flags
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.is_set(flags::STOP) || self.flags.is_set(flags::CLEANING)
    }

    pub fn hangup_reason(&self) -> Option<String> {
        self.hangup_reason.lock().unwrap().clone()
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.local_sdp.lock().unwrap().clone()
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote_sdp.lock().unwrap().clone()
    }

    pub fn plugin_package(&self) -> Option<String> {
        self.plugin
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.package().to_owned())
    }

    pub fn plugin(&self) -> Option<Arc<dyn Plugin>> {
        self.plugin.lock().unwrap().clone()
    }

    pub fn plugin_session(&self) -> Option<Arc<PluginSession>> {
        self.plugin_session.lock().unwrap().clone()
    }

    pub(crate) fn queue_event(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Binds a plugin to this handle; fails when one is already there.
    pub async fn attach(self: &Arc<Self>, plugin: Arc<dyn Plugin>) -> Result<()> {
        {
            let mut slot = self.plugin.lock().unwrap();
            if slot.is_some() {
                return Err(Error::ErrPluginAttached);
            }
            *slot = Some(Arc::clone(&plugin));
        }
        let session = PluginSession::new(self.handle_id, Arc::downgrade(self));
        plugin.create_session(&session).await?;
        *self.plugin_session.lock().unwrap() = Some(session);
        info!(
            "[{}] attached plugin {}",
            self.handle_id,
            plugin.package()
        );
        Ok(())
    }

    /// Initializes the ICE agent (controlling iff we offer), creates the
    /// stream/component pair, starts gathering and spawns the send
    /// worker exactly once.
    pub async fn setup_local(
        self: &Arc<Self>,
        offer: bool,
        audio: bool,
        video: bool,
        data: bool,
        trickle: bool,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ErrWebrtcStopped);
        }
        if !self.flags.try_set(flags::HAS_AGENT) {
            return Ok(());
        }

        if audio {
            self.flags.set(flags::HAS_AUDIO);
        }
        if video {
            self.flags.set(flags::HAS_VIDEO);
        }
        if data {
            self.flags.set(flags::DATA_CHANNELS);
        }
        if trickle || self.config.full_trickle {
            self.flags.set(flags::TRICKLE);
        }
        self.controlling.store(offer, Ordering::SeqCst);

        {
            let mut stream = self.stream.lock().unwrap();
            if stream.is_none() {
                let mut s = Stream::new(self.config.max_nack_queue);
                if offer {
                    // Until the peer answers we assume both directions.
                    s.audio_send = audio;
                    s.audio_recv = audio;
                    s.video_send = video;
                    s.video_recv = video;
                }
                *stream = Some(s);
            }
        }

        let agent = ice_agent::create_agent(&self.config, offer).await?;
        self.install_agent_callbacks(&agent);
        agent.gather_candidates()?;
        *self.agent.lock().unwrap() = Some(agent);

        if self
            .send_worker_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let handle = Arc::clone(self);
            tokio::spawn(async move {
                handle.send_worker().await;
            });
        }

        debug!(
            "[{}] local setup: offer={offer} audio={audio} video={video} data={data} trickle={trickle}",
            self.handle_id
        );
        Ok(())
    }

    fn install_agent_callbacks(self: &Arc<Self>, agent: &Arc<Agent>) {
        let (done_tx, done_rx) = watch::channel(false);
        *self.gathering_done.lock().unwrap() = Some(done_rx);
        let done_tx = Arc::new(done_tx);

        let handle = Arc::downgrade(self);
        agent.on_candidate(Box::new(move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
            let handle = handle.clone();
            let done_tx = Arc::clone(&done_tx);
            Box::pin(async move {
                let Some(handle) = handle.upgrade() else {
                    return;
                };
                match candidate {
                    Some(candidate) => {
                        let line = candidate.marshal();
                        {
                            let mut stream = handle.stream.lock().unwrap();
                            if let Some(stream) = stream.as_mut() {
                                stream.component.local_candidates.push(line.clone());
                            }
                        }
                        if handle.flags.is_set(flags::TRICKLE)
                            && handle.local_sdp.lock().unwrap().is_some()
                        {
                            handle.queue_event(SessionEvent::Trickle {
                                handle_id: handle.handle_id,
                                candidate: serde_json::json!({
                                    "candidate": format!("candidate:{line}"),
                                    "sdpMid": "0",
                                    "sdpMLineIndex": 0,
                                }),
                            });
                        }
                    }
                    None => {
                        trace!("[{}] candidate gathering done", handle.handle_id);
                        let _ = done_tx.send(true);
                        if handle.flags.is_set(flags::TRICKLE) {
                            handle.queue_event(SessionEvent::Trickle {
                                handle_id: handle.handle_id,
                                candidate: serde_json::json!({ "completed": true }),
                            });
                        }
                    }
                }
            })
        }));

        let handle = Arc::downgrade(self);
        agent.on_connection_state_change(Box::new(move |state: ConnectionState| {
            let handle = handle.clone();
            Box::pin(async move {
                let Some(handle) = handle.upgrade() else {
                    return;
                };
                debug!("[{}] ICE state: {state}", handle.handle_id);
                let mut stream = handle.stream.lock().unwrap();
                if let Some(stream) = stream.as_mut() {
                    stream.component.state = state;
                    match state {
                        ConnectionState::Connected => {
                            stream.component.connected_at = Some(Instant::now());
                            stream.component.failed_detected = None;
                        }
                        ConnectionState::Failed => {
                            stream
                                .component
                                .failed_detected
                                .get_or_insert_with(Instant::now);
                        }
                        _ => {}
                    }
                }
            })
        }));

        let handle = Arc::downgrade(self);
        agent.on_selected_candidate_pair_change(Box::new(move |local, remote| {
            let pair = format!("{} <-> {}", local.marshal(), remote.marshal());
            let handle = handle.clone();
            Box::pin(async move {
                let Some(handle) = handle.upgrade() else {
                    return;
                };
                info!("[{}] selected pair: {pair}", handle.handle_id);
                let mut stream = handle.stream.lock().unwrap();
                if let Some(stream) = stream.as_mut() {
                    stream.component.selected_pair = Some(pair);
                }
            })
        }));
    }

    /// Applies a remote JSEP coming from the peer.
    pub async fn apply_remote_jsep(self: &Arc<Self>, jsep: &Jsep) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ErrWebrtcStopped);
        }
        let is_offer = jsep.is_offer();
        if is_offer {
            self.flags.set(flags::PROCESSING_OFFER);
        }

        if !self.flags.is_set(flags::HAS_AGENT) {
            // The peer talks first: we are the controlled side.
            let (audio, video, data) = media_kinds_of(&jsep.sdp);
            self.setup_local(false, audio, video, data, jsep.trickle.unwrap_or(false))
                .await?;
        }

        let remote = {
            let mut guard = self.stream.lock().unwrap();
            let stream = guard.as_mut().ok_or(Error::ErrNoAgent)?;
            sdp_utils::apply_remote_sdp(stream, &jsep.sdp)?
        };
        *self.remote_sdp.lock().unwrap() = Some(jsep.sdp.clone());

        if remote.trickle || jsep.trickle.unwrap_or(false) {
            self.flags.set(flags::TRICKLE);
        }
        if self.config.rfc4588_enabled {
            let has_rtx = {
                let guard = self.stream.lock().unwrap();
                guard
                    .as_ref()
                    .map(|s| s.video_rtx_payload_type.is_some())
                    .unwrap_or(false)
            };
            if has_rtx {
                self.flags.set(flags::RFC4588_RTX);
            }
        }
        if is_offer {
            self.flags.set(flags::GOT_OFFER);
            self.flags.clear(flags::PROCESSING_OFFER);
        } else {
            self.flags.set(flags::GOT_ANSWER);
        }

        self.drain_pending_trickles().await;
        self.maybe_start_webrtc();
        Ok(())
    }

    /// Runs a plugin-supplied JSEP through the gateway: the SDP is
    /// compiled from the negotiated stream state with our ICE/DTLS
    /// parameters, and the finished JSEP is returned for the peer.
    pub async fn process_plugin_jsep(self: &Arc<Self>, mut jsep: Jsep) -> Result<Jsep> {
        if self.is_stopped() {
            return Err(Error::ErrWebrtcStopped);
        }
        if jsep.restart == Some(true) {
            self.restart_ice().await?;
        }
        let is_offer = jsep.is_offer();
        let renegotiation = self.local_sdp.lock().unwrap().is_some();

        if !self.flags.is_set(flags::HAS_AGENT) {
            let (audio, video, data) = media_kinds_of(&jsep.sdp);
            self.setup_local(is_offer, audio, video, data, jsep.trickle.unwrap_or(true))
                .await?;
        }

        let agent = self.agent().ok_or(Error::ErrNoAgent)?;
        let (ufrag, pwd) = agent.get_local_user_credentials().await;
        let trickle = self.flags.is_set(flags::TRICKLE);

        let candidates = if trickle {
            vec![]
        } else {
            self.wait_gathering_done().await;
            let guard = self.stream.lock().unwrap();
            guard
                .as_ref()
                .map(|s| s.component.local_candidates.clone())
                .unwrap_or_default()
        };

        let sdp = {
            let guard = self.stream.lock().unwrap();
            let stream = guard.as_ref().ok_or(Error::ErrNoAgent)?;
            let setup = if is_offer {
                DtlsRole::ActPass.setup_attribute()
            } else {
                stream.dtls_role.setup_attribute()
            };
            sdp_utils::generate_local_sdp(
                stream,
                &LocalSdpOptions {
                    is_offer,
                    audio: self.flags.is_set(flags::HAS_AUDIO),
                    video: self.flags.is_set(flags::HAS_VIDEO),
                    data: self.flags.is_set(flags::DATA_CHANNELS),
                    ufrag,
                    pwd,
                    fingerprint: certificate_fingerprint(&self.certificate),
                    setup,
                    candidates,
                    trickle,
                    rfc4588: self.flags.is_set(flags::RFC4588_RTX),
                },
            )
        };

        *self.local_sdp.lock().unwrap() = Some(sdp.clone());
        if is_offer {
            self.flags.set(flags::GOT_OFFER);
        } else {
            self.flags.set(flags::GOT_ANSWER);
        }

        jsep.sdp = sdp;
        jsep.trickle = Some(trickle);
        if renegotiation {
            jsep.update = Some(true);
        }
        if self.flags.is_set(flags::RESEND_TRICKLES) {
            self.resend_trickles();
        }

        self.maybe_start_webrtc();
        Ok(jsep)
    }

    async fn wait_gathering_done(&self) {
        let rx = self.gathering_done.lock().unwrap().clone();
        if let Some(mut rx) = rx {
            let _ = tokio::time::timeout(Duration::from_secs(3), async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    /// Feeds a trickled candidate to ICE, or buffers it until the
    /// offer/answer is in place.
    pub async fn add_trickle(
        self: &Arc<Self>,
        transaction: Option<String>,
        candidate: TrickleCandidate,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ErrWebrtcStopped);
        }
        if self.flags.is_set(flags::ALL_TRICKLES) {
            // `completed` was authoritative; late candidates are dropped.
            debug!("[{}] candidate after end-of-candidates, ignored", self.handle_id);
            return Ok(());
        }
        if candidate.is_completed() {
            self.flags.set(flags::ALL_TRICKLES);
            if self.flags.is_set(flags::GOT_OFFER) {
                self.flags.set(flags::TRICKLE_SYNCED);
            }
            return Ok(());
        }

        if !self.flags.is_set(flags::GOT_OFFER) {
            self.pending_trickles
                .lock()
                .unwrap()
                .push(PendingTrickle::new(transaction, candidate));
            return Ok(());
        }
        self.feed_trickle(&candidate)
    }

    fn feed_trickle(&self, candidate: &TrickleCandidate) -> Result<()> {
        let Some(line) = candidate.candidate_line() else {
            return Ok(());
        };
        let agent = self.agent().ok_or(Error::ErrNoAgent)?;
        let parsed = unmarshal_candidate(line)?;
        let parsed: Arc<dyn Candidate + Send + Sync> = Arc::new(parsed);
        agent.add_remote_candidate(&parsed)?;
        {
            let mut guard = self.stream.lock().unwrap();
            if let Some(stream) = guard.as_mut() {
                stream.component.remote_candidates.push(line.to_owned());
            }
        }
        trace!("[{}] added remote candidate {line}", self.handle_id);
        Ok(())
    }

    /// Drains candidates buffered before the remote description, in
    /// arrival order; runs at most once per negotiation.
    async fn drain_pending_trickles(self: &Arc<Self>) {
        let pending: Vec<PendingTrickle> =
            self.pending_trickles.lock().unwrap().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        debug!(
            "[{}] draining {} pending trickle candidates",
            self.handle_id,
            pending.len()
        );
        for trickle in pending {
            if trickle.candidate.is_completed() {
                self.flags.set(flags::ALL_TRICKLES);
                continue;
            }
            if let Err(err) = self.feed_trickle(&trickle.candidate) {
                warn!("[{}] bad buffered candidate: {err}", self.handle_id);
            }
        }
    }

    /// ICE restart: new local credentials and a fresh gathering round;
    /// the DTLS-SRTP session survives unless the peer re-keys.
    pub async fn restart_ice(self: &Arc<Self>) -> Result<()> {
        let agent = self.agent().ok_or(Error::ErrNoAgent)?;
        self.flags.set(flags::ICE_RESTART);
        self.flags.set(flags::RESEND_TRICKLES);
        self.flags.clear(flags::ALL_TRICKLES);
        self.flags.clear(flags::TRICKLE_SYNCED);
        {
            let mut guard = self.stream.lock().unwrap();
            if let Some(stream) = guard.as_mut() {
                stream.component.local_candidates.clear();
            }
        }
        agent.restart(String::new(), String::new()).await?;
        agent.gather_candidates()?;
        info!("[{}] ICE restart", self.handle_id);
        Ok(())
    }

    /// Re-announces all gathered candidates, e.g. after an ICE restart.
    pub fn resend_trickles(&self) {
        if !self.flags.is_set(flags::TRICKLE) {
            return;
        }
        self.flags.clear(flags::RESEND_TRICKLES);
        let candidates = {
            let guard = self.stream.lock().unwrap();
            guard
                .as_ref()
                .map(|s| s.component.local_candidates.clone())
                .unwrap_or_default()
        };
        for line in candidates {
            self.queue_event(SessionEvent::Trickle {
                handle_id: self.handle_id,
                candidate: serde_json::json!({
                    "candidate": format!("candidate:{line}"),
                    "sdpMid": "0",
                    "sdpMLineIndex": 0,
                }),
            });
        }
    }

    fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.lock().unwrap().clone()
    }

    fn transport(&self) -> Option<Arc<DtlsSrtp>> {
        self.transport.load_full()
    }

    fn maybe_start_webrtc(self: &Arc<Self>) {
        if !(self.flags.is_set(flags::GOT_OFFER) && self.flags.is_set(flags::GOT_ANSWER)) {
            return;
        }
        if !self.flags.try_set(flags::START) {
            return;
        }
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = handle.start_webrtc().await {
                warn!("[{}] WebRTC setup failed: {err}", handle.handle_id);
                let reason = match err {
                    Error::ErrDtlsFingerprint => "DTLS fingerprint",
                    Error::Ice(_) => "ICE failed",
                    _ => "DTLS error",
                };
                handle.hangup(reason).await;
            }
        });
    }

    /// Connectivity checks, mux setup, DTLS-SRTP handshake, optional
    /// data channels; ends with the handle ready and the plugin's
    /// `setup_media` fired.
    async fn start_webrtc(self: &Arc<Self>) -> Result<()> {
        let agent = self.agent().ok_or(Error::ErrNoAgent)?;
        let (ruser, rpass, role, hashing, fingerprint) = {
            let guard = self.stream.lock().unwrap();
            let stream = guard.as_ref().ok_or(Error::ErrNoAgent)?;
            (
                stream.ruser.clone().ok_or_else(|| {
                    Error::ErrSdpParse("missing remote ufrag".to_owned())
                })?,
                stream.rpass.clone().ok_or_else(|| {
                    Error::ErrSdpParse("missing remote pwd".to_owned())
                })?,
                stream.dtls_role,
                stream.remote_hashing.clone().unwrap_or_else(|| "sha-256".to_owned()),
                stream
                    .remote_fingerprint
                    .clone()
                    .ok_or_else(|| Error::ErrSdpParse("missing fingerprint".to_owned()))?,
            )
        };

        // The sender side stays on the handle so dropping it (teardown)
        // cancels a connect still in flight.
        let (cancel_tx, cancel_rx) = tokio::sync::mpsc::channel(1);
        *self.connect_cancel.lock().unwrap() = Some(cancel_tx);
        let conn: Arc<dyn Conn + Send + Sync> =
            if self.controlling.load(Ordering::SeqCst) {
                agent.dial(cancel_rx, ruser, rpass).await?
            } else {
                agent.accept(cancel_rx, ruser, rpass).await?
            };

        let mut mux = Mux::new(conn);
        let dtls_endpoint = mux.new_endpoint(Box::new(match_dtls)).await;
        let media_endpoint = mux.new_endpoint(Box::new(match_srtp_or_srtcp)).await;
        mux.start();
        *self.mux.lock().await = Some(mux);
        self.media_endpoint.store(Some(Arc::clone(&media_endpoint)));

        let role = if role == DtlsRole::ActPass {
            DtlsRole::Client
        } else {
            role
        };
        let transport = Arc::new(
            DtlsSrtp::handshake(
                dtls_endpoint as Arc<dyn Conn + Send + Sync>,
                self.certificate.clone(),
                role,
                &hashing,
                &fingerprint,
            )
            .await?,
        );
        self.transport.store(Some(Arc::clone(&transport)));

        if self.flags.is_set(flags::DATA_CHANNELS) {
            let handle = Arc::clone(self);
            let conn = transport.conn();
            let is_client = role.is_client();
            tokio::spawn(async move {
                match DataTransport::connect(
                    conn,
                    is_client,
                    format!("handle-{}", handle.handle_id),
                )
                .await
                {
                    Ok(data) => {
                        let data = Arc::new(data);
                        *handle.data_transport.lock().unwrap() = Some(Arc::clone(&data));
                        handle.data_loop(data).await;
                    }
                    Err(err) => {
                        debug!("[{}] data channel setup failed: {err}", handle.handle_id)
                    }
                }
            });
        }

        self.flags.set(flags::READY);
        self.queue_event(SessionEvent::WebrtcUp {
            handle_id: self.handle_id,
        });
        if self
            .setup_media_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.setup_media(&session).await;
            }
        }
        info!("[{}] WebRTC media is now flowing", self.handle_id);

        let handle = Arc::clone(self);
        let endpoint = media_endpoint;
        let inbound_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            handle.inbound_loop(endpoint, inbound_transport).await;
        });

        let handle = Arc::clone(self);
        tokio::spawn(async move {
            handle.maintenance_loop().await;
        });

        Ok(())
    }

    /// Tears the PeerConnection down; idempotent, notifies the plugin
    /// and the signaling peer exactly once.
    pub async fn hangup(self: &Arc<Self>, reason: &str) {
        if !self.flags.try_set(flags::ALERT) {
            trace!("[{}] already hanging up", self.handle_id);
            return;
        }
        self.flags.set(flags::STOP);
        {
            let mut slot = self.hangup_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason.to_owned());
            }
        }
        info!("[{}] hanging up: {reason}", self.handle_id);

        self.queued_packets.push(QueuedPacket::Hangup);

        if self
            .hangup_media_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.hangup_media(&session).await;
            }
        }

        self.queue_event(SessionEvent::Hangup {
            handle_id: self.handle_id,
            reason: reason.to_owned(),
        });
    }

    /// Final teardown: closes transports, destroys the agent, frees the
    /// stream and detaches the plugin.
    pub async fn destroy(self: &Arc<Self>) {
        if !self.flags.try_set(flags::CLEANING) {
            return;
        }
        if !self.flags.is_set(flags::ALERT) {
            self.hangup("Detach").await;
        }

        // Cancels a connectivity attempt still in flight.
        self.connect_cancel.lock().unwrap().take();

        let data = self.data_transport.lock().unwrap().take();
        if let Some(data) = data {
            let _ = data.close().await;
        }
        self.media_endpoint.store(None);
        let transport = self.transport.swap(None);
        if let Some(transport) = transport {
            let _ = transport.close().await;
        }
        let mux = self.mux.lock().await.take();
        if let Some(mut mux) = mux {
            mux.close().await;
        }
        let agent = self.agent.lock().unwrap().take();
        if let Some(agent) = agent {
            let _ = agent.close().await;
        }
        {
            let mut stream = self.stream.lock().unwrap();
            if let Some(stream) = stream.as_mut() {
                stream.component.clear_buffers();
            }
            *stream = None;
        }

        let plugin = self.plugin.lock().unwrap().take();
        let session = self.plugin_session.lock().unwrap().take();
        if let (Some(plugin), Some(session)) = (plugin, session) {
            session.stop();
            if let Err(err) = plugin.destroy_session(&session).await {
                warn!("[{}] destroy_session failed: {err}", self.handle_id);
            }
        }
        debug!("[{}] handle freed", self.handle_id);
    }

    // ---- outbound media path --------------------------------------

    /// Queues an RTP packet from the plugin for the peer; the switching
    /// context keeps seq/ts coherent if the plugin swaps sources.
    pub fn relay_rtp(&self, video: bool, buf: &[u8]) {
        if !self.flags.is_set(flags::READY) || self.is_stopped() {
            return;
        }
        let mut packet = match rtp_engine::parse(buf) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("[{}] dropping malformed outbound RTP: {err}", self.handle_id);
                return;
            }
        };
        {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return;
            };
            if video && !stream.video_send {
                return;
            }
            if !video && !stream.audio_send {
                return;
            }
            stream.rtp_ctx.update_header(&mut packet.header, video, 0);
            packet.header.ssrc = if video {
                stream.video_last_ts = packet.header.timestamp;
                stream.video_ssrc
            } else {
                stream.audio_last_ts = packet.header.timestamp;
                stream.audio_ssrc
            };
        }
        self.queued_packets.push(QueuedPacket::Rtp {
            video,
            packet,
            retransmit: false,
        });
    }

    /// Queues an RTCP packet from the plugin, rewriting SSRCs so feedback
    /// refers to the negotiated streams.
    pub fn relay_rtcp(&self, video: bool, buf: &[u8]) {
        if !self.flags.is_set(flags::READY) || self.is_stopped() {
            return;
        }
        let data = {
            let guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_ref() else {
                return;
            };
            match fix_outbound_rtcp(stream, video, buf) {
                Ok(data) => data,
                Err(err) => {
                    trace!("[{}] dropping malformed outbound RTCP: {err}", self.handle_id);
                    return;
                }
            }
        };
        self.queued_packets.push(QueuedPacket::Rtcp { data });
    }

    /// Queues a datachannel message from the plugin.
    pub fn relay_data(&self, buf: &[u8]) {
        if !self.flags.is_set(flags::READY) || self.is_stopped() {
            return;
        }
        self.queued_packets.push(QueuedPacket::Data {
            data: Bytes::copy_from_slice(buf),
        });
    }

    /// Serializes every outbound write: SRTP protect, ICE write, and the
    /// retransmit bookkeeping consulted on inbound NACKs.
    async fn send_worker(self: Arc<Self>) {
        debug!("[{}] send worker up", self.handle_id);
        loop {
            match self.queued_packets.pop().await {
                QueuedPacket::Hangup => break,
                QueuedPacket::Rtp {
                    video,
                    packet,
                    retransmit,
                } => {
                    let (Some(transport), Some(endpoint)) =
                        (self.transport(), self.media_endpoint())
                    else {
                        continue;
                    };
                    let raw = match packet.marshal() {
                        Ok(raw) => raw,
                        Err(err) => {
                            warn!("[{}] RTP marshal failed: {err}", self.handle_id);
                            continue;
                        }
                    };
                    match transport.protect_rtp(&raw).await {
                        Ok(protected) => {
                            if endpoint.send(&protected).await.is_err() {
                                continue;
                            }
                            let now = Instant::now();
                            let mut guard = self.stream.lock().unwrap();
                            if let Some(stream) = guard.as_mut() {
                                if !retransmit {
                                    stream
                                        .component
                                        .retransmit_queue_mut(video)
                                        .push(packet, now);
                                } else {
                                    stream.component.retransmit_recent_cnt += 1;
                                }
                                stream
                                    .component
                                    .out_stats
                                    .info_mut(video, 0)
                                    .add_packet(protected.len(), now);
                            }
                        }
                        Err(err) => {
                            trace!("[{}] SRTP protect failed: {err}", self.handle_id)
                        }
                    }
                }
                QueuedPacket::Rtcp { data } => {
                    let (Some(transport), Some(endpoint)) =
                        (self.transport(), self.media_endpoint())
                    else {
                        continue;
                    };
                    if let Ok(protected) = transport.protect_rtcp(&data).await {
                        let _ = endpoint.send(&protected).await;
                    }
                }
                QueuedPacket::Data { data } => {
                    let data_transport = self.data_transport.lock().unwrap().clone();
                    if let Some(dt) = data_transport {
                        let now = Instant::now();
                        if dt.send(&data).await.is_ok() {
                            let mut guard = self.stream.lock().unwrap();
                            if let Some(stream) = guard.as_mut() {
                                stream.component.out_stats.data.add_packet(data.len(), now);
                            }
                        }
                    }
                }
            }
        }
        debug!("[{}] send worker leaving", self.handle_id);
    }

    fn media_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.media_endpoint.load_full()
    }

    // ---- inbound media path ---------------------------------------

    async fn inbound_loop(self: Arc<Self>, endpoint: Arc<Endpoint>, transport: Arc<DtlsSrtp>) {
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            if self.is_stopped() {
                break;
            }
            let n = match endpoint.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            let data = &buf[..n];
            if is_rtcp(data) {
                match transport.unprotect_rtcp(data).await {
                    Ok(plain) => self.process_rtcp(&plain).await,
                    Err(Error::ErrSrtpUnprotect) => {
                        self.srtp_soft_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.hangup("SRTP unprotect").await;
                        break;
                    }
                }
            } else {
                match transport.unprotect_rtp(data).await {
                    Ok(plain) => self.process_rtp(&plain).await,
                    Err(Error::ErrSrtpUnprotect) => {
                        self.srtp_soft_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.hangup("SRTP unprotect").await;
                        break;
                    }
                }
            }
        }
        debug!("[{}] inbound loop leaving", self.handle_id);
    }

    async fn process_rtp(self: &Arc<Self>, data: &[u8]) {
        let now = Instant::now();
        let mut packet = match rtp_engine::parse(data) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("[{}] dropping malformed RTP: {err}", self.handle_id);
                return;
            }
        };

        let mut slow_link = false;
        let delivery = {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return;
            };

            let mut class = stream.classify_ssrc(packet.header.ssrc);
            if class == SsrcClass::Unknown {
                if let Some(ext_id) = stream.rid_ext_id {
                    if let Some(rid) = parse_rtp_stream_id(&packet.header, ext_id) {
                        if let Some(layer) =
                            stream.learn_ssrc_from_rid(packet.header.ssrc, &rid)
                        {
                            class = SsrcClass::Video(layer);
                        }
                    }
                }
            }

            let (video, layer) = match class {
                SsrcClass::Audio => (false, 0),
                SsrcClass::Video(layer) => (true, layer),
                SsrcClass::VideoRtx(layer) => {
                    // Recover the original packet from the rtx stream.
                    let media_pt = stream.media_payload_type(packet.header.payload_type);
                    let media_ssrc = stream.video_ssrc_peer[layer];
                    let Some(media_pt) = media_pt else {
                        return;
                    };
                    match rtp_engine::rtx_unwrap(&packet, media_pt, media_ssrc) {
                        Ok((recovered, _osn)) => {
                            packet = recovered;
                            (true, layer)
                        }
                        Err(_) => return,
                    }
                }
                SsrcClass::Unknown => {
                    trace!(
                        "[{}] dropping RTP with undeclared SSRC {}",
                        self.handle_id,
                        packet.header.ssrc
                    );
                    return;
                }
            };

            if stream.twcc.enabled && video && stream.twcc.ext_id != 0 {
                if let Some(wide_seq) =
                    parse_transport_wide_seq(&packet.header, stream.twcc.ext_id)
                {
                    stream.twcc.record(wide_seq, now);
                }
            }

            // NACK bookkeeping and generation.
            if stream.component.nacks_enabled(video) {
                let window = stream.component.seq_window_mut(video, layer);
                window.update(packet.header.sequence_number, now);
                let due = window.nacks_due(now, NACK_HOLD, NACK_GIVE_UP);
                if !due.is_empty() {
                    let nack_count = due.len() as u32;
                    let (sender_ssrc, media_ssrc) = if video {
                        (stream.video_ssrc, stream.video_ssrc_peer[layer])
                    } else {
                        (stream.audio_ssrc, stream.audio_ssrc_peer)
                    };
                    if let Some(data) = build_nack(sender_ssrc, media_ssrc, &due) {
                        self.queued_packets.push(QueuedPacket::Rtcp { data });
                        stream.component.nack_sent_recent_cnt += nack_count;
                        stream
                            .component
                            .in_stats
                            .info_mut(video, layer)
                            .add_nacks(nack_count);
                        slow_link = stream.component.slowlink_in[video as usize]
                            .register_nacks(nack_count, now, &self.config.slow_link);
                    }
                }
            }

            // Inbound skew compensation; a negative return means this
            // packet must be dropped to re-align the stream.
            let skew =
                stream
                    .skew_ctx
                    .skew_compensate(&mut packet.header, video, monotonic_us(), &self.config.skew);
            if skew < 0 {
                trace!("[{}] skew drop ({skew})", self.handle_id);
                None
            } else {
                if video {
                    if stream.video_first_ntp[layer].is_none() {
                        stream.video_first_ntp[layer] = Some((now, packet.header.timestamp));
                    }
                } else if stream.audio_first_ntp.is_none() {
                    stream.audio_first_ntp = Some((now, packet.header.timestamp));
                }

                let class_for_ctx = class;
                if let Some(ctx) = stream.rtcp_ctx_mut(class_for_ctx) {
                    ctx.update(
                        packet.header.sequence_number,
                        packet.header.timestamp,
                        data.len(),
                        now,
                        self.created,
                    );
                }
                stream
                    .component
                    .in_stats
                    .info_mut(video, layer)
                    .add_packet(data.len(), now);
                self.media_notified[video as usize].store(false, Ordering::Relaxed);

                match packet.marshal() {
                    Ok(raw) => Some((video, raw)),
                    Err(_) => None,
                }
            }
        };

        if slow_link {
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.slow_link(&session, false, true).await;
            }
            self.queue_event(SessionEvent::SlowLink {
                handle_id: self.handle_id,
                uplink: false,
                video: true,
            });
        }

        if let Some((video, raw)) = delivery {
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.incoming_rtp(&session, video, &raw).await;
            }
        }
    }

    async fn process_rtcp(self: &Arc<Self>, data: &Bytes) {
        let mut buf = &data[..];
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(packets) => packets,
            Err(err) => {
                trace!("[{}] dropping malformed RTCP: {err}", self.handle_id);
                return;
            }
        };

        let mut is_video = false;
        let mut slow_link: Option<bool> = None;
        {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return;
            };
            for pkt in &packets {
                if let Some(nack) = pkt.as_any().downcast_ref::<TransportLayerNack>() {
                    let video = nack.media_ssrc == stream.video_ssrc;
                    let audio = nack.media_ssrc == stream.audio_ssrc;
                    if !video && !audio {
                        continue;
                    }
                    is_video |= video;
                    let mut nack_count = 0u32;
                    let mut resends = vec![];
                    let now = Instant::now();
                    for pair in &nack.nacks {
                        for seq in pair.packet_list() {
                            nack_count += 1;
                            if let Some(packet) = stream
                                .component
                                .retransmit_queue_mut(video)
                                .get_for_retransmit(seq, now, RETRANSMIT_MIN_INTERVAL)
                            {
                                resends.push(packet);
                            }
                        }
                    }
                    let use_rtx = video
                        && self.flags.is_set(flags::RFC4588_RTX)
                        && stream.video_rtx_payload_type.is_some()
                        && stream.video_ssrc_rtx != 0;
                    for packet in resends {
                        let packet = if use_rtx {
                            let rtx_seq = stream.component.next_rtx_seq();
                            rtp_engine::rtx_wrap(
                                &packet,
                                stream.video_ssrc_rtx,
                                stream.video_rtx_payload_type.unwrap_or_default(),
                                rtx_seq,
                            )
                        } else {
                            packet
                        };
                        self.queued_packets.push(QueuedPacket::Rtp {
                            video,
                            packet,
                            retransmit: true,
                        });
                    }
                    if nack_count > 0 {
                        stream
                            .component
                            .out_stats
                            .info_mut(video, 0)
                            .add_nacks(nack_count);
                        if stream.component.slowlink_out[video as usize].register_nacks(
                            nack_count,
                            now,
                            &self.config.slow_link,
                        ) {
                            slow_link = Some(video);
                        }
                    }
                } else {
                    let header = pkt.header();
                    is_video |= header.packet_type
                        == rtcp::header::PacketType::PayloadSpecificFeedback;
                }
            }
        }

        if let Some(video) = slow_link {
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.slow_link(&session, true, video).await;
            }
            self.queue_event(SessionEvent::SlowLink {
                handle_id: self.handle_id,
                uplink: true,
                video,
            });
        }

        if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
            plugin.incoming_rtcp(&session, is_video, data).await;
        }
    }

    async fn data_loop(self: &Arc<Self>, data: Arc<DataTransport>) {
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            if self.is_stopped() {
                break;
            }
            let n = match data.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            {
                let mut guard = self.stream.lock().unwrap();
                if let Some(stream) = guard.as_mut() {
                    stream
                        .component
                        .in_stats
                        .data
                        .add_packet(n, Instant::now());
                }
            }
            if let (Some(plugin), Some(session)) = (self.plugin(), self.plugin_session()) {
                plugin.incoming_data(&session, &buf[..n]).await;
            }
        }
    }

    /// Periodic housekeeping: transport-wide CC feedback, retransmit
    /// buffer aging, the ICE failure grace timer and the no-media timer.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            if self.is_stopped() {
                break;
            }
            let now = Instant::now();

            let mut twcc_feedback = None;
            let mut ice_failed = false;
            let mut no_media: Vec<bool> = vec![];
            {
                let mut guard = self.stream.lock().unwrap();
                if let Some(stream) = guard.as_mut() {
                    // Transport-wide CC feedback, spaced out.
                    if stream.twcc.enabled && stream.twcc.has_pending() {
                        let due = {
                            let last = self.last_twcc_flush.lock().unwrap();
                            last.map(|l| now.saturating_duration_since(l) >= TWCC_FEEDBACK_INTERVAL)
                                .unwrap_or(true)
                        };
                        if due {
                            let sender_ssrc = stream.video_ssrc;
                            let media_ssrc = stream.video_ssrc_peer[0];
                            if let Some(fb) = stream.twcc.build_feedback(sender_ssrc, media_ssrc) {
                                if let Ok(raw) = fb.marshal() {
                                    twcc_feedback = Some(raw);
                                }
                            }
                            *self.last_twcc_flush.lock().unwrap() = Some(now);
                        }
                    }

                    stream
                        .component
                        .audio_retransmit
                        .purge_older_than(now, RETRANSMIT_MAX_AGE);
                    stream
                        .component
                        .video_retransmit
                        .purge_older_than(now, RETRANSMIT_MAX_AGE);

                    if let Some(failed) = stream.component.failed_detected {
                        if now.saturating_duration_since(failed) >= ICE_FAILED_GRACE {
                            ice_failed = true;
                        }
                    }

                    // No-media accounting per kind, inbound.
                    for video in [false, true] {
                        let has_kind = if video {
                            self.flags.is_set(flags::HAS_VIDEO)
                        } else {
                            self.flags.is_set(flags::HAS_AUDIO)
                        };
                        if !has_kind {
                            continue;
                        }
                        let last = if video {
                            stream.component.in_stats.video[0].updated
                        } else {
                            stream.component.in_stats.audio.updated
                        };
                        let quiet = last
                            .map(|l| now.saturating_duration_since(l) >= self.config.no_media_timer)
                            .unwrap_or(false);
                        if quiet
                            && self.media_notified[video as usize]
                                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                        {
                            no_media.push(video);
                        }
                    }
                }
            }

            if let Some(raw) = twcc_feedback {
                self.queued_packets.push(QueuedPacket::Rtcp { data: raw });
            }
            for video in no_media {
                self.queue_event(SessionEvent::Media {
                    handle_id: self.handle_id,
                    video,
                    receiving: false,
                });
            }
            if ice_failed {
                self.hangup("ICE failed").await;
                break;
            }
        }
        debug!("[{}] maintenance loop leaving", self.handle_id);
    }
}

/// Which media kinds an SDP blob mentions; used when a plugin hands us a
/// JSEP before `setup_local` ran.
fn media_kinds_of(sdp: &str) -> (bool, bool, bool) {
    let mut audio = false;
    let mut video = false;
    let mut data = false;
    for line in sdp.lines() {
        if line.starts_with("m=audio") {
            audio = true;
        } else if line.starts_with("m=video") {
            video = true;
        } else if line.starts_with("m=application") {
            data = true;
        }
    }
    if !(audio || video || data) {
        (true, true, false)
    } else {
        (audio, video, data)
    }
}

/// Packs missing sequences into PID/BLP pairs and marshals the compound
/// NACK.
fn build_nack(sender_ssrc: u32, media_ssrc: u32, seqs: &[u16]) -> Option<Bytes> {
    if seqs.is_empty() {
        return None;
    }
    let mut pairs: Vec<NackPair> = vec![];
    for &seq in seqs {
        if let Some(last) = pairs.last_mut() {
            let distance = seq.wrapping_sub(last.packet_id);
            if distance > 0 && distance <= 16 {
                last.lost_packets |= 1 << (distance - 1);
                continue;
            }
        }
        pairs.push(NackPair {
            packet_id: seq,
            lost_packets: 0,
        });
    }
    let nack = TransportLayerNack {
        sender_ssrc,
        media_ssrc,
        nacks: pairs,
    };
    nack.marshal().ok()
}

/// Rewrites plugin-originated RTCP so feedback carries the negotiated
/// SSRCs; unknown packet types pass through untouched.
fn fix_outbound_rtcp(stream: &Stream, video: bool, buf: &[u8]) -> Result<Bytes> {
    use rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
    use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

    let mut reader = buf;
    let packets = rtcp::packet::unmarshal(&mut reader)?;
    let local_ssrc = if video {
        stream.video_ssrc
    } else {
        stream.audio_ssrc
    };
    let peer_ssrc = if video {
        stream.video_ssrc_peer[0]
    } else {
        stream.audio_ssrc_peer
    };

    let mut out: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![];
    for pkt in packets {
        if let Some(pli) = pkt.as_any().downcast_ref::<PictureLossIndication>() {
            out.push(Box::new(PictureLossIndication {
                sender_ssrc: local_ssrc,
                media_ssrc: if pli.media_ssrc != 0 { pli.media_ssrc } else { peer_ssrc },
            }));
        } else if let Some(fir) = pkt.as_any().downcast_ref::<FullIntraRequest>() {
            let mut fir = fir.clone();
            fir.sender_ssrc = local_ssrc;
            if fir.media_ssrc == 0 {
                fir.media_ssrc = peer_ssrc;
            }
            out.push(Box::new(fir));
        } else if let Some(nack) = pkt.as_any().downcast_ref::<TransportLayerNack>() {
            let mut nack = nack.clone();
            nack.sender_ssrc = local_ssrc;
            if nack.media_ssrc == 0 {
                nack.media_ssrc = peer_ssrc;
            }
            out.push(Box::new(nack));
        } else {
            out.push(pkt);
        }
    }
    Ok(rtcp::packet::marshal(&out)?)
}

fn monotonic_us() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_micros() as i64
}
