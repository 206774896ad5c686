//! C6: StreamServer — accepts connections, owns the session set,
//! arbitrates requested configurations, manages the stream epoch, and
//! fans encoded frames and control events out to every session.
//!
//! Grounded on `streaming/session.rs`'s `SessionManager` (`active_sessions`
//! bound) for the session-set shape, and deliberately *diverging* from
//! `gst_webrtc.rs`'s `handle_client` (which starts/stops the whole
//! pipeline on the 0-to-1 client transition): this keeps the encoder
//! warm regardless of session count and only skips the `FrameBus`
//! publish when nobody is watching.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::command_bus::{arbitrate, CommandBus, CommandReceiver, StreamCommand, StreamConfigRequest};
use crate::config::Config;
use crate::controllers::{BitrateController, FpsGovernor, LowPowerIdle};
use crate::encoder::{EncoderCore, EncoderSink};
use crate::error::MuxerError;
use crate::frame_bus::{coalesce, EncodedFrame, FrameBus};
use crate::protocol::StreamStateCode;
use crate::recording::{MuxerFile, RecordingTee};
use crate::session::{self, SessionOwner, ViewerSession};

/// Creates a fresh muxer + backing file each time recording starts.
/// Concrete implementations bind to the platform's container writer and
/// filesystem; tests use an in-memory fake.
pub trait MuxerFactory: Send + Sync {
    fn create(&self) -> Result<(Box<dyn MuxerFile>, std::fs::File, bool, u32), MuxerError>;
}

/// Forwards encoder output to whichever `RecordingTee` is currently
/// installed, or drops it when nothing is recording. This is the fixed
/// sink wired into `EncoderCore` at construction; the `RecordingTee`
/// underneath it is swapped per recording session.
struct RecordingSlot {
    inner: Mutex<Option<Arc<RecordingTee>>>,
}

impl RecordingSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn install(&self, tee: Arc<RecordingTee>) {
        *self.inner.lock() = Some(tee);
    }

    fn take(&self) -> Option<Arc<RecordingTee>> {
        self.inner.lock().take()
    }

    fn is_active(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl EncoderSink for RecordingSlot {
    fn on_codec_config(&self, epoch: u64, sps: Bytes, pps: Bytes) {
        if let Some(tee) = self.inner.lock().clone() {
            tee.on_codec_config(epoch, sps, pps);
        }
    }

    fn on_frame(&self, frame: EncodedFrame) {
        if let Some(tee) = self.inner.lock().clone() {
            tee.on_frame(frame);
        }
    }
}

/// Thin wrapper so `FrameBus::publish` can be gated by `session_count`
/// (load shedding when nobody is watching) while still being one fixed sink.
struct GatedFrameBus {
    bus: FrameBus,
    session_count: Arc<AtomicUsize>,
}

impl EncoderSink for GatedFrameBus {
    fn on_codec_config(&self, _epoch: u64, _sps: Bytes, _pps: Bytes) {}

    fn on_frame(&self, frame: EncodedFrame) {
        if self.session_count.load(Ordering::Relaxed) > 0 {
            self.bus.publish(frame);
        }
    }
}

/// Caches the latest SPS/PPS so late-joining viewers receive it without
/// waiting for the next IDR, and immediately forwards it to every
/// currently streaming-enabled session so viewers connected before the
/// first codec config was produced aren't left without one. One of the
/// fixed sinks wired at construction.
struct CodecConfigSink {
    slot: Arc<Mutex<Option<(u64, Bytes, Bytes)>>>,
    sessions: Arc<RwLock<HashMap<String, Arc<ViewerSession>>>>,
}

impl EncoderSink for CodecConfigSink {
    fn on_codec_config(&self, epoch: u64, sps: Bytes, pps: Bytes) {
        *self.slot.lock() = Some((epoch, sps.clone(), pps.clone()));
        for session in self.sessions.read().values() {
            if session.is_streaming_enabled() && session.current_epoch() == epoch {
                session.send_csd(epoch, sps.clone(), pps.clone());
            }
        }
    }

    fn on_frame(&self, _frame: EncodedFrame) {}
}

struct ResumeCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, (StreamConfigRequest, Instant)>,
}

impl ResumeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn touch(&mut self, id: &str, cfg: StreamConfigRequest) {
        self.entries.insert(id.to_string(), (cfg, Instant::now()));
        self.order.retain(|x| x != id);
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn take(&mut self, id: &str) -> Option<StreamConfigRequest> {
        self.order.retain(|x| x != id);
        self.entries.remove(id).map(|(cfg, _)| cfg)
    }
}

/// Extract the monotonic counter suffix from a `sess-<n>` id for
/// age comparisons; unparsable ids sort last (treated as newest).
fn session_sequence(id: &str) -> u64 {
    id.rsplit('-').next().and_then(|n| n.parse().ok()).unwrap_or(u64::MAX)
}

struct ArbitrationState {
    requested: HashMap<String, StreamConfigRequest>,
    active_actual: Option<StreamConfigRequest>,
}

pub struct StreamServer {
    config: Arc<Config>,
    sessions: Arc<RwLock<HashMap<String, Arc<ViewerSession>>>>,
    session_counter: AtomicU64,
    session_count: Arc<AtomicUsize>,
    epoch: AtomicU64,
    encoder: Arc<EncoderCore>,
    frame_bus: FrameBus,
    recording_slot: Arc<RecordingSlot>,
    muxer_factory: Arc<dyn MuxerFactory>,
    command_bus: CommandBus,
    arbitration: Mutex<ArbitrationState>,
    resume_cache: Mutex<ResumeCache>,
    last_codec_config: Arc<Mutex<Option<(u64, Bytes, Bytes)>>>,
    bitrate_ctl: Mutex<BitrateController>,
    fps_governor: Mutex<FpsGovernor>,
    low_power: Mutex<LowPowerIdle>,
    zoom: Mutex<f32>,
}

impl StreamServer {
    pub fn new(
        config: Arc<Config>,
        backend: Box<dyn crate::encoder::EncoderBackend>,
        muxer_factory: Arc<dyn MuxerFactory>,
    ) -> (Arc<Self>, CommandReceiver) {
        let (command_bus, command_rx) = CommandBus::new();
        let frame_bus = FrameBus::new(config.frame_queue_capacity);
        let session_count = Arc::new(AtomicUsize::new(0));
        let sessions = Arc::new(RwLock::new(HashMap::new()));
        let recording_slot = Arc::new(RecordingSlot::new());
        let gated_bus = Arc::new(GatedFrameBus {
            bus: frame_bus.clone(),
            session_count: session_count.clone(),
        });
        let last_codec_config = Arc::new(Mutex::new(None));
        let codec_config_sink = Arc::new(CodecConfigSink {
            slot: last_codec_config.clone(),
            sessions: sessions.clone(),
        });

        let command_bus_for_recovery = command_bus.clone();
        let on_recovery_needed: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            command_bus_for_recovery.post(StreamCommand::RequestKeyframe);
        });

        let encoder = Arc::new(EncoderCore::new(
            backend,
            vec![gated_bus, recording_slot.clone(), codec_config_sink],
            config.gop(),
            config.stall_watchdog_threshold(),
            config.keyframe_request_min_interval(),
            config.bitrate_change_min_interval(),
            config.keyframe_drought_request_multiple,
            config.keyframe_drought_recovery_multiple,
            on_recovery_needed,
            config.encoder_state_path.clone(),
        ));

        let bitrate_ctl = BitrateController::new(
            config.bitrate_min_bps,
            config.bitrate_max_bps,
            config.bitrate_inc_step_bps,
            config.bitrate_inc_interval(),
            config.bitrate_change_min_interval(),
            config.bitrate_min_bps,
        );

        let server = Arc::new(Self {
            config: config.clone(),
            sessions,
            session_counter: AtomicU64::new(0),
            session_count,
            epoch: AtomicU64::new(0),
            encoder,
            frame_bus,
            recording_slot,
            muxer_factory,
            command_bus,
            arbitration: Mutex::new(ArbitrationState {
                requested: HashMap::new(),
                active_actual: None,
            }),
            resume_cache: Mutex::new(ResumeCache::new(config.resume_cache_capacity)),
            last_codec_config,
            bitrate_ctl: Mutex::new(bitrate_ctl),
            fps_governor: Mutex::new(FpsGovernor::new()),
            low_power: Mutex::new(LowPowerIdle::new()),
            zoom: Mutex::new(1.0),
        });
        (server, command_rx)
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    #[cfg(any(test, feature = "test-mode"))]
    pub fn session_ids_for_test(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Accept loop: binds once, runs for the server's lifetime. Accept
    /// errors back off briefly and retry rather than tearing down the
    /// listener.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    let id = format!("sess-{}", self.session_counter.fetch_add(1, Ordering::SeqCst));
                    info!(session_id = %id, %addr, "accepted connection");
                    let session = session::spawn(socket, self.config.clone(), self.clone(), id.clone());
                    self.sessions.write().insert(id, session);
                    self.session_count.store(self.sessions.read().len(), Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// Sender worker: drains `FrameBus`, coalesces, fans out to every
    /// streaming-enabled session.
    pub async fn sender_loop(self: Arc<Self>) {
        loop {
            let batch = self.frame_bus.poll_with_timeout(Duration::from_millis(500)).await;
            if let Some(frame) = coalesce(batch) {
                let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
                for session in sessions {
                    if session.is_streaming_enabled() {
                        session.send_frame(&frame);
                    }
                }
            }
        }
    }

    /// Control worker: the single consumer of `CommandBus`.
    pub async fn control_loop(self: Arc<Self>, mut rx: CommandReceiver) {
        while let Some(cmd) = rx.recv().await {
            self.handle_command(cmd).await;
        }
    }

    async fn handle_command(&self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::RequestKeyframe => {
                self.encoder.request_keyframe();
            }
            StreamCommand::AdjustBitrate(bps) => {
                let clamped = bps.clamp(self.config.bitrate_min_bps, self.config.bitrate_max_bps);
                self.encoder.adjust_bitrate(clamped);
            }
            StreamCommand::ReconfigureStream(req) => {
                self.encoder.stop().await;
                if let Err(e) = self.encoder.start(req) {
                    warn!(error = %e, "reconfigure failed");
                }
            }
            StreamCommand::StartRecording => {
                if self.recording_slot.is_active() {
                    return;
                }
                match self.muxer_factory.create() {
                    Ok((muxer, file, expect_audio, orientation)) => {
                        let (width, height) = self
                            .arbitration
                            .lock()
                            .active_actual
                            .map(|cfg| (cfg.width, cfg.height))
                            .unwrap_or((0, 0));
                        let tee = Arc::new(RecordingTee::new(muxer, file, expect_audio, orientation, width, height));
                        self.recording_slot.install(tee);
                        self.broadcast_recording_state(true);
                    }
                    Err(e) => warn!(error = %e, "failed to start recording"),
                }
            }
            StreamCommand::StopRecording => {
                if let Some(tee) = self.recording_slot.take() {
                    self.broadcast_recording_state(false);
                    tokio::spawn(async move {
                        tee.stop().await;
                    });
                }
            }
            StreamCommand::SwitchCamera => {
                info!("camera switch requested (delegated to camera collaborator)");
            }
            StreamCommand::Zoom(z) => {
                *self.zoom.lock() = z;
            }
            StreamCommand::Backpressure => {
                let now = Instant::now();
                if let Some(new_bps) = self.bitrate_ctl.lock().on_backpressure(now) {
                    self.encoder.adjust_bitrate(new_bps);
                }
                self.fps_governor.lock().record_backpressure(now);
            }
            StreamCommand::PressureClear => {}
        }
    }

    fn broadcast_recording_state(&self, active: bool) {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.send_recording_state(active);
        }
    }

    /// Periodic governor tick (AIMD additive increase, FPS ladder,
    /// low-power idle). Intended to be driven by a ~2s interval task.
    pub fn governor_tick(&self, ui_visible: bool) {
        let now = Instant::now();
        if let Some(new_bps) = self.bitrate_ctl.lock().tick(now) {
            self.encoder.adjust_bitrate(new_bps);
        }
        let at_min = self.bitrate_ctl.lock().current() <= self.config.bitrate_min_bps;
        self.fps_governor.lock().note_at_min_bitrate(now, at_min);
        // thermal severity is supplied by an out-of-scope sensor
        // collaborator; this design treats it as always-false here and
        // leaves the hook for a real implementation to wire in.
        if let Some(new_fps) = self.fps_governor.lock().tick(now, false) {
            if let Some(actual) = self.arbitration.lock().active_actual {
                self.command_bus.post(StreamCommand::ReconfigureStream(StreamConfigRequest {
                    fps: new_fps,
                    ..actual
                }));
            }
        }

        let recording = self.recording_slot.is_active();
        let sessions = self.session_count();
        let mut low_power = self.low_power.lock();
        if !low_power.is_active() && LowPowerIdle::should_enter(sessions, ui_visible, recording) {
            if let Some(actual) = self.arbitration.lock().active_actual {
                if let Some(clamped) = low_power.enter(actual, self.config.bitrate_min_bps) {
                    drop(low_power);
                    self.command_bus.post(StreamCommand::ReconfigureStream(clamped));
                    return;
                }
            }
        } else if low_power.is_active() && !LowPowerIdle::should_enter(sessions, ui_visible, recording) {
            if let Some(restored) = low_power.exit() {
                drop(low_power);
                self.command_bus.post(StreamCommand::ReconfigureStream(restored));
            }
        }
    }

    fn reconcile_arbitration(&self) {
        let mut arb = self.arbitration.lock();
        let winner = match arbitrate(&arb.requested.values().copied().collect::<Vec<_>>()) {
            Some(w) => w,
            None => return,
        };
        // Substitute the live encoder's actual width/height for the
        // winner's requested ones before comparing against what's
        // already active, so a winner that is logically unchanged but
        // whose requested size the encoder rounded differently doesn't
        // keep re-triggering an epoch bump.
        let actual = match self.encoder.actual_dimensions() {
            Some((width, height)) => StreamConfigRequest { width, height, ..winner },
            None => winner,
        };
        if arb.active_actual == Some(actual) {
            return;
        }
        arb.active_actual = Some(actual);
        let new_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.encoder.set_epoch(new_epoch);
        drop(arb);

        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in &sessions {
            session.set_stream_epoch(new_epoch);
            session.enable_streaming(true);
            session.send_stream_accepted_and_reconfiguring(
                new_epoch,
                winner.width,
                winner.height,
                winner.bitrate_bps,
                winner.fps,
            );
        }
        if let Some((_, sps, pps)) = self.last_codec_config.lock().clone() {
            for session in &sessions {
                session.send_csd(new_epoch, sps.clone(), pps.clone());
            }
        }
        self.command_bus.post(StreamCommand::ReconfigureStream(winner));
        self.command_bus.post(StreamCommand::RequestKeyframe);
    }
}

impl SessionOwner for StreamServer {
    fn password(&self) -> String {
        self.config.password.clone()
    }

    fn on_auth_success(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if sessions.len() > self.config.max_active_sessions {
            // Evict the oldest session that is not the one that just
            // authenticated, to stay within the active-session bound.
            // Session ids are assigned from a
            // monotonic counter (`sess-<n>`), so the numeric suffix -
            // not the lexicographic string order - determines age.
            if let Some(oldest_id) = sessions
                .keys()
                .filter(|id| id.as_str() != session_id)
                .min_by_key(|id| session_sequence(id))
                .cloned()
            {
                if let Some(oldest) = sessions.remove(&oldest_id) {
                    oldest.close();
                }
            }
        }
        self.session_count.store(sessions.len(), Ordering::SeqCst);
    }

    fn on_set_stream(&self, session_id: &str, cfg: StreamConfigRequest) {
        self.arbitration.lock().requested.insert(session_id.to_string(), cfg);
        self.reconcile_arbitration();
    }

    fn on_resume_request(&self, _session_id: &str, prior_id: &str) -> Option<StreamConfigRequest> {
        self.resume_cache.lock().take(prior_id)
    }

    fn on_touch_resume(&self, session_id: &str, cfg: StreamConfigRequest) {
        self.on_set_stream(session_id, cfg);
    }

    fn on_session_closed(&self, session_id: &str) {
        let mut arb = self.arbitration.lock();
        if let Some(cfg) = arb.requested.remove(session_id) {
            self.resume_cache.lock().touch(session_id, cfg);
        }
        drop(arb);
        self.sessions.write().remove(session_id);
        self.session_count.store(self.sessions.read().len(), Ordering::SeqCst);
        self.reconcile_arbitration();
    }

    fn command_bus(&self) -> CommandBus {
        self.command_bus.clone()
    }
}

/// Broadcast a `STREAM_STATE|STOPPED` to every connected session without
/// tearing down the listener — used when the owner stops capture (design
/// end-to-end scenario 6).
pub async fn broadcast_stopped(server: &Arc<StreamServer>) {
    let epoch = server.epoch();
    let sessions: Vec<_> = server.sessions.read().values().cloned().collect();
    for session in sessions {
        session.send_stream_state(StreamStateCode::Stopped, epoch);
    }
}

pub fn encoder_handle(server: &Arc<StreamServer>) -> Arc<EncoderCore> {
    server.encoder.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_bus::StreamConfigRequest;
    use crate::encoder::{ConfigAttempt, EncoderBackend};
    use crate::error::EncoderError;

    struct NoopBackend;
    impl EncoderBackend for NoopBackend {
        fn configure(&mut self, _attempt: ConfigAttempt) -> Result<(), EncoderError> {
            Ok(())
        }
        fn push_raw(&mut self, _data: Bytes, _pts_us: u64) -> Result<(), EncoderError> {
            Ok(())
        }
        fn poll_output(&mut self) -> Option<(Bytes, u64)> {
            None
        }
        fn request_keyframe(&mut self) {}
        fn adjust_bitrate(&mut self, _bps: u32) {}
        fn stop(&mut self) {}
    }

    struct NoopMuxerFactory;
    impl MuxerFactory for NoopMuxerFactory {
        fn create(&self) -> Result<(Box<dyn MuxerFile>, std::fs::File, bool, u32), MuxerError> {
            Err(MuxerError::InvalidState)
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            password: "hunter2".into(),
            ..Config::default()
        })
    }

    #[test]
    fn test_arbitration_bumps_epoch_once_then_idempotent() {
        let (server, _rx) = StreamServer::new(test_config(), Box::new(NoopBackend), Arc::new(NoopMuxerFactory));
        let cfg = StreamConfigRequest {
            width: 720,
            height: 960,
            bitrate_bps: 2_000_000,
            fps: 30,
        };
        server.on_set_stream("sess-0", cfg);
        assert_eq!(server.epoch(), 1);
        server.on_set_stream("sess-0", cfg);
        assert_eq!(server.epoch(), 1, "identical request must not bump epoch again");
    }

    #[test]
    fn test_session_count_tracks_map() {
        let (server, _rx) = StreamServer::new(test_config(), Box::new(NoopBackend), Arc::new(NoopMuxerFactory));
        assert_eq!(server.session_count(), 0);
    }
}
