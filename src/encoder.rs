//! C3: EncoderCore — wraps a single hardware video encoder collaborator
//! and exposes the start/stop/reconfigure/adjust-bitrate/request-keyframe
//! surface used by the rest of the control plane.
//!
//! Grounded on `streaming/pipeline.rs`'s `CameraPipeline` (start/stop/
//! `Drop`, and its bus-watch logging idiom) for the lifecycle shape, and
//! on `webrtc/raii_guards.rs` for the ordered, logged,
//! best-effort cleanup discipline — generalized here into an explicit
//! typestate (`Idle -> Running -> Stopping -> Joined -> Released`) rather
//! than a bare `Arc<Mutex<bool>>`, to close off a stop/start race where a
//! stale `spawn_blocking` drain could resurrect a backend after `stop()`
//! already released it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command_bus::StreamConfigRequest;
use crate::error::EncoderError;
use crate::frame_bus::{EncodedFrame, FrameBus};
use crate::protocol;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const JOINED: u8 = 3;
const RELEASED: u8 = 4;

/// Narrow capability trait every consumer of the encoder's output
/// implements, wired once at construction — replaces the class-based
/// mutable-listener-property pattern the design calls out for redesign.
pub trait EncoderSink: Send + Sync {
    fn on_codec_config(&self, epoch: u64, sps: Bytes, pps: Bytes);
    fn on_frame(&self, frame: EncodedFrame);
}

impl EncoderSink for FrameBus {
    fn on_codec_config(&self, _epoch: u64, _sps: Bytes, _pps: Bytes) {
        // FrameBus only carries frames; codec config is cached and
        // re-sent per session by the server on (re)negotiation.
    }

    fn on_frame(&self, frame: EncodedFrame) {
        self.publish(frame);
    }
}

/// How the backend receives raw input for a given configuration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Encoder reads directly off a shared input surface.
    Surface,
    /// Encoder reads from caller-pushed buffers; a device-fixed size,
    /// used when the surface path is unavailable or has failed before.
    Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Baseline,
    High,
}

/// One concrete configuration `EncoderCore::start` will try against the
/// backend. `width`/`height` of `0` asks the backend to derive the size
/// from the input surface itself.
#[derive(Debug, Clone, Copy)]
pub struct ConfigAttempt {
    pub mode: InputMode,
    pub profile: Profile,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub fps: u32,
}

/// The external hardware/software encoder being wrapped. Real
/// implementations call into vendor codec APIs; tests use
/// `crate::testutil::FakeEncoderBackend`.
pub trait EncoderBackend: Send {
    /// Attempt to configure for one specific attempt. `EncoderCore::start`
    /// walks a strategy-ordered list of attempts and uses the first one
    /// that returns `Ok`.
    fn configure(&mut self, attempt: ConfigAttempt) -> Result<(), EncoderError>;

    /// Feed one raw input frame. Only called while the encoder is in the
    /// `Running` state.
    fn push_raw(&mut self, data: Bytes, pts_us: u64) -> Result<(), EncoderError>;

    /// Non-blocking poll for one encoded access unit (Annex-B) plus its
    /// backend-supplied pts. `None` means "no output ready yet".
    fn poll_output(&mut self) -> Option<(Bytes, u64)>;

    fn request_keyframe(&mut self);

    fn adjust_bitrate(&mut self, bps: u32);

    fn stop(&mut self);
}

/// Raw camera-frame supplier. Push model: the implementation calls
/// `EncoderCore::push_raw` itself as frames arrive rather than being
/// polled, carrying each frame's wall-clock capture time through to
/// `EncodedFrame::capture_epoch_ms`. Camera acquisition itself is an
/// out-of-scope collaborator, so no concrete implementation is wired
/// into the binary — this trait exists so one can be plugged in without
/// touching `EncoderCore`.
pub trait RawFrameSource: Send {
    fn start(&mut self, core: Arc<EncoderCore>);
}

/// 16-pixel-aligned size, the first configuration attempt tried for
/// surface input.
fn align16(v: u32) -> u32 {
    v.div_ceil(16) * 16
}

/// Device-validated buffer-mode clamp size, keyed by requested
/// orientation (landscape when width >= height).
fn buffer_clamp_size(cfg: StreamConfigRequest) -> (u32, u32) {
    if cfg.width >= cfg.height {
        (960, 720)
    } else {
        (720, 960)
    }
}

/// Strategy-ordered configuration attempts: explicit aligned size,
/// standard (unrounded) size, 0x0 surface-derived size, then high
/// profile — all against surface input, in that order — followed by
/// buffer-mode fallbacks. When `force_buffer` is set (a prior start
/// marked surface input bad), surface attempts are skipped entirely.
fn build_attempts(cfg: StreamConfigRequest, force_buffer: bool) -> Vec<ConfigAttempt> {
    let (buf_w, buf_h) = buffer_clamp_size(cfg);
    let buffer_attempts = [
        ConfigAttempt {
            mode: InputMode::Buffer,
            profile: Profile::Baseline,
            width: buf_w,
            height: buf_h,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
        ConfigAttempt {
            mode: InputMode::Buffer,
            profile: Profile::High,
            width: buf_w,
            height: buf_h,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
    ];

    if force_buffer {
        return buffer_attempts.to_vec();
    }

    let aligned_w = align16(cfg.width);
    let aligned_h = align16(cfg.height);
    let mut attempts = vec![
        ConfigAttempt {
            mode: InputMode::Surface,
            profile: Profile::Baseline,
            width: aligned_w,
            height: aligned_h,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
        ConfigAttempt {
            mode: InputMode::Surface,
            profile: Profile::Baseline,
            width: cfg.width,
            height: cfg.height,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
        ConfigAttempt {
            mode: InputMode::Surface,
            profile: Profile::Baseline,
            width: 0,
            height: 0,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
        ConfigAttempt {
            mode: InputMode::Surface,
            profile: Profile::High,
            width: aligned_w,
            height: aligned_h,
            bitrate_bps: cfg.bitrate_bps,
            fps: cfg.fps,
        },
    ];
    attempts.extend(buffer_attempts);
    attempts
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedEncoderState {
    #[serde(default)]
    surface_input_bad: bool,
}

fn load_surface_bad(path: &str) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<PersistedEncoderState>(&s).ok())
        .map(|s| s.surface_input_bad)
        .unwrap_or(false)
}

fn persist_surface_bad(path: &str) {
    let state = PersistedEncoderState { surface_input_bad: true };
    match serde_json::to_string(&state) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!(error = %e, path, "failed to persist surface-input-bad marker");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize surface-input-bad marker"),
    }
}

struct WatchdogConfig {
    gop: Duration,
    stall_threshold: Duration,
    keyframe_request_min_interval: Duration,
    bitrate_change_min_interval: Duration,
    drought_request_multiple: u32,
    drought_recovery_multiple: u32,
}

struct DrainState {
    last_idr: Option<Instant>,
    stall_since: Option<Instant>,
    last_input_count: u64,
    last_output_count: u64,
    last_keyframe_request: Option<Instant>,
    last_bitrate_change: Option<Instant>,
    first_pts: Option<u64>,
    last_emitted_pts: Option<u64>,
    config_emitted: bool,
}

impl DrainState {
    fn new() -> Self {
        Self {
            last_idr: None,
            stall_since: None,
            last_input_count: 0,
            last_output_count: 0,
            last_keyframe_request: None,
            last_bitrate_change: None,
            first_pts: None,
            last_emitted_pts: None,
            config_emitted: false,
        }
    }
}

/// Wraps one [`EncoderBackend`] plus its drain loop and watchdogs.
pub struct EncoderCore {
    backend: Arc<Mutex<Box<dyn EncoderBackend>>>,
    sinks: Vec<Arc<dyn EncoderSink>>,
    state: Arc<AtomicU8>,
    epoch: Arc<AtomicU64>,
    input_count: Arc<AtomicU64>,
    output_count: Arc<AtomicU64>,
    watchdog: Arc<WatchdogConfig>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    on_recovery_needed: Arc<dyn Fn() + Send + Sync>,
    pending_capture: Arc<Mutex<VecDeque<u64>>>,
    actual_width: Arc<AtomicU32>,
    actual_height: Arc<AtomicU32>,
    surface_bad: AtomicBool,
    state_path: String,
}

impl EncoderCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Box<dyn EncoderBackend>,
        sinks: Vec<Arc<dyn EncoderSink>>,
        gop: Duration,
        stall_threshold: Duration,
        keyframe_request_min_interval: Duration,
        bitrate_change_min_interval: Duration,
        drought_request_multiple: u64,
        drought_recovery_multiple: u64,
        on_recovery_needed: Arc<dyn Fn() + Send + Sync>,
        state_path: String,
    ) -> Self {
        let surface_bad = load_surface_bad(&state_path);
        Self {
            backend: Arc::new(Mutex::new(backend)),
            sinks,
            state: Arc::new(AtomicU8::new(IDLE)),
            epoch: Arc::new(AtomicU64::new(0)),
            input_count: Arc::new(AtomicU64::new(0)),
            output_count: Arc::new(AtomicU64::new(0)),
            watchdog: Arc::new(WatchdogConfig {
                gop,
                stall_threshold,
                keyframe_request_min_interval,
                bitrate_change_min_interval,
                drought_request_multiple: drought_request_multiple as u32,
                drought_recovery_multiple: drought_recovery_multiple as u32,
            }),
            drain_handle: Mutex::new(None),
            on_recovery_needed,
            pending_capture: Arc::new(Mutex::new(VecDeque::new())),
            actual_width: Arc::new(AtomicU32::new(0)),
            actual_height: Arc::new(AtomicU32::new(0)),
            surface_bad: AtomicBool::new(surface_bad),
            state_path,
        }
    }

    /// The live encoder's actual width/height, as accepted by whichever
    /// configuration attempt succeeded. `None` before the first
    /// successful `start()`, or when the accepted attempt asked the
    /// backend to derive the size itself (the 0x0 surface-derived
    /// attempt).
    pub fn actual_dimensions(&self) -> Option<(u32, u32)> {
        let w = self.actual_width.load(Ordering::SeqCst);
        let h = self.actual_height.load(Ordering::SeqCst);
        if w == 0 || h == 0 {
            None
        } else {
            Some((w, h))
        }
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Start (or restart) the encoder for `cfg`. Idempotent against being
    /// called from `Idle` or after a prior `stop()` reached `Joined`.
    ///
    /// Walks the strategy-ordered attempt list (aligned size, standard
    /// size, 0x0 surface-derived, high profile, then buffer-mode
    /// fallbacks) and uses the first attempt the backend accepts. If
    /// every surface attempt fails and a buffer-mode attempt succeeds,
    /// marks surface input bad so the next `start()` (including after a
    /// restart) skips straight to buffer mode.
    pub fn start(&self, cfg: StreamConfigRequest) -> Result<(), EncoderError> {
        let prev = self.state.swap(RUNNING, Ordering::SeqCst);
        if prev == RUNNING {
            warn!("start() called while encoder already running");
        }

        let force_buffer = self.surface_bad.load(Ordering::SeqCst);
        let attempts = build_attempts(cfg, force_buffer);
        let mut accepted = None;
        {
            let mut backend = self.backend.lock();
            for attempt in attempts {
                match backend.configure(attempt) {
                    Ok(()) => {
                        accepted = Some(attempt);
                        break;
                    }
                    Err(e) => {
                        debug!(
                            mode = ?attempt.mode,
                            profile = ?attempt.profile,
                            width = attempt.width,
                            height = attempt.height,
                            error = %e,
                            "encoder configuration attempt failed"
                        );
                    }
                }
            }
        }
        let accepted = match accepted {
            Some(a) => a,
            None => {
                self.state.store(IDLE, Ordering::SeqCst);
                return Err(EncoderError::ConfigUnsupported {
                    width: cfg.width,
                    height: cfg.height,
                });
            }
        };

        if !force_buffer && accepted.mode == InputMode::Buffer {
            warn!("every surface-input configuration attempt failed, forcing buffer mode on next start");
            self.surface_bad.store(true, Ordering::SeqCst);
            persist_surface_bad(&self.state_path);
        }

        self.actual_width.store(accepted.width, Ordering::SeqCst);
        self.actual_height.store(accepted.height, Ordering::SeqCst);
        self.pending_capture.lock().clear();
        self.input_count.store(0, Ordering::SeqCst);
        self.output_count.store(0, Ordering::SeqCst);

        let backend = Arc::clone(&self.backend);
        let sinks = self.sinks.clone();
        let state = Arc::clone(&self.state);
        let epoch = Arc::clone(&self.epoch);
        let input_count = Arc::clone(&self.input_count);
        let output_count = Arc::clone(&self.output_count);
        let watchdog = Arc::clone(&self.watchdog);
        let on_recovery_needed = Arc::clone(&self.on_recovery_needed);
        let pending_capture = Arc::clone(&self.pending_capture);

        let handle = tokio::task::spawn_blocking(move || {
            drain_loop(
                backend,
                sinks,
                state,
                epoch,
                input_count,
                output_count,
                watchdog,
                on_recovery_needed,
                pending_capture,
            );
        });
        *self.drain_handle.lock() = Some(handle);
        info!(mode = ?accepted.mode, profile = ?accepted.profile, width = accepted.width, height = accepted.height, "encoder started");
        Ok(())
    }

    /// Feed one raw input frame, carrying its wall-clock capture time so
    /// the matching output frame's `capture_epoch_ms` can be filled in
    /// once it drains out, in push order (no B-frame reordering).
    pub fn push_raw(&self, data: Bytes, capture_epoch_ms: u64, pts_us: u64) -> Result<(), EncoderError> {
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(EncoderError::NotRunning);
        }
        self.backend.lock().push_raw(data, pts_us)?;
        self.pending_capture.lock().push_back(capture_epoch_ms);
        self.input_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn request_keyframe(&self) {
        if self.state.load(Ordering::SeqCst) == RUNNING {
            self.backend.lock().request_keyframe();
        }
    }

    pub fn adjust_bitrate(&self, bps: u32) {
        if self.state.load(Ordering::SeqCst) == RUNNING {
            self.backend.lock().adjust_bitrate(bps);
        }
    }

    /// Stop the encoder: atomically reject new `push_raw` calls, signal
    /// the backend, wait up to ~1s for the drain loop to join, then
    /// release. Safe to call multiple times.
    pub async fn stop(&self) {
        let prev = self.state.swap(STOPPING, Ordering::SeqCst);
        if prev == IDLE || prev == RELEASED {
            self.state.store(RELEASED, Ordering::SeqCst);
            return;
        }
        self.backend.lock().stop();
        let handle = self.drain_handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(_) => debug!("encoder drain loop joined"),
                Err(_) => warn!("encoder drain loop did not join within 1s, forcing release"),
            }
        }
        self.state.store(JOINED, Ordering::SeqCst);
        self.state.store(RELEASED, Ordering::SeqCst);
        info!("encoder released");
    }
}

#[allow(clippy::too_many_arguments)]
fn drain_loop(
    backend: Arc<Mutex<Box<dyn EncoderBackend>>>,
    sinks: Vec<Arc<dyn EncoderSink>>,
    state: Arc<AtomicU8>,
    epoch: Arc<AtomicU64>,
    input_count: Arc<AtomicU64>,
    output_count: Arc<AtomicU64>,
    watchdog: Arc<WatchdogConfig>,
    on_recovery_needed: Arc<dyn Fn() + Send + Sync>,
    pending_capture: Arc<Mutex<VecDeque<u64>>>,
) {
    let mut st = DrainState::new();
    let mut last_tick = Instant::now();
    loop {
        if state.load(Ordering::SeqCst) != RUNNING {
            break;
        }
        let output = backend.lock().poll_output();
        match output {
            Some((unit, raw_pts)) => {
                output_count.fetch_add(1, Ordering::Relaxed);
                st.stall_since = None;
                let is_key = protocol::is_keyframe(&unit);
                if is_key {
                    st.last_idr = Some(Instant::now());
                }
                if !st.config_emitted {
                    let sets = protocol::extract_param_sets(&unit);
                    if sets.len() >= 2 {
                        let sps = Bytes::copy_from_slice(sets[0]);
                        let pps = Bytes::copy_from_slice(sets[1]);
                        let e = epoch.load(Ordering::SeqCst);
                        for sink in &sinks {
                            sink.on_codec_config(e, sps.clone(), pps.clone());
                        }
                        st.config_emitted = true;
                    }
                }
                let normalized = normalize_pts(&mut st, raw_pts);
                let capture_epoch_ms = pending_capture.lock().pop_front().unwrap_or(0);
                let frame = EncodedFrame {
                    data: unit,
                    is_keyframe: is_key,
                    pts_us: normalized,
                    capture_epoch_ms,
                    epoch: epoch.load(Ordering::SeqCst),
                };
                for sink in &sinks {
                    sink.on_frame(frame.clone());
                }
            }
            None => {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        if last_tick.elapsed() >= Duration::from_secs(2) {
            last_tick = Instant::now();
            run_watchdogs(
                &backend,
                &watchdog,
                &mut st,
                &input_count,
                &output_count,
                &on_recovery_needed,
            );
        }
    }
}

/// Normalizes the backend-supplied raw pts so the first emitted frame is
/// `0`, then forces strict monotonicity for anything non-increasing
/// afterward (a backend occasionally repeating or rewinding a pts).
fn normalize_pts(st: &mut DrainState, raw_pts: u64) -> u64 {
    let base = *st.first_pts.get_or_insert(raw_pts);
    let candidate = raw_pts.saturating_sub(base);
    let next = match st.last_emitted_pts {
        Some(prev) if candidate <= prev => prev + 1,
        _ => candidate,
    };
    st.last_emitted_pts = Some(next);
    next
}

fn run_watchdogs(
    backend: &Arc<Mutex<Box<dyn EncoderBackend>>>,
    watchdog: &WatchdogConfig,
    st: &mut DrainState,
    input_count: &Arc<AtomicU64>,
    output_count: &Arc<AtomicU64>,
    on_recovery_needed: &Arc<dyn Fn() + Send + Sync>,
) {
    let now = Instant::now();
    let inputs = input_count.load(Ordering::Relaxed);
    let outputs = output_count.load(Ordering::Relaxed);

    if inputs > 20 && inputs == st.last_input_count && outputs == st.last_output_count {
        let since = *st.stall_since.get_or_insert(now);
        if since.elapsed() > Duration::ZERO {
            backend.lock().request_keyframe();
            if now.duration_since(since) > watchdog.stall_threshold {
                error!("stall watchdog: no progress for >5s, requesting recovery");
                on_recovery_needed();
            }
        }
    } else {
        st.stall_since = None;
    }
    st.last_input_count = inputs;
    st.last_output_count = outputs;

    if let Some(last_idr) = st.last_idr {
        let drought = last_idr.elapsed();
        let request_threshold = watchdog.gop * watchdog.drought_request_multiple;
        let recovery_threshold = watchdog.gop * watchdog.drought_recovery_multiple;
        if drought > recovery_threshold {
            error!(?drought, "keyframe drought watchdog: requesting recovery");
            on_recovery_needed();
        } else if drought > request_threshold {
            warn!(?drought, "keyframe drought watchdog: requesting keyframe");
            backend.lock().request_keyframe();
        }
    } else if st.config_emitted {
        // never produced an IDR at all after config: treat like a fresh
        // drought clock starting now rather than panicking immediately.
        st.last_idr = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        frames: AtomicUsize,
        configs: AtomicUsize,
    }

    impl EncoderSink for CountingSink {
        fn on_codec_config(&self, _epoch: u64, _sps: Bytes, _pps: Bytes) {
            self.configs.fetch_add(1, Ordering::SeqCst);
        }
        fn on_frame(&self, _frame: EncodedFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedBackend {
        outputs: Vec<(Bytes, u64)>,
        accept_mode: Option<InputMode>,
        configured_attempt: Option<ConfigAttempt>,
    }

    impl ScriptedBackend {
        fn new(outputs: Vec<(Bytes, u64)>) -> Self {
            Self {
                outputs,
                accept_mode: None,
                configured_attempt: None,
            }
        }

        /// Only accept attempts in `mode`, rejecting everything else —
        /// used to exercise the strategy fallback in `start()`.
        fn accepting_only(outputs: Vec<(Bytes, u64)>, mode: InputMode) -> Self {
            Self {
                outputs,
                accept_mode: Some(mode),
                configured_attempt: None,
            }
        }
    }

    impl EncoderBackend for ScriptedBackend {
        fn configure(&mut self, attempt: ConfigAttempt) -> Result<(), EncoderError> {
            if let Some(mode) = self.accept_mode {
                if attempt.mode != mode {
                    return Err(EncoderError::ConfigUnsupported {
                        width: attempt.width,
                        height: attempt.height,
                    });
                }
            }
            self.configured_attempt = Some(attempt);
            Ok(())
        }
        fn push_raw(&mut self, _data: Bytes, _pts_us: u64) -> Result<(), EncoderError> {
            Ok(())
        }
        fn poll_output(&mut self) -> Option<(Bytes, u64)> {
            self.outputs.pop()
        }
        fn request_keyframe(&mut self) {}
        fn adjust_bitrate(&mut self, _bps: u32) {}
        fn stop(&mut self) {}
    }

    fn idr_unit() -> Bytes {
        Bytes::from_static(&[0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 1, 0x65, 9])
    }

    fn test_cfg() -> StreamConfigRequest {
        StreamConfigRequest {
            width: 720,
            height: 960,
            bitrate_bps: 2_000_000,
            fps: 30,
        }
    }

    static STATE_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Every test gets its own scratch state-file path so they never
    /// observe each other's persisted "surface-input bad" marker.
    fn test_state_path() -> String {
        let n = STATE_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/camstream-encoder-test-state-{}-{}.json", std::process::id(), n)
    }

    fn new_core(backend: Box<dyn EncoderBackend>, sinks: Vec<Arc<dyn EncoderSink>>) -> EncoderCore {
        EncoderCore::new(
            backend,
            sinks,
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_millis(400),
            Duration::from_secs(2),
            2,
            3,
            Arc::new(|| {}),
            test_state_path(),
        )
    }

    #[tokio::test]
    async fn test_start_emits_config_and_frame() {
        let mut outputs = vec![(idr_unit(), 1000)];
        outputs.reverse();
        let backend = Box::new(ScriptedBackend::new(outputs));
        let sink = Arc::new(CountingSink {
            frames: AtomicUsize::new(0),
            configs: AtomicUsize::new(0),
        });
        let core = new_core(backend, vec![sink.clone()]);
        core.start(test_cfg()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        core.stop().await;

        assert_eq!(sink.configs.load(Ordering::SeqCst), 1);
        assert_eq!(sink.frames.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_raw_rejected_when_not_running() {
        let backend = Box::new(ScriptedBackend::new(vec![]));
        let core = new_core(backend, vec![]);
        let err = core.push_raw(Bytes::from_static(b"x"), 0, 0).unwrap_err();
        assert!(matches!(err, EncoderError::NotRunning));
    }

    #[tokio::test]
    async fn test_double_stop_is_safe() {
        let backend = Box::new(ScriptedBackend::new(vec![]));
        let core = new_core(backend, vec![]);
        core.start(StreamConfigRequest {
            width: 640,
            height: 480,
            bitrate_bps: 500_000,
            fps: 15,
        })
        .unwrap();
        core.stop().await;
        core.stop().await;
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn test_start_falls_back_to_buffer_mode_and_marks_surface_bad() {
        let backend = Box::new(ScriptedBackend::accepting_only(vec![], InputMode::Buffer));
        let state_path = test_state_path();
        let core = EncoderCore::new(
            backend,
            vec![],
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_millis(400),
            Duration::from_secs(2),
            2,
            3,
            Arc::new(|| {}),
            state_path.clone(),
        );
        core.start(test_cfg()).unwrap();
        assert_eq!(core.actual_dimensions(), Some((960, 720)));
        core.stop().await;
        assert!(std::fs::read_to_string(&state_path).unwrap().contains("surface_input_bad"));
        let _ = std::fs::remove_file(&state_path);
    }

    #[test]
    fn test_build_attempts_forces_buffer_only_when_marked_bad() {
        let cfg = test_cfg();
        let normal = build_attempts(cfg, false);
        assert!(normal.iter().any(|a| a.mode == InputMode::Surface));
        assert!(normal.iter().any(|a| a.mode == InputMode::Buffer));

        let forced = build_attempts(cfg, true);
        assert!(forced.iter().all(|a| a.mode == InputMode::Buffer));
    }

    #[test]
    fn test_normalize_pts_starts_at_zero_and_is_monotonic() {
        let mut st = DrainState::new();
        assert_eq!(normalize_pts(&mut st, 5_000), 0);
        assert_eq!(normalize_pts(&mut st, 5_033), 33);
        // a repeated or rewound raw pts must still move strictly forward
        assert_eq!(normalize_pts(&mut st, 5_033), 34);
    }
}
