//! C5: ViewerSession — per-connection protocol state machine covering
//! handshake, authentication, negotiation, streaming, talkback ingest and
//! half-close.
//!
//! Grounded on `streaming/session.rs`'s `WebRTCSession` (lifecycle and
//! ordered `Drop` cleanup) and `streaming/webrtc_streamer.rs`
//! (splitting a connection into an independent reader/writer pair). The
//! heavy WebRTC/SDP machinery those files carry is not needed here — this
//! connection speaks the length-prefixed binary protocol in
//! `protocol.rs` directly — but the split-task, bounded-outbound-queue
//! shape is the same idiom.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command_bus::{CommandBus, StreamCommand, StreamConfigRequest};
use crate::config::Config;
use crate::error::SessionError;
use crate::frame_bus::EncodedFrame;
use crate::protocol::{self, StreamStateCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    AwaitingAuth,
    Authenticated,
    Streaming,
    Closing,
    Closed,
}

/// Narrow callback surface the server implements; sessions never reach
/// into the server's internals directly.
pub trait SessionOwner: Send + Sync {
    fn password(&self) -> String;
    fn on_auth_success(&self, session_id: &str);
    fn on_set_stream(&self, session_id: &str, cfg: StreamConfigRequest);
    fn on_resume_request(&self, session_id: &str, prior_id: &str) -> Option<StreamConfigRequest>;
    fn on_touch_resume(&self, session_id: &str, cfg: StreamConfigRequest);
    fn on_session_closed(&self, session_id: &str);
    fn command_bus(&self) -> CommandBus;
}

enum Outbound {
    Single(u8, Bytes),
    Atomic(Vec<(u8, Bytes)>),
}

const MAX_AUTH_ATTEMPTS: u32 = 3;

struct SharedState {
    state: Mutex<SessionState>,
    current_epoch: AtomicU64,
    streaming_enabled: AtomicBool,
    last_pong: Mutex<Instant>,
    outbound_len: AtomicUsize,
    pressure_flagged: AtomicBool,
    auth_attempts: AtomicUsize,
    closed_notified: AtomicBool,
}

/// Public handle to a connected viewer. Cheap to clone (`Arc` inside).
pub struct ViewerSession {
    pub id: String,
    shared: Arc<SharedState>,
    outbound_tx: mpsc::Sender<Outbound>,
    high_water: usize,
    low_water: usize,
    command_bus: CommandBus,
    reader_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ViewerSession {
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn current_epoch(&self) -> u64 {
        self.shared.current_epoch.load(Ordering::SeqCst)
    }

    pub fn set_stream_epoch(&self, epoch: u64) {
        self.shared.current_epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn enable_streaming(&self, enabled: bool) {
        self.shared.streaming_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.shared.streaming_enabled.load(Ordering::SeqCst)
    }

    fn enqueue(&self, item: Outbound) {
        match self.outbound_tx.try_send(item) {
            Ok(()) => {
                let len = self.shared.outbound_len.fetch_add(1, Ordering::SeqCst) + 1;
                if len >= self.high_water
                    && !self.shared.pressure_flagged.swap(true, Ordering::SeqCst)
                {
                    self.command_bus.post(StreamCommand::Backpressure);
                }
            }
            Err(_) => {
                warn!(session_id = %self.id, "outbound queue full, dropping record");
            }
        }
    }

    pub fn send_csd(&self, epoch: u64, sps: Bytes, pps: Bytes) {
        let mut payload = Vec::with_capacity(8 + sps.len() + pps.len());
        payload.extend_from_slice(&epoch.to_be_bytes());
        payload.extend_from_slice(&(sps.len() as u32).to_be_bytes());
        payload.extend_from_slice(&sps);
        payload.extend_from_slice(&pps);
        self.enqueue(Outbound::Single(protocol::TYPE_CSD, Bytes::from(payload)));
    }

    pub fn send_frame(&self, frame: &EncodedFrame) {
        if frame.epoch != self.current_epoch() {
            debug!(session_id = %self.id, "dropping frame from stale epoch");
            return;
        }
        let mut payload = Vec::with_capacity(21 + frame.data.len());
        payload.extend_from_slice(&frame.epoch.to_be_bytes());
        payload.extend_from_slice(&frame.pts_us.to_be_bytes());
        payload.push(frame.is_keyframe as u8);
        payload.extend_from_slice(&frame.capture_epoch_ms.to_be_bytes());
        payload.extend_from_slice(&frame.data);
        self.enqueue(Outbound::Single(protocol::TYPE_FRAME, Bytes::from(payload)));
    }

    pub fn send_stream_accepted_and_reconfiguring(
        &self,
        epoch: u64,
        width: u32,
        height: u32,
        bitrate_bps: u32,
        fps: u32,
    ) {
        let accepted = protocol::encode_stream_accepted(epoch, width, height, bitrate_bps, fps, &self.id);
        let state = protocol::encode_stream_state(StreamStateCode::Reconfiguring, epoch);
        self.enqueue(Outbound::Atomic(vec![
            (protocol::TYPE_STREAM_ACCEPTED, Bytes::from(accepted.into_bytes())),
            (protocol::TYPE_STREAM_STATE, Bytes::from(state.into_bytes())),
        ]));
    }

    pub fn send_stream_state(&self, code: StreamStateCode, epoch: u64) {
        let payload = protocol::encode_stream_state(code, epoch);
        self.enqueue(Outbound::Single(protocol::TYPE_STREAM_STATE, Bytes::from(payload.into_bytes())));
    }

    pub fn send_control(&self, text: &str) {
        self.enqueue(Outbound::Single(protocol::TYPE_CONTROL, Bytes::copy_from_slice(text.as_bytes())));
    }

    pub fn send_control_atomic(&self, a: &str, b: &str) {
        self.enqueue(Outbound::Atomic(vec![
            (protocol::TYPE_CONTROL, Bytes::copy_from_slice(a.as_bytes())),
            (protocol::TYPE_CONTROL, Bytes::copy_from_slice(b.as_bytes())),
        ]));
    }

    pub fn send_recording_state(&self, active: bool) {
        self.send_control(&format!("RECORDING|active={active}"));
    }

    pub fn send_camera_facing(&self, front: bool) {
        self.send_control(&format!("CAMERA|front={front}"));
    }

    pub fn send_encoder_rotation(&self, deg: u32) {
        self.send_control(&format!("ENC_ROT|{deg}"));
    }

    pub fn send_audio_down(&self, pcm: &[u8], pts_us: u64, rate: u32, channels: u16, compressed: bool) {
        let mut payload = Vec::with_capacity(15 + pcm.len());
        payload.extend_from_slice(&pts_us.to_be_bytes());
        payload.extend_from_slice(&rate.to_be_bytes());
        payload.extend_from_slice(&channels.to_be_bytes());
        payload.push(compressed as u8);
        payload.extend_from_slice(pcm);
        self.enqueue(Outbound::Single(protocol::TYPE_AUDIO_DOWN, Bytes::from(payload)));
    }

    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if *state != SessionState::Closed {
            *state = SessionState::Closing;
        }
    }
}

/// Spawn reader and writer tasks for a freshly accepted connection.
/// Returns the public handle once the handshake machinery is wired; the
/// handle is usable immediately (outbound sends just queue until the
/// writer task drains them).
pub fn spawn(
    socket: TcpStream,
    config: Arc<Config>,
    owner: Arc<dyn SessionOwner>,
    session_id: String,
) -> Arc<ViewerSession> {
    let (read_half, write_half) = tokio::io::split(socket);
    let (tx, rx) = mpsc::channel(256);
    let high_water = 192usize;
    let low_water = 64usize;

    let shared = Arc::new(SharedState {
        state: Mutex::new(SessionState::New),
        current_epoch: AtomicU64::new(0),
        streaming_enabled: AtomicBool::new(false),
        last_pong: Mutex::new(Instant::now()),
        outbound_len: AtomicUsize::new(0),
        pressure_flagged: AtomicBool::new(false),
        auth_attempts: AtomicUsize::new(0),
        closed_notified: AtomicBool::new(false),
    });

    let session = Arc::new(ViewerSession {
        id: session_id.clone(),
        shared: shared.clone(),
        outbound_tx: tx,
        high_water,
        low_water,
        command_bus: owner.command_bus(),
        reader_handle: Mutex::new(None),
    });

    tokio::spawn(writer_loop(write_half, rx, shared.clone(), owner.command_bus(), low_water));
    let reader_handle = tokio::spawn(reader_loop(read_half, config.clone(), owner.clone(), session.clone(), shared.clone()));
    *session.reader_handle.lock() = Some(reader_handle);
    tokio::spawn(keepalive_loop(config, owner, session.clone(), shared));

    session
}

/// Periodically pings the viewer and closes the connection if no PONG
/// arrives within the configured timeout. Runs independently of
/// `reader_loop` since a stuck or silent peer never produces a read to
/// notice the staleness from the reader side.
async fn keepalive_loop(config: Arc<Config>, owner: Arc<dyn SessionOwner>, session: Arc<ViewerSession>, shared: Arc<SharedState>) {
    let interval = config.keepalive_interval();
    let timeout = config.keepalive_timeout();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let state = *shared.state.lock();
        if state == SessionState::Closing || state == SessionState::Closed {
            break;
        }
        session.send_control("PING");
        let elapsed = shared.last_pong.lock().elapsed();
        if elapsed > timeout {
            warn!(session_id = %session.id, "no PONG within keepalive timeout, closing session");
            *shared.state.lock() = SessionState::Closing;
            if let Some(handle) = session.reader_handle.lock().take() {
                handle.abort();
            }
            notify_closed(&shared, &owner, &session.id);
            *shared.state.lock() = SessionState::Closed;
            break;
        }
    }
}

/// Calls `on_session_closed` at most once per session, since both
/// `reader_loop` and `keepalive_loop` can reach the close path.
fn notify_closed(shared: &Arc<SharedState>, owner: &Arc<dyn SessionOwner>, session_id: &str) {
    if !shared.closed_notified.swap(true, Ordering::SeqCst) {
        owner.on_session_closed(session_id);
    }
}

async fn writer_loop(
    mut write_half: WriteHalf<TcpStream>,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<SharedState>,
    command_bus: CommandBus,
    low_water: usize,
) {
    while let Some(item) = rx.recv().await {
        let len = shared.outbound_len.fetch_sub(1, Ordering::SeqCst) - 1;
        if len <= low_water && shared.pressure_flagged.swap(false, Ordering::SeqCst) {
            command_bus.post(StreamCommand::PressureClear);
        }
        let result = match item {
            Outbound::Single(rtype, payload) => protocol::write_record(&mut write_half, rtype, &payload).await,
            Outbound::Atomic(records) => {
                let refs: Vec<(u8, &[u8])> = records.iter().map(|(t, p)| (*t, p.as_ref())).collect();
                protocol::write_records_atomic(&mut write_half, &refs).await
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "session write failed, closing");
            *shared.state.lock() = SessionState::Closing;
            break;
        }
        if *shared.state.lock() == SessionState::Closed {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_loop(
    mut read_half: ReadHalf<TcpStream>,
    config: Arc<Config>,
    owner: Arc<dyn SessionOwner>,
    session: Arc<ViewerSession>,
    shared: Arc<SharedState>,
) {
    let mut resume_candidate: Option<String> = None;
    loop {
        if *shared.state.lock() == SessionState::Closing || *shared.state.lock() == SessionState::Closed {
            break;
        }
        let record = match protocol::read_record(&mut read_half, config.max_frame_payload_bytes).await {
            Ok(r) => r,
            Err(e) => {
                debug!(session_id = %session.id, error = %e, "session read ended");
                break;
            }
        };
        let cur_state = *shared.state.lock();
        let text = || String::from_utf8_lossy(&record.payload).to_string();
        match (cur_state, record.rtype) {
            (SessionState::New, protocol::TYPE_HELLO) => {
                let kv = protocol::parse_kv(&text());
                if let Some(prior) = kv.get("resume") {
                    resume_candidate = Some(prior.to_string());
                }
                *shared.state.lock() = SessionState::AwaitingAuth;
            }
            (SessionState::AwaitingAuth, protocol::TYPE_AUTH) => {
                let ok = protocol::constant_time_eq(record.payload.as_ref(), owner.password().as_bytes());
                if ok {
                    *shared.state.lock() = SessionState::Authenticated;
                    session.enqueue(Outbound::Single(protocol::TYPE_AUTH_OK, Bytes::from_static(b"ok")));
                    owner.on_auth_success(&session.id);
                    if let Some(prior_id) = resume_candidate.take() {
                        if let Some(cfg) = owner.on_resume_request(&session.id, &prior_id) {
                            session.send_control(protocol::encode_stream_state(StreamStateCode::Streaming, session.current_epoch()).as_str());
                            owner.on_touch_resume(&session.id, cfg);
                        }
                    }
                } else {
                    let attempts = shared.auth_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    session.enqueue(Outbound::Single(protocol::TYPE_AUTH_FAIL, Bytes::from_static(b"fail")));
                    if attempts as u32 >= MAX_AUTH_ATTEMPTS {
                        *shared.state.lock() = SessionState::Closing;
                        break;
                    }
                }
            }
            (SessionState::Authenticated, protocol::TYPE_SET_STREAM)
            | (SessionState::Streaming, protocol::TYPE_SET_STREAM) => {
                if let Some(cfg) = parse_stream_config(&text()) {
                    *shared.state.lock() = SessionState::Streaming;
                    owner.on_set_stream(&session.id, cfg);
                }
            }
            (SessionState::Streaming, protocol::TYPE_CONTROL) => {
                handle_control(&text(), &session, &owner, &shared);
            }
            (SessionState::Streaming, protocol::TYPE_AUDIO_UP) => {
                // Talkback PCM forwarded to the audio collaborator is out
                // of this module's scope; acknowledged and dropped here.
            }
            (_, protocol::TYPE_CONTROL) => {
                handle_control(&text(), &session, &owner, &shared);
            }
            _ => {
                warn!(session_id = %session.id, state = ?cur_state, rtype = record.rtype, "unexpected record for state");
                *shared.state.lock() = SessionState::Closing;
                break;
            }
        }
    }
    *shared.state.lock() = SessionState::Closed;
    notify_closed(&shared, &owner, &session.id);
}

fn handle_control(text: &str, session: &Arc<ViewerSession>, owner: &Arc<dyn SessionOwner>, shared: &Arc<SharedState>) {
    match text {
        "PONG" => {
            *shared.last_pong.lock() = Instant::now();
        }
        "REQ_KEYFRAME" => {
            owner.command_bus().post(StreamCommand::RequestKeyframe);
        }
        "SWITCH_CAMERA" => {
            owner.command_bus().post(StreamCommand::SwitchCamera);
        }
        other if other.starts_with("ADJUST_BITRATE|") => {
            if let Ok(bps) = other["ADJUST_BITRATE|".len()..].parse::<u32>() {
                owner.command_bus().post(StreamCommand::AdjustBitrate(bps));
            }
        }
        other if other.starts_with("ZOOM|") => {
            if let Ok(z) = other["ZOOM|".len()..].parse::<f32>() {
                owner.command_bus().post(StreamCommand::Zoom(z));
            }
        }
        _ => {
            let _ = session;
            debug!(control = %text, "unrecognized control message");
        }
    }
}

fn parse_stream_config(text: &str) -> Option<StreamConfigRequest> {
    let kv = protocol::parse_kv(text);
    Some(StreamConfigRequest {
        width: kv.get("width")?.parse().ok()?,
        height: kv.get("height")?.parse().ok()?,
        bitrate_bps: kv.get("bitrate")?.parse().ok()?,
        fps: kv.get("fps")?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_config() {
        let cfg = parse_stream_config("width=720|height=960|bitrate=2000000|fps=30").unwrap();
        assert_eq!(cfg.width, 720);
        assert_eq!(cfg.fps, 30);
    }

    #[test]
    fn test_parse_stream_config_missing_field() {
        assert!(parse_stream_config("width=720|height=960").is_none());
    }
}
