//! C1: FrameBus — a bounded single-producer/multi-consumer queue of
//! encoded frames with a keyframe-priority drop policy.
//!
//! Grounded on `streaming/frame_distributor.rs`'s `FrameDistributor`/
//! `FrameReceiver` (the `FrameStats` snapshot, and its test style), but
//! re-architected: fanning frames out via `tokio::sync::broadcast`, whose
//! only backpressure policy is "lag and drop whatever the slow receiver
//! missed". That is wrong for a single
//! shared queue feeding the sender loop in `server.rs`: dropping a
//! keyframe there extends every viewer's black-screen window until the
//! next GOP. This queue instead drops stale non-key frames first and
//! never discards a keyframe once accepted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// One encoded access unit, shared read-only across every consumer
/// (fan-out sessions and the recording tee) without copying.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub pts_us: u64,
    pub capture_epoch_ms: u64,
    pub epoch: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameBusStats {
    pub published: u64,
    pub dropped: u64,
    pub current_size: usize,
}

struct Inner {
    queue: Mutex<VecDeque<Arc<EncodedFrame>>>,
    notify: Notify,
    capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Shared handle; cloning is cheap (an `Arc` underneath), the way
/// `FrameDistributor` is freely cloned into every session task.
#[derive(Clone)]
pub struct FrameBus {
    inner: Arc<Inner>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FrameBus capacity must be non-zero");
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a frame. Returns `true` if it was enqueued as-is, `false`
    /// if it was dropped (only possible for a non-keyframe arriving while
    /// the queue is full).
    pub fn publish(&self, frame: EncodedFrame) -> bool {
        let frame = Arc::new(frame);
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            if frame.is_keyframe {
                debug!(
                    dropped = queue.len(),
                    "frame bus full, clearing stale frames for incoming keyframe"
                );
                queue.clear();
            } else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("frame bus full, dropping non-keyframe frame");
                return false;
            }
        }
        queue.push_back(frame);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.inner.notify.notify_waiters();
        true
    }

    /// Remove and return every frame currently queued, oldest first.
    /// Used by the sender loop to drain-and-coalesce: pull everything
    /// that arrived since the last send and pick the newest (preferring
    /// the newest keyframe if one is present).
    pub fn drain(&self) -> Vec<Arc<EncodedFrame>> {
        let mut queue = self.inner.queue.lock();
        queue.drain(..).collect()
    }

    /// Wait up to `timeout` for at least one frame to become available,
    /// then drain. Returns an empty vec on timeout (the caller treats
    /// that as "nothing to send, check shutdown and loop again").
    pub async fn poll_with_timeout(&self, timeout: Duration) -> Vec<Arc<EncodedFrame>> {
        {
            let queue = self.inner.queue.lock();
            if !queue.is_empty() {
                drop(queue);
                return self.drain();
            }
        }
        let notified = self.inner.notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
        self.drain()
    }

    pub fn clear(&self) {
        self.inner.queue.lock().clear();
    }

    pub fn stats(&self) -> FrameBusStats {
        FrameBusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            current_size: self.inner.queue.lock().len(),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// Given a batch of drained frames, apply the sender loop's coalesce
/// policy from the design: if any drained frame was a keyframe, send the
/// newest keyframe; otherwise send the newest frame.
pub fn coalesce(mut batch: Vec<Arc<EncodedFrame>>) -> Option<Arc<EncodedFrame>> {
    if batch.is_empty() {
        return None;
    }
    if let Some(pos) = batch.iter().rposition(|f| f.is_keyframe) {
        return Some(batch.swap_remove(pos));
    }
    batch.pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: u64, is_key: bool) -> EncodedFrame {
        EncodedFrame {
            data: Bytes::from_static(b"x"),
            is_keyframe: is_key,
            pts_us: pts,
            capture_epoch_ms: 0,
            epoch: 1,
        }
    }

    #[test]
    fn test_basic_publish_and_drain() {
        let bus = FrameBus::new(4);
        assert!(bus.publish(frame(1, false)));
        assert!(bus.publish(frame(2, false)));
        assert_eq!(bus.size(), 2);
        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(bus.size(), 0);
    }

    #[test]
    fn test_full_queue_drops_non_keyframe() {
        let bus = FrameBus::new(2);
        assert!(bus.publish(frame(1, false)));
        assert!(bus.publish(frame(2, false)));
        assert!(!bus.publish(frame(3, false)));
        assert_eq!(bus.size(), 2);
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn test_full_queue_keyframe_clears_stale_frames() {
        let bus = FrameBus::new(2);
        assert!(bus.publish(frame(1, false)));
        assert!(bus.publish(frame(2, false)));
        assert!(bus.publish(frame(3, true)));
        assert_eq!(bus.size(), 1);
        let drained = bus.drain();
        assert!(drained[0].is_keyframe);
        assert_eq!(drained[0].pts_us, 3);
    }

    #[test]
    fn test_coalesce_prefers_newest_keyframe() {
        let batch = vec![
            Arc::new(frame(1, true)),
            Arc::new(frame(2, false)),
            Arc::new(frame(3, true)),
            Arc::new(frame(4, false)),
        ];
        let chosen = coalesce(batch).unwrap();
        assert_eq!(chosen.pts_us, 3);
    }

    #[test]
    fn test_coalesce_no_keyframe_picks_newest() {
        let batch = vec![Arc::new(frame(1, false)), Arc::new(frame(2, false))];
        let chosen = coalesce(batch).unwrap();
        assert_eq!(chosen.pts_us, 2);
    }

    #[tokio::test]
    async fn test_poll_with_timeout_returns_on_publish() {
        let bus = FrameBus::new(4);
        let bus2 = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus2.publish(frame(1, false));
        });
        let drained = bus.poll_with_timeout(Duration::from_secs(1)).await;
        assert_eq!(drained.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_with_timeout_empty_on_timeout() {
        let bus = FrameBus::new(4);
        let drained = bus.poll_with_timeout(Duration::from_millis(20)).await;
        assert!(drained.is_empty());
    }
}
