//! Audio capture
//!
//! Owns the microphone for the duration of one recording. Device readiness
//! races with the rest of the pipeline are expected, not exceptional, so
//! opening retries on a fixed bounded backoff. The capture buffer is owned
//! exclusively by the recording task and moved out exactly once when the
//! recording stops, whether by explicit request or the automatic ceiling.

use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Native format of a capture device: interleaved `i16` at this rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// The raw capture buffer: everything the device produced for one
/// recording, at the device's native spec. Consumed by the encoder.
#[derive(Debug)]
pub struct CaptureBuffer {
    pub spec: CaptureSpec,
    pub samples: Vec<i16>,
}

/// A live stream of interleaved sample chunks from an open device. Dropping
/// the stream signals the producer to shut down.
pub struct CaptureStream {
    rx: mpsc::Receiver<Vec<i16>>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureStream {
    pub fn new(rx: mpsc::Receiver<Vec<i16>>, shutdown: Arc<AtomicBool>) -> Self {
        Self { rx, shutdown }
    }

    /// Next chunk of interleaved samples; `None` when the device ended.
    pub async fn read_chunk(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Capability interface over a microphone-like device.
pub trait AudioSource: Send + Sync {
    fn spec(&self) -> CaptureSpec;
    /// Open the device. Fails with `DeviceUnavailable` while permission or
    /// hardware is still resolving; callers retry on a bounded backoff.
    fn open(&self) -> Result<CaptureStream>;
}

/// Retry policy for opening the capture device.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Handle to an in-progress recording. Exactly one may be open per session.
pub struct RecordingHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: oneshot::Receiver<CaptureBuffer>,
    task: JoinHandle<()>,
}

impl RecordingHandle {
    /// Stop the recording and take its buffer. The explicit-stop and
    /// ceiling paths both converge here, so at most one finalize happens.
    pub async fn stop(mut self) -> Result<CaptureBuffer> {
        if let Some(tx) = self.stop_tx.take() {
            // The task may already have stopped at the ceiling.
            let _ = tx.send(());
        }
        self.done_rx
            .await
            .map_err(|_| SessionError::DeviceUnavailable("recording ended without a buffer".into()))
    }

    /// Abandon the recording without finalizing (session teardown). Also
    /// aborts a still-pending open-retry loop.
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// Start a recording: open the device (with bounded retry), then collect
/// chunks until stopped or the ceiling fires, posting loudness along the
/// way.
pub fn start_recording(
    source: Arc<dyn AudioSource>,
    retry: RetryPolicy,
    ceiling: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> RecordingHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<CaptureBuffer>();

    let task = tokio::spawn(async move {
        let mut stream = match open_with_retry(source.as_ref(), retry, &events).await {
            Some(stream) => stream,
            None => return, // CaptureFailed already posted; done_tx drops
        };

        let spec = source.spec();
        info!(
            "recording started: {} Hz x{} (ceiling {:?})",
            spec.sample_rate, spec.channels, ceiling
        );

        let mut samples: Vec<i16> = Vec::new();
        let deadline = tokio::time::sleep(ceiling);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = stream.read_chunk() => {
                    match chunk {
                        Some(chunk) => {
                            let _ = events.send(SessionEvent::Loudness(loudness(&chunk)));
                            samples.extend_from_slice(&chunk);
                        }
                        None => {
                            warn!("capture device ended mid-recording");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    info!("recording ceiling reached, forcing stop");
                    let _ = events.send(SessionEvent::RecordingCeiling);
                    break;
                }
                _ = &mut stop_rx => {
                    debug!("recording stop requested");
                    break;
                }
            }
        }

        let _ = done_tx.send(CaptureBuffer { spec, samples });
    });

    RecordingHandle {
        stop_tx: Some(stop_tx),
        done_rx,
        task,
    }
}

async fn open_with_retry(
    source: &dyn AudioSource,
    retry: RetryPolicy,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Option<CaptureStream> {
    for attempt in 1..=retry.attempts.max(1) {
        match source.open() {
            Ok(stream) => {
                if attempt > 1 {
                    debug!("capture device ready after {} attempts", attempt);
                }
                return Some(stream);
            }
            Err(e) => {
                if attempt == retry.attempts.max(1) {
                    warn!("capture device unavailable after {} attempts: {}", attempt, e);
                    let _ = events.send(SessionEvent::CaptureFailed(e.to_string()));
                    return None;
                }
                debug!("capture open attempt {} failed: {}", attempt, e);
                tokio::time::sleep(retry.delay).await;
            }
        }
    }
    None
}

/// Relative loudness of a chunk, 0-100. Cosmetic UI feedback only.
pub fn loudness(chunk: &[i16]) -> u8 {
    if chunk.is_empty() {
        return 0;
    }
    let sum_sq: f64 = chunk.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / chunk.len() as f64).sqrt();
    // Speech RMS sits well under full scale; boost so normal levels are
    // visible on a 0-100 meter.
    ((rms / i16::MAX as f64) * 300.0).min(100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Source backed by a pre-filled channel of chunks.
    struct FakeSource {
        spec: CaptureSpec,
        chunks: std::sync::Mutex<Option<mpsc::Receiver<Vec<i16>>>>,
        fail_opens: AtomicU32,
    }

    impl FakeSource {
        fn with_chunks(chunks: Vec<Vec<i16>>) -> (Arc<Self>, mpsc::Sender<Vec<i16>>) {
            let (tx, rx) = mpsc::channel(64);
            for c in chunks {
                tx.try_send(c).unwrap();
            }
            (
                Arc::new(Self {
                    spec: CaptureSpec {
                        sample_rate: 16_000,
                        channels: 1,
                    },
                    chunks: std::sync::Mutex::new(Some(rx)),
                    fail_opens: AtomicU32::new(0),
                }),
                tx,
            )
        }

        fn failing_first(n: u32, chunks: Vec<Vec<i16>>) -> (Arc<Self>, mpsc::Sender<Vec<i16>>) {
            let (src, tx) = Self::with_chunks(chunks);
            src.fail_opens.store(n, Ordering::SeqCst);
            (src, tx)
        }
    }

    impl AudioSource for FakeSource {
        fn spec(&self) -> CaptureSpec {
            self.spec
        }

        fn open(&self) -> Result<CaptureStream> {
            let remaining = self.fail_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_opens.store(remaining - 1, Ordering::SeqCst);
                return Err(SessionError::DeviceUnavailable("permission resolving".into()));
            }
            let rx = self
                .chunks
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SessionError::DeviceUnavailable("already open".into()))?;
            Ok(CaptureStream::new(rx, Arc::new(AtomicBool::new(false))))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn collects_chunks_in_order_until_stopped() {
        let (source, tx) = FakeSource::with_chunks(vec![vec![1, 2], vec![3, 4]]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();

        let handle = start_recording(source, policy(), Duration::from_secs(55), ev_tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);

        let buffer = handle.stop().await.unwrap();
        assert_eq!(buffer.samples, vec![1, 2, 3, 4]);
        assert_eq!(buffer.spec.sample_rate, 16_000);

        // Loudness was reported while recording.
        let mut saw_loudness = false;
        while let Ok(ev) = ev_rx.try_recv() {
            if matches!(ev, SessionEvent::Loudness(_)) {
                saw_loudness = true;
            }
        }
        assert!(saw_loudness);
    }

    #[tokio::test]
    async fn ceiling_forces_stop_and_still_yields_buffer() {
        let (source, _tx) = FakeSource::with_chunks(vec![vec![7; 160]]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();

        let handle = start_recording(source, policy(), Duration::from_millis(40), ev_tx);

        // Never call stop from the outside; wait for the ceiling.
        let mut saw_ceiling = false;
        while let Some(ev) = ev_rx.recv().await {
            if matches!(ev, SessionEvent::RecordingCeiling) {
                saw_ceiling = true;
                break;
            }
        }
        assert!(saw_ceiling);

        let buffer = handle.stop().await.unwrap();
        assert_eq!(buffer.samples, vec![7; 160]);
    }

    #[tokio::test]
    async fn open_retries_until_device_is_ready() {
        let (source, _tx) = FakeSource::failing_first(2, vec![vec![5, 5]]);
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();

        let handle = start_recording(source, policy(), Duration::from_secs(55), ev_tx);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let buffer = handle.stop().await.unwrap();
        assert_eq!(buffer.samples, vec![5, 5]);
    }

    #[tokio::test]
    async fn bounded_retry_gives_up_with_capture_failed() {
        let (source, _tx) = FakeSource::failing_first(10, vec![]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();

        let handle = start_recording(source, policy(), Duration::from_secs(55), ev_tx);

        let mut failed = false;
        while let Some(ev) = ev_rx.recv().await {
            if matches!(ev, SessionEvent::CaptureFailed(_)) {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(handle.stop().await.is_err());
    }

    #[tokio::test]
    async fn cancel_is_a_clean_abort() {
        let (source, _tx) = FakeSource::failing_first(u32::MAX, vec![]);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();

        let handle = start_recording(
            source,
            RetryPolicy {
                attempts: 1000,
                delay: Duration::from_millis(5),
            },
            Duration::from_secs(55),
            ev_tx,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // No terminal event arrives after an abort.
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn loudness_is_bounded() {
        assert_eq!(loudness(&[]), 0);
        assert_eq!(loudness(&[0; 160]), 0);
        assert_eq!(loudness(&[i16::MAX; 160]), 100);
        let quiet = loudness(&[500; 160]);
        assert!(quiet > 0 && quiet < 20);
    }
}
