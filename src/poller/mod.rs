use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consume::ConsumeError;
use crate::session::{QueryHandle, Session};

/// Callback invoked with each non-empty batch: the blob bytes and the number
/// of blobs they hold.
pub type BatchFn = Box<dyn Fn(&[u8], usize) + Send + Sync>;

/// Polls one (query, process) pair of a [`Session`] on a fixed interval.
pub struct Poller {
    session: Arc<Session>,
    query: QueryHandle,
    pid: u32,
    interval: Duration,
    frames_per_poll: usize,
    blob_size: usize,
    frames_total: Arc<AtomicU64>,
    callbacks: Arc<parking_lot::Mutex<Vec<BatchFn>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("query", &self.query)
            .field("pid", &self.pid)
            .field("interval", &self.interval)
            .field("frames_per_poll", &self.frames_per_poll)
            .finish()
    }
}

impl Poller {
    pub fn new(
        session: Arc<Session>,
        query: QueryHandle,
        pid: u32,
        interval: Duration,
        frames_per_poll: usize,
    ) -> Result<Self> {
        if interval.is_zero() {
            bail!("poll interval must be > 0");
        }

        if frames_per_poll == 0 {
            bail!("frames_per_poll must be > 0");
        }

        let blob_size = session.blob_size(query)?;

        Ok(Self {
            session,
            query,
            pid,
            interval,
            frames_per_poll,
            blob_size,
            frames_total: Arc::new(AtomicU64::new(0)),
            callbacks: Arc::new(parking_lot::Mutex::new(Vec::with_capacity(4))),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    /// Register a callback for every non-empty batch.
    pub fn on_batch(&self, f: BatchFn) {
        self.callbacks.lock().push(f);
    }

    /// Total blobs delivered since start.
    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background polling task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running.
        }

        let session = Arc::clone(&self.session);
        let query = self.query;
        let pid = self.pid;
        let period = self.interval;
        let max_frames = self.frames_per_poll;
        let blob_size = self.blob_size;
        let frames_total = Arc::clone(&self.frames_total);
        let callbacks = Arc::clone(&self.callbacks);
        let running = Arc::clone(&self.running);
        let cancel = self.cancel.clone();
        let mut buf = vec![0u8; blob_size * max_frames];

        info!(
            query = %query,
            pid,
            interval = ?period,
            frames_per_poll = max_frames,
            "poller started",
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(pid, "poller stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match session.consume_frame_events(query, pid, &mut buf, max_frames) {
                            Ok(0) => {}
                            Ok(n) => {
                                frames_total.fetch_add(n as u64, Ordering::Relaxed);
                                let cbs = callbacks.lock();
                                for cb in cbs.iter() {
                                    cb(&buf[..n * blob_size], n);
                                }
                            }
                            Err(
                                e @ (ConsumeError::ProducerGone { .. }
                                | ConsumeError::UnknownStream { .. }
                                | ConsumeError::UnknownQuery { .. }),
                            ) => {
                                info!(pid, reason = %e, "poller finished");
                                break;
                            }
                            Err(e) => {
                                warn!(pid, error = %e, "poll failed");
                            }
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
