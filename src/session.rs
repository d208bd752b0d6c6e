//! Consumer-side session.
//!
//! A [`Session`] owns everything a client keeps between polls: the open ring
//! streams keyed by process id, compiled queries keyed by handle, and one
//! resolver cursor plus [`MetricContext`] per (query, process) pair. It is
//! `Send + Sync`; independent pairs poll concurrently.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::consume::{self, ConsumeCounter, ConsumeError, ConsumeStats};
use crate::context::MetricContext;
use crate::query::{GatherProgram, QueryCompiler, QueryElement};
use crate::resolver::FrameContextResolver;
use crate::ring::{RingError, RingReader};
use crate::stats::window::{
    collect_window, compute_statistics, validate_requests, DriftTracker, StatRequest,
    SwapChainStats, WindowSpec,
};

/// Device id meaning "no device selected".
pub const NO_DEVICE: u32 = 0;

/// Handle returned by [`Session::register_query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub u64);

impl std::fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Stream {
    reader: RingReader,
    drift: Mutex<DriftTracker>,
}

struct Consumer {
    resolver: FrameContextResolver,
    ctx: MetricContext,
}

/// Client session over any number of process streams.
pub struct Session {
    streams: DashMap<u32, Arc<Stream>>,
    queries: DashMap<QueryHandle, Arc<GatherProgram>>,
    consumers: DashMap<(QueryHandle, u32), Arc<Mutex<Consumer>>>,
    next_query: AtomicU64,
    active_device: AtomicU32,
    stats: ConsumeStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.streams.len())
            .field("queries", &self.queries.len())
            .field("consumers", &self.consumers.len())
            .field("active_device", &self.active_device())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            queries: DashMap::new(),
            consumers: DashMap::new(),
            next_query: AtomicU64::new(1),
            active_device: AtomicU32::new(NO_DEVICE),
            stats: ConsumeStats::new(),
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Start tracking process `pid` through `reader`. Replaces any previous
    /// stream for the same process and resets its cursors.
    pub fn open_stream(&self, pid: u32, reader: RingReader) {
        info!(pid, ring = reader.name(), capacity = reader.capacity(), "stream opened");
        self.consumers.retain(|(_, p), _| *p != pid);
        self.streams.insert(
            pid,
            Arc::new(Stream {
                reader,
                drift: Mutex::new(DriftTracker::default()),
            }),
        );
    }

    /// Stop tracking `pid`. Returns false if no stream was open.
    pub fn close_stream(&self, pid: u32) -> bool {
        self.consumers.retain(|(_, p), _| *p != pid);
        let removed = self.streams.remove(&pid).is_some();
        if removed {
            info!(pid, "stream closed");
        }
        removed
    }

    pub fn has_stream(&self, pid: u32) -> bool {
        self.streams.contains_key(&pid)
    }

    fn stream(&self, pid: u32) -> Result<Arc<Stream>, ConsumeError> {
        self.streams
            .get(&pid)
            .map(|s| Arc::clone(s.value()))
            .ok_or(ConsumeError::UnknownStream { pid })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Compile and register a frame-event query. Offsets are written back
    /// into `elements`.
    pub fn register_query(&self, elements: &mut [QueryElement]) -> Result<QueryHandle, ConsumeError> {
        let program = QueryCompiler::compile(elements)?;
        let handle = QueryHandle(self.next_query.fetch_add(1, Ordering::Relaxed));
        debug!(
            query = %handle,
            elements = elements.len(),
            blob_size = program.blob_size(),
            "query registered",
        );
        self.queries.insert(handle, Arc::new(program));
        Ok(handle)
    }

    /// Drop a query and every cursor created for it.
    pub fn free_query(&self, handle: QueryHandle) -> bool {
        self.consumers.retain(|(h, _), _| *h != handle);
        self.queries.remove(&handle).is_some()
    }

    pub fn blob_size(&self, handle: QueryHandle) -> Result<usize, ConsumeError> {
        Ok(self.program(handle)?.blob_size())
    }

    fn program(&self, handle: QueryHandle) -> Result<Arc<GatherProgram>, ConsumeError> {
        self.queries
            .get(&handle)
            .map(|p| Arc::clone(p.value()))
            .ok_or(ConsumeError::UnknownQuery { handle: handle.0 })
    }

    fn consumer(&self, handle: QueryHandle, stream: &Stream, pid: u32) -> Arc<Mutex<Consumer>> {
        let entry = self.consumers.entry((handle, pid)).or_insert_with(|| {
            Arc::new(Mutex::new(Consumer {
                resolver: FrameContextResolver::for_reader(&stream.reader),
                ctx: MetricContext::new(stream.reader.qpc_frequency(), stream.reader.start_qpc()),
            }))
        });
        Arc::clone(entry.value())
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Write up to `max_frames` blobs for `pid` into `out`, returning how many
    /// were written. Zero means no frame was ready yet.
    ///
    /// A producer that has gone away closes the stream.
    pub fn consume_frame_events(
        &self,
        handle: QueryHandle,
        pid: u32,
        out: &mut [u8],
        max_frames: usize,
    ) -> Result<usize, ConsumeError> {
        let program = self.program(handle)?;
        let stream = self.stream(pid)?;

        let needed = max_frames.saturating_mul(program.blob_size());
        if out.len() < needed {
            return Err(ConsumeError::Marshal {
                needed,
                available: out.len(),
            });
        }

        if let Some(device) = program.referenced_device() {
            let previous = self.active_device.swap(device, Ordering::Relaxed);
            if previous != device {
                debug!(device, previous, "active device changed");
            }
        }

        // The context is keyed to the first frame's QPC, so no cursor is
        // created before the producer has written one.
        if !stream.reader.has_start_qpc() {
            if !stream.reader.is_process_active() {
                info!(pid, "producer gone");
                self.close_stream(pid);
                return Err(ConsumeError::ProducerGone { pid });
            }
            return Ok(0);
        }

        let consumer = self.consumer(handle, &stream, pid);
        let mut consumer = consumer.lock();
        let Consumer { resolver, ctx } = &mut *consumer;

        let report = match consume::consume_frame_events(
            &stream.reader,
            resolver,
            ctx,
            &program,
            &mut out[..needed],
        ) {
            Ok(report) => report,
            Err(RingError::ProducerGone) => {
                drop(consumer);
                info!(pid, "producer gone");
                self.close_stream(pid);
                return Err(ConsumeError::ProducerGone { pid });
            }
            Err(e) => return Err(e.into()),
        };

        self.stats
            .record_n(ConsumeCounter::FramesEmitted, report.frames as u64);
        self.stats
            .record_n(ConsumeCounter::PresentsSkipped, u64::from(report.skipped));
        self.stats
            .record_n(ConsumeCounter::Overruns, u64::from(report.overruns));
        if report.stalled {
            self.stats.record(ConsumeCounter::LookaheadStalls);
        }

        Ok(report.frames)
    }

    /// Compute windowed statistics for `pid`, one entry per swap chain.
    pub fn poll_statistics(
        &self,
        pid: u32,
        requests: &[StatRequest],
        win: &WindowSpec,
    ) -> Result<Vec<SwapChainStats>, ConsumeError> {
        validate_requests(requests)?;
        let stream = self.stream(pid)?;
        if !stream.reader.is_process_active() {
            self.close_stream(pid);
            return Err(ConsumeError::ProducerGone { pid });
        }

        let frames = {
            let mut drift = stream.drift.lock();
            collect_window(&stream.reader, win, &mut drift)?
        };

        Ok(compute_statistics(
            &frames,
            requests,
            stream.reader.qpc_frequency(),
            stream.reader.start_qpc(),
        )?)
    }

    /// Device selected by the most recent device-bound query.
    pub fn active_device(&self) -> u32 {
        self.active_device.load(Ordering::Relaxed)
    }

    /// Read and reset consumption counters.
    pub fn stats_snapshot(&self) -> Vec<(ConsumeCounter, u64)> {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::query::metric::Metric;
    use crate::query::QueryError;
    use crate::ring::{self, PlaybackFlags, RingOptions, RingWriter};
    use crate::stats::Stat;
    use crate::synth::{FrameGenerator, FrameParams};

    const FREQ: u64 = 10_000_000;

    fn ring(capacity: usize) -> (RingWriter, RingReader) {
        ring::create(RingOptions {
            name: "session".to_string(),
            capacity,
            qpc_frequency: FREQ,
            flags: PlaybackFlags {
                reset_oldest: true,
                ..PlaybackFlags::default()
            },
        })
        .expect("ring")
    }

    fn fill(w: &mut RingWriter, n: usize) {
        let mut gen = FrameGenerator::new(FrameParams::default(), FREQ, 1_000);
        for _ in 0..n {
            w.write(&gen.next_frame()).expect("write");
        }
    }

    #[test]
    fn test_unknown_stream_and_query() {
        let session = Session::new();
        let mut elements = [QueryElement::new(Metric::CpuStartTime)];
        let handle = session.register_query(&mut elements).expect("register");

        let mut out = vec![0u8; 64];
        let err = session.consume_frame_events(handle, 7, &mut out, 1).unwrap_err();
        assert!(matches!(err, ConsumeError::UnknownStream { pid: 7 }));

        let err = session
            .consume_frame_events(QueryHandle(999), 7, &mut out, 1)
            .unwrap_err();
        assert!(matches!(err, ConsumeError::UnknownQuery { handle: 999 }));
    }

    #[test]
    fn test_register_rejects_dynamic_metric() {
        let session = Session::new();
        let mut elements = [QueryElement::new(Metric::DisplayedFps)];
        let err = session.register_query(&mut elements).unwrap_err();
        assert!(matches!(
            err,
            ConsumeError::Query(QueryError::NotFrameEvent {
                metric: Metric::DisplayedFps
            })
        ));
    }

    #[test]
    fn test_marshal_failure_on_short_buffer() {
        let (_w, r) = ring(16);
        let session = Session::new();
        session.open_stream(10, r);
        let mut elements = [QueryElement::new(Metric::CpuStartTime)];
        let handle = session.register_query(&mut elements).expect("register");
        let blob = session.blob_size(handle).expect("blob size");

        let mut out = vec![0u8; blob * 2];
        let err = session.consume_frame_events(handle, 10, &mut out, 3).unwrap_err();
        let ConsumeError::Marshal { needed, available } = err else {
            panic!("expected marshal error, got {err:?}");
        };
        assert_eq!(needed, blob * 3);
        assert_eq!(available, blob * 2);
    }

    #[test]
    fn test_consume_counts_and_producer_gone_closes_stream() {
        let (mut w, r) = ring(64);
        fill(&mut w, 10);

        let session = Session::new();
        session.open_stream(10, r);
        let mut elements = [QueryElement::new(Metric::CpuStartTime)];
        let handle = session.register_query(&mut elements).expect("register");
        let blob = session.blob_size(handle).expect("blob size");

        let mut out = vec![0u8; blob * 32];
        let n = session.consume_frame_events(handle, 10, &mut out, 32).expect("consume");
        // First present has no history, last has no successor.
        assert_eq!(n, 8);

        let snap = session.stats_snapshot();
        assert!(snap.contains(&(ConsumeCounter::FramesEmitted, 8)));
        assert!(snap.contains(&(ConsumeCounter::PresentsSkipped, 1)));
        assert!(snap.contains(&(ConsumeCounter::LookaheadStalls, 1)));

        w.shutdown();
        let err = session.consume_frame_events(handle, 10, &mut out, 32).unwrap_err();
        assert!(matches!(err, ConsumeError::ProducerGone { pid: 10 }));
        assert!(!session.has_stream(10));
    }

    #[test]
    fn test_empty_ring_defers_cursor_creation() {
        let (mut w, r) = ring(64);
        let session = Session::new();
        session.open_stream(10, r);
        let mut elements = [QueryElement::new(Metric::CpuStartTime)];
        let handle = session.register_query(&mut elements).expect("register");
        let blob = session.blob_size(handle).expect("blob size");
        let mut out = vec![0u8; blob * 16];

        assert_eq!(session.consume_frame_events(handle, 10, &mut out, 16).expect("consume"), 0);
        assert!(session.consumers.is_empty());

        fill(&mut w, 4);
        assert_eq!(session.consume_frame_events(handle, 10, &mut out, 16).expect("consume"), 2);
        let cpu_start = crate::query::read_f64(&out[blob..], &elements[0]);
        // Third frame, two periods after the first one written.
        assert!((cpu_start - 2000.0 / 144.0).abs() < 1e-3, "cpu start time {cpu_start}");
    }

    #[test]
    fn test_cursors_are_per_query() {
        let (mut w, r) = ring(64);
        fill(&mut w, 6);

        let session = Session::new();
        session.open_stream(10, r);
        let mut a = [QueryElement::new(Metric::CpuStartQpc)];
        let mut b = [QueryElement::new(Metric::CpuStartQpc)];
        let qa = session.register_query(&mut a).expect("register");
        let qb = session.register_query(&mut b).expect("register");
        let blob = session.blob_size(qa).expect("blob size");

        let mut out = vec![0u8; blob * 16];
        let na = session.consume_frame_events(qa, 10, &mut out, 16).expect("consume");
        assert_eq!(session.consume_frame_events(qa, 10, &mut out, 16).expect("consume"), 0);
        let nb = session.consume_frame_events(qb, 10, &mut out, 16).expect("consume");
        assert_eq!(na, nb);

        assert!(session.free_query(qa));
        assert!(!session.free_query(qa));
        assert!(matches!(
            session.blob_size(qa),
            Err(ConsumeError::UnknownQuery { .. })
        ));
    }

    #[test]
    fn test_device_query_sets_active_device() {
        let (_w, r) = ring(16);
        let session = Session::new();
        session.open_stream(10, r);
        let mut elements = [QueryElement::new(Metric::GpuPower).device(2)];
        let handle = session.register_query(&mut elements).expect("register");
        assert_eq!(session.active_device(), NO_DEVICE);

        let mut out = vec![0u8; 64];
        session.consume_frame_events(handle, 10, &mut out, 1).expect("consume");
        assert_eq!(session.active_device(), 2);
    }

    #[test]
    fn test_poll_statistics() {
        let (mut w, r) = ring(512);
        let mut gen = FrameGenerator::new(
            FrameParams {
                fps: 100.0,
                ..FrameParams::default()
            },
            FREQ,
            1_000,
        );
        for _ in 0..200 {
            w.write(&gen.next_frame()).expect("write");
        }

        let session = Session::new();
        session.open_stream(10, r);
        let requests = [
            StatRequest::new(Metric::DisplayedFps, Stat::Avg),
            StatRequest::new(Metric::PercentDroppedFrames, Stat::Avg),
        ];
        let stats = session
            .poll_statistics(10, &requests, &WindowSpec::latest(Duration::from_secs(1)))
            .expect("stats");
        assert_eq!(stats.len(), 1);
        assert!((stats[0].values[0] - 100.0).abs() < 0.5, "{:?}", stats[0].values);
        assert_eq!(stats[0].values[1], 0.0);

        let bad = [StatRequest::new(Metric::GpuFanSpeed, Stat::Avg).index(9)];
        assert!(matches!(
            session.poll_statistics(10, &bad, &WindowSpec::latest(Duration::from_secs(1))),
            Err(ConsumeError::Query(QueryError::ArrayIndexOutOfRange { .. }))
        ));
    }
}
