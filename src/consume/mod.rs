//! The frame-event consumption loop.
//!
//! Each call advances a resolver over the ring, feeds resolved presents into
//! the [`MetricContext`], and writes one blob per display entry until the
//! requested frame count is reached or no more look-ahead is available.

pub mod stats;

use thiserror::Error;
use tracing::{trace, warn};

use crate::context::MetricContext;
use crate::query::{GatherProgram, QueryError};
use crate::resolver::{FrameContextResolver, ResolvedFrames, Step};
use crate::ring::{RingError, RingReader};

pub use stats::{ConsumeCounter, ConsumeStats};

/// Errors returned to frame-event consumers.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("producer for process {pid} is gone")]
    ProducerGone { pid: u32 },

    #[error("no stream open for process {pid}")]
    UnknownStream { pid: u32 },

    #[error("unknown query handle {handle}")]
    UnknownQuery { handle: u64 },

    #[error("output buffer holds {available} bytes, need {needed}")]
    Marshal { needed: usize, available: usize },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// What one consumption call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Blobs written.
    pub frames: usize,
    /// Presents skipped for lack of history.
    pub skipped: u32,
    pub overruns: u32,
    /// The call ended because the resolver needed more frames.
    pub stalled: bool,
}

/// Write up to `out.len() / blob_size` blobs into `out`.
///
/// Overruns are soft: they are counted and logged, and the resolver
/// re-anchors on the following step.
pub fn consume_frame_events(
    reader: &RingReader,
    resolver: &mut FrameContextResolver,
    ctx: &mut MetricContext,
    program: &GatherProgram,
    out: &mut [u8],
) -> Result<ConsumeReport, RingError> {
    if !reader.is_process_active() {
        return Err(RingError::ProducerGone);
    }

    let blob_size = program.blob_size();
    let max = if blob_size == 0 { 0 } else { out.len() / blob_size };

    let mut report = ConsumeReport::default();
    let mut resolved = ResolvedFrames::default();
    let mut copied = 0usize;

    while copied < max {
        match resolver.consume_next(reader, &mut resolved)? {
            Step::Ready => {}
            Step::InsufficientLookahead => {
                report.stalled = true;
                break;
            }
            Step::Overrun { pending } => {
                report.overruns += 1;
                warn!(
                    ring = reader.name(),
                    pending,
                    capacity = reader.capacity(),
                    "consumer overrun, frames lost",
                );
                continue;
            }
        }

        if !resolved.back.has_required() {
            report.skipped += 1;
            trace!(
                frame_id = resolved.current.present.frame_id,
                "present skipped, no history",
            );
            continue;
        }

        ctx.begin_present(&mut resolved);
        for i in 0..ctx.display_count() {
            if copied >= max {
                break;
            }
            ctx.select_display(i);
            let start = copied * blob_size;
            program.gather_to_blob(ctx, &mut out[start..start + blob_size]);
            copied += 1;
        }
        ctx.end_present();

        // Keep the next present's blobs together in one call.
        let next_blobs = ctx.frames.next_displayed.present.displayed_len().max(1);
        if copied + next_blobs > max {
            break;
        }
    }

    ctx.prune_flip_table();
    report.frames = copied;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::metric::Metric;
    use crate::query::{read_f64, read_value, QueryCompiler, QueryElement};
    use crate::resolver::AnchorMode;
    use crate::ring::record::{FrameType, PresentResult};
    use crate::ring::{self, FrameRecord, PlaybackFlags, RingOptions, RingWriter};
    use crate::query::gather::Value;

    const FREQ: u64 = 10_000_000;
    const MS: u64 = FREQ / 1000;

    fn ring(capacity: usize) -> (RingWriter, RingReader) {
        ring::create(RingOptions {
            name: "consume".to_string(),
            capacity,
            qpc_frequency: FREQ,
            flags: PlaybackFlags {
                reset_oldest: true,
                ..PlaybackFlags::default()
            },
        })
        .expect("ring")
    }

    fn displayed(id: u32) -> FrameRecord {
        let mut r = FrameRecord::default();
        r.present.frame_id = id;
        r.present.present_start_time = 1_000 + u64::from(id) * 10 * MS;
        r.present.time_in_present = MS;
        r.present.final_state = PresentResult::Presented;
        r.present.displayed_count = 1;
        r.present.displayed_screen_time[0] = r.present.present_start_time + 5 * MS;
        r.present.displayed_frame_type[0] = FrameType::Application;
        r
    }

    #[test]
    fn test_producer_gone() {
        let (mut w, r) = ring(8);
        w.shutdown();
        let (program, _) = QueryCompiler::compile_names(&["dropped_frames"]).expect("compile");
        let mut res = FrameContextResolver::new(AnchorMode::Oldest);
        let mut ctx = MetricContext::new(FREQ, 0);
        let mut out = vec![0u8; program.blob_size() * 4];
        let err = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).unwrap_err();
        assert_eq!(err, RingError::ProducerGone);
    }

    #[test]
    fn test_first_present_without_history_is_skipped() {
        let (mut w, r) = ring(16);
        for i in 0..5 {
            w.write(&displayed(i)).expect("write");
        }
        let mut elements = vec![QueryElement::new(Metric::DisplayedTime)];
        let program = QueryCompiler::compile(&mut elements).expect("compile");
        let mut res = FrameContextResolver::for_reader(&r);
        let mut ctx = MetricContext::new(FREQ, r.start_qpc());
        let mut out = vec![0u8; program.blob_size() * 16];

        let report = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).expect("consume");
        assert_eq!(report.skipped, 1);
        assert_eq!(report.frames, 3);
        assert!(report.stalled);
        for i in 0..report.frames {
            let blob = &out[i * program.blob_size()..];
            assert!((read_f64(blob, &elements[0]) - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_respects_output_capacity() {
        let (mut w, r) = ring(32);
        for i in 0..20 {
            w.write(&displayed(i)).expect("write");
        }
        let mut elements = vec![QueryElement::new(Metric::CpuStartQpc)];
        let program = QueryCompiler::compile(&mut elements).expect("compile");
        let mut res = FrameContextResolver::for_reader(&r);
        let mut ctx = MetricContext::new(FREQ, r.start_qpc());

        let mut out = vec![0u8; program.blob_size() * 4];
        let first = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).expect("consume");
        assert_eq!(first.frames, 4);
        assert!(!first.stalled);
        let last_qpc = read_value(&out[3 * program.blob_size()..], &elements[0]);

        let second = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).expect("consume");
        assert_eq!(second.frames, 4);
        let next_qpc = read_value(&out, &elements[0]);
        match (last_qpc, next_qpc) {
            (Value::U64(a), Value::U64(b)) => assert_eq!(b - a, 10 * MS),
            other => panic!("unexpected values {other:?}"),
        }
    }

    #[test]
    fn test_backpressured_ring_emits_after_retiring_slots() {
        let (mut w, r) = ring::create(RingOptions {
            name: "consume-bp".to_string(),
            capacity: 4,
            qpc_frequency: FREQ,
            flags: PlaybackFlags {
                is_playback: true,
                backpressured: true,
                ..PlaybackFlags::default()
            },
        })
        .expect("ring");
        let mut elements = vec![QueryElement::new(Metric::CpuStartQpc)];
        let program = QueryCompiler::compile(&mut elements).expect("compile");
        let mut res = FrameContextResolver::for_reader(&r);
        let mut out = vec![0u8; program.blob_size() * 8];

        let mut next_id = 0;
        for _ in 0..4 {
            w.write(&displayed(next_id)).expect("write");
            next_id += 1;
        }
        let mut ctx = MetricContext::new(FREQ, r.start_qpc());

        let first = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).expect("consume");
        assert_eq!(first.skipped, 1);
        assert_eq!(first.frames, 2);
        assert_eq!(r.len(), 1);

        // Refill the retired slots; every further present has history.
        for _ in 0..3 {
            w.write(&displayed(next_id)).expect("write");
            next_id += 1;
        }
        let second = consume_frame_events(&r, &mut res, &mut ctx, &program, &mut out).expect("consume");
        assert_eq!(second.skipped, 0);
        assert_eq!(second.frames, 3);
        let Value::U64(qpc) = read_value(&out, &elements[0]) else {
            panic!("cpu_start_qpc is not u64");
        };
        // Frame 3's CPU start is the end of frame 2, a slot already retired.
        assert_eq!(qpc, displayed(2).present.present_start_time + MS);
    }
}
