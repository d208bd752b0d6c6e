use std::alloc::System;
use std::hint::black_box;

use frametap::consume::consume_frame_events;
use frametap::context::MetricContext;
use frametap::query::metric::Metric;
use frametap::query::{GatherProgram, QueryCompiler, QueryElement};
use frametap::resolver::{AnchorMode, FrameContextResolver, ResolvedFrames, Step};
use frametap::ring::{self, PlaybackFlags, RingOptions, RingReader, RingWriter, RECORD_SIZE};
use frametap::synth::{FrameGenerator, FrameParams};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

const FREQ: u64 = 10_000_000;

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn filled_ring(capacity: usize, frames: usize, generated: u32) -> (RingWriter, RingReader, FrameGenerator) {
    let (mut w, r) = ring::create(RingOptions {
        name: "alloc-test".to_string(),
        capacity,
        qpc_frequency: FREQ,
        flags: PlaybackFlags {
            reset_oldest: true,
            ..PlaybackFlags::default()
        },
    })
    .expect("ring");

    let mut gen = FrameGenerator::new(
        FrameParams {
            percent_dropped: 10.0,
            generated_frames: generated,
            ..FrameParams::default()
        },
        FREQ,
        1_000,
    );
    for _ in 0..frames {
        w.write(&gen.next_frame()).expect("write");
    }
    (w, r, gen)
}

fn wide_program() -> GatherProgram {
    let mut elements = [
        QueryElement::new(Metric::Application),
        QueryElement::new(Metric::FrameType),
        QueryElement::new(Metric::CpuStartQpc),
        QueryElement::new(Metric::CpuStartTime),
        QueryElement::new(Metric::DisplayedTime),
        QueryElement::new(Metric::UntilDisplayed),
        QueryElement::new(Metric::AnimationError),
        QueryElement::new(Metric::AllowsTearing),
        QueryElement::new(Metric::GpuPower),
        QueryElement::new(Metric::GpuFanSpeed).index(2),
        QueryElement::new(Metric::GpuMemUsed),
        QueryElement::new(Metric::DroppedFrames),
    ];
    QueryCompiler::compile(&mut elements).expect("compile")
}

/// A context loaded with one resolved present, ready to gather.
fn prepared_context(reader: &RingReader) -> MetricContext {
    let mut resolver = FrameContextResolver::new(AnchorMode::Oldest);
    let mut resolved = ResolvedFrames::default();
    let mut ctx = MetricContext::new(reader.qpc_frequency(), reader.start_qpc());

    loop {
        match resolver.consume_next(reader, &mut resolved).expect("consume") {
            Step::Ready if resolved.back.has_required() => break,
            Step::Ready => continue,
            other => panic!("ring too short to prepare a context: {other:?}"),
        }
    }

    ctx.begin_present(&mut resolved);
    ctx.select_display(0);
    ctx
}

#[test]
#[serial]
fn ring_read_slot_allocates_zero() {
    let (_w, r, _gen) = filled_ring(64, 100, 0);
    let mut slot = [0u8; RECORD_SIZE];

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for idx in 0..r.capacity() {
            r.read_slot(idx, true, &mut slot).expect("read slot");
            black_box(&slot);
        }
    });

    assert_eq!(allocations, 0, "read_slot allocated {allocations} times");
    assert_eq!(deallocations, 0);
}

#[test]
#[serial]
fn ring_read_allocates_zero() {
    let (_w, r, _gen) = filled_ring(64, 100, 2);

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        for idx in 0..r.capacity() {
            black_box(r.read(idx, true).expect("read"));
        }
    });

    assert_eq!(allocations, 0, "read allocated {allocations} times");
}

#[test]
#[serial]
fn gather_to_blob_allocates_zero() {
    let (_w, r, _gen) = filled_ring(64, 32, 1);
    let program = wide_program();
    let ctx = prepared_context(&r);
    let mut blob = vec![0u8; program.blob_size()];

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..1_000 {
            program.gather_to_blob(&ctx, &mut blob);
            black_box(&blob);
        }
    });

    assert_eq!(allocations, 0, "gather allocated {allocations} times");
    assert_eq!(deallocations, 0);
}

#[test]
#[serial]
fn steady_state_consume_allocation_budget() {
    let (mut w, r, mut gen) = filled_ring(512, 64, 1);
    let program = wide_program();
    let mut resolver = FrameContextResolver::new(AnchorMode::Oldest);
    let mut ctx = MetricContext::new(r.qpc_frequency(), r.start_qpc());
    let mut out = vec![0u8; program.blob_size() * 256];

    // Warm-up sizes the context's internal tables.
    consume_frame_events(&r, &mut resolver, &mut ctx, &program, &mut out).expect("warm-up");

    let (frames, allocations, _deallocations) = measure_alloc_counts(|| {
        let mut frames = 0;
        for _ in 0..8 {
            for _ in 0..32 {
                w.write(&gen.next_frame()).expect("write");
            }
            let report =
                consume_frame_events(&r, &mut resolver, &mut ctx, &program, &mut out).expect("consume");
            frames += report.frames;
            black_box(&out);
        }
        frames
    });

    assert!(frames > 200, "expected a steady stream of blobs, got {frames}");
    assert!(
        allocations <= 8,
        "steady-state consume allocation budget exceeded: {}",
        allocations
    );
}
