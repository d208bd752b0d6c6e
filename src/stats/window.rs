//! Windowed statistics over the most recent frames of a ring.
//!
//! [`collect_window`] walks backward from the latest frame until the requested
//! span is covered, optionally ending the window at a client-supplied time
//! corrected for clock drift. [`compute_statistics`] then resolves each swap
//! chain's frames with a fresh [`MetricContext`] and reduces the samples.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::context::MetricContext;
use crate::query::gather::GatherKind;
use crate::query::metric::Metric;
use crate::query::QueryError;
use crate::resolver::resolve_slice;
use crate::ring::{FrameRecord, RingError, RingReader};

use super::{calculate_statistic, Stat};

/// Drift larger than this many QPC ticks re-baselines the client offset.
pub const DRIFT_REBASELINE_TICKS: u64 = 50_000_000;

/// Smoothed offset between the client's QPC clock and frame timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftTracker {
    delta: Option<i64>,
}

impl DriftTracker {
    /// Observe a (client, frame) pair and return the offset to use.
    ///
    /// The baseline only moves when the new offset differs from it by more
    /// than [`DRIFT_REBASELINE_TICKS`].
    pub fn update(&mut self, client_qpc: u64, frame_qpc: u64) -> i64 {
        let observed = i64::try_from(client_qpc)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(frame_qpc).unwrap_or(i64::MAX));

        let delta = match self.delta {
            Some(base) if base.abs_diff(observed) <= DRIFT_REBASELINE_TICKS => base,
            _ => observed,
        };
        self.delta = Some(delta);
        delta
    }

    pub fn baseline(&self) -> Option<i64> {
        self.delta
    }
}

/// Which part of the timeline a statistics poll covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Span of present start times to include.
    pub window: Duration,
    /// How far before the end point the window ends.
    pub offset: Duration,
    /// Client-side "now". `None` ends the window at the latest frame.
    pub client_qpc: Option<u64>,
}

impl WindowSpec {
    pub fn latest(window: Duration) -> Self {
        Self {
            window,
            offset: Duration::ZERO,
            client_qpc: None,
        }
    }
}

fn ms_to_ticks(ms: f64, qpc_frequency: u64) -> f64 {
    ms * qpc_frequency as f64 / 1000.0
}

fn ticks_to_ms(ticks: u64, qpc_frequency: u64) -> f64 {
    ticks as f64 * 1000.0 / qpc_frequency as f64
}

/// Collect the frames inside `win`, oldest first.
pub fn collect_window(
    reader: &RingReader,
    win: &WindowSpec,
    drift: &mut DriftTracker,
) -> Result<Vec<FrameRecord>, RingError> {
    let Some(latest) = reader.latest_frame_index()? else {
        return Ok(Vec::new());
    };

    let freq = reader.qpc_frequency();
    let capacity = reader.capacity();
    let head = reader.head_idx();
    let latest_start = reader.read(latest, true)?.present.present_start_time;

    let mut window_ms = win.window.as_secs_f64() * 1000.0;
    let mut idx = latest;
    let mut start_qpc = latest_start;

    if let Some(client_qpc) = win.client_qpc {
        let delta = drift.update(client_qpc, latest_start);
        let offset_ticks = ms_to_ticks(win.offset.as_secs_f64() * 1000.0, freq) as i64;
        let adjusted = (client_qpc as i64).saturating_sub(delta.saturating_add(offset_ticks));
        let adjusted = adjusted.max(0) as u64;

        if adjusted > latest_start {
            window_ms -= ticks_to_ms(adjusted - latest_start, freq);
            if window_ms <= 0.0 {
                return Ok(Vec::new());
            }
        } else {
            // Walk back to the newest frame at or before the end point.
            loop {
                let rec = reader.read(idx, true)?;
                if rec.present.present_start_time <= adjusted {
                    start_qpc = rec.present.present_start_time;
                    break;
                }
                if idx == head {
                    return Ok(Vec::new());
                }
                idx = (idx + capacity - 1) % capacity;
            }
        }
    }

    let mut frames = Vec::new();
    loop {
        let rec = reader.read(idx, true)?;
        let age = ticks_to_ms(start_qpc.saturating_sub(rec.present.present_start_time), freq);
        if age > window_ms {
            break;
        }
        frames.push(rec);
        if idx == head || frames.len() >= reader.len() {
            break;
        }
        idx = (idx + capacity - 1) % capacity;
    }

    frames.reverse();
    Ok(frames)
}

/// One statistic to compute per swap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRequest {
    pub metric: Metric,
    pub stat: Stat,
    pub array_index: u32,
}

impl StatRequest {
    pub fn new(metric: Metric, stat: Stat) -> Self {
        Self {
            metric,
            stat,
            array_index: 0,
        }
    }

    pub fn index(mut self, array_index: u32) -> Self {
        self.array_index = array_index;
        self
    }
}

/// Results for one swap chain, parallel to the request list.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SwapChainStats {
    pub swap_chain_address: u64,
    pub values: Vec<f64>,
}

/// How a requested metric is sampled and post-processed.
#[derive(Debug, Clone, Copy)]
struct Plan {
    kind: GatherKind,
    app_only: bool,
    invert: bool,
    post: Post,
}

#[derive(Debug, Clone, Copy)]
enum Post {
    Identity,
    /// 1000 / frame time in ms.
    Rate,
    Percent,
}

fn plan(req: &StatRequest) -> Result<Plan, QueryError> {
    let (base, invert, post) = match req.metric {
        Metric::PresentedFps => (Metric::BetweenPresents, true, Post::Rate),
        Metric::DisplayedFps => (Metric::BetweenDisplayChange, true, Post::Rate),
        Metric::ApplicationFps => (Metric::CpuFrameTime, false, Post::Rate),
        Metric::PercentDroppedFrames => (Metric::DroppedFrames, false, Post::Percent),
        m => (m, false, Post::Identity),
    };

    let len = base.array_len();
    if req.array_index as usize >= len {
        return Err(QueryError::ArrayIndexOutOfRange {
            metric: req.metric,
            index: req.array_index,
            len,
        });
    }

    let kind = GatherKind::for_metric(base, req.array_index as usize)
        .ok_or(QueryError::NotFrameEvent { metric: base })?;

    Ok(Plan {
        kind,
        app_only: base.is_app_attributed(),
        invert,
        post,
    })
}

/// Validate a request list before polling.
pub fn validate_requests(requests: &[StatRequest]) -> Result<(), QueryError> {
    requests.iter().try_for_each(|r| plan(r).map(|_| ()))
}

/// Reduce `frames` (oldest first) into per-swap-chain statistics.
pub fn compute_statistics(
    frames: &[FrameRecord],
    requests: &[StatRequest],
    qpc_frequency: u64,
    qpc_start: u64,
) -> Result<Vec<SwapChainStats>, QueryError> {
    let plans = requests.iter().map(plan).collect::<Result<Vec<_>, _>>()?;

    let mut chains: BTreeMap<u64, Vec<FrameRecord>> = BTreeMap::new();
    for f in frames {
        chains
            .entry(f.present.swap_chain_address)
            .or_default()
            .push(f.clone());
    }

    let mut out = Vec::with_capacity(chains.len());
    for (address, chain) in chains {
        let mut samples: Vec<Vec<f64>> = vec![Vec::new(); plans.len()];
        let mut ctx = MetricContext::new(qpc_frequency, qpc_start);

        resolve_slice(&chain, |resolved| {
            let mut scratch = resolved.clone();
            ctx.begin_present(&mut scratch);

            for i in 0..ctx.display_count() {
                ctx.select_display(i);
                let at_app = ctx.display_index() == ctx.app_index();
                for (plan, series) in plans.iter().zip(samples.iter_mut()) {
                    if plan.app_only && !at_app {
                        continue;
                    }
                    let v = plan.kind.evaluate(&ctx).as_f64();
                    if !v.is_nan() {
                        series.push(v);
                    }
                }
            }

            ctx.end_present();
        });

        let values = plans
            .iter()
            .zip(requests)
            .zip(&samples)
            .map(|((plan, req), series)| {
                let v = calculate_statistic(series, req.stat, plan.invert);
                match plan.post {
                    Post::Identity => v,
                    Post::Rate if v > 0.0 => 1000.0 / v,
                    Post::Rate => 0.0,
                    Post::Percent => v * 100.0,
                }
            })
            .collect();

        out.push(SwapChainStats {
            swap_chain_address: address,
            values,
        });
    }

    Ok(out)
}
