//! Cross-frame metric state for one (query, process) pair.
//!
//! A [`MetricContext`] is fed one resolved present at a time. It derives the
//! per-present quantities every gather command reads (CPU start, effective
//! screen times, input sources) and carries state that outlives the ring:
//! simulation start history, the PC-latency input average, the animation
//! source and the flip-delay correction table.

use std::collections::HashMap;

use crate::resolver::ResolvedFrames;
use crate::ring::record::PresentEvent;

/// Smoothing factor of the input-to-simulation-start average.
const PCL_EMA_ALPHA: f64 = 0.1;

/// Timestamp family used as "simulation start" by animation metrics.
///
/// Starts at `CpuStart` and moves to a provider source at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationErrorSource {
    #[default]
    CpuStart,
    AppProvider,
    PcLatency,
}

/// Correction recorded for a present whose flip was collapsed into an
/// earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipDelayEntry {
    pub flip_delay: u64,
    pub screen_time: u64,
}

/// Mutable state shared by all gather commands of one query on one process.
#[derive(Debug, Clone)]
pub struct MetricContext {
    pub(crate) period_ms: f64,
    pub(crate) qpc_start: u64,

    // Current present, rebuilt by `begin_present`.
    pub(crate) frames: ResolvedFrames,
    pub(crate) dropped: bool,
    pub(crate) app_index: usize,
    pub(crate) cpu_start: u64,
    pub(crate) click_source: u64,
    pub(crate) input_source: u64,
    pub(crate) anim_sim_start: u64,
    pub(crate) anim_prev_sim_start: u64,
    pub(crate) anim_prev_screen: u64,

    // Current display entry, rebuilt by `select_display`.
    pub(crate) display_index: usize,
    pub(crate) screen_time: u64,
    pub(crate) next_screen_time: u64,
    pub(crate) prev_screen_time: u64,
    pub(crate) flip_delay: u64,

    // Carried across presents and polls.
    pub(crate) last_sim_start: u64,
    pub(crate) first_sim_start: u64,
    pub(crate) animation_source: AnimationErrorSource,
    pub(crate) pcl_input_ema: f64,
    last_nd_click: u64,
    last_nd_all_input: u64,
    pcl_accumulated_ms: f64,
    last_nd_pcl_sim: u64,
    flip_table: HashMap<u32, FlipDelayEntry>,
    last_displayed_frame_id: Option<u32>,
}

impl MetricContext {
    /// `qpc_start` anchors `CpuStartTime`; pass the ring's first-frame time.
    pub fn new(qpc_frequency: u64, qpc_start: u64) -> Self {
        Self {
            period_ms: if qpc_frequency == 0 {
                0.0
            } else {
                1000.0 / qpc_frequency as f64
            },
            qpc_start,
            frames: ResolvedFrames::default(),
            dropped: false,
            app_index: 0,
            cpu_start: 0,
            click_source: 0,
            input_source: 0,
            anim_sim_start: 0,
            anim_prev_sim_start: 0,
            anim_prev_screen: 0,
            display_index: 0,
            screen_time: 0,
            next_screen_time: 0,
            prev_screen_time: 0,
            flip_delay: 0,
            last_sim_start: 0,
            first_sim_start: 0,
            animation_source: AnimationErrorSource::CpuStart,
            pcl_input_ema: 0.0,
            last_nd_click: 0,
            last_nd_all_input: 0,
            pcl_accumulated_ms: 0.0,
            last_nd_pcl_sim: 0,
            flip_table: HashMap::new(),
            last_displayed_frame_id: None,
        }
    }

    /// Load the next resolved present. `resolved` receives the previous one,
    /// so callers can keep reusing the same buffer.
    pub fn begin_present(&mut self, resolved: &mut ResolvedFrames) {
        std::mem::swap(&mut self.frames, resolved);

        let cur = &self.frames.current.present;
        let dropped = cur.is_dropped();
        let click = cur.mouse_click_time;
        let input = cur.input_time;
        let pcl_input = cur.pcl_input_ping_time;
        let pcl_sim = cur.pcl_sim_start_time;

        self.dropped = dropped;
        self.app_index = cur.app_index();
        self.cpu_start = cpu_start(&self.frames);

        if dropped {
            if click != 0 {
                self.last_nd_click = click;
            }
            if input != 0 {
                self.last_nd_all_input = input;
            }
            self.click_source = 0;
            self.input_source = 0;
            self.accumulate_dropped_pcl(pcl_input, pcl_sim);
        } else {
            self.click_source = if click != 0 { click } else { self.last_nd_click };
            self.input_source = if input != 0 { input } else { self.last_nd_all_input };
            self.last_nd_click = 0;
            self.last_nd_all_input = 0;
            self.update_pcl_average(pcl_input, pcl_sim);
        }

        self.resolve_animation_refs();
        self.select_display(0);
    }

    /// Number of blobs this present produces: one per display entry, or one
    /// for a dropped present.
    pub fn display_count(&self) -> usize {
        if self.dropped {
            1
        } else {
            self.frames.current.present.displayed_len().max(1)
        }
    }

    /// Point the context at display entry `index` of the current present.
    pub fn select_display(&mut self, index: usize) {
        self.display_index = index;

        if self.dropped {
            self.screen_time = 0;
            self.next_screen_time = 0;
            self.prev_screen_time = 0;
            self.flip_delay = 0;
            return;
        }

        let cur = &self.frames.current.present;
        let len = cur.displayed_len();
        let screen = corrected_screen(&self.flip_table, cur, index);

        self.prev_screen_time = if index > 0 {
            cur.displayed_screen_time[index - 1]
        } else {
            self.frames
                .back
                .last_displayed
                .as_ref()
                .map(|r| corrected_last_screen(&self.flip_table, &r.present))
                .unwrap_or(0)
        };

        self.next_screen_time = if index + 1 < len {
            cur.displayed_screen_time[index + 1]
        } else {
            let next = &self.frames.next_displayed.present;
            let mut next_screen = corrected_screen(&self.flip_table, next, 0);
            // Collapsed present: the next frame cannot reach the screen
            // before this one, so it inherits this screen time and the
            // difference is folded into its flip delay.
            if cur.flip_delay != 0 && next_screen != 0 && screen > next_screen {
                self.flip_table.insert(
                    next.frame_id,
                    FlipDelayEntry {
                        flip_delay: next.flip_delay + (screen - next_screen),
                        screen_time: screen,
                    },
                );
                next_screen = screen;
            }
            next_screen
        };

        self.flip_delay = self
            .flip_table
            .get(&cur.frame_id)
            .map(|e| e.flip_delay)
            .unwrap_or(cur.flip_delay);
        self.screen_time = screen;
    }

    /// Fold the current present into the carried state. Call once after all
    /// of its display entries have been gathered.
    pub fn end_present(&mut self) {
        let cur = &self.frames.current.present;
        let app_sim = cur.app_sim_start_time;
        let pcl_sim = cur.pcl_sim_start_time;
        let frame_id = cur.frame_id;

        let sim = if pcl_sim != 0 { pcl_sim } else { app_sim };
        if sim != 0 {
            self.last_sim_start = sim;
        }
        if !self.dropped {
            self.last_displayed_frame_id = Some(frame_id);
        }

        if self.animation_source == AnimationErrorSource::CpuStart {
            if app_sim != 0 {
                self.animation_source = AnimationErrorSource::AppProvider;
                self.first_sim_start = app_sim;
            } else if pcl_sim != 0 {
                self.animation_source = AnimationErrorSource::PcLatency;
                self.first_sim_start = pcl_sim;
            }
        }
        if self.first_sim_start == 0 {
            self.first_sim_start = self.anim_sim_start;
        }
    }

    /// Drop flip corrections for frames older than the last displayed one.
    pub fn prune_flip_table(&mut self) {
        if let Some(last) = self.last_displayed_frame_id {
            self.flip_table.retain(|&id, _| id >= last);
        }
    }

    pub fn animation_source(&self) -> AnimationErrorSource {
        self.animation_source
    }

    /// Current input-to-simulation-start average in milliseconds, 0 if unset.
    pub fn pcl_input_average(&self) -> f64 {
        self.pcl_input_ema
    }

    pub fn flip_correction(&self, frame_id: u32) -> Option<FlipDelayEntry> {
        self.flip_table.get(&frame_id).copied()
    }

    pub fn flip_table_len(&self) -> usize {
        self.flip_table.len()
    }

    /// The present currently loaded.
    pub fn current(&self) -> &PresentEvent {
        &self.frames.current.present
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub fn display_index(&self) -> usize {
        self.display_index
    }

    pub fn app_index(&self) -> usize {
        self.app_index
    }

    #[inline]
    pub(crate) fn ms(&self, ticks: u64) -> f64 {
        ticks as f64 * self.period_ms
    }

    /// Unsigned delta, 0 when `from` is unset or not before `to`.
    #[inline]
    pub(crate) fn unsigned_ms(&self, from: u64, to: u64) -> f64 {
        if from == 0 || to <= from {
            0.0
        } else {
            self.ms(to - from)
        }
    }

    /// Signed delta, 0 when either side is unset.
    #[inline]
    pub(crate) fn signed_ms(&self, from: u64, to: u64) -> f64 {
        if from == 0 || to == 0 || from == to {
            0.0
        } else if to > from {
            self.ms(to - from)
        } else {
            -self.ms(from - to)
        }
    }

    /// Strict delta, NaN when undefined.
    #[inline]
    pub(crate) fn delta_ms(&self, from: u64, to: u64) -> f64 {
        if from == 0 || to == 0 || to <= from {
            f64::NAN
        } else {
            self.ms(to - from)
        }
    }

    fn feed_pcl_average(&mut self, sample_ms: f64) {
        self.pcl_input_ema = if self.pcl_input_ema == 0.0 {
            sample_ms
        } else {
            PCL_EMA_ALPHA * sample_ms + (1.0 - PCL_EMA_ALPHA) * self.pcl_input_ema
        };
    }

    fn accumulate_dropped_pcl(&mut self, pcl_input: u64, pcl_sim: u64) {
        if pcl_sim == 0 {
            return;
        }
        if pcl_input != 0 {
            self.pcl_accumulated_ms = self.unsigned_ms(pcl_input, pcl_sim);
        } else if self.pcl_accumulated_ms != 0.0 {
            self.pcl_accumulated_ms += self.unsigned_ms(self.last_nd_pcl_sim, pcl_sim);
        }
        self.last_nd_pcl_sim = pcl_sim;
    }

    fn update_pcl_average(&mut self, pcl_input: u64, pcl_sim: u64) {
        if pcl_sim == 0 {
            return;
        }
        if pcl_input != 0 {
            let sample = self.unsigned_ms(pcl_input, pcl_sim);
            self.feed_pcl_average(sample);
        } else if self.pcl_accumulated_ms != 0.0 {
            let sample =
                self.pcl_accumulated_ms + self.unsigned_ms(self.last_nd_pcl_sim, pcl_sim);
            self.feed_pcl_average(sample);
        }
        self.pcl_accumulated_ms = 0.0;
        self.last_nd_pcl_sim = 0;
    }

    fn resolve_animation_refs(&mut self) {
        let cur = &self.frames.current.present;
        let back = &self.frames.back;

        self.anim_sim_start = match self.animation_source {
            AnimationErrorSource::CpuStart => self.cpu_start,
            AnimationErrorSource::AppProvider => cur.app_sim_start_time,
            AnimationErrorSource::PcLatency => cur.pcl_sim_start_time,
        };

        self.anim_prev_sim_start = match self.animation_source {
            AnimationErrorSource::CpuStart => back
                .prev_app_before_last_app_displayed
                .as_ref()
                .map(|r| cpu_end(&r.present))
                .unwrap_or(0),
            AnimationErrorSource::AppProvider => back
                .last_app_displayed
                .as_ref()
                .map(|r| r.present.app_sim_start_time)
                .unwrap_or(0),
            AnimationErrorSource::PcLatency => back
                .last_app_displayed
                .as_ref()
                .map(|r| r.present.pcl_sim_start_time)
                .unwrap_or(0),
        };

        self.anim_prev_screen = back
            .last_app_displayed
            .as_ref()
            .map(|r| corrected_last_screen(&self.flip_table, &r.present))
            .unwrap_or(0);
    }
}

/// End of the CPU portion of a present, preferring frame-generation overrides.
fn cpu_end(p: &PresentEvent) -> u64 {
    if p.app_propagated_present_start_time != 0 {
        p.app_propagated_present_start_time + p.app_propagated_time_in_present
    } else {
        p.present_start_time + p.time_in_present
    }
}

fn cpu_start(frames: &ResolvedFrames) -> u64 {
    if let Some(app) = &frames.back.last_app_presented {
        cpu_end(&app.present)
    } else if let Some(last) = &frames.back.last_presented {
        last.present.present_start_time + frames.current.present.time_in_present
    } else {
        0
    }
}

fn corrected_screen(table: &HashMap<u32, FlipDelayEntry>, p: &PresentEvent, index: usize) -> u64 {
    match table.get(&p.frame_id) {
        Some(entry) if index == 0 => entry.screen_time,
        _ => p.displayed_screen_time[index.min(p.displayed_screen_time.len() - 1)],
    }
}

fn corrected_last_screen(table: &HashMap<u32, FlipDelayEntry>, p: &PresentEvent) -> u64 {
    match p.displayed_len() {
        0 => 0,
        n => corrected_screen(table, p, n - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::BackReferences;
    use crate::ring::record::{FrameType, PresentResult};
    use crate::ring::FrameRecord;

    const FREQ: u64 = 10_000_000;

    fn present(id: u32, start: u64, screens: &[u64]) -> FrameRecord {
        let mut r = FrameRecord::default();
        r.present.frame_id = id;
        r.present.present_start_time = start;
        r.present.time_in_present = 10_000;
        if screens.is_empty() {
            r.present.final_state = PresentResult::Discarded;
        } else {
            r.present.final_state = PresentResult::Presented;
            r.present.displayed_count = screens.len() as u32;
            for (i, &s) in screens.iter().enumerate() {
                r.present.displayed_screen_time[i] = s;
                r.present.displayed_frame_type[i] = FrameType::Application;
            }
        }
        r
    }

    fn resolved(current: FrameRecord, next: FrameRecord, last: Option<FrameRecord>) -> ResolvedFrames {
        ResolvedFrames {
            current,
            next_displayed: next,
            back: BackReferences {
                last_presented: last.clone(),
                last_app_presented: last.clone(),
                last_displayed: last.clone(),
                last_app_displayed: last,
                prev_app_before_last_app_displayed: None,
            },
        }
    }

    #[test]
    fn test_cpu_start_uses_last_app_present() {
        let mut ctx = MetricContext::new(FREQ, 0);
        let last = present(1, 100_000, &[150_000]);
        let mut r = resolved(present(2, 200_000, &[250_000]), present(3, 300_000, &[350_000]), Some(last));
        ctx.begin_present(&mut r);
        assert_eq!(ctx.cpu_start, 110_000);
        assert_eq!(ctx.prev_screen_time, 150_000);
        assert_eq!(ctx.screen_time, 250_000);
        assert_eq!(ctx.next_screen_time, 350_000);
    }

    #[test]
    fn test_propagated_cpu_end_wins() {
        let mut last = present(1, 100_000, &[150_000]);
        last.present.app_propagated_present_start_time = 90_000;
        last.present.app_propagated_time_in_present = 5_000;
        assert_eq!(cpu_end(&last.present), 95_000);
    }

    #[test]
    fn test_dropped_click_is_carried_to_next_displayed() {
        let mut ctx = MetricContext::new(FREQ, 0);
        let mut dropped = present(2, 200_000, &[]);
        dropped.present.mouse_click_time = 180_000;
        let mut r = resolved(dropped, present(3, 300_000, &[350_000]), Some(present(1, 100_000, &[150_000])));
        ctx.begin_present(&mut r);
        ctx.end_present();
        assert_eq!(ctx.click_source, 0);

        let mut r = resolved(present(3, 300_000, &[350_000]), present(4, 400_000, &[450_000]), None);
        ctx.begin_present(&mut r);
        assert_eq!(ctx.click_source, 180_000);

        // Consumed once.
        let mut r = resolved(present(4, 400_000, &[450_000]), present(5, 500_000, &[550_000]), None);
        ctx.begin_present(&mut r);
        assert_eq!(ctx.click_source, 0);
    }

    #[test]
    fn test_pcl_average_accumulates_across_dropped_frames() {
        let mut ctx = MetricContext::new(FREQ, 0);

        let mut d = present(1, 100_000, &[]);
        d.present.pcl_input_ping_time = 90_000;
        d.present.pcl_sim_start_time = 100_000; // 1 ms after input
        let mut r = resolved(d, present(2, 0, &[1]), None);
        ctx.begin_present(&mut r);
        ctx.end_present();
        assert_eq!(ctx.pcl_input_average(), 0.0);

        let mut shown = present(2, 200_000, &[250_000]);
        shown.present.pcl_sim_start_time = 120_000; // 2 ms later
        let mut r = resolved(shown, present(3, 0, &[1]), None);
        ctx.begin_present(&mut r);
        assert!((ctx.pcl_input_average() - 3.0).abs() < 1e-9);

        let mut shown = present(3, 300_000, &[350_000]);
        shown.present.pcl_input_ping_time = 300_000;
        shown.present.pcl_sim_start_time = 310_000; // 1 ms sample
        let mut r = resolved(shown, present(4, 0, &[1]), None);
        ctx.begin_present(&mut r);
        assert!((ctx.pcl_input_average() - (0.1 * 1.0 + 0.9 * 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_animation_source_is_sticky() {
        let mut ctx = MetricContext::new(FREQ, 0);
        let mut first = present(1, 100_000, &[150_000]);
        first.present.app_sim_start_time = 95_000;
        let mut r = resolved(first, present(2, 200_000, &[250_000]), None);
        ctx.begin_present(&mut r);
        ctx.end_present();
        assert_eq!(ctx.animation_source(), AnimationErrorSource::AppProvider);
        assert_eq!(ctx.first_sim_start, 95_000);

        let mut pcl_only = present(2, 200_000, &[250_000]);
        pcl_only.present.pcl_sim_start_time = 190_000;
        let mut r = resolved(pcl_only, present(3, 300_000, &[350_000]), None);
        ctx.begin_present(&mut r);
        ctx.end_present();
        assert_eq!(ctx.animation_source(), AnimationErrorSource::AppProvider);
    }

    #[test]
    fn test_animation_error_switches_to_provider_once() {
        use crate::query::gather::{GatherKind, Value};
        use crate::resolver::resolve_slice;

        // Frames 1..=3 carry no simulation start, 4..=7 do from the app.
        let sims = [0, 0, 0, 395_000, 480_000, 470_000, 0, 0];
        let stream: Vec<FrameRecord> = sims
            .iter()
            .enumerate()
            .map(|(i, &sim)| {
                let id = i as u32 + 1;
                let start = u64::from(id) * 100_000;
                let mut r = present(id, start, &[start + 50_000]);
                r.present.app_sim_start_time = sim;
                r
            })
            .collect();

        let mut ctx = MetricContext::new(FREQ, 0);
        let mut errors = Vec::new();
        let mut sources = Vec::new();
        resolve_slice(&stream, |resolved| {
            if !resolved.back.has_required() {
                return;
            }
            let mut resolved = resolved.clone();
            ctx.begin_present(&mut resolved);
            let error = match GatherKind::AnimationError.evaluate(&ctx) {
                Value::F64(v) => v,
                other => panic!("unexpected value {other:?}"),
            };
            errors.push((ctx.current().frame_id, error));
            ctx.end_present();
            sources.push(ctx.animation_source());
        });

        let switches = sources.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
        assert_eq!(sources.last(), Some(&AnimationErrorSource::AppProvider));
        assert_eq!(ctx.first_sim_start, 395_000);

        let error = |id: u32| errors.iter().find(|(f, _)| *f == id).map(|(_, e)| *e).unwrap();
        // No earlier CPU end to measure from yet.
        assert!(error(2).is_nan());
        assert_eq!(error(3), 0.0);
        // The frame that first carries a provider sim is still timed from CPU start.
        assert_eq!(error(4), 0.0);
        // 10 ms between screens against 8.5 ms of simulation.
        assert!((error(5) - 1.5).abs() < 1e-9);
        // Simulation start moving backwards.
        assert!(error(6).is_nan());
        // Provider stays selected after a frame without a sim start.
        assert!(error(7).is_nan());
    }

    #[test]
    fn test_collapsed_present_moves_next_screen_time() {
        // Known-ambiguous path: the correction is keyed on the next frame
        // and only overrides its first display entry.
        let mut ctx = MetricContext::new(FREQ, 0);
        let mut cur = present(2, 200_000, &[400_000]);
        cur.present.flip_delay = 5_000;
        let mut next = present(3, 300_000, &[380_000]);
        next.present.flip_delay = 1_000;

        let mut r = resolved(cur, next, Some(present(1, 100_000, &[150_000])));
        ctx.begin_present(&mut r);
        assert_eq!(ctx.next_screen_time, 400_000);
        assert_eq!(
            ctx.flip_correction(3),
            Some(FlipDelayEntry {
                flip_delay: 21_000,
                screen_time: 400_000,
            })
        );
        ctx.end_present();

        let mut r = resolved(present(3, 300_000, &[380_000]), present(4, 500_000, &[550_000]), None);
        r.current.present.flip_delay = 1_000;
        ctx.begin_present(&mut r);
        assert_eq!(ctx.screen_time, 400_000);
        assert_eq!(ctx.flip_delay, 21_000);
        ctx.end_present();

        ctx.prune_flip_table();
        assert_eq!(ctx.flip_table_len(), 1);
        let mut r = resolved(present(4, 500_000, &[550_000]), present(5, 600_000, &[650_000]), None);
        ctx.begin_present(&mut r);
        ctx.end_present();
        ctx.prune_flip_table();
        assert_eq!(ctx.flip_table_len(), 0);
    }

    #[test]
    fn test_time_helpers() {
        let ctx = MetricContext::new(FREQ, 0);
        assert_eq!(ctx.unsigned_ms(0, 10_000), 0.0);
        assert_eq!(ctx.unsigned_ms(20_000, 10_000), 0.0);
        assert!((ctx.unsigned_ms(10_000, 20_000) - 1.0).abs() < 1e-12);
        assert!((ctx.signed_ms(20_000, 10_000) + 1.0).abs() < 1e-12);
        assert_eq!(ctx.signed_ms(0, 10_000), 0.0);
        assert!(ctx.delta_ms(10_000, 10_000).is_nan());
        assert!(ctx.delta_ms(0, 10_000).is_nan());
    }
}
