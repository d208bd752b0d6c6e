//! Per-metric gather strategies.
//!
//! Every frame-event metric maps to one [`GatherKind`]. Evaluation reads a
//! [`MetricContext`] and never fails: undefined floating values come back as
//! NaN, undefined counters and flags as zero.

use crate::context::MetricContext;
use crate::ring::record::FrameType;

use super::metric::Metric;

/// A single typed value ready to be written into a blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    F64(f64),
    U64(u64),
    U32(u32),
    I32(i32),
    Enum(u32),
    Bool(bool),
    Char(u8),
}

impl Value {
    /// Write little-endian at the start of `out`.
    #[inline]
    pub fn write_le(self, out: &mut [u8]) {
        match self {
            Value::F64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
            Value::U32(v) | Value::Enum(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Value::Bool(v) => out[0] = u8::from(v),
            Value::Char(v) => out[0] = v,
        }
    }

    /// Numeric view used by statistics.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::F64(v) => v,
            Value::U64(v) => v as f64,
            Value::U32(v) | Value::Enum(v) => f64::from(v),
            Value::I32(v) => f64::from(v),
            Value::Bool(v) => f64::from(u8::from(v)),
            Value::Char(v) => f64::from(v),
        }
    }
}

/// Base duration fields that have a frame-generation override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationField {
    CpuWait,
    GpuBusy,
    VideoBusy,
}

/// Which input timestamp an input-to-photon metric starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Click,
    AllInput,
}

/// Closed set of gather strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherKind {
    /// Verbatim copy of one record field or array element.
    Copy { metric: Metric, index: usize },
    /// One byte of the application name.
    ApplicationChar { index: usize },
    FrameType,
    QpcDuration(DurationField),
    CpuStartQpc,
    CpuStartTime,
    CpuBusy,
    CpuFrameTime,
    GpuLatency,
    GpuWait,
    GpuTime,
    BetweenPresents,
    UntilDisplayed,
    BetweenDisplayChange,
    DisplayLatency,
    DisplayedTime,
    RenderPresentLatency,
    FlipDelay,
    Dropped,
    BetweenSimulationStart,
    AnimationError,
    AnimationTime,
    PcLatency,
    InputToPhoton(InputSource),
    InstrumentedLatency,
}

impl GatherKind {
    /// Strategy for `metric`, `None` for metrics that only exist as polled
    /// statistics.
    pub fn for_metric(metric: Metric, array_index: usize) -> Option<Self> {
        use Metric as M;

        let kind = match metric {
            M::Application => Self::ApplicationChar { index: array_index },
            M::FrameType => Self::FrameType,
            M::CpuWait => Self::QpcDuration(DurationField::CpuWait),
            M::GpuBusy => Self::QpcDuration(DurationField::GpuBusy),
            M::VideoBusy => Self::QpcDuration(DurationField::VideoBusy),
            M::CpuStartQpc => Self::CpuStartQpc,
            M::CpuStartTime => Self::CpuStartTime,
            M::CpuBusy => Self::CpuBusy,
            M::CpuFrameTime => Self::CpuFrameTime,
            M::GpuLatency => Self::GpuLatency,
            M::GpuWait => Self::GpuWait,
            M::GpuTime => Self::GpuTime,
            M::BetweenPresents => Self::BetweenPresents,
            M::UntilDisplayed => Self::UntilDisplayed,
            M::BetweenDisplayChange => Self::BetweenDisplayChange,
            M::DisplayLatency => Self::DisplayLatency,
            M::DisplayedTime => Self::DisplayedTime,
            M::RenderPresentLatency => Self::RenderPresentLatency,
            M::FlipDelay => Self::FlipDelay,
            M::DroppedFrames => Self::Dropped,
            M::BetweenSimulationStart => Self::BetweenSimulationStart,
            M::AnimationError => Self::AnimationError,
            M::AnimationTime => Self::AnimationTime,
            M::PcLatency => Self::PcLatency,
            M::ClickToPhotonLatency => Self::InputToPhoton(InputSource::Click),
            M::AllInputToPhotonLatency => Self::InputToPhoton(InputSource::AllInput),
            M::InstrumentedLatency => Self::InstrumentedLatency,
            M::PresentedFps | M::DisplayedFps | M::ApplicationFps | M::PercentDroppedFrames => {
                return None
            }
            _ => Self::Copy {
                metric,
                index: array_index,
            },
        };

        Some(kind)
    }

    /// Compute the value for the context's current display entry.
    pub fn evaluate(self, ctx: &MetricContext) -> Value {
        let frames = &ctx.frames;
        let cur = &frames.current.present;
        let at_app = ctx.display_index == ctx.app_index;

        match self {
            Self::Copy { metric, index } => copy_field(ctx, metric, index),

            Self::ApplicationChar { index } => {
                Value::Char(cur.application.get(index).copied().unwrap_or(0))
            }

            Self::FrameType => {
                let t = if cur.displayed_count == 0 {
                    FrameType::Application
                } else {
                    match cur.displayed_frame_type[ctx.display_index] {
                        FrameType::NotSet | FrameType::Repeated => FrameType::Application,
                        t => t,
                    }
                };
                Value::Enum(t as u32)
            }

            Self::QpcDuration(field) => {
                if !at_app {
                    return Value::F64(0.0);
                }
                let (base, propagated) = match field {
                    DurationField::CpuWait => {
                        (cur.time_in_present, cur.app_propagated_time_in_present)
                    }
                    DurationField::GpuBusy => (cur.gpu_duration, cur.app_propagated_gpu_duration),
                    DurationField::VideoBusy => {
                        (cur.gpu_video_duration, cur.app_propagated_gpu_video_duration)
                    }
                };
                let ticks = if propagated != 0 { propagated } else { base };
                Value::F64(ctx.ms(ticks))
            }

            Self::CpuStartQpc => Value::U64(ctx.cpu_start),

            Self::CpuStartTime => {
                Value::F64(ctx.ms(cur.present_start_time.saturating_sub(ctx.qpc_start)))
            }

            Self::CpuBusy => app_gated(at_app, || {
                ctx.delta_ms(ctx.cpu_start, propagated_or(cur.app_propagated_present_start_time, cur.present_start_time))
            }),

            Self::GpuLatency => app_gated(at_app, || {
                ctx.delta_ms(ctx.cpu_start, propagated_or(cur.app_propagated_gpu_start_time, cur.gpu_start_time))
            }),

            Self::CpuFrameTime => app_gated(at_app, || {
                ctx.unsigned_ms(ctx.cpu_start, cur.present_start_time) + ctx.ms(cur.time_in_present)
            }),

            Self::GpuWait => app_gated(at_app, || gpu_wait(ctx)),

            Self::GpuTime => app_gated(at_app, || ctx.ms(cur.gpu_duration) + gpu_wait(ctx)),

            Self::BetweenPresents => Value::F64(
                frames
                    .back
                    .last_presented
                    .as_ref()
                    .map(|last| ctx.delta_ms(last.present.present_start_time, cur.present_start_time))
                    .unwrap_or(f64::NAN),
            ),

            Self::UntilDisplayed => {
                displayed_only(ctx, || ctx.delta_ms(cur.present_start_time, ctx.screen_time))
            }

            Self::BetweenDisplayChange => {
                displayed_only(ctx, || ctx.delta_ms(ctx.prev_screen_time, ctx.screen_time))
            }

            Self::DisplayLatency => {
                displayed_only(ctx, || ctx.delta_ms(ctx.cpu_start, ctx.screen_time))
            }

            Self::DisplayedTime => displayed_only(ctx, || {
                nan_if_zero(ctx.unsigned_ms(ctx.screen_time, ctx.next_screen_time))
            }),

            Self::RenderPresentLatency => Value::F64(if cur.ready_time == 0 {
                f64::NAN
            } else {
                ctx.signed_ms(cur.present_start_time, cur.ready_time)
            }),

            Self::FlipDelay => displayed_only(ctx, || ctx.ms(ctx.flip_delay)),

            Self::Dropped => Value::Bool(ctx.dropped),

            Self::BetweenSimulationStart => {
                if !at_app {
                    return Value::F64(0.0);
                }
                let sim = propagated_or(cur.pcl_sim_start_time, cur.app_sim_start_time);
                Value::F64(if sim == 0 {
                    f64::NAN
                } else {
                    ctx.delta_ms(ctx.last_sim_start, sim)
                })
            }

            Self::AnimationError => {
                if ctx.dropped || !at_app {
                    return Value::F64(f64::NAN);
                }
                let prev_sim = ctx.anim_prev_sim_start;
                let sim = ctx.anim_sim_start;
                // A simulation start that does not move forward marks a
                // source transition, not a real error.
                if prev_sim == 0 || sim == 0 || sim <= prev_sim || ctx.anim_prev_screen == 0 {
                    return Value::F64(f64::NAN);
                }
                Value::F64(
                    ctx.signed_ms(ctx.anim_prev_screen, ctx.screen_time)
                        - ctx.signed_ms(prev_sim, sim),
                )
            }

            Self::AnimationTime => {
                if ctx.dropped || !at_app {
                    return Value::F64(f64::NAN);
                }
                Value::F64(ctx.unsigned_ms(ctx.first_sim_start, ctx.anim_sim_start))
            }

            Self::PcLatency => displayed_only(ctx, || {
                let sim = propagated_or(cur.pcl_sim_start_time, ctx.last_sim_start);
                if ctx.pcl_input_ema == 0.0 || sim == 0 {
                    f64::NAN
                } else {
                    ctx.pcl_input_ema + ctx.signed_ms(sim, ctx.screen_time)
                }
            }),

            Self::InputToPhoton(source) => {
                if ctx.dropped || !at_app {
                    return Value::F64(f64::NAN);
                }
                let from = match source {
                    InputSource::Click => ctx.click_source,
                    InputSource::AllInput => ctx.input_source,
                };
                Value::F64(nan_if_zero(ctx.unsigned_ms(from, ctx.screen_time)))
            }

            Self::InstrumentedLatency => displayed_only(ctx, || {
                let start = propagated_or(cur.app_sleep_end_time, cur.app_sim_start_time);
                if start == 0 {
                    f64::NAN
                } else {
                    ctx.delta_ms(start, ctx.screen_time)
                }
            }),
        }
    }
}

/// `preferred` when set, otherwise `fallback`.
#[inline]
fn propagated_or(preferred: u64, fallback: u64) -> u64 {
    if preferred != 0 {
        preferred
    } else {
        fallback
    }
}

#[inline]
fn nan_if_zero(v: f64) -> f64 {
    if v == 0.0 {
        f64::NAN
    } else {
        v
    }
}

#[inline]
fn app_gated(at_app: bool, f: impl FnOnce() -> f64) -> Value {
    Value::F64(if at_app { f() } else { 0.0 })
}

#[inline]
fn displayed_only(ctx: &MetricContext, f: impl FnOnce() -> f64) -> Value {
    Value::F64(if ctx.dropped { f64::NAN } else { f() })
}

fn gpu_wait(ctx: &MetricContext) -> f64 {
    let cur = &ctx.frames.current.present;
    let span = ctx.unsigned_ms(cur.gpu_start_time, cur.ready_time);
    (span - ctx.ms(cur.gpu_duration)).max(0.0)
}

fn copy_field(ctx: &MetricContext, metric: Metric, index: usize) -> Value {
    use Metric as M;

    let p = &ctx.frames.current.present;
    let g = &ctx.frames.current.gpu;
    let c = &ctx.frames.current.cpu;

    match metric {
        M::ProcessId => Value::U32(p.process_id),
        M::SwapChainAddress => Value::U64(p.swap_chain_address),
        M::PresentRuntime => Value::Enum(p.runtime as u32),
        M::SyncInterval => Value::I32(p.sync_interval),
        M::PresentFlags => Value::U32(p.present_flags),
        M::AllowsTearing => Value::Bool(p.supports_tearing),
        M::PresentMode => Value::Enum(p.present_mode as u32),

        M::GpuPower => Value::F64(g.gpu_power_w),
        M::GpuSustainedPowerLimit => Value::F64(g.gpu_sustained_power_limit_w),
        M::GpuVoltage => Value::F64(g.gpu_voltage_v),
        M::GpuFrequency => Value::F64(g.gpu_frequency_mhz),
        M::GpuTemperature => Value::F64(g.gpu_temperature_c),
        M::GpuUtilization => Value::F64(g.gpu_utilization),
        M::GpuRenderComputeUtilization => Value::F64(g.gpu_render_compute_utilization),
        M::GpuMediaUtilization => Value::F64(g.gpu_media_utilization),
        M::GpuMemPower => Value::F64(g.vram_power_w),
        M::GpuMemVoltage => Value::F64(g.vram_voltage_v),
        M::GpuMemFrequency => Value::F64(g.vram_frequency_mhz),
        M::GpuMemEffectiveFrequency => Value::F64(g.vram_effective_frequency_gbps),
        M::GpuMemTemperature => Value::F64(g.vram_temperature_c),
        M::GpuFanSpeed => Value::F64(g.fan_speed_rpm.get(index).copied().unwrap_or(0.0)),
        M::GpuMemSize => Value::U64(g.gpu_mem_total_size_b),
        M::GpuMemUsed => Value::U64(g.gpu_mem_used_b),
        M::GpuMemMaxBandwidth => Value::U64(g.gpu_mem_max_bandwidth_bps),
        M::GpuMemWriteBandwidth => Value::F64(g.gpu_mem_write_bandwidth_bps),
        M::GpuMemReadBandwidth => Value::F64(g.gpu_mem_read_bandwidth_bps),
        M::GpuPowerLimited => Value::Bool(g.gpu_power_limited),
        M::GpuTemperatureLimited => Value::Bool(g.gpu_temperature_limited),
        M::GpuCurrentLimited => Value::Bool(g.gpu_current_limited),
        M::GpuVoltageLimited => Value::Bool(g.gpu_voltage_limited),
        M::GpuUtilizationLimited => Value::Bool(g.gpu_utilization_limited),
        M::GpuMemPowerLimited => Value::Bool(g.vram_power_limited),
        M::GpuMemTemperatureLimited => Value::Bool(g.vram_temperature_limited),
        M::GpuMemCurrentLimited => Value::Bool(g.vram_current_limited),
        M::GpuMemVoltageLimited => Value::Bool(g.vram_voltage_limited),
        M::GpuMemUtilizationLimited => Value::Bool(g.vram_utilization_limited),

        M::CpuUtilization => Value::F64(c.cpu_utilization),
        M::CpuPower => Value::F64(c.cpu_power_w),
        M::CpuPowerLimit => Value::F64(c.cpu_power_limit_w),
        M::CpuTemperature => Value::F64(c.cpu_temperature),
        M::CpuFrequency => Value::F64(c.cpu_frequency),

        // Computed metrics never reach the copy strategy.
        _ => match metric.data_type() {
            super::metric::DataType::F64 => Value::F64(f64::NAN),
            _ => Value::U64(0),
        },
    }
}
