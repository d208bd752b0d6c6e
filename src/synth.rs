//! Deterministic synthetic frame source.
//!
//! Produces presents at a fixed cadence with an exact share of dropped frames
//! and optional frame-generation sub-frames. Used by the binary's producer
//! thread, integration tests and benches.

use crate::ring::record::{
    FrameType, PresentMode, PresentResult, Runtime, FAN_COUNT, MAX_DISPLAYED,
};
use crate::ring::{CpuTelemetryCap, FrameRecord, GpuTelemetryCap};

/// GPU telemetry fields the generator fills in.
pub const GPU_CAPS: &[GpuTelemetryCap] = &[
    GpuTelemetryCap::GpuPower,
    GpuTelemetryCap::GpuSustainedPowerLimit,
    GpuTelemetryCap::GpuVoltage,
    GpuTelemetryCap::GpuFrequency,
    GpuTelemetryCap::GpuTemperature,
    GpuTelemetryCap::GpuUtilization,
    GpuTelemetryCap::GpuRenderComputeUtilization,
    GpuTelemetryCap::VramFrequency,
    GpuTelemetryCap::VramEffectiveFrequency,
    GpuTelemetryCap::VramTemperature,
    GpuTelemetryCap::FanSpeed0,
    GpuTelemetryCap::FanSpeed1,
    GpuTelemetryCap::FanSpeed2,
    GpuTelemetryCap::FanSpeed3,
    GpuTelemetryCap::FanSpeed4,
    GpuTelemetryCap::GpuMemSize,
    GpuTelemetryCap::GpuMemUsed,
    GpuTelemetryCap::GpuMemMaxBandwidth,
];

/// CPU telemetry fields the generator fills in.
pub const CPU_CAPS: &[CpuTelemetryCap] = &[
    CpuTelemetryCap::CpuUtilization,
    CpuTelemetryCap::CpuFrequency,
];

/// Shape of the generated stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameParams {
    pub application: String,
    pub process_id: u32,
    pub swap_chain_address: u64,
    pub runtime: Runtime,
    pub present_mode: PresentMode,
    pub present_flags: u32,
    pub sync_interval: i32,
    /// Presents per second.
    pub fps: f64,
    /// Share of presents discarded, in `[0, 100]`.
    pub percent_dropped: f64,
    /// Generated sub-frames shown before each application frame.
    pub generated_frames: u32,
    pub in_present_ms: f64,
    pub until_displayed_ms: f64,
    pub gpu_active_ms: f64,
    /// Stamp application-provider simulation starts on every present.
    pub app_sim: bool,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            application: "test_app".to_string(),
            process_id: 10,
            swap_chain_address: 1,
            runtime: Runtime::D3d9,
            present_mode: PresentMode::HardwareIndependentFlip,
            present_flags: 512,
            sync_interval: 0,
            fps: 144.0,
            percent_dropped: 0.0,
            generated_frames: 0,
            in_present_ms: 1.3707,
            until_displayed_ms: 11.35,
            gpu_active_ms: 7.05,
            app_sim: false,
        }
    }
}

/// Generates consecutive [`FrameRecord`]s.
#[derive(Debug, Clone)]
pub struct FrameGenerator {
    params: FrameParams,
    ticks_per_ms: f64,
    period_ticks: f64,
    start_qpc: u64,
    index: u64,
}

impl FrameGenerator {
    /// `start_qpc` is the present start time of the first frame.
    pub fn new(params: FrameParams, qpc_frequency: u64, start_qpc: u64) -> Self {
        let ticks_per_ms = qpc_frequency as f64 / 1000.0;
        let period_ticks = if params.fps > 0.0 {
            qpc_frequency as f64 / params.fps
        } else {
            0.0
        };
        Self {
            params,
            ticks_per_ms,
            period_ticks,
            start_qpc,
            index: 0,
        }
    }

    /// QPC ticks between consecutive presents.
    pub fn period_ticks(&self) -> f64 {
        self.period_ticks
    }

    pub fn params(&self) -> &FrameParams {
        &self.params
    }

    /// Number of frames generated so far.
    pub fn generated(&self) -> u64 {
        self.index
    }

    fn ticks(&self, ms: f64) -> u64 {
        (ms * self.ticks_per_ms).round().max(0.0) as u64
    }

    /// Whether present `i` is discarded. Drops are spread evenly so any run
    /// of `n` presents holds `n * percent / 100` drops, rounded.
    fn is_dropped(&self, i: u64) -> bool {
        let p = (self.params.percent_dropped / 100.0).clamp(0.0, 1.0);
        ((i + 1) as f64 * p).floor() > (i as f64 * p).floor()
    }

    pub fn next_frame(&mut self) -> FrameRecord {
        let i = self.index;
        self.index += 1;

        let start = self.start_qpc + (i as f64 * self.period_ticks).round() as u64;
        let in_present = self.ticks(self.params.in_present_ms);
        let gpu_active = self.ticks(self.params.gpu_active_ms);

        let mut rec = FrameRecord::default();
        let p = &mut rec.present;
        p.frame_id = i as u32;
        p.process_id = self.params.process_id;
        p.swap_chain_address = self.params.swap_chain_address;
        p.runtime = self.params.runtime;
        p.present_mode = self.params.present_mode;
        p.present_flags = self.params.present_flags;
        p.sync_interval = self.params.sync_interval;
        p.set_application(&self.params.application);
        p.frame_type = FrameType::Application;

        p.present_start_time = start;
        p.time_in_present = in_present;
        p.gpu_start_time = start + in_present;
        p.gpu_duration = gpu_active;
        p.gpu_video_duration = gpu_active;
        p.ready_time = p.gpu_start_time + gpu_active;
        if self.params.app_sim {
            p.app_sim_start_time = start;
        }

        if self.is_dropped(i) {
            p.final_state = PresentResult::Discarded;
        } else {
            let generated = (self.params.generated_frames as usize).min(MAX_DISPLAYED - 1);
            let entries = generated + 1;
            let first_screen = start + self.ticks(self.params.until_displayed_ms);
            let step = self.period_ticks / entries as f64;

            p.final_state = PresentResult::Presented;
            p.displayed_count = entries as u32;
            for k in 0..entries {
                p.displayed_screen_time[k] = first_screen + (k as f64 * step).round() as u64;
                p.displayed_frame_type[k] = if k < generated {
                    FrameType::IntelXefg
                } else {
                    FrameType::Application
                };
            }
        }

        let g = &mut rec.gpu;
        g.gpu_power_w = 135.34;
        g.gpu_sustained_power_limit_w = 190.0;
        g.gpu_voltage_v = 1.032;
        g.gpu_frequency_mhz = 2400.0;
        g.gpu_temperature_c = 62.7;
        g.gpu_utilization = 98.3;
        g.gpu_render_compute_utilization = 96.4;
        g.vram_frequency_mhz = 2000.0;
        g.vram_effective_frequency_gbps = 16000.0;
        g.vram_temperature_c = 71.0;
        g.gpu_mem_total_size_b = 8_589_934_592;
        g.gpu_mem_used_b = 2_192_377_540;
        g.gpu_mem_max_bandwidth_bps = 512_000_000_000;
        g.fan_speed_rpm = [1070.2; FAN_COUNT];

        let c = &mut rec.cpu;
        c.cpu_utilization = 19.4;
        c.cpu_frequency = 4212.9;

        rec
    }

    pub fn frames(&mut self, n: usize) -> Vec<FrameRecord> {
        (0..n).map(|_| self.next_frame()).collect()
    }
}
