//! Fixed-size frame record stored in every ring slot.
//!
//! A record is encoded little-endian into exactly [`RECORD_SIZE`] bytes so the
//! ring can store it as a run of `u64` words. Decoding checks the slot length
//! once, then reads fixed offsets with unaligned loads.

use thiserror::Error;

/// Maximum number of display events a single present can produce.
pub const MAX_DISPLAYED: usize = 16;

/// Fixed length of the NUL-padded application name.
pub const APP_NAME_LEN: usize = 260;

/// Number of fan speed readings carried per GPU telemetry sample.
pub const FAN_COUNT: usize = 5;

const PRESENT_U64_FIELDS: usize = 27 + MAX_DISPLAYED;
const PRESENT_U32_FIELDS: usize = 15;
const PRESENT_SIZE: usize =
    PRESENT_U64_FIELDS * 8 + PRESENT_U32_FIELDS * 4 + MAX_DISPLAYED + 1 + APP_NAME_LEN;
const GPU_SIZE: usize = (15 + FAN_COUNT) * 8 + 3 * 8 + 10;
const CPU_SIZE: usize = 5 * 8;

/// Encoded payload length before padding.
pub const RECORD_PAYLOAD: usize = PRESENT_SIZE + GPU_SIZE + CPU_SIZE;

/// Slot size in bytes, padded to a whole number of words.
pub const RECORD_SIZE: usize = RECORD_PAYLOAD.div_ceil(8) * 8;

/// Slot size in `u64` words.
pub const RECORD_WORDS: usize = RECORD_SIZE / 8;

/// Errors raised while decoding a slot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("slot too short: {size} bytes, need {need}")]
    Truncated { size: usize, need: usize },
}

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Final outcome of a present event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PresentResult {
    #[default]
    Unknown = 0,
    Presented = 1,
    Discarded = 2,
}

impl PresentResult {
    /// Decode a raw value, mapping anything unrecognised to `Unknown`.
    pub fn from_raw(v: u32) -> Self {
        match v {
            1 => Self::Presented,
            2 => Self::Discarded,
            _ => Self::Unknown,
        }
    }
}

/// Presentation path chosen by the OS for a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PresentMode {
    #[default]
    Unknown = 0,
    HardwareLegacyFlip = 1,
    HardwareLegacyCopyToFrontBuffer = 2,
    HardwareIndependentFlip = 3,
    ComposedFlip = 4,
    ComposedCopyGpuGdi = 5,
    ComposedCopyCpuGdi = 6,
    HardwareComposedIndependentFlip = 8,
}

impl PresentMode {
    pub fn from_raw(v: u32) -> Self {
        match v {
            1 => Self::HardwareLegacyFlip,
            2 => Self::HardwareLegacyCopyToFrontBuffer,
            3 => Self::HardwareIndependentFlip,
            4 => Self::ComposedFlip,
            5 => Self::ComposedCopyGpuGdi,
            6 => Self::ComposedCopyCpuGdi,
            8 => Self::HardwareComposedIndependentFlip,
            _ => Self::Unknown,
        }
    }
}

/// Graphics runtime that issued the present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Runtime {
    #[default]
    Other = 0,
    Dxgi = 1,
    D3d9 = 2,
}

impl Runtime {
    pub fn from_raw(v: u32) -> Self {
        match v {
            1 => Self::Dxgi,
            2 => Self::D3d9,
            _ => Self::Other,
        }
    }
}

/// Device that produced an input sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum InputDeviceType {
    #[default]
    None = 0,
    Unknown = 1,
    Mouse = 2,
    Keyboard = 3,
}

impl InputDeviceType {
    pub fn from_raw(v: u32) -> Self {
        match v {
            0 => Self::None,
            2 => Self::Mouse,
            3 => Self::Keyboard,
            _ => Self::Unknown,
        }
    }
}

/// Origin of a displayed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FrameType {
    #[default]
    NotSet = 0,
    Unspecified = 1,
    Application = 2,
    Repeated = 3,
    IntelXefg = 50,
    AmdAfmf = 100,
}

impl FrameType {
    pub fn from_raw(v: u32) -> Self {
        match v {
            1 => Self::Unspecified,
            2 => Self::Application,
            3 => Self::Repeated,
            50 => Self::IntelXefg,
            100 => Self::AmdAfmf,
            _ => Self::NotSet,
        }
    }

    /// True for frames rendered by the application itself.
    pub fn is_app(self) -> bool {
        matches!(self, Self::NotSet | Self::Application)
    }
}

// ---------------------------------------------------------------------------
// Record types
// ---------------------------------------------------------------------------

/// One present event as captured by the producer.
///
/// All timestamps are QPC ticks; zero means "not captured".
#[derive(Debug, Clone, PartialEq)]
pub struct PresentEvent {
    pub present_start_time: u64,
    pub time_in_present: u64,
    pub gpu_start_time: u64,
    pub ready_time: u64,
    pub gpu_duration: u64,
    pub gpu_video_duration: u64,
    pub input_time: u64,
    pub mouse_click_time: u64,

    /// Overrides filled in on the frame-generation path. Non-zero wins.
    pub app_propagated_present_start_time: u64,
    pub app_propagated_time_in_present: u64,
    pub app_propagated_gpu_start_time: u64,
    pub app_propagated_ready_time: u64,
    pub app_propagated_gpu_duration: u64,
    pub app_propagated_gpu_video_duration: u64,

    /// Timestamps reported by the application's own instrumentation.
    pub app_sleep_start_time: u64,
    pub app_sleep_end_time: u64,
    pub app_sim_start_time: u64,
    pub app_sim_end_time: u64,
    pub app_render_submit_start_time: u64,
    pub app_render_submit_end_time: u64,
    pub app_present_start_time: u64,
    pub app_present_end_time: u64,
    pub app_input_time: u64,

    pub pcl_input_ping_time: u64,
    pub pcl_sim_start_time: u64,
    pub flip_delay: u64,
    pub swap_chain_address: u64,
    pub displayed_screen_time: [u64; MAX_DISPLAYED],

    pub process_id: u32,
    pub thread_id: u32,
    pub app_input_type: InputDeviceType,
    pub flip_token: u32,
    pub sync_interval: i32,
    pub present_flags: u32,
    pub displayed_count: u32,
    pub dest_width: u32,
    pub dest_height: u32,
    pub frame_id: u32,
    pub runtime: Runtime,
    pub present_mode: PresentMode,
    pub final_state: PresentResult,
    pub input_type: InputDeviceType,
    pub frame_type: FrameType,
    pub displayed_frame_type: [FrameType; MAX_DISPLAYED],
    pub supports_tearing: bool,
    pub application: [u8; APP_NAME_LEN],
}

impl Default for PresentEvent {
    fn default() -> Self {
        Self {
            present_start_time: 0,
            time_in_present: 0,
            gpu_start_time: 0,
            ready_time: 0,
            gpu_duration: 0,
            gpu_video_duration: 0,
            input_time: 0,
            mouse_click_time: 0,
            app_propagated_present_start_time: 0,
            app_propagated_time_in_present: 0,
            app_propagated_gpu_start_time: 0,
            app_propagated_ready_time: 0,
            app_propagated_gpu_duration: 0,
            app_propagated_gpu_video_duration: 0,
            app_sleep_start_time: 0,
            app_sleep_end_time: 0,
            app_sim_start_time: 0,
            app_sim_end_time: 0,
            app_render_submit_start_time: 0,
            app_render_submit_end_time: 0,
            app_present_start_time: 0,
            app_present_end_time: 0,
            app_input_time: 0,
            pcl_input_ping_time: 0,
            pcl_sim_start_time: 0,
            flip_delay: 0,
            swap_chain_address: 0,
            displayed_screen_time: [0; MAX_DISPLAYED],
            process_id: 0,
            thread_id: 0,
            app_input_type: InputDeviceType::None,
            flip_token: 0,
            sync_interval: 0,
            present_flags: 0,
            displayed_count: 0,
            dest_width: 0,
            dest_height: 0,
            frame_id: 0,
            runtime: Runtime::Other,
            present_mode: PresentMode::Unknown,
            final_state: PresentResult::Unknown,
            input_type: InputDeviceType::None,
            frame_type: FrameType::NotSet,
            displayed_frame_type: [FrameType::NotSet; MAX_DISPLAYED],
            supports_tearing: false,
            application: [0; APP_NAME_LEN],
        }
    }
}

impl PresentEvent {
    /// Number of usable display entries.
    #[inline]
    pub fn displayed_len(&self) -> usize {
        (self.displayed_count as usize).min(MAX_DISPLAYED)
    }

    /// The present reached the screen at least once.
    #[inline]
    pub fn is_displayed(&self) -> bool {
        self.final_state == PresentResult::Presented && self.displayed_count > 0
    }

    /// The present was discarded or never shown.
    #[inline]
    pub fn is_dropped(&self) -> bool {
        !self.is_displayed()
    }

    /// Frame type of the last display entry, `NotSet` when nothing was shown.
    pub fn last_frame_type(&self) -> FrameType {
        match self.displayed_len() {
            0 => FrameType::NotSet,
            n => self.displayed_frame_type[n - 1],
        }
    }

    /// Screen time of the last display entry, zero when nothing was shown.
    pub fn last_screen_time(&self) -> u64 {
        match self.displayed_len() {
            0 => 0,
            n => self.displayed_screen_time[n - 1],
        }
    }

    /// A present counts as an application frame when it produced no display
    /// entries or its latest entry was rendered by the application.
    pub fn is_app_frame(&self) -> bool {
        self.displayed_count == 0 || self.last_frame_type().is_app()
    }

    /// Index of the first application-rendered display entry, or 0.
    pub fn app_index(&self) -> usize {
        (0..self.displayed_len())
            .find(|&i| self.displayed_frame_type[i].is_app())
            .unwrap_or(0)
    }

    /// Application name up to the first NUL.
    pub fn application_name(&self) -> &str {
        let end = self
            .application
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(APP_NAME_LEN);
        std::str::from_utf8(&self.application[..end]).unwrap_or("")
    }

    /// Store `name`, truncated to leave room for the terminating NUL.
    pub fn set_application(&mut self, name: &str) {
        self.application = [0; APP_NAME_LEN];
        let n = name.len().min(APP_NAME_LEN - 1);
        self.application[..n].copy_from_slice(&name.as_bytes()[..n]);
    }
}

/// GPU and VRAM power telemetry sampled alongside a present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuTelemetry {
    pub gpu_power_w: f64,
    pub gpu_sustained_power_limit_w: f64,
    pub gpu_voltage_v: f64,
    pub gpu_frequency_mhz: f64,
    pub gpu_temperature_c: f64,
    pub gpu_utilization: f64,
    pub gpu_render_compute_utilization: f64,
    pub gpu_media_utilization: f64,
    pub vram_power_w: f64,
    pub vram_voltage_v: f64,
    pub vram_frequency_mhz: f64,
    pub vram_effective_frequency_gbps: f64,
    pub vram_temperature_c: f64,
    pub fan_speed_rpm: [f64; FAN_COUNT],
    pub gpu_mem_write_bandwidth_bps: f64,
    pub gpu_mem_read_bandwidth_bps: f64,
    pub gpu_mem_total_size_b: u64,
    pub gpu_mem_used_b: u64,
    pub gpu_mem_max_bandwidth_bps: u64,
    pub gpu_power_limited: bool,
    pub gpu_temperature_limited: bool,
    pub gpu_current_limited: bool,
    pub gpu_voltage_limited: bool,
    pub gpu_utilization_limited: bool,
    pub vram_power_limited: bool,
    pub vram_temperature_limited: bool,
    pub vram_current_limited: bool,
    pub vram_voltage_limited: bool,
    pub vram_utilization_limited: bool,
}

/// CPU telemetry sampled alongside a present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTelemetry {
    pub cpu_utilization: f64,
    pub cpu_power_w: f64,
    pub cpu_power_limit_w: f64,
    pub cpu_temperature: f64,
    pub cpu_frequency: f64,
}

/// Everything the producer publishes for one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRecord {
    pub present: PresentEvent,
    pub gpu: GpuTelemetry,
    pub cpu: CpuTelemetry,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct SlotWriter<'a> {
    buf: &'a mut [u8; RECORD_SIZE],
    pos: usize,
}

impl SlotWriter<'_> {
    #[inline(always)]
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    #[inline(always)]
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    #[inline(always)]
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    #[inline(always)]
    fn f64(&mut self, v: f64) {
        self.bytes(&v.to_le_bytes());
    }

    #[inline(always)]
    fn flag(&mut self, v: bool) {
        self.bytes(&[u8::from(v)]);
    }
}

impl FrameRecord {
    /// Encode into a slot image. Bytes past [`RECORD_PAYLOAD`] are zeroed.
    pub fn encode(&self, out: &mut [u8; RECORD_SIZE]) {
        let mut w = SlotWriter { buf: out, pos: 0 };
        let p = &self.present;

        for v in [
            p.present_start_time,
            p.time_in_present,
            p.gpu_start_time,
            p.ready_time,
            p.gpu_duration,
            p.gpu_video_duration,
            p.input_time,
            p.mouse_click_time,
            p.app_propagated_present_start_time,
            p.app_propagated_time_in_present,
            p.app_propagated_gpu_start_time,
            p.app_propagated_ready_time,
            p.app_propagated_gpu_duration,
            p.app_propagated_gpu_video_duration,
            p.app_sleep_start_time,
            p.app_sleep_end_time,
            p.app_sim_start_time,
            p.app_sim_end_time,
            p.app_render_submit_start_time,
            p.app_render_submit_end_time,
            p.app_present_start_time,
            p.app_present_end_time,
            p.app_input_time,
            p.pcl_input_ping_time,
            p.pcl_sim_start_time,
            p.flip_delay,
            p.swap_chain_address,
        ] {
            w.u64(v);
        }
        for v in p.displayed_screen_time {
            w.u64(v);
        }

        for v in [
            p.process_id,
            p.thread_id,
            p.app_input_type as u32,
            p.flip_token,
            p.sync_interval as u32,
            p.present_flags,
            p.displayed_count,
            p.dest_width,
            p.dest_height,
            p.frame_id,
            p.runtime as u32,
            p.present_mode as u32,
            p.final_state as u32,
            p.input_type as u32,
            p.frame_type as u32,
        ] {
            w.u32(v);
        }
        for t in p.displayed_frame_type {
            w.bytes(&[t as u32 as u8]);
        }
        w.flag(p.supports_tearing);
        w.bytes(&p.application);

        let g = &self.gpu;
        for v in [
            g.gpu_power_w,
            g.gpu_sustained_power_limit_w,
            g.gpu_voltage_v,
            g.gpu_frequency_mhz,
            g.gpu_temperature_c,
            g.gpu_utilization,
            g.gpu_render_compute_utilization,
            g.gpu_media_utilization,
            g.vram_power_w,
            g.vram_voltage_v,
            g.vram_frequency_mhz,
            g.vram_effective_frequency_gbps,
            g.vram_temperature_c,
        ] {
            w.f64(v);
        }
        for v in g.fan_speed_rpm {
            w.f64(v);
        }
        w.f64(g.gpu_mem_write_bandwidth_bps);
        w.f64(g.gpu_mem_read_bandwidth_bps);
        w.u64(g.gpu_mem_total_size_b);
        w.u64(g.gpu_mem_used_b);
        w.u64(g.gpu_mem_max_bandwidth_bps);
        for v in [
            g.gpu_power_limited,
            g.gpu_temperature_limited,
            g.gpu_current_limited,
            g.gpu_voltage_limited,
            g.gpu_utilization_limited,
            g.vram_power_limited,
            g.vram_temperature_limited,
            g.vram_current_limited,
            g.vram_voltage_limited,
            g.vram_utilization_limited,
        ] {
            w.flag(v);
        }

        let c = &self.cpu;
        for v in [
            c.cpu_utilization,
            c.cpu_power_w,
            c.cpu_power_limit_w,
            c.cpu_temperature,
            c.cpu_frequency,
        ] {
            w.f64(v);
        }

        debug_assert_eq!(w.pos, RECORD_PAYLOAD);
        w.buf[RECORD_PAYLOAD..].fill(0);
    }

    /// Decode a slot image produced by [`FrameRecord::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < RECORD_PAYLOAD {
            return Err(DecodeError::Truncated {
                size: data.len(),
                need: RECORD_PAYLOAD,
            });
        }

        let mut r = SlotReader { data, pos: 0 };

        let mut p = PresentEvent {
            present_start_time: r.u64(),
            time_in_present: r.u64(),
            gpu_start_time: r.u64(),
            ready_time: r.u64(),
            gpu_duration: r.u64(),
            gpu_video_duration: r.u64(),
            input_time: r.u64(),
            mouse_click_time: r.u64(),
            app_propagated_present_start_time: r.u64(),
            app_propagated_time_in_present: r.u64(),
            app_propagated_gpu_start_time: r.u64(),
            app_propagated_ready_time: r.u64(),
            app_propagated_gpu_duration: r.u64(),
            app_propagated_gpu_video_duration: r.u64(),
            app_sleep_start_time: r.u64(),
            app_sleep_end_time: r.u64(),
            app_sim_start_time: r.u64(),
            app_sim_end_time: r.u64(),
            app_render_submit_start_time: r.u64(),
            app_render_submit_end_time: r.u64(),
            app_present_start_time: r.u64(),
            app_present_end_time: r.u64(),
            app_input_time: r.u64(),
            pcl_input_ping_time: r.u64(),
            pcl_sim_start_time: r.u64(),
            flip_delay: r.u64(),
            swap_chain_address: r.u64(),
            ..PresentEvent::default()
        };
        for slot in p.displayed_screen_time.iter_mut() {
            *slot = r.u64();
        }

        p.process_id = r.u32();
        p.thread_id = r.u32();
        p.app_input_type = InputDeviceType::from_raw(r.u32());
        p.flip_token = r.u32();
        p.sync_interval = r.u32() as i32;
        p.present_flags = r.u32();
        p.displayed_count = r.u32();
        p.dest_width = r.u32();
        p.dest_height = r.u32();
        p.frame_id = r.u32();
        p.runtime = Runtime::from_raw(r.u32());
        p.present_mode = PresentMode::from_raw(r.u32());
        p.final_state = PresentResult::from_raw(r.u32());
        p.input_type = InputDeviceType::from_raw(r.u32());
        p.frame_type = FrameType::from_raw(r.u32());
        for slot in p.displayed_frame_type.iter_mut() {
            *slot = FrameType::from_raw(u32::from(r.u8()));
        }
        p.supports_tearing = r.flag();
        p.application = r.fixed::<APP_NAME_LEN>();

        let mut g = GpuTelemetry {
            gpu_power_w: r.f64(),
            gpu_sustained_power_limit_w: r.f64(),
            gpu_voltage_v: r.f64(),
            gpu_frequency_mhz: r.f64(),
            gpu_temperature_c: r.f64(),
            gpu_utilization: r.f64(),
            gpu_render_compute_utilization: r.f64(),
            gpu_media_utilization: r.f64(),
            vram_power_w: r.f64(),
            vram_voltage_v: r.f64(),
            vram_frequency_mhz: r.f64(),
            vram_effective_frequency_gbps: r.f64(),
            vram_temperature_c: r.f64(),
            ..GpuTelemetry::default()
        };
        for slot in g.fan_speed_rpm.iter_mut() {
            *slot = r.f64();
        }
        g.gpu_mem_write_bandwidth_bps = r.f64();
        g.gpu_mem_read_bandwidth_bps = r.f64();
        g.gpu_mem_total_size_b = r.u64();
        g.gpu_mem_used_b = r.u64();
        g.gpu_mem_max_bandwidth_bps = r.u64();
        g.gpu_power_limited = r.flag();
        g.gpu_temperature_limited = r.flag();
        g.gpu_current_limited = r.flag();
        g.gpu_voltage_limited = r.flag();
        g.gpu_utilization_limited = r.flag();
        g.vram_power_limited = r.flag();
        g.vram_temperature_limited = r.flag();
        g.vram_current_limited = r.flag();
        g.vram_voltage_limited = r.flag();
        g.vram_utilization_limited = r.flag();

        let c = CpuTelemetry {
            cpu_utilization: r.f64(),
            cpu_power_w: r.f64(),
            cpu_power_limit_w: r.f64(),
            cpu_temperature: r.f64(),
            cpu_frequency: r.f64(),
        };

        Ok(Self {
            present: p,
            gpu: g,
            cpu: c,
        })
    }
}

// ---------------------------------------------------------------------------
// Fixed-width read helpers
// ---------------------------------------------------------------------------

struct SlotReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl SlotReader<'_> {
    #[inline(always)]
    fn fixed<const N: usize>(&mut self) -> [u8; N] {
        debug_assert!(self.pos + N <= self.data.len());
        // Safety: `decode` checks `data.len() >= RECORD_PAYLOAD` and the
        // reads below never advance past RECORD_PAYLOAD.
        let v = unsafe { (self.data.as_ptr().add(self.pos) as *const [u8; N]).read_unaligned() };
        self.pos += N;
        v
    }

    #[inline(always)]
    fn u8(&mut self) -> u8 {
        self.fixed::<1>()[0]
    }

    #[inline(always)]
    fn flag(&mut self) -> bool {
        self.u8() != 0
    }

    #[inline(always)]
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.fixed::<4>())
    }

    #[inline(always)]
    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.fixed::<8>())
    }

    #[inline(always)]
    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.fixed::<8>())
    }
}
