//! Closed metric table: names, output types and array extents.

/// Output type of a metric value inside a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F64,
    U64,
    U32,
    I32,
    /// Enum discriminant stored as `u32`.
    Enum,
    Bool,
    /// One byte of a fixed-length string.
    Char,
}

impl DataType {
    /// Size in bytes. Every type is naturally aligned, so this is also its alignment.
    pub const fn size(self) -> usize {
        match self {
            Self::F64 | Self::U64 => 8,
            Self::U32 | Self::I32 | Self::Enum => 4,
            Self::Bool | Self::Char => 1,
        }
    }

    pub const fn align(self) -> usize {
        self.size()
    }
}

macro_rules! metrics {
    ($($variant:ident => $name:literal, $ty:ident;)+) => {
        /// Every metric a query element can name.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Metric {
            $($variant,)+
        }

        impl Metric {
            /// All metrics in declaration order.
            pub const ALL: &'static [Metric] = &[$(Metric::$variant,)+];

            /// Stable snake_case name.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Metric::$variant => $name,)+
                }
            }

            pub const fn data_type(self) -> DataType {
                match self {
                    $(Metric::$variant => DataType::$ty,)+
                }
            }
        }
    };
}

metrics! {
    // Present identity
    Application => "application", Char;
    ProcessId => "process_id", U32;
    SwapChainAddress => "swap_chain_address", U64;
    PresentRuntime => "present_runtime", Enum;
    SyncInterval => "sync_interval", I32;
    PresentFlags => "present_flags", U32;
    AllowsTearing => "allows_tearing", Bool;
    PresentMode => "present_mode", Enum;
    FrameType => "frame_type", Enum;

    // CPU timing
    CpuStartQpc => "cpu_start_qpc", U64;
    CpuStartTime => "cpu_start_time", F64;
    BetweenPresents => "between_presents", F64;
    CpuFrameTime => "cpu_frame_time", F64;
    CpuBusy => "cpu_busy", F64;
    CpuWait => "cpu_wait", F64;

    // GPU timing
    GpuLatency => "gpu_latency", F64;
    GpuTime => "gpu_time", F64;
    GpuBusy => "gpu_busy", F64;
    GpuWait => "gpu_wait", F64;
    VideoBusy => "video_busy", F64;

    // Display timing
    DisplayLatency => "display_latency", F64;
    DisplayedTime => "displayed_time", F64;
    UntilDisplayed => "until_displayed", F64;
    BetweenDisplayChange => "between_display_change", F64;
    RenderPresentLatency => "render_present_latency", F64;
    FlipDelay => "flip_delay", F64;
    DroppedFrames => "dropped_frames", Bool;

    // Simulation and input
    BetweenSimulationStart => "between_simulation_start", F64;
    AnimationError => "animation_error", F64;
    AnimationTime => "animation_time", F64;
    PcLatency => "pc_latency", F64;
    ClickToPhotonLatency => "click_to_photon_latency", F64;
    AllInputToPhotonLatency => "all_input_to_photon_latency", F64;
    InstrumentedLatency => "instrumented_latency", F64;

    // GPU telemetry
    GpuPower => "gpu_power", F64;
    GpuSustainedPowerLimit => "gpu_sustained_power_limit", F64;
    GpuVoltage => "gpu_voltage", F64;
    GpuFrequency => "gpu_frequency", F64;
    GpuTemperature => "gpu_temperature", F64;
    GpuUtilization => "gpu_utilization", F64;
    GpuRenderComputeUtilization => "gpu_render_compute_utilization", F64;
    GpuMediaUtilization => "gpu_media_utilization", F64;
    GpuMemPower => "gpu_mem_power", F64;
    GpuMemVoltage => "gpu_mem_voltage", F64;
    GpuMemFrequency => "gpu_mem_frequency", F64;
    GpuMemEffectiveFrequency => "gpu_mem_effective_frequency", F64;
    GpuMemTemperature => "gpu_mem_temperature", F64;
    GpuFanSpeed => "gpu_fan_speed", F64;
    GpuMemSize => "gpu_mem_size", U64;
    GpuMemUsed => "gpu_mem_used", U64;
    GpuMemMaxBandwidth => "gpu_mem_max_bandwidth", U64;
    GpuMemWriteBandwidth => "gpu_mem_write_bandwidth", F64;
    GpuMemReadBandwidth => "gpu_mem_read_bandwidth", F64;
    GpuPowerLimited => "gpu_power_limited", Bool;
    GpuTemperatureLimited => "gpu_temperature_limited", Bool;
    GpuCurrentLimited => "gpu_current_limited", Bool;
    GpuVoltageLimited => "gpu_voltage_limited", Bool;
    GpuUtilizationLimited => "gpu_utilization_limited", Bool;
    GpuMemPowerLimited => "gpu_mem_power_limited", Bool;
    GpuMemTemperatureLimited => "gpu_mem_temperature_limited", Bool;
    GpuMemCurrentLimited => "gpu_mem_current_limited", Bool;
    GpuMemVoltageLimited => "gpu_mem_voltage_limited", Bool;
    GpuMemUtilizationLimited => "gpu_mem_utilization_limited", Bool;

    // CPU telemetry
    CpuUtilization => "cpu_utilization", F64;
    CpuPower => "cpu_power", F64;
    CpuPowerLimit => "cpu_power_limit", F64;
    CpuTemperature => "cpu_temperature", F64;
    CpuFrequency => "cpu_frequency", F64;

    // Polled statistics only
    PresentedFps => "presented_fps", F64;
    DisplayedFps => "displayed_fps", F64;
    ApplicationFps => "application_fps", F64;
    PercentDroppedFrames => "percent_dropped_frames", F64;
}

impl Metric {
    /// Look a metric up by its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Number of addressable array elements.
    pub const fn array_len(self) -> usize {
        match self {
            Self::Application => crate::ring::record::APP_NAME_LEN,
            Self::GpuFanSpeed => crate::ring::record::FAN_COUNT,
            _ => 1,
        }
    }

    /// Metrics that only exist as windowed statistics cannot appear in a
    /// per-frame query.
    pub const fn is_frame_event(self) -> bool {
        !matches!(
            self,
            Self::PresentedFps
                | Self::DisplayedFps
                | Self::ApplicationFps
                | Self::PercentDroppedFrames
        )
    }

    /// Metrics reported only on the application-rendered display entry of a
    /// present.
    pub const fn is_app_attributed(self) -> bool {
        matches!(
            self,
            Self::CpuBusy
                | Self::CpuWait
                | Self::CpuFrameTime
                | Self::GpuLatency
                | Self::GpuBusy
                | Self::GpuWait
                | Self::GpuTime
                | Self::VideoBusy
                | Self::BetweenSimulationStart
        )
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
