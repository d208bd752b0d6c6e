use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::query::metric::Metric;
use crate::query::{QueryCompiler, QueryElement};
use crate::ring::record::MAX_DISPLAYED;
use crate::ring::{PlaybackFlags, RingOptions};
use crate::stats::window::{validate_requests, StatRequest, WindowSpec};
use crate::stats::Stat;
use crate::synth::FrameParams;

/// Top-level configuration for the frametap demo pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared frame ring configuration.
    #[serde(default)]
    pub ring: RingConfig,

    /// Synthetic producer configuration.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consumer query and statistics configuration.
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// Shared frame ring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Region name handed to consumers. Default: "frametap-demo".
    #[serde(default = "default_ring_name")]
    pub name: String,

    /// Number of frame slots. Default: 4096.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// QPC ticks per second. Default: 10,000,000.
    #[serde(default = "default_qpc_frequency")]
    pub qpc_frequency: u64,

    /// Eviction behaviour when the ring is full. Default: realtime.
    #[serde(default)]
    pub mode: RingMode,

    /// Longest a backpressured write waits for space. Default: 500ms.
    #[serde(default = "default_backpressure_timeout", with = "humantime_serde")]
    pub backpressure_timeout: Duration,

    /// Retry period of a backpressured write. Default: 25ms.
    #[serde(default = "default_backpressure_retry", with = "humantime_serde")]
    pub backpressure_retry: Duration,
}

/// Ring eviction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingMode {
    /// Overwrite the oldest frame; consumers start at the newest.
    #[default]
    Realtime,
    /// Overwrite the oldest frame; consumers start at the oldest.
    ResetOldest,
    /// Never overwrite; the consumer retires slots.
    Backpressured,
}

/// Synthetic producer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Process id stamped on generated frames. Default: 10.
    #[serde(default = "default_process_id")]
    pub process_id: u32,

    /// Presents per second. Default: 144.
    #[serde(default = "default_fps")]
    pub fps: f64,

    /// Share of presents discarded, in percent. Default: 0.
    #[serde(default)]
    pub percent_dropped: f64,

    /// Frame-generation sub-frames per displayed present. Default: 0.
    #[serde(default)]
    pub generated_frames: u32,
}

/// One statistic requested from the windowed poll.
#[derive(Debug, Clone, Deserialize)]
pub struct StatConfig {
    pub metric: String,
    pub stat: String,
}

/// Consumer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Frame-event poll interval. Default: 100ms.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum blobs per poll. Default: 256.
    #[serde(default = "default_frames_per_poll")]
    pub frames_per_poll: usize,

    /// Metrics of the frame-event query, in blob order.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    /// Span of the statistics window. Default: 1s.
    #[serde(default = "default_stats_window", with = "humantime_serde")]
    pub stats_window: Duration,

    /// How far before "now" the statistics window ends. Default: 0ms.
    #[serde(default = "default_stats_offset", with = "humantime_serde")]
    pub stats_offset: Duration,

    /// Statistics printed once per second.
    #[serde(default = "default_stats")]
    pub stats: Vec<StatConfig>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ring_name() -> String {
    "frametap-demo".to_string()
}

fn default_capacity() -> usize {
    4096
}

fn default_qpc_frequency() -> u64 {
    10_000_000
}

fn default_backpressure_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_backpressure_retry() -> Duration {
    Duration::from_millis(25)
}

fn default_process_id() -> u32 {
    10
}

fn default_fps() -> f64 {
    144.0
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_frames_per_poll() -> usize {
    256
}

fn default_metrics() -> Vec<String> {
    [
        "cpu_start_time",
        "frame_type",
        "displayed_time",
        "display_latency",
        "dropped_frames",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stats_window() -> Duration {
    Duration::from_secs(1)
}

fn default_stats_offset() -> Duration {
    Duration::ZERO
}

fn default_stats() -> Vec<StatConfig> {
    vec![
        StatConfig {
            metric: "displayed_fps".to_string(),
            stat: "avg".to_string(),
        },
        StatConfig {
            metric: "percent_dropped_frames".to_string(),
            stat: "avg".to_string(),
        },
    ]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ring: RingConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            name: default_ring_name(),
            capacity: default_capacity(),
            qpc_frequency: default_qpc_frequency(),
            mode: RingMode::default(),
            backpressure_timeout: default_backpressure_timeout(),
            backpressure_retry: default_backpressure_retry(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            process_id: default_process_id(),
            fps: default_fps(),
            percent_dropped: 0.0,
            generated_frames: 0,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            frames_per_poll: default_frames_per_poll(),
            metrics: default_metrics(),
            stats_window: default_stats_window(),
            stats_offset: default_stats_offset(),
            stats: default_stats(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ring.name.is_empty() {
            bail!("ring.name is required");
        }

        if self.ring.capacity < 2 {
            bail!("ring.capacity must be at least 2");
        }

        if self.ring.qpc_frequency == 0 {
            bail!("ring.qpc_frequency must be positive");
        }

        if self.ring.mode == RingMode::Backpressured && self.ring.backpressure_retry.is_zero() {
            bail!("ring.backpressure_retry must be positive");
        }

        if !self.producer.fps.is_finite() || self.producer.fps <= 0.0 {
            bail!("producer.fps must be positive");
        }

        if !(0.0..=100.0).contains(&self.producer.percent_dropped) {
            bail!("producer.percent_dropped must be within [0, 100]");
        }

        if self.producer.generated_frames as usize >= MAX_DISPLAYED {
            bail!(
                "producer.generated_frames must be at most {}",
                MAX_DISPLAYED - 1
            );
        }

        if self.consumer.poll_interval.is_zero() {
            bail!("consumer.poll_interval must be positive");
        }

        if self.consumer.frames_per_poll == 0 {
            bail!("consumer.frames_per_poll must be positive");
        }

        if self.consumer.stats_window.is_zero() {
            bail!("consumer.stats_window must be positive");
        }

        let mut elements = self.consumer.query_elements()?;
        QueryCompiler::compile(&mut elements).context("invalid consumer.metrics")?;

        let requests = self.consumer.stat_requests()?;
        validate_requests(&requests).context("invalid consumer.stats")?;

        Ok(())
    }
}

impl RingConfig {
    pub fn options(&self) -> RingOptions {
        let flags = match self.mode {
            RingMode::Realtime => PlaybackFlags::default(),
            RingMode::ResetOldest => PlaybackFlags {
                reset_oldest: true,
                ..PlaybackFlags::default()
            },
            RingMode::Backpressured => PlaybackFlags {
                is_playback: true,
                backpressured: true,
                ..PlaybackFlags::default()
            },
        };

        RingOptions {
            name: self.name.clone(),
            capacity: self.capacity,
            qpc_frequency: self.qpc_frequency,
            flags,
        }
    }
}

impl ProducerConfig {
    pub fn frame_params(&self) -> FrameParams {
        FrameParams {
            process_id: self.process_id,
            fps: self.fps,
            percent_dropped: self.percent_dropped,
            generated_frames: self.generated_frames,
            ..FrameParams::default()
        }
    }
}

impl ConsumerConfig {
    /// Resolve `metrics` into query elements.
    pub fn query_elements(&self) -> Result<Vec<QueryElement>> {
        self.metrics
            .iter()
            .map(|name| {
                Metric::from_name(name)
                    .map(QueryElement::new)
                    .with_context(|| format!("unknown metric in consumer.metrics: {name}"))
            })
            .collect()
    }

    /// Resolve `stats` into statistic requests.
    pub fn stat_requests(&self) -> Result<Vec<StatRequest>> {
        self.stats
            .iter()
            .map(|s| {
                let metric = Metric::from_name(&s.metric)
                    .with_context(|| format!("unknown metric in consumer.stats: {}", s.metric))?;
                let stat = Stat::from_name(&s.stat)
                    .with_context(|| format!("unknown stat in consumer.stats: {}", s.stat))?;
                Ok(StatRequest::new(metric, stat))
            })
            .collect()
    }

    pub fn window(&self) -> WindowSpec {
        WindowSpec {
            window: self.stats_window,
            offset: self.stats_offset,
            client_qpc: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.ring.capacity, 4096);
        assert_eq!(cfg.ring.qpc_frequency, 10_000_000);
        assert_eq!(cfg.ring.mode, RingMode::Realtime);
        assert_eq!(cfg.ring.backpressure_timeout, Duration::from_millis(500));
        assert_eq!(cfg.ring.backpressure_retry, Duration::from_millis(25));
        assert_eq!(cfg.consumer.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.consumer.frames_per_poll, 256);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
ring:
  name: replay
  capacity: 64
  mode: reset_oldest
producer:
  fps: 302
  percent_dropped: 50
consumer:
  poll_interval: 50ms
  metrics: [frame_type, displayed_time]
  stats_window: 2s
  stats:
    - { metric: presented_fps, stat: percentile_99 }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate().expect("valid");

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ring.name, "replay");
        assert_eq!(cfg.ring.mode, RingMode::ResetOldest);
        assert!(cfg.ring.options().flags.reset_oldest);
        assert_eq!(cfg.producer.fps, 302.0);
        assert_eq!(cfg.consumer.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.consumer.stats_window, Duration::from_secs(2));

        let requests = cfg.consumer.stat_requests().expect("requests");
        assert_eq!(
            requests,
            vec![StatRequest::new(Metric::PresentedFps, Stat::Percentile99)]
        );
    }

    #[test]
    fn test_validation_capacity_too_small() {
        let mut cfg = Config::default();
        cfg.ring.capacity = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ring.capacity"));
    }

    #[test]
    fn test_validation_zero_qpc_frequency() {
        let mut cfg = Config::default();
        cfg.ring.qpc_frequency = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("qpc_frequency"));
    }

    #[test]
    fn test_validation_producer_ranges() {
        let mut cfg = Config::default();
        cfg.producer.fps = 0.0;
        assert!(cfg.validate().unwrap_err().to_string().contains("fps"));

        let mut cfg = Config::default();
        cfg.producer.percent_dropped = 100.5;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("percent_dropped"));

        let mut cfg = Config::default();
        cfg.producer.generated_frames = 16;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("generated_frames"));
        cfg.producer.generated_frames = 15;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_consumer_zero_values() {
        let mut cfg = Config::default();
        cfg.consumer.poll_interval = Duration::ZERO;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("poll_interval"));

        let mut cfg = Config::default();
        cfg.consumer.frames_per_poll = 0;
        assert!(cfg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("frames_per_poll"));
    }

    #[test]
    fn test_validation_unknown_metric() {
        let mut cfg = Config::default();
        cfg.consumer.metrics.push("frame_rate".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("frame_rate"));
    }

    #[test]
    fn test_validation_dynamic_metric_in_frame_query() {
        let mut cfg = Config::default();
        cfg.consumer.metrics = vec!["displayed_fps".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("consumer.metrics"));
    }

    #[test]
    fn test_validation_empty_metric_list() {
        let mut cfg = Config::default();
        cfg.consumer.metrics.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_unknown_stat() {
        let mut cfg = Config::default();
        cfg.consumer.stats = vec![StatConfig {
            metric: "displayed_fps".to_string(),
            stat: "median".to_string(),
        }];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn test_backpressured_mode_flags() {
        let cfg = RingConfig {
            mode: RingMode::Backpressured,
            ..RingConfig::default()
        };
        let opts = cfg.options();
        assert!(opts.flags.backpressured);
        assert!(opts.flags.is_playback);
        assert!(!opts.flags.reset_oldest);
    }
}
