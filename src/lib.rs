//! Per-frame presentation telemetry core.
//!
//! A single producer appends fixed-size [`ring::record::FrameRecord`] slots into a
//! shared [`ring`] region. Consumers walk that region with a
//! [`resolver::FrameContextResolver`], keep cross-frame state in a
//! [`context::MetricContext`], and write fixed-layout blobs with a
//! [`query::GatherProgram`] compiled from a list of requested metrics.

pub mod config;
pub mod consume;
pub mod context;
pub mod poller;
pub mod query;
pub mod resolver;
pub mod ring;
pub mod session;
pub mod stats;
pub mod synth;
