//! Query compilation and blob gathering.
//!
//! A query is an ordered list of [`QueryElement`]s. [`QueryCompiler::compile`]
//! validates it once, places every value at a naturally aligned offset and
//! returns an immutable [`GatherProgram`] that writes one fixed-size blob per
//! display entry.

pub mod gather;
pub mod metric;

use thiserror::Error;

use crate::context::MetricContext;
use crate::stats::Stat;

use gather::{GatherKind, Value};
use metric::{DataType, Metric};

/// Blob sizes are rounded up to this many bytes.
pub const BLOB_ALIGN: usize = 16;

/// Query compilation errors. Raised once at registration, never per frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query has no elements")]
    Empty,

    #[error("unknown metric: {name}")]
    UnknownMetric { name: String },

    #[error("query references devices {first} and {second}, only one device is allowed")]
    MultipleDevices { first: u32, second: u32 },

    #[error("{metric} is only available as a polled statistic")]
    NotFrameEvent { metric: Metric },

    #[error("{metric} array index {index} out of range (len {len})")]
    ArrayIndexOutOfRange {
        metric: Metric,
        index: u32,
        len: usize,
    },

    #[error("{metric} does not accept a statistic in a frame query (got {stat})")]
    StatNotAllowed { metric: Metric, stat: Stat },
}

/// One requested metric. `data_offset` and `data_size` are filled in by the
/// compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryElement {
    pub metric: Metric,
    pub device_id: u32,
    pub array_index: u32,
    pub stat: Stat,
    pub data_offset: u64,
    pub data_size: u32,
}

impl QueryElement {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            device_id: 0,
            array_index: 0,
            stat: Stat::None,
            data_offset: 0,
            data_size: 0,
        }
    }

    pub fn device(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn index(mut self, array_index: u32) -> Self {
        self.array_index = array_index;
        self
    }

    pub fn stat(mut self, stat: Stat) -> Self {
        self.stat = stat;
        self
    }
}

/// A compiled, offset-bound gather step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherCommand {
    pub kind: GatherKind,
    pub data_type: DataType,
    /// Offset before alignment padding.
    pub begin: usize,
    /// Offset the value is written at.
    pub output: usize,
    /// One past the value.
    pub end: usize,
}

/// Immutable result of compiling a query.
#[derive(Debug, Clone)]
pub struct GatherProgram {
    commands: Vec<GatherCommand>,
    blob_size: usize,
    referenced_device: Option<u32>,
}

impl GatherProgram {
    /// Write one blob for the context's current display entry.
    ///
    /// `blob` must hold at least [`GatherProgram::blob_size`] bytes.
    pub fn gather_to_blob(&self, ctx: &MetricContext, blob: &mut [u8]) {
        let blob = &mut blob[..self.blob_size];
        blob.fill(0);
        for cmd in &self.commands {
            cmd.kind.evaluate(ctx).write_le(&mut blob[cmd.output..cmd.end]);
        }
    }

    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    /// The single non-universal device this query reads, if any.
    pub fn referenced_device(&self) -> Option<u32> {
        self.referenced_device
    }
}

/// Builds [`GatherProgram`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryCompiler;

impl QueryCompiler {
    /// Validate `elements`, write back their offsets and build the program.
    pub fn compile(elements: &mut [QueryElement]) -> Result<GatherProgram, QueryError> {
        if elements.is_empty() {
            return Err(QueryError::Empty);
        }

        let mut referenced_device: Option<u32> = None;
        let mut commands = Vec::with_capacity(elements.len());
        let mut offset = 0usize;

        for el in elements.iter_mut() {
            let metric = el.metric;

            if !metric.is_frame_event() {
                return Err(QueryError::NotFrameEvent { metric });
            }

            if el.device_id != 0 {
                match referenced_device {
                    Some(first) if first != el.device_id => {
                        return Err(QueryError::MultipleDevices {
                            first,
                            second: el.device_id,
                        });
                    }
                    _ => referenced_device = Some(el.device_id),
                }
            }

            if el.stat != Stat::None {
                return Err(QueryError::StatNotAllowed {
                    metric,
                    stat: el.stat,
                });
            }

            let len = metric.array_len();
            if el.array_index as usize >= len {
                return Err(QueryError::ArrayIndexOutOfRange {
                    metric,
                    index: el.array_index,
                    len,
                });
            }

            let kind = GatherKind::for_metric(metric, el.array_index as usize)
                .ok_or(QueryError::NotFrameEvent { metric })?;

            let data_type = metric.data_type();
            let output = offset + padding(offset, data_type.align());
            let end = output + data_type.size();

            el.data_offset = output as u64;
            el.data_size = (end - output) as u32;

            commands.push(GatherCommand {
                kind,
                data_type,
                begin: offset,
                output,
                end,
            });
            offset = end;
        }

        let blob_size = offset + padding(offset, BLOB_ALIGN);

        Ok(GatherProgram {
            commands,
            blob_size,
            referenced_device,
        })
    }

    /// Compile from metric names, returning the resolved elements alongside.
    pub fn compile_names<S: AsRef<str>>(
        names: &[S],
    ) -> Result<(GatherProgram, Vec<QueryElement>), QueryError> {
        let mut elements = names
            .iter()
            .map(|n| {
                Metric::from_name(n.as_ref())
                    .map(QueryElement::new)
                    .ok_or_else(|| QueryError::UnknownMetric {
                        name: n.as_ref().to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let program = Self::compile(&mut elements)?;
        Ok((program, elements))
    }
}

/// Bytes needed to move `offset` up to a multiple of `align`.
#[inline]
pub fn padding(offset: usize, align: usize) -> usize {
    (align - offset % align) % align
}

// ---------------------------------------------------------------------------
// Blob readers
// ---------------------------------------------------------------------------

#[inline]
fn fixed<const N: usize>(blob: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&blob[offset..offset + N]);
    out
}

/// Decode the value an element occupies in `blob`.
///
/// # Panics
///
/// Panics if `blob` is shorter than the element's offset plus size.
pub fn read_value(blob: &[u8], element: &QueryElement) -> Value {
    let o = element.data_offset as usize;
    match element.metric.data_type() {
        DataType::F64 => Value::F64(f64::from_le_bytes(fixed(blob, o))),
        DataType::U64 => Value::U64(u64::from_le_bytes(fixed(blob, o))),
        DataType::U32 => Value::U32(u32::from_le_bytes(fixed(blob, o))),
        DataType::I32 => Value::I32(i32::from_le_bytes(fixed(blob, o))),
        DataType::Enum => Value::Enum(u32::from_le_bytes(fixed(blob, o))),
        DataType::Bool => Value::Bool(blob[o] != 0),
        DataType::Char => Value::Char(blob[o]),
    }
}

/// Read an `f64` element, NaN for non-float elements.
pub fn read_f64(blob: &[u8], element: &QueryElement) -> f64 {
    match read_value(blob, element) {
        Value::F64(v) => v,
        _ => f64::NAN,
    }
}
