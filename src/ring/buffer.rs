use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::record::{FrameRecord, RECORD_SIZE, RECORD_WORDS};
use super::{CpuTelemetryCap, GpuTelemetryCap, PlaybackFlags, RingError, RingOptions};

/// Result of a single producer write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record landed in a free slot.
    Written,
    /// The ring was full and the oldest slot was overwritten.
    Evicted,
    /// Backpressured ring is full; nothing was written.
    Full,
}

/// Header plus slot storage. Every reference into the region is a slot index.
struct Region {
    name: String,
    max_entries: usize,
    qpc_frequency: u64,
    flags: PlaybackFlags,

    head_idx: AtomicUsize,
    tail_idx: AtomicUsize,
    num_frames_written: AtomicU64,
    process_active: AtomicBool,
    start_qpc: AtomicU64,
    start_recorded: AtomicBool,
    gpu_caps: AtomicU64,
    cpu_caps: AtomicU64,

    occupancy: AtomicUsize,
    wrapped: AtomicBool,

    slots: Box<[AtomicU64]>,
}

impl Region {
    #[inline]
    fn is_full(&self) -> bool {
        self.occupancy.load(Ordering::Acquire) == self.max_entries
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.occupancy.load(Ordering::Acquire) == 0
    }

    #[inline]
    fn ensure_active(&self) -> Result<(), RingError> {
        if self.process_active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RingError::ProducerGone)
        }
    }

    fn check_index(&self, index: usize) -> Result<(), RingError> {
        let head = self.head_idx.load(Ordering::Acquire);
        let tail = self.tail_idx.load(Ordering::Acquire);
        let oob = RingError::OutOfBoundsIndex { index, head, tail };

        if index >= self.max_entries {
            return Err(oob);
        }

        // A full ring holds live data in every slot.
        if self.is_full() {
            return Ok(());
        }

        let valid = if head <= tail {
            index >= head && index < tail
        } else {
            index >= head || index < tail
        };

        if valid {
            Ok(())
        } else {
            Err(oob)
        }
    }

    fn store_slot(&self, index: usize, image: &[u8; RECORD_SIZE]) {
        let base = index * RECORD_WORDS;
        for (w, chunk) in image.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.slots[base + w].store(u64::from_le_bytes(word), Ordering::Relaxed);
        }
    }

    fn load_slot(&self, index: usize, out: &mut [u8; RECORD_SIZE]) {
        let base = index * RECORD_WORDS;
        for (w, chunk) in out.chunks_exact_mut(8).enumerate() {
            let word = self.slots[base + w].load(Ordering::Relaxed);
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Create a ring region and return its producer and a first reader.
pub fn create(opts: RingOptions) -> Result<(RingWriter, RingReader), RingError> {
    if opts.capacity < 2 {
        return Err(RingError::InvalidCapacity {
            capacity: opts.capacity,
        });
    }
    if opts.qpc_frequency == 0 {
        return Err(RingError::InvalidQpcFrequency);
    }

    let slots: Box<[AtomicU64]> = (0..opts.capacity * RECORD_WORDS)
        .map(|_| AtomicU64::new(0))
        .collect();

    let region = Arc::new(Region {
        name: opts.name,
        max_entries: opts.capacity,
        qpc_frequency: opts.qpc_frequency,
        flags: opts.flags,
        head_idx: AtomicUsize::new(0),
        tail_idx: AtomicUsize::new(0),
        num_frames_written: AtomicU64::new(0),
        process_active: AtomicBool::new(true),
        start_qpc: AtomicU64::new(0),
        start_recorded: AtomicBool::new(false),
        gpu_caps: AtomicU64::new(0),
        cpu_caps: AtomicU64::new(0),
        occupancy: AtomicUsize::new(0),
        wrapped: AtomicBool::new(false),
        slots,
    });

    debug!(
        name = %region.name,
        capacity = region.max_entries,
        qpc_frequency = region.qpc_frequency,
        flags = ?region.flags,
        "ring region created",
    );

    Ok((
        RingWriter {
            region: Arc::clone(&region),
        },
        RingReader { region },
    ))
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// The single producer handle. Not cloneable.
pub struct RingWriter {
    region: Arc<Region>,
}

impl std::fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingWriter")
            .field("name", &self.region.name)
            .field("capacity", &self.region.max_entries)
            .finish()
    }
}

impl RingWriter {
    /// Append a record at `tail_idx`.
    ///
    /// In real-time mode a full ring evicts its oldest slot. In backpressured
    /// mode a full ring is left untouched and `WriteOutcome::Full` is returned.
    pub fn write(&mut self, record: &FrameRecord) -> Result<WriteOutcome, RingError> {
        let r = &*self.region;
        r.ensure_active()?;

        let full = r.is_full();
        if full && r.flags.backpressured {
            return Ok(WriteOutcome::Full);
        }

        let mut image = [0u8; RECORD_SIZE];
        record.encode(&mut image);

        let tail = r.tail_idx.load(Ordering::Relaxed);
        r.store_slot(tail, &image);

        if !r.start_recorded.load(Ordering::Relaxed) {
            r.start_qpc
                .store(record.present.present_start_time, Ordering::Relaxed);
            r.start_recorded.store(true, Ordering::Release);
        }

        let next = (tail + 1) % r.max_entries;
        if next == 0 {
            r.wrapped.store(true, Ordering::Release);
        }

        let outcome = if full {
            r.head_idx.store(next, Ordering::Release);
            WriteOutcome::Evicted
        } else {
            r.occupancy.fetch_add(1, Ordering::AcqRel);
            WriteOutcome::Written
        };

        r.tail_idx.store(next, Ordering::Release);
        r.num_frames_written.fetch_add(1, Ordering::Release);

        Ok(outcome)
    }

    /// Write, retrying every `retry` while a backpressured ring stays full,
    /// for at most `timeout`.
    pub fn write_with_backpressure(
        &mut self,
        record: &FrameRecord,
        timeout: Duration,
        retry: Duration,
    ) -> Result<WriteOutcome, RingError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.write(record)? {
                WriteOutcome::Full if Instant::now() < deadline => std::thread::sleep(retry),
                WriteOutcome::Full => {
                    debug!(
                        name = %self.region.name,
                        frame_id = record.present.frame_id,
                        "backpressure timeout, frame not written",
                    );
                    return Ok(WriteOutcome::Full);
                }
                outcome => return Ok(outcome),
            }
        }
    }

    /// Publish the set of GPU telemetry fields this producer fills in.
    pub fn set_gpu_caps(&self, caps: &[GpuTelemetryCap]) {
        let bits = caps.iter().fold(0u64, |acc, c| acc | c.mask());
        self.region.gpu_caps.store(bits, Ordering::Release);
    }

    /// Publish the set of CPU telemetry fields this producer fills in.
    pub fn set_cpu_caps(&self, caps: &[CpuTelemetryCap]) {
        let bits = caps.iter().fold(0u64, |acc, c| acc | c.mask());
        self.region.cpu_caps.store(bits, Ordering::Release);
    }

    /// Hand out another reader over the same region.
    pub fn reader(&self) -> RingReader {
        RingReader {
            region: Arc::clone(&self.region),
        }
    }

    /// Clear `process_active`. Permanent for the region's lifetime.
    pub fn shutdown(&mut self) {
        if self.region.process_active.swap(false, Ordering::AcqRel) {
            info!(
                name = %self.region.name,
                frames_written = self.region.num_frames_written.load(Ordering::Relaxed),
                "ring producer shut down",
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn set_frames_written(&mut self, n: u64) {
        self.region.num_frames_written.store(n, Ordering::Release);
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// A read-only view of a ring region. Cheap to clone.
#[derive(Clone)]
pub struct RingReader {
    region: Arc<Region>,
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("name", &self.region.name)
            .field("capacity", &self.region.max_entries)
            .field("head", &self.head_idx())
            .field("tail", &self.tail_idx())
            .finish()
    }
}

impl RingReader {
    /// Copy slot `index` into an owned record.
    ///
    /// With `checked`, the index must fall inside the live range. Without it,
    /// only the slot bound is enforced.
    pub fn read(&self, index: usize, checked: bool) -> Result<FrameRecord, RingError> {
        let mut image = [0u8; RECORD_SIZE];
        self.read_slot(index, checked, &mut image)?;
        Ok(FrameRecord::decode(&image)?)
    }

    /// Copy the raw slot image of `index` into `out`.
    pub fn read_slot(
        &self,
        index: usize,
        checked: bool,
        out: &mut [u8; RECORD_SIZE],
    ) -> Result<(), RingError> {
        let r = &*self.region;
        r.ensure_active()?;

        if checked {
            r.check_index(index)?;
        } else if index >= r.max_entries {
            return Err(RingError::OutOfBoundsIndex {
                index,
                head: self.head_idx(),
                tail: self.tail_idx(),
            });
        }

        r.load_slot(index, out);
        Ok(())
    }

    /// Index of the most recently written slot, `None` while empty.
    pub fn latest_frame_index(&self) -> Result<Option<usize>, RingError> {
        let r = &*self.region;
        r.ensure_active()?;

        if r.is_empty() {
            return Ok(None);
        }

        let tail = r.tail_idx.load(Ordering::Acquire);
        Ok(Some(if tail == 0 {
            r.max_entries - 1
        } else {
            tail - 1
        }))
    }

    /// Retire the oldest slot. Only meaningful on a backpressured ring, where
    /// the designated consumer frees slots it has processed.
    pub fn dequeue(&self) -> Result<bool, RingError> {
        let r = &*self.region;
        r.ensure_active()?;

        if !r.flags.backpressured || r.is_empty() {
            return Ok(false);
        }

        let head = r.head_idx.load(Ordering::Acquire);
        r.head_idx
            .store((head + 1) % r.max_entries, Ordering::Release);
        r.occupancy.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    pub fn name(&self) -> &str {
        &self.region.name
    }

    pub fn capacity(&self) -> usize {
        self.region.max_entries
    }

    pub fn qpc_frequency(&self) -> u64 {
        self.region.qpc_frequency
    }

    pub fn flags(&self) -> PlaybackFlags {
        self.region.flags
    }

    pub fn head_idx(&self) -> usize {
        self.region.head_idx.load(Ordering::Acquire)
    }

    pub fn tail_idx(&self) -> usize {
        self.region.tail_idx.load(Ordering::Acquire)
    }

    pub fn num_frames_written(&self) -> u64 {
        self.region.num_frames_written.load(Ordering::Acquire)
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.region.occupancy.load(Ordering::Acquire)
    }

    /// Present start time of the first frame written into the region.
    pub fn start_qpc(&self) -> u64 {
        self.region.start_qpc.load(Ordering::Relaxed)
    }

    /// True once the first frame has been written and `start_qpc` is fixed.
    pub fn has_start_qpc(&self) -> bool {
        self.region.start_recorded.load(Ordering::Acquire)
    }

    pub fn is_process_active(&self) -> bool {
        self.region.process_active.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.region.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// True until the producer has wrapped past the last slot once.
    pub fn has_uninitialized_frames(&self) -> bool {
        !self.region.wrapped.load(Ordering::Acquire)
    }

    pub fn has_gpu_cap(&self, cap: GpuTelemetryCap) -> bool {
        self.region.gpu_caps.load(Ordering::Acquire) & cap.mask() != 0
    }

    pub fn has_cpu_cap(&self, cap: CpuTelemetryCap) -> bool {
        self.region.cpu_caps.load(Ordering::Acquire) & cap.mask() != 0
    }
}
