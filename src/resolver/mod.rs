//! Cross-frame context resolution.
//!
//! Most derived metrics describe the interval between two displayed frames,
//! so computing them for one present needs its displayed successor and a
//! handful of earlier frames of specific kinds. [`FrameContextResolver`] walks
//! a live ring with a cursor to find them; [`resolve_slice`] does the same
//! over an already-collected, chronological slice.

use tracing::debug;

use crate::ring::{FrameRecord, RingError, RingReader};

/// Earlier frames needed by history-dependent metrics.
///
/// Each slot holds the nearest frame of its kind before the current one.
#[derive(Debug, Clone, Default)]
pub struct BackReferences {
    pub last_presented: Option<FrameRecord>,
    pub last_app_presented: Option<FrameRecord>,
    pub last_displayed: Option<FrameRecord>,
    pub last_app_displayed: Option<FrameRecord>,
    /// Application frame immediately before `last_app_displayed`.
    pub prev_app_before_last_app_displayed: Option<FrameRecord>,
}

impl BackReferences {
    /// Feed frames newest-to-oldest. Returns true once every slot is filled.
    pub fn observe(&mut self, rec: &FrameRecord) -> bool {
        let p = &rec.present;
        let is_app = p.is_app_frame();
        let displayed = p.is_displayed();

        if self.last_presented.is_none() {
            self.last_presented = Some(rec.clone());
        }
        if self.last_app_presented.is_none() && is_app {
            self.last_app_presented = Some(rec.clone());
        }
        if self.last_displayed.is_none() && displayed {
            self.last_displayed = Some(rec.clone());
        }
        // Checked before last_app_displayed so one frame cannot fill both.
        if self.last_app_displayed.is_some()
            && self.prev_app_before_last_app_displayed.is_none()
            && is_app
        {
            self.prev_app_before_last_app_displayed = Some(rec.clone());
        }
        if self.last_app_displayed.is_none() && displayed && is_app {
            self.last_app_displayed = Some(rec.clone());
        }

        self.is_complete()
    }

    /// Append `rec` as the newest frame of an oldest-to-newest history.
    pub fn push(&mut self, rec: &FrameRecord) {
        let p = &rec.present;
        let is_app = p.is_app_frame();
        let displayed = p.is_displayed();

        if displayed && is_app {
            self.prev_app_before_last_app_displayed = self.last_app_presented.take();
            self.last_app_displayed = Some(rec.clone());
        }
        if displayed {
            self.last_displayed = Some(rec.clone());
        }
        if is_app {
            self.last_app_presented = Some(rec.clone());
        }
        self.last_presented = Some(rec.clone());
    }

    pub fn is_complete(&self) -> bool {
        self.last_presented.is_some()
            && self.last_app_presented.is_some()
            && self.last_displayed.is_some()
            && self.last_app_displayed.is_some()
            && self.prev_app_before_last_app_displayed.is_some()
    }

    /// Enough history exists to report metrics for the current frame.
    pub fn has_required(&self) -> bool {
        self.last_presented.is_some() && self.last_app_presented.is_some()
    }
}

/// Frames resolved around one present.
#[derive(Debug, Clone, Default)]
pub struct ResolvedFrames {
    pub current: FrameRecord,
    /// First displayed frame after `current`.
    pub next_displayed: FrameRecord,
    pub back: BackReferences,
}

/// Outcome of one resolver step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `ResolvedFrames` was filled and the cursor advanced.
    Ready,
    /// Not enough frames after the cursor yet; poll again later.
    InsufficientLookahead,
    /// The producer lapped the cursor. The resolver re-anchors on the next call.
    Overrun { pending: u64 },
}

/// Where an unanchored cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorMode {
    /// Newest frame: live consumers skip history.
    Latest,
    /// Oldest live frame: replay and backpressured consumers see everything.
    Oldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unanchored,
    Anchored { cursor: usize, cursor_seq: u64 },
}

/// Per-consumer cursor over a ring.
///
/// History is read from the ring once, when the cursor anchors, and carried
/// forward from then on, so a backpressured consumer may retire every slot
/// behind its cursor.
#[derive(Debug, Clone)]
pub struct FrameContextResolver {
    state: State,
    mode: AnchorMode,
    history: BackReferences,
}

impl FrameContextResolver {
    pub fn new(mode: AnchorMode) -> Self {
        Self {
            state: State::Unanchored,
            mode,
            history: BackReferences::default(),
        }
    }

    /// Pick the anchor mode implied by the ring's playback flags.
    pub fn for_reader(reader: &RingReader) -> Self {
        let flags = reader.flags();
        let mode = if flags.reset_oldest || flags.backpressured {
            AnchorMode::Oldest
        } else {
            AnchorMode::Latest
        };
        Self::new(mode)
    }

    pub fn mode(&self) -> AnchorMode {
        self.mode
    }

    pub fn is_anchored(&self) -> bool {
        matches!(self.state, State::Anchored { .. })
    }

    /// Slot index the next step will resolve, if anchored.
    pub fn cursor(&self) -> Option<usize> {
        match self.state {
            State::Anchored { cursor, .. } => Some(cursor),
            State::Unanchored => None,
        }
    }

    fn anchor(&self, reader: &RingReader, written: u64) -> Result<Option<(usize, u64)>, RingError> {
        let Some(latest) = reader.latest_frame_index()? else {
            return Ok(None);
        };

        let anchor = match self.mode {
            AnchorMode::Latest => (latest, written.wrapping_sub(1)),
            AnchorMode::Oldest => (
                reader.head_idx(),
                written.wrapping_sub(reader.len() as u64),
            ),
        };

        debug!(
            ring = reader.name(),
            cursor = anchor.0,
            mode = ?self.mode,
            "resolver anchored",
        );

        Ok(Some(anchor))
    }

    /// Resolve the frame at the cursor into `out` and advance past it.
    ///
    /// `out` is only meaningful when `Step::Ready` is returned.
    pub fn consume_next(
        &mut self,
        reader: &RingReader,
        out: &mut ResolvedFrames,
    ) -> Result<Step, RingError> {
        let written = reader.num_frames_written();
        let capacity = reader.capacity();

        let (cursor, cursor_seq) = match self.state {
            State::Anchored { cursor, cursor_seq } => (cursor, cursor_seq),
            State::Unanchored => match self.anchor(reader, written)? {
                Some(anchor) => {
                    self.state = State::Anchored {
                        cursor: anchor.0,
                        cursor_seq: anchor.1,
                    };
                    self.history = scan_history(reader, anchor.0)?;
                    anchor
                }
                None => return Ok(Step::InsufficientLookahead),
            },
        };

        let pending = written.wrapping_sub(cursor_seq);
        if pending > capacity as u64 {
            self.state = State::Unanchored;
            return Ok(Step::Overrun { pending });
        }
        if pending < 2 {
            return Ok(Step::InsufficientLookahead);
        }

        // `pending <= capacity` keeps every slot between the cursor and the
        // live edge readable, so only the slot bound is checked below.
        out.current = reader.read(cursor, false)?;

        let mut found = false;
        for k in 1..pending as usize {
            let rec = reader.read((cursor + k) % capacity, false)?;
            if rec.present.is_displayed() {
                out.next_displayed = rec;
                found = true;
                break;
            }
        }
        if !found {
            return Ok(Step::InsufficientLookahead);
        }

        out.back.clone_from(&self.history);
        self.history.push(&out.current);

        self.state = State::Anchored {
            cursor: (cursor + 1) % capacity,
            cursor_seq: cursor_seq.wrapping_add(1),
        };

        if reader.flags().backpressured {
            reader.dequeue()?;
        }

        Ok(Step::Ready)
    }
}

/// Walk backward from `cursor` to the oldest live slot.
fn scan_history(reader: &RingReader, cursor: usize) -> Result<BackReferences, RingError> {
    let capacity = reader.capacity();
    let mut back = BackReferences::default();
    if reader.is_empty() {
        return Ok(back);
    }
    let back_limit = (cursor + capacity - reader.head_idx()) % capacity;
    for k in 1..=back_limit {
        let rec = reader.read((cursor + capacity - k) % capacity, false)?;
        if back.observe(&rec) {
            break;
        }
    }
    Ok(back)
}

/// Resolve each frame of a chronological slice that has a displayed successor
/// inside the slice, calling `f` for each in order.
pub fn resolve_slice(frames: &[FrameRecord], mut f: impl FnMut(&ResolvedFrames)) {
    let mut resolved = ResolvedFrames::default();
    let mut next_displayed = 0;

    for i in 0..frames.len() {
        if next_displayed <= i {
            match (i + 1..frames.len()).find(|&j| frames[j].present.is_displayed()) {
                Some(j) => next_displayed = j,
                None => return,
            }
        }

        resolved.current = frames[i].clone();
        resolved.next_displayed = frames[next_displayed].clone();
        resolved.back = BackReferences::default();
        for rec in frames[..i].iter().rev() {
            if resolved.back.observe(rec) {
                break;
            }
        }

        f(&resolved);
    }
}
