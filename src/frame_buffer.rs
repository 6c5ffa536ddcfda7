//! # Frame Buffers
//!
//! Pure transforms from ordered trajectory rows into the two shapes the
//! playback side consumes:
//!
//! - [`FrameBuffer`]: for every sampled frame, a flat `[x, y, z]` array indexed
//!   by agent slot plus a [`VisibilityMask`] ("big data" mode)
//! - [`PathGroups`]: every agent's sampled positions in input order
//!
//! Hidden slots carry `(0, 0, HIDDEN_Z)` so a point-cloud consumer can take a
//! frame slice as-is. The visibility mask is authoritative.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::agents::AgentIndex;
use crate::error::{PlaybackError, Result};
use crate::sampling::SamplePolicy;
use crate::{AgentId, Frame, FrameRange, TrajectoryRow, AGENT_Z, GROUND_Z, HIDDEN_Z};

// ============================================================================
// Visibility
// ============================================================================

/// Per-slot visibility bitset for one frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisibilityMask {
    words: Vec<u64>,
    len: usize,
}

impl VisibilityMask {
    /// A mask of `len` slots, all hidden.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark `slot` visible. Out-of-range slots are ignored.
    #[inline]
    pub fn show(&mut self, slot: usize) {
        if slot < self.len {
            self.words[slot / 64] |= 1 << (slot % 64);
        }
    }

    #[inline]
    pub fn hide(&mut self, slot: usize) {
        if slot < self.len {
            self.words[slot / 64] &= !(1 << (slot % 64));
        }
    }

    /// Hide every slot.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    #[inline]
    pub fn is_visible(&self, slot: usize) -> bool {
        slot < self.len && self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn count_visible(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Visible slots in ascending order.
    pub fn iter_visible(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }
}

// ============================================================================
// Frame views
// ============================================================================

/// Positions of every slot at one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    frame: Frame,
    positions: &'a [f32],
    visibility: &'a VisibilityMask,
}

impl<'a> FrameView<'a> {
    pub fn new(frame: Frame, positions: &'a [f32], visibility: &'a VisibilityMask) -> Self {
        Self {
            frame,
            positions,
            visibility,
        }
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Flat `[x, y, z]` triples for every slot, hidden ones included.
    pub fn positions(&self) -> &'a [f32] {
        self.positions
    }

    pub fn visibility(&self) -> &'a VisibilityMask {
        self.visibility
    }

    pub fn agent_count(&self) -> usize {
        self.positions.len() / 3
    }

    /// Position of a visible slot.
    pub fn position(&self, slot: usize) -> Option<[f32; 3]> {
        if !self.visibility.is_visible(slot) {
            return None;
        }
        let p = self.positions.get(slot * 3..slot * 3 + 3)?;
        Some([p[0], p[1], p[2]])
    }

    /// `(slot, [x, y, z])` for every visible slot.
    pub fn iter_visible(&self) -> impl Iterator<Item = (usize, [f32; 3])> + 'a {
        let positions = self.positions;
        let visibility: &'a VisibilityMask = self.visibility;
        visibility.iter_visible().filter_map(move |slot| {
            let p = positions.get(slot * 3..slot * 3 + 3)?;
            Some((slot, [p[0], p[1], p[2]]))
        })
    }
}

// ============================================================================
// Dense buffer
// ============================================================================

/// Precomputed positions for every sampled frame in a range.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    range: FrameRange,
    policy: SamplePolicy,
    agent_count: usize,
    positions: Vec<f32>,
    visibility: Vec<VisibilityMask>,
    rows_written: u64,
    rows_skipped: u64,
}

impl FrameBuffer {
    /// Slice for `frame`, or `None` if it is unsampled or out of range.
    pub fn frame(&self, frame: Frame) -> Option<FrameView<'_>> {
        let index = self.policy.index_of(frame, self.range)?;
        let stride = self.agent_count * 3;
        let positions = self.positions.get(index * stride..(index + 1) * stride)?;
        let visibility = self.visibility.get(index)?;
        Some(FrameView::new(frame, positions, visibility))
    }

    pub fn range(&self) -> FrameRange {
        self.range
    }

    pub fn policy(&self) -> SamplePolicy {
        self.policy
    }

    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn sampled_frame_count(&self) -> usize {
        self.visibility.len()
    }

    /// Rows written into the buffer.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Rows dropped for an unknown agent or a frame outside the range.
    pub fn rows_skipped(&self) -> u64 {
        self.rows_skipped
    }

    /// Approximate heap usage of positions and masks.
    pub fn memory_bytes(&self) -> usize {
        self.positions.len() * std::mem::size_of::<f32>()
            + self
                .visibility
                .iter()
                .map(|m| m.words.len() * std::mem::size_of::<u64>())
                .sum::<usize>()
    }
}

/// Incremental dense buffer construction.
///
/// Rows may arrive in any order. A later row for the same agent and frame
/// overwrites an earlier one.
#[derive(Debug)]
pub struct DenseBufferBuilder {
    range: FrameRange,
    policy: SamplePolicy,
    agent_count: usize,
    positions: Vec<f32>,
    visibility: Vec<VisibilityMask>,
    rows_written: u64,
    rows_skipped: u64,
}

impl DenseBufferBuilder {
    /// Allocate a buffer with every slot of every sampled frame hidden.
    ///
    /// Fails with [`PlaybackError::ConfigError`] when the buffer size
    /// overflows or cannot be allocated.
    pub fn new(range: FrameRange, policy: SamplePolicy, agent_count: usize) -> Result<Self> {
        let frames = policy.sampled_count(range);
        let len = frames
            .checked_mul(agent_count)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| PlaybackError::ConfigError {
                message: format!(
                    "dense buffer of {frames} frames x {agent_count} agents overflows; \
                     raise frame_step or disable big data mode"
                ),
            })?;

        let mut positions = Vec::new();
        positions
            .try_reserve_exact(len)
            .map_err(|e| PlaybackError::ConfigError {
                message: format!("cannot allocate dense buffer of {len} floats: {e}"),
            })?;
        positions.extend(
            std::iter::repeat([0.0, 0.0, HIDDEN_Z])
                .take(frames * agent_count)
                .flatten(),
        );
        let visibility = vec![VisibilityMask::new(agent_count); frames];

        debug!(
            "[FrameBuffer] Allocated {} frames x {} agents ({} floats)",
            frames, agent_count, len
        );

        Ok(Self {
            range,
            policy,
            agent_count,
            positions,
            visibility,
            rows_written: 0,
            rows_skipped: 0,
        })
    }

    /// Write one row into `slot`. `None` marks an agent unknown to the index.
    ///
    /// Returns whether the row landed in the buffer. Unsampled frames are
    /// ignored without being counted as skipped.
    pub fn push(&mut self, row: &TrajectoryRow, slot: Option<usize>) -> bool {
        let Some(slot) = slot.filter(|&s| s < self.agent_count) else {
            self.rows_skipped += 1;
            return false;
        };
        let Some(index) = self.policy.index_of(row.frame, self.range) else {
            if self.policy.is_sampled(row.frame) {
                self.rows_skipped += 1;
            }
            return false;
        };

        let stride = self.agent_count * 3;
        let frame_slice = &mut self.positions[index * stride..(index + 1) * stride];
        write_slot(frame_slice, &mut self.visibility[index], slot, row);
        self.rows_written += 1;
        true
    }

    pub fn finish(self) -> FrameBuffer {
        info!(
            "[FrameBuffer] Built {} frames, {} rows written, {} skipped",
            self.visibility.len(),
            self.rows_written,
            self.rows_skipped
        );
        FrameBuffer {
            range: self.range,
            policy: self.policy,
            agent_count: self.agent_count,
            positions: self.positions,
            visibility: self.visibility,
            rows_written: self.rows_written,
            rows_skipped: self.rows_skipped,
        }
    }
}

#[inline]
fn write_slot(frame_slice: &mut [f32], mask: &mut VisibilityMask, slot: usize, row: &TrajectoryRow) {
    let base = slot * 3;
    frame_slice[base] = row.x as f32;
    frame_slice[base + 1] = row.y as f32;
    frame_slice[base + 2] = AGENT_Z;
    mask.show(slot);
}

/// Build a dense buffer from rows in one pass.
pub fn build_dense_buffer<I>(
    rows: I,
    range: FrameRange,
    policy: SamplePolicy,
    agents: &AgentIndex,
) -> Result<FrameBuffer>
where
    I: IntoIterator<Item = TrajectoryRow>,
{
    let mut builder = DenseBufferBuilder::new(range, policy, agents.len())?;
    for row in rows {
        builder.push(&row, agents.slot_of(row.agent_id));
    }
    Ok(builder.finish())
}

/// Parallel variant of [`build_dense_buffer`].
///
/// Rows are bucketed by frame first, then frames are filled in parallel.
/// Input order is kept within each frame, so the result equals the
/// sequential build.
#[cfg(feature = "parallel")]
pub fn build_dense_buffer_parallel(
    rows: &[TrajectoryRow],
    range: FrameRange,
    policy: SamplePolicy,
    agents: &AgentIndex,
) -> Result<FrameBuffer> {
    use rayon::prelude::*;

    let mut builder = DenseBufferBuilder::new(range, policy, agents.len())?;
    let mut buckets: Vec<Vec<(usize, usize)>> = vec![Vec::new(); builder.visibility.len()];

    for (i, row) in rows.iter().enumerate() {
        match (agents.slot_of(row.agent_id), policy.index_of(row.frame, range)) {
            (Some(slot), Some(index)) => buckets[index].push((i, slot)),
            (None, _) => builder.rows_skipped += 1,
            (Some(_), None) => {
                if policy.is_sampled(row.frame) {
                    builder.rows_skipped += 1;
                }
            }
        }
    }

    let stride = builder.agent_count * 3;
    if stride > 0 {
        builder
            .positions
            .par_chunks_mut(stride)
            .zip(builder.visibility.par_iter_mut())
            .zip(buckets.par_iter())
            .for_each(|((frame_slice, mask), bucket)| {
                for &(i, slot) in bucket {
                    write_slot(frame_slice, mask, slot, &rows[i]);
                }
            });
    }
    builder.rows_written = buckets.iter().map(|b| b.len() as u64).sum();

    Ok(builder.finish())
}

// ============================================================================
// Path groups
// ============================================================================

/// Sampled positions of every agent, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathGroups {
    paths: BTreeMap<AgentId, Vec<[f64; 3]>>,
}

impl PathGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `row` to its agent's path if its frame is sampled.
    pub fn record(&mut self, row: &TrajectoryRow, policy: SamplePolicy) {
        if policy.is_sampled(row.frame) {
            self.paths
                .entry(row.agent_id)
                .or_default()
                .push([row.x, row.y, GROUND_Z as f64]);
        }
    }

    pub fn get(&self, agent_id: AgentId) -> Option<&[[f64; 3]]> {
        self.paths.get(&agent_id).map(Vec::as_slice)
    }

    /// Agents with at least one point.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn total_points(&self) -> usize {
        self.paths.values().map(Vec::len).sum()
    }

    /// `(agent_id, points)` in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &[[f64; 3]])> {
        self.paths.iter().map(|(&id, points)| (id, points.as_slice()))
    }
}

/// Group sampled rows by agent in one pass.
pub fn build_path_groups<I>(rows: I, policy: SamplePolicy) -> PathGroups
where
    I: IntoIterator<Item = TrajectoryRow>,
{
    let mut groups = PathGroups::new();
    for row in rows {
        groups.record(&row, policy);
    }
    groups
}
