//! # Live Frame Queries
//!
//! Answers "where is every agent at frame f" while the host scrubs the
//! timeline, from either source:
//!
//! - **Dense**: an O(1) slice of the precomputed [`FrameBuffer`]
//! - **Streaming**: a point query on the session's store, written into a
//!   reusable scratch frame
//!
//! Both share the load's sample policy. A `None` result means "keep what is
//! on screen": the frame is unsampled, out of range, or the query failed.
//! Failures never reach the caller; the first one is logged as a warning and
//! later ones at debug level.

use std::sync::Arc;

use log::{debug, warn};

use crate::agents::AgentIndex;
use crate::error::{PlaybackError, Result};
use crate::frame_buffer::{FrameBuffer, FrameView, VisibilityMask};
use crate::frame_cache::FrameCache;
use crate::sampling::SamplePolicy;
use crate::store::LazyStore;
use crate::{AgentPosition, Frame, FrameRange, AGENT_Z, HIDDEN_Z};

/// Where frame positions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Dense,
    Streaming,
}

enum Source {
    Dense(Arc<FrameBuffer>),
    Streaming { cache: FrameCache },
}

/// Installed frame-change handler.
pub struct LiveFrameQuery {
    agents: Arc<AgentIndex>,
    range: FrameRange,
    policy: SamplePolicy,
    source: Source,
    positions: Vec<f32>,
    visibility: VisibilityMask,
    last_frame: Option<Frame>,
    failures: u64,
}

impl LiveFrameQuery {
    /// Serve frames from a precomputed buffer.
    pub fn dense(buffer: Arc<FrameBuffer>, agents: Arc<AgentIndex>) -> Self {
        Self {
            range: buffer.range(),
            policy: buffer.policy(),
            agents,
            source: Source::Dense(buffer),
            positions: Vec::new(),
            visibility: VisibilityMask::default(),
            last_frame: None,
            failures: 0,
        }
    }

    /// Serve frames with point queries, caching up to `cache_frames` results.
    pub fn streaming(
        agents: Arc<AgentIndex>,
        range: FrameRange,
        policy: SamplePolicy,
        cache_frames: usize,
    ) -> Self {
        let n = agents.len();
        Self {
            positions: hidden_positions(n),
            visibility: VisibilityMask::new(n),
            agents,
            range,
            policy,
            source: Source::Streaming {
                cache: FrameCache::new(cache_frames),
            },
            last_frame: None,
            failures: 0,
        }
    }

    pub fn mode(&self) -> QueryMode {
        match self.source {
            Source::Dense(_) => QueryMode::Dense,
            Source::Streaming { .. } => QueryMode::Streaming,
        }
    }

    pub fn range(&self) -> FrameRange {
        self.range
    }

    /// Last frame that produced a view.
    pub fn last_frame(&self) -> Option<Frame> {
        self.last_frame
    }

    /// Failed queries since installation.
    pub fn failure_count(&self) -> u64 {
        self.failures
    }

    /// `(hits, misses)` of the streaming cache; `None` in dense mode.
    pub fn cache_stats(&self) -> Option<(u64, u64)> {
        match &self.source {
            Source::Dense(_) => None,
            Source::Streaming { cache } => Some(cache.hit_stats()),
        }
    }

    /// Positions for `frame`, or `None` to keep the current display.
    pub fn on_frame_change(&mut self, frame: Frame, store: &mut LazyStore) -> Option<FrameView<'_>> {
        if !self.policy.is_sampled(frame) || !self.range.contains(frame) {
            return None;
        }

        match &mut self.source {
            Source::Dense(buffer) => {
                let view = buffer.frame(frame)?;
                self.last_frame = Some(frame);
                Some(view)
            }
            Source::Streaming { cache } => {
                let fetched = fetch_positions(cache, store, frame);
                match fetched {
                    Ok(present) => {
                        fill_frame(&mut self.positions, &mut self.visibility, &self.agents, &present);
                        self.last_frame = Some(frame);
                        Some(FrameView::new(frame, &self.positions, &self.visibility))
                    }
                    Err(err) => {
                        report_failure(&mut self.failures, frame, &err);
                        None
                    }
                }
            }
        }
    }

    /// View of the last frame served, if any.
    pub fn last_view(&self) -> Option<FrameView<'_>> {
        let frame = self.last_frame?;
        match &self.source {
            Source::Dense(buffer) => buffer.frame(frame),
            Source::Streaming { .. } => {
                Some(FrameView::new(frame, &self.positions, &self.visibility))
            }
        }
    }
}

fn hidden_positions(agent_count: usize) -> Vec<f32> {
    std::iter::repeat([0.0, 0.0, HIDDEN_Z])
        .take(agent_count)
        .flatten()
        .collect()
}

fn fetch_positions(
    cache: &mut FrameCache,
    store: &mut LazyStore,
    frame: Frame,
) -> Result<Arc<[AgentPosition]>> {
    if let Some(hit) = cache.get(frame) {
        return Ok(hit);
    }
    let present: Arc<[AgentPosition]> = store.get()?.positions_at_frame(frame)?.into();
    cache.insert(frame, Arc::clone(&present));
    Ok(present)
}

/// Hide every slot, then show the agents present in this frame.
fn fill_frame(
    positions: &mut [f32],
    visibility: &mut VisibilityMask,
    agents: &AgentIndex,
    present: &[AgentPosition],
) {
    visibility.clear_all();
    for triple in positions.chunks_exact_mut(3) {
        triple.copy_from_slice(&[0.0, 0.0, HIDDEN_Z]);
    }

    for position in present {
        let Some(slot) = agents.slot_of(position.agent_id) else {
            continue;
        };
        let base = slot * 3;
        if let Some(triple) = positions.get_mut(base..base + 3) {
            triple.copy_from_slice(&[position.x as f32, position.y as f32, AGENT_Z]);
            visibility.show(slot);
        }
    }
}

fn report_failure(failures: &mut u64, frame: Frame, err: &PlaybackError) {
    *failures += 1;
    if *failures == 1 {
        warn!("[LiveQuery] Frame {frame} query failed, keeping last state: {err}");
    } else {
        debug!("[LiveQuery] Frame {frame} query failed ({} failures): {err}", failures);
    }
}
