//! # Crowd Replay
//!
//! Frame-indexed playback of large pedestrian trajectory datasets stored in
//! SQLite (JuPedSim trajectory files).
//!
//! This library provides:
//! - A background, cancellable staged import pipeline driven tick by tick
//! - Dense per-frame position buffers ("big data" mode) or per-frame store
//!   queries ("streaming" mode) behind one live frame-query API
//! - Walkable-area loading (WKT polygons unioned into one polygon with holes)
//!
//! ## Features
//!
//! - **`parallel`** - Build dense frame buffers in parallel with rayon
//!
//! ## Quick Start
//!
//! ```no_run
//! use crowd_replay::{PlaybackConfig, RecordingScene, Session, TickOutcome};
//!
//! let mut session = Session::new();
//! let mut scene = RecordingScene::default();
//! session.start_load("trajectories.sqlite", PlaybackConfig::default())?;
//!
//! // The host calls tick() from its own timer; this loop stands in for it.
//! while let TickOutcome::Running = session.tick(&mut scene) {
//!     std::thread::sleep(session.config().tick_interval());
//! }
//!
//! if let Some(view) = session.on_frame_change(10) {
//!     for (slot, [x, y, _z]) in view.iter_visible() {
//!         println!("slot {slot}: ({x}, {y})");
//!     }
//! }
//! # Ok::<(), crowd_replay::PlaybackError>(())
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, PlaybackError, Result};

// Configuration surface
pub mod config;
pub use config::PlaybackConfig;

// Frame sampling policy shared by build and query
pub mod sampling;
pub use sampling::SamplePolicy;

// Read-only trajectory store access
pub mod store;
pub use store::{LazyStore, StoreMetadata, TrajectoryColumns, TrajectoryStore};

// Walkable area loading and boundary hand-off
pub mod geometry;
pub use geometry::{load_walkable_area, BoundaryCurve, Ring, WalkableArea};

// Agent id <-> slot mapping
pub mod agents;
pub use agents::AgentIndex;

// Dense frame buffers and path groups
pub mod frame_buffer;
#[cfg(feature = "parallel")]
pub use frame_buffer::build_dense_buffer_parallel;
pub use frame_buffer::{
    build_dense_buffer, build_path_groups, DenseBufferBuilder, FrameBuffer, FrameView,
    PathGroups, VisibilityMask,
};

// LRU cache of streamed frames
pub mod frame_cache;
pub use frame_cache::FrameCache;

// Live frame queries
pub mod live;
pub use live::{LiveFrameQuery, QueryMode};

// Scene hand-off
pub mod scene;
pub use scene::{AgentSpawn, PathCurve, RecordedPath, RecordingScene, SceneSink};

// Staged import pipeline
pub mod pipeline;
pub use pipeline::{LoadProgress, LoadStatus, Stage, StageTimings, TickOutcome};

// Session context owning all playback state
pub mod session;
pub use session::{Session, SessionStats};

// ============================================================================
// Core Types
// ============================================================================

/// Stable agent identifier.
pub type AgentId = i64;

/// Recorded simulation frame number.
pub type Frame = i64;

/// Height of the walkable area and of path curves.
pub const GROUND_Z: f32 = 0.0;

/// Height of a visible agent (sphere center above the ground).
pub const AGENT_Z: f32 = 0.5;

/// Height of an agent absent from the current frame.
///
/// Far below any plausible trajectory height. The visibility mask is
/// authoritative; this value only lets a dense slice be consumed as-is.
pub const HIDDEN_Z: f32 = -10_000.0;

/// One recorded position of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRow {
    pub agent_id: AgentId,
    pub frame: Frame,
    pub x: f64,
    pub y: f64,
}

/// Position of an agent within a single queried frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub agent_id: AgentId,
    pub x: f64,
    pub y: f64,
}

/// Inclusive frame bounds of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameRange {
    pub min_frame: Frame,
    pub max_frame: Frame,
}

impl FrameRange {
    /// Create a range. Bounds given in the wrong order are swapped.
    pub fn new(min_frame: Frame, max_frame: Frame) -> Self {
        Self {
            min_frame: min_frame.min(max_frame),
            max_frame: min_frame.max(max_frame),
        }
    }

    /// The range reported for a store without rows.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    pub fn contains(&self, frame: Frame) -> bool {
        (self.min_frame..=self.max_frame).contains(&frame)
    }

    /// Number of frames in the range (always at least 1).
    ///
    /// Saturates at `u64::MAX` for a range spanning all of `i64`.
    pub fn len(&self) -> u64 {
        self.max_frame.abs_diff(self.min_frame).saturating_add(1)
    }

    /// Whether the range covers a single frame.
    pub fn is_single_frame(&self) -> bool {
        self.min_frame == self.max_frame
    }
}
