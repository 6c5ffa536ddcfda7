//! Scene hand-off.
//!
//! The import pipeline never talks to a renderer directly. Everything it
//! materializes goes through [`SceneSink`], implemented by the host.
//! [`RecordingScene`] keeps every call in memory for headless use and tests.

use crate::error::{PlaybackError, Result};
use crate::geometry::BoundaryCurve;
use crate::{AgentId, FrameRange};

/// One agent object to create.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSpawn {
    pub agent_id: AgentId,
    /// Slot in the agent index, shared with frame views.
    pub slot: usize,
    pub scale: f64,
}

impl AgentSpawn {
    pub fn name(&self) -> String {
        format!("Agent_{}", self.agent_id)
    }
}

/// One agent path curve to create. Points sit at ground level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathCurve<'a> {
    pub agent_id: AgentId,
    pub points: &'a [[f64; 3]],
    pub thickness: f64,
}

impl PathCurve<'_> {
    pub fn name(&self) -> String {
        format!("Path_Agent_{}", self.agent_id)
    }
}

/// Receiver of everything the import pipeline materializes.
///
/// An error from any method aborts the running load.
pub trait SceneSink {
    /// Create (or reuse) the containers that hold the loaded objects.
    fn prepare_collections(&mut self) -> Result<()>;

    fn add_boundary(&mut self, curve: BoundaryCurve) -> Result<()>;

    /// A single point cloud whose points follow frame views slot by slot.
    fn add_point_cloud(&mut self, agent_count: usize, agent_scale: f64) -> Result<()>;

    fn add_agent(&mut self, agent: AgentSpawn) -> Result<()>;

    fn add_path(&mut self, path: PathCurve<'_>) -> Result<()>;

    fn set_paths_visible(&mut self, visible: bool) -> Result<()>;

    /// Rescale every agent object (or the point cloud instance) already created.
    fn set_agent_scale(&mut self, scale: f64) -> Result<()>;

    /// Playback bounds, plus the recorded frame rate when the store has one.
    fn set_frame_range(&mut self, range: FrameRange, fps: Option<f64>) -> Result<()>;
}

/// A path as recorded by [`RecordingScene`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPath {
    pub name: String,
    pub agent_id: AgentId,
    pub points: Vec<[f64; 3]>,
    pub thickness: f64,
}

/// In-memory [`SceneSink`].
#[derive(Debug, Clone, Default)]
pub struct RecordingScene {
    pub collections_prepared: u32,
    pub boundaries: Vec<BoundaryCurve>,
    pub point_cloud: Option<(usize, f64)>,
    pub agents: Vec<AgentSpawn>,
    pub paths: Vec<RecordedPath>,
    pub paths_visible: Option<bool>,
    pub frame_range: Option<(FrameRange, Option<f64>)>,
    /// Fail `add_agent` for this id.
    pub fail_on_agent: Option<AgentId>,
}

impl RecordingScene {
    /// A scene that fails when asked to create `agent_id`.
    pub fn failing_on_agent(agent_id: AgentId) -> Self {
        Self {
            fail_on_agent: Some(agent_id),
            ..Self::default()
        }
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|a| a.agent_id).collect()
    }
}

impl SceneSink for RecordingScene {
    fn prepare_collections(&mut self) -> Result<()> {
        self.collections_prepared += 1;
        Ok(())
    }

    fn add_boundary(&mut self, curve: BoundaryCurve) -> Result<()> {
        self.boundaries.push(curve);
        Ok(())
    }

    fn add_point_cloud(&mut self, agent_count: usize, agent_scale: f64) -> Result<()> {
        self.point_cloud = Some((agent_count, agent_scale));
        Ok(())
    }

    fn add_agent(&mut self, agent: AgentSpawn) -> Result<()> {
        if self.fail_on_agent == Some(agent.agent_id) {
            return Err(PlaybackError::Internal {
                message: format!("scene rejected {}", agent.name()),
            });
        }
        self.agents.push(agent);
        Ok(())
    }

    fn add_path(&mut self, path: PathCurve<'_>) -> Result<()> {
        self.paths.push(RecordedPath {
            name: path.name(),
            agent_id: path.agent_id,
            points: path.points.to_vec(),
            thickness: path.thickness,
        });
        Ok(())
    }

    fn set_paths_visible(&mut self, visible: bool) -> Result<()> {
        self.paths_visible = Some(visible);
        Ok(())
    }

    fn set_agent_scale(&mut self, scale: f64) -> Result<()> {
        for agent in &mut self.agents {
            agent.scale = scale;
        }
        if let Some((_, cloud_scale)) = self.point_cloud.as_mut() {
            *cloud_scale = scale;
        }
        Ok(())
    }

    fn set_frame_range(&mut self, range: FrameRange, fps: Option<f64>) -> Result<()> {
        self.frame_range = Some((range, fps));
        Ok(())
    }
}
