//! # Staged Import Pipeline
//!
//! A load runs as a strict sequence of named stages, advanced one step per
//! host tick:
//!
//! ```text
//! LoadingMetadata → CreatingCollections → CreatingGeometry
//!     → (CreatingBigData | CreatingAgents) → [CreatingPaths] → Finalizing → Done
//! ```
//!
//! `LoadingMetadata` runs on a background worker and is polled without
//! blocking. `CreatingAgents` and `CreatingPaths` are chunked: each tick
//! hands `chunk_size` entities to the scene in ascending agent-id order.
//! Every stage records its duration in [`StageTimings`].
//!
//! Cancellation is cooperative. The pipeline stops on the tick after
//! [`ImportPipeline::request_cancel`], keeps whatever was loaded and never
//! undoes scene objects it already created.

pub mod progress;
pub mod timing;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::config::PlaybackConfig;
use crate::error::{OptionExt, PlaybackError, Result};
use crate::frame_buffer::{FrameBuffer, PathGroups};
use crate::geometry::WalkableArea;
use crate::scene::{AgentSpawn, PathCurve, SceneSink};
use crate::session::Session;
use crate::{AgentId, FrameRange};

pub use progress::{stage_progress, LoadProgress, LoadStatus};
pub use timing::{StageTiming, StageTimings};
pub use worker::{MetadataResult, MetadataWorker, WorkerOutcome, WorkerPoll, WorkerRequest};

/// Worker phases in order, used to spread progress over `LoadingMetadata`.
const WORKER_PHASES: [&str; 6] = [
    "open",
    "metadata",
    "geometry",
    "frame_range",
    "agent_ids",
    "history_scan",
];

/// Named pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadingMetadata,
    CreatingCollections,
    CreatingGeometry,
    CreatingBigData,
    CreatingAgents,
    CreatingPaths,
    Finalizing,
    Done,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::LoadingMetadata => "LoadingMetadata",
            Stage::CreatingCollections => "CreatingCollections",
            Stage::CreatingGeometry => "CreatingGeometry",
            Stage::CreatingBigData => "CreatingBigData",
            Stage::CreatingAgents => "CreatingAgents",
            Stage::CreatingPaths => "CreatingPaths",
            Stage::Finalizing => "Finalizing",
            Stage::Done => "Done",
        }
    }

    /// Progress message shown while the stage runs.
    pub fn message(&self) -> &'static str {
        match self {
            Stage::LoadingMetadata => "Loading metadata...",
            Stage::CreatingCollections => "Creating collections...",
            Stage::CreatingGeometry => "Creating geometry...",
            Stage::CreatingBigData => "Creating point cloud...",
            Stage::CreatingAgents => "Creating agents...",
            Stage::CreatingPaths => "Creating paths...",
            Stage::Finalizing => "Finalizing...",
            Stage::Done => progress::MSG_COMPLETE,
        }
    }
}

/// Result of one host tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No load is running.
    Idle,
    /// The load advanced and needs more ticks.
    Running,
    /// The load ended on this tick.
    Finished(LoadStatus),
}

/// State of one in-flight load.
pub struct ImportPipeline {
    config: PlaybackConfig,
    stage: Stage,
    worker: Option<MetadataWorker>,
    cancel: Arc<AtomicBool>,
    timings: StageTimings,
    /// Entities already handed to the scene by the current chunked stage
    cursor: usize,
    walkable_area: Option<WalkableArea>,
    geometry_error: Option<PlaybackError>,
    dense: Option<FrameBuffer>,
    paths: Option<PathGroups>,
    path_ids: Vec<AgentId>,
    paths_created: usize,
    paths_skipped: usize,
}

impl ImportPipeline {
    /// Spawn the metadata worker and enter `LoadingMetadata`.
    pub fn start(path: std::path::PathBuf, config: PlaybackConfig) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let request = WorkerRequest {
            path,
            policy: config.sample_policy(),
            build_dense: config.big_data_mode,
            build_paths: config.load_full_paths,
            cancel_check_rows: config.cancel_check_rows,
        };
        let worker = MetadataWorker::spawn(request, Arc::clone(&cancel))?;

        let mut timings = StageTimings::new();
        timings.start(Stage::LoadingMetadata.name());
        info!(
            "[Pipeline] Load started (big_data_mode={}, load_full_paths={}, frame_step={})",
            config.big_data_mode, config.load_full_paths, config.frame_step
        );

        Ok(Self {
            config,
            stage: Stage::LoadingMetadata,
            worker: Some(worker),
            cancel,
            timings,
            cursor: 0,
            walkable_area: None,
            geometry_error: None,
            dense: None,
            paths: None,
            path_ids: Vec::new(),
            paths_created: 0,
            paths_skipped: 0,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }

    /// Ask the load to stop. Takes effect on the next tick.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Advance by one step.
    pub fn tick<S>(&mut self, session: &mut Session, scene: &mut S) -> TickOutcome
    where
        S: SceneSink + ?Sized,
    {
        if self.is_cancel_requested() {
            return self.finish_cancelled(session);
        }

        let step = match self.stage {
            Stage::LoadingMetadata => self.poll_metadata(session),
            Stage::CreatingCollections => self.create_collections(session, scene),
            Stage::CreatingGeometry => self.create_geometry(session, scene),
            Stage::CreatingBigData => self.create_big_data(session, scene),
            Stage::CreatingAgents => self.create_agent_chunk(session, scene),
            Stage::CreatingPaths => self.create_path_chunk(session, scene),
            Stage::Finalizing => self.finalize(session, scene),
            Stage::Done => Ok(()),
        };

        match step {
            Err(err) => self.finish_failed(session, err),
            Ok(()) if self.stage == Stage::Done => TickOutcome::Finished(LoadStatus::Complete),
            Ok(()) => TickOutcome::Running,
        }
    }

    // ========================================================================
    // Stage transitions
    // ========================================================================

    /// Progress window `(start, end)` of a stage.
    fn window(&self, stage: Stage) -> (f64, f64) {
        let agents_end = if self.config.load_full_paths { 75.0 } else { 95.0 };
        match stage {
            Stage::LoadingMetadata => (0.0, 40.0),
            Stage::CreatingCollections => (40.0, 42.0),
            Stage::CreatingGeometry => (42.0, 45.0),
            Stage::CreatingBigData | Stage::CreatingAgents => (45.0, agents_end),
            Stage::CreatingPaths => (75.0, 95.0),
            Stage::Finalizing => (95.0, 100.0),
            Stage::Done => (100.0, 100.0),
        }
    }

    fn enter(&mut self, next: Stage, progress: &mut LoadProgress) {
        if let Some(elapsed) = self.timings.finish(self.stage.name()) {
            info!(
                "[Pipeline] {} done in {:.1}ms",
                self.stage.name(),
                elapsed.as_secs_f64() * 1000.0
            );
        }
        debug!("[Pipeline] {} -> {}", self.stage.name(), next.name());
        self.stage = next;
        self.cursor = 0;
        if next != Stage::Done {
            self.timings.start(next.name());
        }
        progress.advance(self.window(next).0, next.message());
    }

    fn after_geometry(&self) -> Stage {
        if self.config.big_data_mode {
            Stage::CreatingBigData
        } else {
            Stage::CreatingAgents
        }
    }

    fn after_agents(&self) -> Stage {
        if self.config.load_full_paths {
            Stage::CreatingPaths
        } else {
            Stage::Finalizing
        }
    }

    // ========================================================================
    // Stages
    // ========================================================================

    fn poll_metadata(&mut self, session: &mut Session) -> Result<()> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_internal("metadata worker missing")?;

        match worker.poll() {
            WorkerPoll::Pending => {
                let phase = worker.progress().phase();
                let fraction = worker.progress().fraction();
                let index = WORKER_PHASES
                    .iter()
                    .position(|p| *p == phase)
                    .unwrap_or(0);
                let (start, end) = self.window(Stage::LoadingMetadata);
                let done = (index as f64 + fraction) / WORKER_PHASES.len() as f64;
                session
                    .progress
                    .advance(start + done * (end - start), Stage::LoadingMetadata.message());
                Ok(())
            }
            WorkerPoll::Finished(outcome) => {
                self.worker = None;
                self.accept_outcome(session, outcome)?;
                if !self.is_cancel_requested() {
                    self.enter(Stage::CreatingCollections, &mut session.progress);
                }
                Ok(())
            }
        }
    }

    /// Commit the worker's result to the session. Partial results are
    /// committed too, before any worker error is returned.
    fn accept_outcome(&mut self, session: &mut Session, outcome: WorkerOutcome) -> Result<()> {
        let WorkerOutcome { mut result, error } = outcome;
        self.timings.merge(std::mem::take(&mut result.timings));

        session.store_metadata = result.store_metadata.take();
        session.has_frame_index = result.has_frame_index;
        if let Some(range) = result.frame_range {
            session.frame_range = Some(range);
        }
        if let Some(agents) = result.agents.take() {
            session.progress.loaded_agent_count = agents.len();
            session.agents = Some(Arc::new(agents));
        }
        self.walkable_area = result.walkable_area.take();
        self.geometry_error = result.geometry_error.take();
        self.dense = result.frame_buffer.take();
        self.paths = result.paths.take();

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn create_collections<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        scene.prepare_collections()?;
        self.enter(Stage::CreatingGeometry, &mut session.progress);
        Ok(())
    }

    fn create_geometry<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        if let Some(err) = self.geometry_error.take() {
            warn!("[Pipeline] Skipping geometry: {err}");
            session.warnings.push(format!("Geometry not loaded: {err}"));
        } else if let Some(area) = self.walkable_area.take() {
            let curves = area.boundary_curves(self.config.geometry_thickness);
            info!("[Pipeline] Creating {} boundary curves", curves.len());
            for curve in curves {
                scene.add_boundary(curve)?;
            }
        } else {
            info!("[Pipeline] No walkable area in store");
        }

        let next = self.after_geometry();
        self.enter(next, &mut session.progress);
        Ok(())
    }

    fn create_big_data<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        let buffer = self.dense.take().ok_or_internal("dense buffer missing")?;
        info!(
            "[Pipeline] Dense buffer: {} frames x {} agents, {:.1} MB",
            buffer.sampled_frame_count(),
            buffer.agent_count(),
            buffer.memory_bytes() as f64 / (1024.0 * 1024.0)
        );
        let agent_count = buffer.agent_count();
        session.frame_buffer = Some(Arc::new(buffer));
        scene.add_point_cloud(agent_count, self.config.agent_scale)?;

        let next = self.after_agents();
        self.enter(next, &mut session.progress);
        Ok(())
    }

    fn create_agent_chunk<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        let agents = session
            .agents
            .clone()
            .ok_or_internal("agent index missing")?;
        let chunk = agents.chunk(self.cursor, self.config.chunk_size);
        for (offset, &agent_id) in chunk.iter().enumerate() {
            scene.add_agent(AgentSpawn {
                agent_id,
                slot: self.cursor + offset,
                scale: self.config.agent_scale,
            })?;
        }
        self.cursor += chunk.len();

        let total = agents.len();
        let (start, end) = self.window(Stage::CreatingAgents);
        session.progress.advance(
            stage_progress(start, end, self.cursor, total),
            format!("Creating agents... ({}/{})", self.cursor, total),
        );

        if self.cursor >= total {
            let next = self.after_agents();
            self.enter(next, &mut session.progress);
        }
        Ok(())
    }

    fn create_path_chunk<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        if self.cursor == 0 && self.path_ids.is_empty() {
            self.path_ids = self
                .paths
                .as_ref()
                .map(|p| p.iter().map(|(id, _)| id).collect())
                .unwrap_or_default();
        }

        let end_index = (self.cursor + self.config.chunk_size).min(self.path_ids.len());
        if let Some(paths) = &self.paths {
            for &agent_id in &self.path_ids[self.cursor..end_index] {
                let points = paths.get(agent_id).unwrap_or_default();
                if points.len() < 2 {
                    self.paths_skipped += 1;
                    continue;
                }
                scene.add_path(PathCurve {
                    agent_id,
                    points,
                    thickness: self.config.path_thickness,
                })?;
                self.paths_created += 1;
            }
        }
        self.cursor = end_index;

        let total = self.path_ids.len();
        let (start, end) = self.window(Stage::CreatingPaths);
        session.progress.advance(
            stage_progress(start, end, self.cursor, total),
            format!("Creating paths... ({}/{})", self.cursor, total),
        );

        if self.cursor >= total {
            scene.set_paths_visible(self.config.show_paths)?;
            info!(
                "[Pipeline] Created {} paths ({} skipped with fewer than 2 points)",
                self.paths_created, self.paths_skipped
            );
            self.paths = None;
            self.enter(Stage::Finalizing, &mut session.progress);
        }
        Ok(())
    }

    fn finalize<S>(&mut self, session: &mut Session, scene: &mut S) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        let range = session.frame_range.unwrap_or_else(FrameRange::empty);
        let fps = session.store_metadata.as_ref().and_then(|m| m.fps);
        scene.set_frame_range(range, fps)?;
        session.install_live_hook();

        self.enter(Stage::Done, &mut session.progress);
        session.progress.in_progress = false;
        session.progress.progress_pct = 100.0;
        info!(
            "[Pipeline] Load complete: {} agents, frames {}..={} [{}]",
            session.progress.loaded_agent_count,
            range.min_frame,
            range.max_frame,
            self.timings.summary()
        );
        Ok(())
    }

    // ========================================================================
    // Termination
    // ========================================================================

    fn finish_cancelled(&mut self, session: &mut Session) -> TickOutcome {
        // A result that already arrived is kept; a worker still running is
        // left to notice the flag and exit on its own.
        if let Some(mut worker) = self.worker.take() {
            if let WorkerPoll::Finished(outcome) = worker.poll() {
                if let Err(err) = self.accept_outcome(session, outcome) {
                    debug!("[Pipeline] Worker error after cancel: {err}");
                }
            }
        }
        self.timings.finalize_running(Instant::now());
        session.release_after_abort();

        let status = LoadStatus::Cancelled {
            partial_data_retained: true,
        };
        session.progress.in_progress = false;
        session.progress.message = status.message();
        self.stage = Stage::Done;
        info!(
            "[Pipeline] Load cancelled [{}]",
            self.timings.summary()
        );
        TickOutcome::Finished(status)
    }

    fn finish_failed(&mut self, session: &mut Session, err: PlaybackError) -> TickOutcome {
        if let PlaybackError::WorkerFailure { trace, .. } = &err {
            debug!("[Pipeline] Worker trace:\n{trace}");
        }
        error!("[Pipeline] Load failed in {}: {err}", self.stage.name());

        self.worker = None;
        self.timings.finalize_running(Instant::now());
        session.release_after_abort();

        let status = LoadStatus::Failed {
            message: err.to_string(),
        };
        session.progress.in_progress = false;
        session.progress.message = status.message();
        self.stage = Stage::Done;
        TickOutcome::Finished(status)
    }
}
