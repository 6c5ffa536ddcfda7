//! # Playback Session
//!
//! The context object owning all state of one loaded simulation: the store
//! connection used for streaming queries, frame bounds, the agent index, the
//! dense buffer, the installed live query and the in-flight pipeline.
//!
//! The host owns the `Session` and drives it from its own timer:
//!
//! 1. [`Session::start_load`] spawns the pipeline
//! 2. [`Session::tick`] advances it until it reports [`TickOutcome::Finished`]
//! 3. [`Session::on_frame_change`] serves positions on every cursor move
//! 4. [`Session::teardown`] releases the store and the buffers

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::agents::AgentIndex;
use crate::config::PlaybackConfig;
use crate::error::{PlaybackError, Result};
use crate::frame_buffer::{FrameBuffer, FrameView};
use crate::live::{LiveFrameQuery, QueryMode};
use crate::pipeline::{ImportPipeline, LoadProgress, LoadStatus, Stage, TickOutcome};
use crate::scene::SceneSink;
use crate::store::{LazyStore, StoreMetadata};
use crate::{Frame, FrameRange};

/// Session statistics for monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub loading: bool,
    pub mode: Option<QueryMode>,
    pub agent_count: usize,
    pub frame_range: Option<FrameRange>,
    pub sampled_frame_count: usize,
    pub dense_buffer_bytes: usize,
    pub store_open: bool,
    pub hook_installed: bool,
    /// `(hits, misses)` of the streaming frame cache
    pub stream_cache: Option<(u64, u64)>,
    pub live_query_failures: u64,
    pub warning_count: usize,
}

/// Owned playback context. Nothing here is global.
pub struct Session {
    config: PlaybackConfig,
    pub(crate) store: LazyStore,
    pub(crate) frame_range: Option<FrameRange>,
    pub(crate) store_metadata: Option<StoreMetadata>,
    pub(crate) has_frame_index: Option<bool>,
    pub(crate) agents: Option<Arc<AgentIndex>>,
    pub(crate) frame_buffer: Option<Arc<FrameBuffer>>,
    live: Option<LiveFrameQuery>,
    pipeline: Option<ImportPipeline>,
    pub(crate) progress: LoadProgress,
    last_status: Option<LoadStatus>,
    pub(crate) warnings: Vec<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            config: PlaybackConfig::default(),
            store: LazyStore::detached(),
            frame_range: None,
            store_metadata: None,
            has_frame_index: None,
            agents: None,
            frame_buffer: None,
            live: None,
            pipeline: None,
            progress: LoadProgress::default(),
            last_status: None,
            warnings: Vec::new(),
        }
    }

    /// Config of the current (or last) load.
    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Begin loading `path`. Data from a previous load is torn down first.
    ///
    /// Fails with [`PlaybackError::LoadInProgress`] while another load runs;
    /// in that case nothing is changed.
    pub fn start_load(&mut self, path: impl AsRef<Path>, config: PlaybackConfig) -> Result<()> {
        if self.pipeline.is_some() {
            warn!("[Session] Load already in progress, ignoring request");
            return Err(PlaybackError::LoadInProgress);
        }
        config.validate()?;

        let path = path.as_ref();
        if !path.is_file() {
            return Err(PlaybackError::NotFound {
                path: path.to_path_buf(),
            });
        }

        self.teardown();
        self.frame_range = None;
        self.store_metadata = None;
        self.has_frame_index = None;
        self.agents = None;
        self.warnings.clear();
        self.last_status = None;

        info!("[Session] Loading {}", path.display());
        self.pipeline = Some(ImportPipeline::start(path.to_path_buf(), config.clone())?);
        self.store = LazyStore::new(path);
        self.config = config;
        self.progress = LoadProgress::starting(Stage::LoadingMetadata.message());
        Ok(())
    }

    /// Advance the running load by one step.
    pub fn tick<S>(&mut self, scene: &mut S) -> TickOutcome
    where
        S: SceneSink + ?Sized,
    {
        let Some(mut pipeline) = self.pipeline.take() else {
            return TickOutcome::Idle;
        };

        let outcome = pipeline.tick(self, scene);
        match &outcome {
            TickOutcome::Finished(status) => {
                debug!("[Session] Load finished: {}", status.message());
                self.last_status = Some(status.clone());
            }
            _ => self.pipeline = Some(pipeline),
        }
        outcome
    }

    /// Ask the running load to stop. Returns whether a load was running.
    pub fn request_cancel(&self) -> bool {
        match &self.pipeline {
            Some(pipeline) => {
                info!("[Session] Cancel requested");
                pipeline.request_cancel();
                true
            }
            None => false,
        }
    }

    pub fn progress(&self) -> &LoadProgress {
        &self.progress
    }

    pub fn is_loading(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.pipeline.as_ref().map(ImportPipeline::stage)
    }

    /// How the last load ended.
    pub fn last_status(&self) -> Option<&LoadStatus> {
        self.last_status.as_ref()
    }

    /// Non-fatal problems of the last load (e.g. unusable geometry).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    // ========================================================================
    // Display settings
    // ========================================================================

    /// Show or hide the agent path curves of the loaded scene.
    ///
    /// Updates the session config to match. Fails with
    /// [`PlaybackError::LoadInProgress`] while a load runs.
    pub fn set_show_paths<S>(&mut self, scene: &mut S, visible: bool) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        if self.is_loading() {
            return Err(PlaybackError::LoadInProgress);
        }
        self.config.show_paths = visible;
        if self.agents.is_some() {
            debug!("[Session] Paths visible: {visible}");
            scene.set_paths_visible(visible)?;
        }
        Ok(())
    }

    /// Rescale the agents of the loaded scene.
    ///
    /// `scale` must lie within `0.01..=10`. Updates the session config to
    /// match. Fails with [`PlaybackError::LoadInProgress`] while a load runs.
    pub fn set_agent_scale<S>(&mut self, scene: &mut S, scale: f64) -> Result<()>
    where
        S: SceneSink + ?Sized,
    {
        if self.is_loading() {
            return Err(PlaybackError::LoadInProgress);
        }
        let config = PlaybackConfig {
            agent_scale: scale,
            ..self.config.clone()
        };
        config.validate()?;
        self.config = config;
        if self.agents.is_some() {
            debug!("[Session] Agent scale: {scale}");
            scene.set_agent_scale(scale)?;
        }
        Ok(())
    }

    // ========================================================================
    // Frame queries
    // ========================================================================

    /// Positions at `frame`, or `None` to keep the current display.
    pub fn on_frame_change(&mut self, frame: Frame) -> Option<FrameView<'_>> {
        let live = self.live.as_mut()?;
        live.on_frame_change(frame, &mut self.store)
    }

    /// Install the live query over the loaded data.
    ///
    /// Uses the dense buffer when one was built, streaming queries otherwise.
    /// Returns `false` if a hook is already installed or nothing is loaded.
    pub fn install_live_hook(&mut self) -> bool {
        if self.live.is_some() {
            return false;
        }
        let Some(agents) = self.agents.clone() else {
            debug!("[Session] No agents loaded, live hook not installed");
            return false;
        };

        let live = match &self.frame_buffer {
            Some(buffer) => LiveFrameQuery::dense(Arc::clone(buffer), agents),
            None => {
                if self.has_frame_index == Some(false) {
                    warn!("[Session] Store has no index on frame; streaming queries will be slow");
                }
                LiveFrameQuery::streaming(
                    agents,
                    self.frame_range.unwrap_or_else(FrameRange::empty),
                    self.config.sample_policy(),
                    self.config.stream_cache_frames,
                )
            }
        };
        info!("[Session] Live hook installed ({:?})", live.mode());
        self.live = Some(live);
        true
    }

    /// Returns whether a hook was installed.
    pub fn uninstall_live_hook(&mut self) -> bool {
        let removed = self.live.take().is_some();
        if removed {
            debug!("[Session] Live hook removed");
        }
        removed
    }

    pub fn is_hook_installed(&self) -> bool {
        self.live.is_some()
    }

    pub fn mode(&self) -> Option<QueryMode> {
        self.live.as_ref().map(LiveFrameQuery::mode)
    }

    // ========================================================================
    // Loaded data
    // ========================================================================

    pub fn frame_range(&self) -> Option<FrameRange> {
        self.frame_range
    }

    pub fn agents(&self) -> Option<&AgentIndex> {
        self.agents.as_deref()
    }

    pub fn frame_buffer(&self) -> Option<&FrameBuffer> {
        self.frame_buffer.as_deref()
    }

    pub fn store_metadata(&self) -> Option<&StoreMetadata> {
        self.store_metadata.as_ref()
    }

    pub fn is_store_open(&self) -> bool {
        self.store.is_open()
    }

    /// Close the store, remove the live hook and drop the dense buffer.
    ///
    /// A running pipeline is left alone; cancel it first.
    pub fn teardown(&mut self) {
        let closed = self.store.close();
        let unhooked = self.uninstall_live_hook();
        let dropped = self.frame_buffer.take().is_some();
        if closed || unhooked || dropped {
            info!("[Session] Teardown (store closed={closed}, hook removed={unhooked}, buffer dropped={dropped})");
        }
    }

    /// Cleanup after a cancelled or failed load. Loaded data stays in place.
    pub(crate) fn release_after_abort(&mut self) {
        self.store.close();
        self.uninstall_live_hook();
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            loading: self.is_loading(),
            mode: self.mode(),
            agent_count: self.agents.as_ref().map_or(0, |a| a.len()),
            frame_range: self.frame_range,
            sampled_frame_count: self.frame_range.map_or(0, |range| {
                self.config.sample_policy().sampled_count(range)
            }),
            dense_buffer_bytes: self.frame_buffer.as_ref().map_or(0, |b| b.memory_bytes()),
            store_open: self.store.is_open(),
            hook_installed: self.is_hook_installed(),
            stream_cache: self.live.as_ref().and_then(LiveFrameQuery::cache_stats),
            live_query_failures: self.live.as_ref().map_or(0, LiveFrameQuery::failure_count),
            warning_count: self.warnings.len(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
