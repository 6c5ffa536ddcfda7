//! Background metadata worker.
//!
//! Runs the heavy part of a load on its own thread with its own read-only
//! connection: metadata, geometry, frame range, agent ids, and (when
//! requested) one ordered scan of the full history that fills the dense
//! buffer and the path groups.
//!
//! The worker sends exactly one [`WorkerOutcome`] and exits. The interactive
//! side polls with [`MetadataWorker::poll`], which never blocks.

use std::any::Any;
use std::backtrace::Backtrace;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::agents::AgentIndex;
use crate::error::{OptionExt, PlaybackError, Result};
#[cfg(feature = "parallel")]
use crate::frame_buffer::build_dense_buffer_parallel;
#[cfg(not(feature = "parallel"))]
use crate::frame_buffer::DenseBufferBuilder;
use crate::frame_buffer::{FrameBuffer, PathGroups};
use crate::geometry::{load_walkable_area, WalkableArea};
use crate::pipeline::timing::StageTimings;
use crate::sampling::SamplePolicy;
use crate::store::{StoreMetadata, TrajectoryStore};
use crate::{FrameRange, TrajectoryRow};

/// What the worker should load.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub path: PathBuf,
    pub policy: SamplePolicy,
    pub build_dense: bool,
    pub build_paths: bool,
    /// Rows scanned between cancellation checks
    pub cancel_check_rows: usize,
}

/// Everything the worker managed to load. Steps that did not run stay `None`.
#[derive(Debug, Default)]
pub struct MetadataResult {
    pub store_metadata: Option<StoreMetadata>,
    pub has_frame_index: Option<bool>,
    pub walkable_area: Option<WalkableArea>,
    /// Geometry failures do not fail the worker; they are reported here.
    pub geometry_error: Option<PlaybackError>,
    pub frame_range: Option<FrameRange>,
    pub agents: Option<AgentIndex>,
    pub frame_buffer: Option<FrameBuffer>,
    pub paths: Option<PathGroups>,
    pub rows_scanned: u64,
    pub timings: StageTimings,
    /// The worker stopped early because cancellation was requested.
    pub cancelled: bool,
}

/// Final message from the worker.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub result: MetadataResult,
    pub error: Option<PlaybackError>,
}

/// Worker progress shared between threads.
#[derive(Debug, Clone)]
pub struct WorkerProgress {
    /// Current phase: "starting", "open", "metadata", "geometry", "frame_range", "agent_ids", "history_scan", "done"
    phase: Arc<Mutex<String>>,
    completed: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl WorkerProgress {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new("starting".to_string())),
            completed: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_phase(&self, phase: &str, total: u64) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase.to_string();
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn add_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::SeqCst);
    }

    pub fn phase(&self) -> String {
        self.phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Completed fraction of the current phase (0 when the total is unknown).
    pub fn fraction(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.completed() as f64 / total as f64).min(1.0),
        }
    }
}

impl Default for WorkerProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a non-blocking poll.
#[derive(Debug)]
pub enum WorkerPoll {
    Pending,
    Finished(WorkerOutcome),
}

/// Handle on the background worker.
pub struct MetadataWorker {
    receiver: mpsc::Receiver<WorkerOutcome>,
    cancel: Arc<AtomicBool>,
    progress: WorkerProgress,
    handle: Option<thread::JoinHandle<()>>,
    finished: bool,
}

impl MetadataWorker {
    /// Spawn the worker thread. `cancel` is checked between steps and
    /// periodically during the history scan.
    pub fn spawn(request: WorkerRequest, cancel: Arc<AtomicBool>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let progress = WorkerProgress::new();

        let worker_cancel = Arc::clone(&cancel);
        let worker_progress = progress.clone();
        let handle = thread::Builder::new()
            .name("crowd-replay-worker".to_string())
            .spawn(move || {
                let started = Instant::now();
                let mut result = MetadataResult::default();
                let error = run_guarded(&mut result, |result| {
                    run_steps(&request, &worker_cancel, &worker_progress, result)
                });
                result.timings.finalize_running(Instant::now());
                worker_progress.set_phase("done", 0);
                debug!(
                    "[Worker] Finished in {:.1}ms (cancelled={}, error={})",
                    started.elapsed().as_secs_f64() * 1000.0,
                    result.cancelled,
                    error.is_some()
                );
                tx.send(WorkerOutcome { result, error }).ok();
            })
            .map_err(|e| PlaybackError::Internal {
                message: format!("failed to spawn worker thread: {e}"),
            })?;

        Ok(Self {
            receiver: rx,
            cancel,
            progress,
            handle: Some(handle),
            finished: false,
        })
    }

    /// Check for the outcome without blocking.
    ///
    /// A worker that vanished without sending is reported as a failure.
    /// After the outcome has been returned once, further polls stay pending.
    pub fn poll(&mut self) -> WorkerPoll {
        if self.finished {
            return WorkerPoll::Pending;
        }
        let outcome = match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return WorkerPoll::Pending,
            Err(TryRecvError::Disconnected) => WorkerOutcome {
                result: MetadataResult::default(),
                error: Some(PlaybackError::WorkerFailure {
                    message: "worker exited without a result".to_string(),
                    trace: String::new(),
                }),
            },
        };
        self.finished = true;
        // The thread is done or about to exit; let it go without joining.
        self.handle.take();
        WorkerPoll::Finished(outcome)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> &WorkerProgress {
        &self.progress
    }
}

/// Run `body`, turning errors and panics into the worker's error slot.
/// Whatever `body` stored in `result` before failing is kept.
fn run_guarded<F>(result: &mut MetadataResult, body: F) -> Option<PlaybackError>
where
    F: FnOnce(&mut MetadataResult) -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| body(result))) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            error!("[Worker] Load failed: {err}");
            Some(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let trace = Backtrace::force_capture().to_string();
            error!("[Worker] Panicked: {message}");
            Some(PlaybackError::WorkerFailure { message, trace })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Accumulates the dense buffer during the history scan.
///
/// Without the `parallel` feature rows are written straight into the
/// buffer. With it, the scan only collects rows and the frames are filled
/// with rayon once the scan is done.
enum DenseCollector {
    #[cfg(not(feature = "parallel"))]
    Incremental(DenseBufferBuilder),
    #[cfg(feature = "parallel")]
    Buffered {
        range: FrameRange,
        policy: SamplePolicy,
        rows: Vec<TrajectoryRow>,
    },
}

impl DenseCollector {
    fn new(range: FrameRange, policy: SamplePolicy, agent_count: usize) -> Result<Self> {
        #[cfg(not(feature = "parallel"))]
        {
            Ok(Self::Incremental(DenseBufferBuilder::new(range, policy, agent_count)?))
        }
        #[cfg(feature = "parallel")]
        {
            debug!("[Worker] Collecting rows for a parallel build of {agent_count} agents");
            Ok(Self::Buffered {
                range,
                policy,
                rows: Vec::new(),
            })
        }
    }

    fn push(&mut self, row: TrajectoryRow, agents: &AgentIndex) {
        match self {
            #[cfg(not(feature = "parallel"))]
            Self::Incremental(builder) => {
                builder.push(&row, agents.slot_of(row.agent_id));
            }
            #[cfg(feature = "parallel")]
            Self::Buffered { policy, rows, .. } => {
                let _ = agents;
                // Unsampled rows never reach the buffer.
                if policy.is_sampled(row.frame) {
                    rows.push(row);
                }
            }
        }
    }

    fn finish(self, agents: &AgentIndex) -> Result<FrameBuffer> {
        match self {
            #[cfg(not(feature = "parallel"))]
            Self::Incremental(builder) => {
                let _ = agents;
                Ok(builder.finish())
            }
            #[cfg(feature = "parallel")]
            Self::Buffered { range, policy, rows } => {
                build_dense_buffer_parallel(&rows, range, policy, agents)
            }
        }
    }
}

fn cancel_requested(cancel: &AtomicBool, result: &mut MetadataResult, next_step: &str) -> bool {
    if cancel.load(Ordering::SeqCst) {
        info!("[Worker] Cancelled before {next_step}");
        result.cancelled = true;
        return true;
    }
    false
}

fn run_steps(
    request: &WorkerRequest,
    cancel: &AtomicBool,
    progress: &WorkerProgress,
    result: &mut MetadataResult,
) -> Result<()> {
    if cancel_requested(cancel, result, "open") {
        return Ok(());
    }
    progress.set_phase("open", 0);
    result.timings.start("worker.open");
    let store = TrajectoryStore::open(&request.path)?;
    result.timings.finish("worker.open");

    if cancel_requested(cancel, result, "metadata") {
        return Ok(());
    }
    progress.set_phase("metadata", 0);
    result.timings.start("worker.metadata");
    let metadata = store.metadata()?;
    result.has_frame_index = Some(store.has_frame_index()?);
    result.store_metadata = Some(metadata);
    result.timings.finish("worker.metadata");

    if cancel_requested(cancel, result, "geometry") {
        return Ok(());
    }
    progress.set_phase("geometry", 0);
    result.timings.start("worker.geometry");
    match load_walkable_area(&store) {
        Ok(area) => result.walkable_area = area,
        Err(err) => {
            warn!("[Worker] Geometry not loaded: {err}");
            result.geometry_error = Some(err);
        }
    }
    result.timings.finish("worker.geometry");

    if cancel_requested(cancel, result, "frame_range") {
        return Ok(());
    }
    progress.set_phase("frame_range", 0);
    result.timings.start("worker.frame_range");
    let range = store.frame_range()?;
    if let Some(frame_rows) = result.store_metadata.as_ref().and_then(|m| m.frame_data_rows) {
        if frame_rows != range.len() {
            warn!(
                "[Worker] frame_data has {} rows but trajectories span {} frames",
                frame_rows,
                range.len()
            );
        }
    }
    result.frame_range = Some(range);
    result.timings.finish("worker.frame_range");
    info!(
        "[Worker] Frame range {}..={}",
        range.min_frame, range.max_frame
    );

    if cancel_requested(cancel, result, "agent_ids") {
        return Ok(());
    }
    progress.set_phase("agent_ids", 0);
    result.timings.start("worker.agent_ids");
    result.agents = Some(AgentIndex::from_ids(store.distinct_agent_ids()?));
    result.timings.finish("worker.agent_ids");
    let agent_count = result.agents.as_ref().map_or(0, AgentIndex::len);
    info!("[Worker] {agent_count} agents");

    if !request.build_dense && !request.build_paths {
        return Ok(());
    }
    if cancel_requested(cancel, result, "history_scan") {
        return Ok(());
    }
    let agents = result.agents.as_ref().ok_or_internal("agent index missing")?;

    result.timings.start("worker.history_scan");
    progress.set_phase("history_scan", store.row_count()?);
    let mut dense = if request.build_dense {
        Some(DenseCollector::new(range, request.policy, agents.len())?)
    } else {
        None
    };
    let mut paths = request.build_paths.then(PathGroups::new);

    let check_every = request.cancel_check_rows.max(1) as u64;
    let mut since_check = 0u64;
    let mut interrupted = false;
    let scanned = store.visit_full_history(|row| {
        if let Some(collector) = dense.as_mut() {
            collector.push(row, agents);
        }
        if let Some(groups) = paths.as_mut() {
            groups.record(&row, request.policy);
        }
        since_check += 1;
        if since_check >= check_every {
            progress.add_completed(since_check);
            since_check = 0;
            if cancel.load(Ordering::SeqCst) {
                interrupted = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    })?;
    progress.add_completed(since_check);

    if interrupted {
        info!("[Worker] History scan cancelled after {scanned} rows");
        result.rows_scanned = scanned;
        result.timings.finish("worker.history_scan");
        result.cancelled = true;
        return Ok(());
    }

    let frame_buffer = dense.map(|collector| collector.finish(agents)).transpose()?;
    result.rows_scanned = scanned;
    result.timings.finish("worker.history_scan");
    result.frame_buffer = frame_buffer;
    result.paths = paths;
    info!("[Worker] Scanned {scanned} history rows");
    Ok(())
}
