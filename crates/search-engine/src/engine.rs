use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::alignment::{Aligner, Visualizer};
use crate::api::{
    CandidateSlot, CandidateStat, CandidateStatus, EngineConfig, EngineError, JobDescriptor,
    JobId, JobStatus, Phase, PhaseProgress, PhaseState, SearchRequest, StreamFrame,
};
use crate::backend::{BackendError, SearchBackend};
use crate::phase::{PhaseOutcome, PhaseScheduler, PhaseTask};
use crate::pool::{TaskError, TaskHandle, WorkerPool};
use crate::registry::JobRegistry;
use crate::store::{ChainInfo, StructureStore};
use crate::stream::{FrameEmitter, JobView};
use crate::worker::{DetailContext, DetailError, DetailRequest, compute_stats};

const FRAME_CHANNEL_CAPACITY: usize = 64;
const END_JOB_TIMEOUT: Duration = Duration::from_secs(5);

/// Chains shorter than this are not offered as search queries.
pub const MIN_QUERY_CHAIN_RESIDUES: u32 = 10;

/// External services the engine orchestrates.
pub struct Collaborators {
    /// Job descriptor store.
    pub registry: Arc<dyn JobRegistry>,
    /// Remote similarity search service.
    pub backend: Arc<dyn SearchBackend>,
    /// Identifier lookup and pairwise result cache.
    pub store: Arc<dyn StructureStore>,
    /// Pairwise structural comparison.
    pub aligner: Arc<dyn Aligner>,
    /// Comparison renderer; `None` disables rendering for every job.
    pub visualizer: Option<Arc<dyn Visualizer>>,
}

struct EngineShared {
    cfg: EngineConfig,
    registry: Arc<dyn JobRegistry>,
    backend: Arc<dyn SearchBackend>,
    store: Arc<dyn StructureStore>,
    details: Arc<DetailContext>,
    pool: WorkerPool,
    streams: DashMap<JobId, broadcast::Sender<StreamFrame>>,
}

impl EngineShared {
    fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.details.job_dir(job_id)
    }

    async fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let mut reaped = 0;
        for job_id in self.registry.job_ids() {
            let Some(descriptor) = self.registry.get(&job_id) else {
                continue;
            };
            let idle = (now - descriptor.updated_at).to_std().unwrap_or_default();
            if !descriptor.status.is_terminal() || idle <= max_idle {
                continue;
            }

            self.registry.delete(&job_id);
            self.streams.remove(&job_id);
            let job_dir = self.job_dir(&job_id);
            match tokio::fs::remove_dir_all(&job_dir).await {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                    warn!(%job_id, dir = %job_dir.display(), "failed to remove job directory: {err}");
                }
                _ => {}
            }
            debug!(%job_id, idle_secs = idle.as_secs(), "reaped idle job");
            reaped += 1;
        }
        reaped
    }
}

/// Cloneable handle to the job orchestration engine.
///
/// Every submitted job gets its own streaming loop on the caller's tokio runtime;
/// phase searches and candidate detail computations of all jobs share one bounded
/// low-priority worker pool.
#[derive(Clone)]
pub struct SearchEngine {
    shared: Arc<EngineShared>,
}

impl SearchEngine {
    /// Build an engine and its worker pool.
    pub fn new(cfg: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        let cfg = cfg.normalized();
        let pool = WorkerPool::new(cfg.pool_size, cfg.worker_nice).map_err(EngineError::Pool)?;
        let details = Arc::new(DetailContext {
            store: collaborators.store.clone(),
            aligner: collaborators.aligner,
            visualizer: collaborators.visualizer,
            cache_min_elapsed: cfg.cache_min_elapsed,
            computations_dir: cfg.computations_dir.clone(),
        });
        Ok(Self {
            shared: Arc::new(EngineShared {
                cfg,
                registry: collaborators.registry,
                backend: collaborators.backend,
                store: collaborators.store,
                details,
                pool,
                streams: DashMap::new(),
            }),
        })
    }

    /// Register a job and start its streaming loop. Must be called within a tokio runtime.
    pub fn submit(&self, request: SearchRequest) -> Result<JobId, EngineError> {
        request.validate()?;

        let job_id = JobId::new_random();
        let descriptor = JobDescriptor::new(job_id.clone(), &request);
        self.shared.registry.create(descriptor.clone())?;

        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        self.shared.streams.insert(job_id.clone(), frames.clone());

        info!(
            %job_id,
            query = %request.query,
            radius = descriptor.radius,
            num_results = descriptor.num_results,
            "search job submitted"
        );
        let runtime = JobRuntime::new(self.shared.clone(), descriptor, frames);
        tokio::spawn(runtime.run());
        Ok(job_id)
    }

    /// Stream of frames for `job_id`, starting with a full snapshot.
    ///
    /// Once the job is terminal the subscription yields only the snapshot.
    pub fn subscribe(&self, job_id: &JobId) -> Result<JobSubscription, EngineError> {
        // Subscribe before reading the descriptor so no frame falls in between.
        let rx = self
            .shared
            .streams
            .get(job_id)
            .map(|frames| frames.subscribe());
        let descriptor = self
            .shared
            .registry
            .get(job_id)
            .ok_or_else(|| EngineError::UnknownJob(job_id.clone()))?;
        Ok(JobSubscription {
            snapshot: Some(JobView::from_descriptor(&descriptor).full_frame()),
            rx,
        })
    }

    /// Request cooperative cancellation; repeated calls are no-ops.
    pub fn abort(&self, job_id: &JobId) -> Result<(), EngineError> {
        if self.shared.registry.get(job_id).is_none() {
            return Err(EngineError::UnknownJob(job_id.clone()));
        }
        self.shared.registry.request_abort(job_id)?;
        info!(%job_id, "abort requested");
        Ok(())
    }

    /// Current descriptor of `job_id`.
    pub fn descriptor(&self, job_id: &JobId) -> Result<JobDescriptor, EngineError> {
        self.shared
            .registry
            .get(job_id)
            .ok_or_else(|| EngineError::UnknownJob(job_id.clone()))
    }

    /// Indexed chains of `entry_id` usable as search queries.
    pub async fn query_chains(&self, entry_id: &str) -> Result<Vec<ChainInfo>, EngineError> {
        let chains = self
            .shared
            .store
            .indexed_chains(entry_id)
            .await
            .map_err(EngineError::Store)?;
        let usable: Vec<ChainInfo> = chains
            .into_iter()
            .filter(|chain| chain.length >= MIN_QUERY_CHAIN_RESIDUES)
            .collect();
        if usable.is_empty() {
            return Err(EngineError::NoCandidatesFound {
                min_residues: MIN_QUERY_CHAIN_RESIDUES,
            });
        }
        Ok(usable)
    }

    /// Delete terminal jobs idle for longer than `max_idle`, with their working
    /// directories. Returns how many were removed.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        self.shared.reap_idle(max_idle).await
    }

    /// Run [`Self::reap_idle`] every `interval` until every engine handle is dropped.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let shared: Weak<EngineShared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let reaped = shared.reap_idle(max_idle).await;
                if reaped > 0 {
                    info!(reaped, "removed idle jobs");
                }
            }
        })
    }
}

/// Frames of one job, in emission order.
#[derive(Debug)]
pub struct JobSubscription {
    snapshot: Option<StreamFrame>,
    rx: Option<broadcast::Receiver<StreamFrame>>,
}

impl JobSubscription {
    /// Next frame, or `None` once the job's loop has finished.
    ///
    /// A subscriber that falls behind skips the frames it missed.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        if let Some(frame) = self.snapshot.take() {
            return Some(frame);
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged behind job stream");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

type ProgressTask = TaskHandle<Result<PhaseProgress, BackendError>>;
type DetailTask = TaskHandle<Result<CandidateStat, DetailError>>;

/// Per-job streaming loop state. Owns the job's descriptor; the registry copy is
/// overwritten once per tick.
struct JobRuntime {
    shared: Arc<EngineShared>,
    state: JobDescriptor,
    scheduler: PhaseScheduler,
    progress: Option<(Phase, ProgressTask)>,
    details: HashMap<String, DetailTask>,
    emitter: FrameEmitter,
    frames: broadcast::Sender<StreamFrame>,
    started_at: Instant,
    /// Phase failed locally while its backend search may still be running.
    orphaned: Option<Phase>,
}

impl JobRuntime {
    fn new(
        shared: Arc<EngineShared>,
        state: JobDescriptor,
        frames: broadcast::Sender<StreamFrame>,
    ) -> Self {
        let emitter = FrameEmitter::new(shared.cfg.keepalive_ticks);
        Self {
            shared,
            state,
            scheduler: PhaseScheduler::new(),
            progress: None,
            details: HashMap::new(),
            emitter,
            frames,
            started_at: Instant::now(),
            orphaned: None,
        }
    }

    async fn run(mut self) {
        let job_id = self.state.job_id.clone();
        self.scheduler
            .start(|phase| launch_phase(&self.shared, &self.state, phase));

        let mut ticker = tokio::time::interval(self.shared.cfg.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(status) if status.is_terminal() => {
                    info!(%job_id, ?status, "search job ended");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%job_id, "stopping job loop: {err}");
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn tick(&mut self) -> Result<JobStatus, EngineError> {
        let job_id = self.state.job_id.clone();
        let current = self
            .shared
            .registry
            .get(&job_id)
            .ok_or_else(|| EngineError::UnknownJob(job_id.clone()))?;

        if current.abort_requested {
            self.state.abort_requested = true;
            self.state.status = JobStatus::Aborted;
            self.publish()?;
            return Ok(JobStatus::Aborted);
        }

        self.poll_phases().await;
        self.poll_progress().await;
        self.dispatch_details();
        self.collect_details().await;

        let max_age = self.shared.cfg.max_job_age;
        let timed_out = !self.scheduler.has_error() && self.started_at.elapsed() > max_age;
        if timed_out {
            warn!(%job_id, ?max_age, "search job timed out");
            if let Some(phase) = self.scheduler.computing() {
                self.scheduler.fail(phase);
                self.orphaned = Some(phase);
                self.state.phase_state = self.scheduler.states();
            }
            self.state.error_message =
                Some(format!("job exceeded the maximum age of {max_age:?}"));
        }

        self.state.status = if timed_out || self.scheduler.has_error() {
            JobStatus::Error
        } else if self.is_finished() {
            JobStatus::Finished
        } else {
            JobStatus::Computing
        };

        self.publish()?;
        Ok(self.state.status)
    }

    async fn poll_phases(&mut self) {
        let outcome = self
            .scheduler
            .poll(|phase| launch_phase(&self.shared, &self.state, phase))
            .await;

        match outcome {
            Some(PhaseOutcome::Done { phase, result }) => {
                info!(
                    job_id = %self.state.job_id,
                    %phase,
                    candidates = result.candidate_ids.len(),
                    "search phase done"
                );
                self.state.phase_statistics[phase.index()] = Some(result.statistics);
                self.state.candidate_ids = result.candidate_ids;
                if let Some((polled, task)) = self.progress.take() {
                    if polled == phase {
                        task.cancel();
                    } else {
                        self.progress = Some((polled, task));
                    }
                }
            }
            Some(PhaseOutcome::Failed { phase, message }) => {
                error!(job_id = %self.state.job_id, %phase, "search phase failed: {message}");
                self.state.error_message = Some(message);
            }
            None => {}
        }
        self.state.phase_state = self.scheduler.states();
    }

    async fn poll_progress(&mut self) {
        if self.state.disable_search_stats {
            return;
        }

        let finished = self.progress.as_ref().is_some_and(|(_, task)| task.is_done());
        if let Some((phase, task)) = self.progress.take_if(|_| finished) {
            match task.result().await {
                Ok(Ok(progress)) => {
                    if self.scheduler.state(phase) == PhaseState::Computing {
                        self.state.phase_progress[phase.index()] = Some(progress);
                    }
                }
                Ok(Err(err)) => {
                    if self.scheduler.state(phase) == PhaseState::Computing {
                        error!(job_id = %self.state.job_id, %phase, "progress poll failed: {err}");
                        self.scheduler.fail(phase);
                        self.orphaned = Some(phase);
                        self.state.phase_state = self.scheduler.states();
                        self.state.error_message = Some(err.to_string());
                    }
                }
                Err(TaskError::Cancelled) => {}
                Err(err) => warn!(job_id = %self.state.job_id, %phase, "progress task: {err}"),
            }
        }

        if let (None, Some(phase)) = (&self.progress, self.scheduler.computing()) {
            let backend = self.shared.backend.clone();
            let job_id = self.state.job_id.clone();
            let task = TaskHandle::spawn(async move { backend.get_progress(&job_id, phase).await });
            self.progress = Some((phase, task));
        }
    }

    fn dispatch_details(&mut self) {
        let min_qscore = self.state.min_qscore();
        for candidate in &self.state.candidate_ids {
            if self.state.candidate_stats.contains_key(candidate) {
                continue;
            }
            self.state.candidate_stats.insert(
                candidate.clone(),
                CandidateSlot {
                    status: CandidateStatus::Pending,
                    stat: None,
                },
            );
            let request = DetailRequest {
                job_id: self.state.job_id.clone(),
                query: self.state.query.clone(),
                query_name: self.state.query_name.clone(),
                candidate: candidate.clone(),
                min_qscore,
                disable_visualizations: self.state.disable_visualizations,
            };
            let task = self
                .shared
                .pool
                .submit(compute_stats(self.shared.details.clone(), request));
            self.details.insert(candidate.clone(), task);
        }
    }

    async fn collect_details(&mut self) {
        let finished: Vec<String> = self
            .details
            .iter()
            .filter(|(_, task)| task.is_done())
            .map(|(candidate, _)| candidate.clone())
            .collect();

        for candidate in finished {
            let Some(task) = self.details.remove(&candidate) else {
                continue;
            };
            let slot = match task.result().await {
                Ok(Ok(stat)) => CandidateSlot {
                    status: CandidateStatus::Done,
                    stat: Some(stat),
                },
                Ok(Err(err)) => {
                    warn!(job_id = %self.state.job_id, %candidate, "candidate detail failed: {err}");
                    CandidateSlot {
                        status: CandidateStatus::Failed,
                        stat: None,
                    }
                }
                Err(err) => {
                    warn!(job_id = %self.state.job_id, %candidate, "candidate detail task: {err}");
                    CandidateSlot {
                        status: CandidateStatus::Failed,
                        stat: None,
                    }
                }
            };
            self.state.candidate_stats.insert(candidate, slot);
        }
    }

    fn is_finished(&self) -> bool {
        self.scheduler.state(Phase::Exhaustive) == PhaseState::Done
            && self.state.candidate_ids.iter().all(|candidate| {
                self.state
                    .candidate_stats
                    .get(candidate)
                    .is_some_and(|slot| slot.status != CandidateStatus::Pending)
            })
    }

    /// Write the descriptor back and push this tick's frame, if any.
    fn publish(&mut self) -> Result<(), EngineError> {
        let state = &self.state;
        self.shared.registry.mutate(&state.job_id, &mut |descriptor| {
            let created_at = descriptor.created_at;
            *descriptor = state.clone();
            descriptor.created_at = created_at;
        })?;

        if let Some(frame) = self.emitter.next(JobView::from_descriptor(&self.state)) {
            // No subscribers is fine.
            let _ = self.frames.send(frame);
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        let job_id = self.state.job_id.clone();

        let remote = self.scheduler.cancel().or(self.orphaned.take());
        if let Some((_, task)) = self.progress.take() {
            task.cancel();
        }
        let outstanding = self.details.len();
        for (_, task) in self.details.drain() {
            task.cancel();
        }
        if outstanding > 0 {
            debug!(%job_id, outstanding, "cancelled candidate detail tasks");
        }

        // Subscribers see the stream close only after the backend was told.
        if let Some(phase) = remote {
            let end = self.shared.backend.end_job(&job_id, phase);
            match tokio::time::timeout(END_JOB_TIMEOUT, end).await {
                Ok(Ok(())) => debug!(%job_id, %phase, "ended backend search"),
                Ok(Err(err)) => warn!(%job_id, %phase, "failed to end backend search: {err}"),
                Err(_) => warn!(%job_id, %phase, "ending backend search timed out"),
            }
        }

        self.shared.streams.remove(&job_id);
    }
}

fn launch_phase(shared: &EngineShared, job: &JobDescriptor, phase: Phase) -> PhaseTask {
    debug!(job_id = %job.job_id, %phase, "launching search phase");
    let backend = shared.backend.clone();
    let query = job.query.clone();
    let radius = job.radius;
    let num_results = job.num_results;
    let job_id = job.job_id.clone();
    shared.pool.submit(async move {
        backend
            .run_phase(&query, radius, num_results, phase, &job_id)
            .await
    })
}
