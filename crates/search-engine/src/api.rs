//! Public API types for the similarity search engine.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// One of the three escalating search passes against the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Radius-less top-K over small sketches.
    #[serde(rename = "sketches_small")]
    SketchCoarse,
    /// Radius-bounded search over large sketches.
    #[serde(rename = "sketches_large")]
    SketchFine,
    /// Exact search with full distance evaluation.
    #[serde(rename = "full")]
    Exhaustive,
}

impl Phase {
    /// All phases in cascade order.
    pub const ALL: [Phase; 3] = [Phase::SketchCoarse, Phase::SketchFine, Phase::Exhaustive];

    /// Wire name used by the backend configuration and stream frames.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::SketchCoarse => "sketches_small",
            Phase::SketchFine => "sketches_large",
            Phase::Exhaustive => "full",
        }
    }

    /// Position in the cascade (0-based).
    pub fn index(self) -> usize {
        match self {
            Phase::SketchCoarse => 0,
            Phase::SketchFine => 1,
            Phase::Exhaustive => 2,
        }
    }

    /// The phase that depends on this one, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::SketchCoarse => Some(Phase::SketchFine),
            Phase::SketchFine => Some(Phase::Exhaustive),
            Phase::Exhaustive => None,
        }
    }

    /// Whether the backend call for this phase carries the search radius.
    pub fn uses_radius(self) -> bool {
        !matches!(self, Phase::SketchCoarse)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase state machine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    /// Not started; waiting for the preceding phase.
    Waiting,
    /// Backend call in flight.
    Computing,
    /// Backend call returned successfully.
    Done,
    /// Backend call (or its progress poll) failed.
    Error,
}

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Still running.
    Computing,
    /// Exhaustive phase done and every candidate resolved.
    Finished,
    /// A phase failed or the job exceeded its maximum age.
    Error,
    /// Abort was requested.
    Aborted,
}

impl JobStatus {
    /// Whether the streaming loop stops on this status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Computing)
    }
}

/// Resolution state of a single candidate's detail computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    /// Detail task dispatched, not yet resolved.
    Pending,
    /// Statistics available.
    Done,
    /// Detail computation failed; the candidate is hidden from results.
    Failed,
}

/// Similarity statistics of a query/candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateStat {
    /// Q-score in `[0, 1]`.
    pub qscore: f64,
    /// Root-mean-square deviation of the superposition.
    pub rmsd: f64,
    /// Sequence identity of the aligned residues.
    pub seq_identity: f64,
    /// Number of aligned residues.
    pub aligned_length: u32,
}

/// Entry of [`JobDescriptor::candidate_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateSlot {
    /// Resolution state.
    pub status: CandidateStatus,
    /// Statistics once [`CandidateStatus::Done`].
    pub stat: Option<CandidateStat>,
}

/// Backend-reported timing and distance counters for a completed phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatistics {
    /// Query-to-pivot distances required.
    pub pivot_dist_count_total: f64,
    /// Query-to-pivot distances served from the backend cache.
    pub pivot_dist_count_cached: f64,
    /// Time spent on pivot distances.
    pub pivot_time: f64,
    /// Candidate distances required (0 for sketch phases).
    pub search_dist_count_total: f64,
    /// Candidate distances served from the backend cache (0 for sketch phases).
    pub search_dist_count_cached: f64,
    /// Search time, excluding pivot time for the exhaustive phase.
    pub search_time: f64,
}

/// Live progress of a running backend phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseProgress {
    /// Whether the backend still runs the job.
    pub running: bool,
    /// Expected pivot distances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_dist_count_expected: Option<f64>,
    /// Pivot distances taken from cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_dist_count_cached: Option<f64>,
    /// Pivot distances actually computed (excluding cached ones).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_dist_count_computed: Option<f64>,
    /// Pivot time, once the exhaustive phase has finished its pivot step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot_time: Option<f64>,
    /// Expected candidate distances (exhaustive phase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_dist_count_expected: Option<f64>,
    /// Candidate distances taken from cache (exhaustive phase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_dist_count_cached: Option<f64>,
    /// Candidate distances actually computed (exhaustive phase).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_dist_count_computed: Option<f64>,
}

/// Result of one backend phase call.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResult {
    /// Chain identifiers in backend answer order.
    pub candidate_ids: Vec<String>,
    /// Backend timing and counters.
    pub statistics: PhaseStatistics,
}

/// Opaque job identifier, also used as a directory/namespace key by collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random identifier.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client search submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Query chain identifier as understood by the backend (e.g. `1ABC:A`).
    pub query: String,
    /// Display name used to label rendered comparisons.
    pub query_name: String,
    /// Minimum Q-score of reported candidates, in `[0, 1]`.
    pub qscore_threshold: f64,
    /// Requested candidate count per phase.
    pub num_results: u32,
    /// Skip rendering comparison images.
    pub disable_visualizations: bool,
    /// Omit backend statistics and progress from the stream.
    pub disable_search_stats: bool,
}

impl SearchRequest {
    /// Search radius sent to the backend (`1 - qscore_threshold`).
    pub fn radius(&self) -> f64 {
        1.0 - self.qscore_threshold
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.query.trim().is_empty() {
            return Err(EngineError::InvalidRequest("query must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.qscore_threshold) {
            return Err(EngineError::InvalidRequest(format!(
                "qscore threshold must be within [0, 1], got {}",
                self.qscore_threshold
            )));
        }
        if self.num_results == 0 {
            return Err(EngineError::InvalidRequest(
                "number of results must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable state of one search job, held by the job registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job identifier.
    pub job_id: JobId,
    /// Query chain identifier.
    pub query: String,
    /// Query display name.
    pub query_name: String,
    /// Search radius, `0 <= radius <= 1`.
    pub radius: f64,
    /// Requested candidate count per phase (`> 0`).
    pub num_results: u32,
    /// Rendering disabled for this job.
    pub disable_visualizations: bool,
    /// Statistics and progress omitted from the stream.
    pub disable_search_stats: bool,
    /// State per phase, indexed by [`Phase::index`].
    pub phase_state: [PhaseState; 3],
    /// Statistics of each completed phase.
    pub phase_statistics: [Option<PhaseStatistics>; 3],
    /// Latest progress of each phase.
    pub phase_progress: [Option<PhaseProgress>; 3],
    /// Candidates of the most recently completed phase (replaced per phase).
    pub candidate_ids: Vec<String>,
    /// Detail state of every candidate seen so far.
    pub candidate_stats: HashMap<String, CandidateSlot>,
    /// Set externally, never reset.
    pub abort_requested: bool,
    /// Overall status.
    pub status: JobStatus,
    /// Failure description when `status == Error`.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Fresh descriptor: coarse phase computing, the others waiting.
    pub fn new(job_id: JobId, request: &SearchRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            query: request.query.clone(),
            query_name: request.query_name.clone(),
            radius: request.radius().clamp(0.0, 1.0),
            num_results: request.num_results,
            disable_visualizations: request.disable_visualizations,
            disable_search_stats: request.disable_search_stats,
            phase_state: [PhaseState::Computing, PhaseState::Waiting, PhaseState::Waiting],
            phase_statistics: [None; 3],
            phase_progress: [None; 3],
            candidate_ids: Vec::new(),
            candidate_stats: HashMap::new(),
            abort_requested: false,
            status: JobStatus::Computing,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lowest Q-score a candidate may have to be reported.
    pub fn min_qscore(&self) -> f64 {
        1.0 - self.radius
    }

    /// State of `phase`.
    pub fn phase_state(&self, phase: Phase) -> PhaseState {
        self.phase_state[phase.index()]
    }
}

/// One row of the sorted candidate list in a stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    /// Candidate chain identifier.
    pub object: String,
    /// Q-score.
    pub qscore: f64,
    /// RMSD.
    pub rmsd: f64,
    /// Sequence identity.
    pub seq_id: f64,
    /// Aligned residues.
    pub aligned: u32,
}

/// Data frame of the subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFrame {
    /// Job identifier.
    pub job_id: JobId,
    /// Candidates of the latest completed phase, in backend order.
    pub chain_ids: Vec<String>,
    /// Overall status.
    pub status: JobStatus,
    /// Coarse sketch phase state.
    pub sketches_small_status: PhaseState,
    /// Fine sketch phase state.
    pub sketches_large_status: PhaseState,
    /// Exhaustive phase state.
    pub full_status: PhaseState,
    /// Coarse sketch phase statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketches_small_statistics: Option<PhaseStatistics>,
    /// Fine sketch phase statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketches_large_statistics: Option<PhaseStatistics>,
    /// Exhaustive phase statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_statistics: Option<PhaseStatistics>,
    /// Coarse sketch phase progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketches_small_progress: Option<PhaseProgress>,
    /// Fine sketch phase progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketches_large_progress: Option<PhaseProgress>,
    /// Exhaustive phase progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_progress: Option<PhaseProgress>,
    /// Candidates sorted by descending Q-score; omitted when unchanged since the previous frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Vec<CandidateEntry>>,
    /// Resolved candidates of the current list.
    pub completed: usize,
    /// Failure description for `ERROR` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Keep-alive comment frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    /// Always `keep-alive`.
    pub comment: String,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            comment: "keep-alive".to_string(),
        }
    }
}

/// A frame pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamFrame {
    /// Job state changed.
    Update(Box<UpdateFrame>),
    /// Nothing changed for a while.
    KeepAlive(KeepAlive),
}

impl StreamFrame {
    /// Serialize as one newline-terminated JSON line.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// The data frame, if this is not a keep-alive.
    pub fn as_update(&self) -> Option<&UpdateFrame> {
        match self {
            StreamFrame::Update(frame) => Some(frame),
            StreamFrame::KeepAlive(_) => None,
        }
    }
}

/// Configuration for the search engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Streaming loop cadence.
    pub tick: Duration,

    /// Unchanged ticks before a keep-alive frame is emitted.
    pub keepalive_ticks: u32,

    /// Number of concurrently running phase/detail tasks (shared by all jobs).
    pub pool_size: usize,

    /// Niceness increment applied to worker pool threads (unix only).
    pub worker_nice: i32,

    /// Jobs older than this are failed with a timeout error.
    pub max_job_age: Duration,

    /// Detail computations slower than this are written back to the cache.
    pub cache_min_elapsed: Duration,

    /// Per-job working directories (`query<job_id>`) are created here.
    pub computations_dir: PathBuf,
}

impl EngineConfig {
    /// Default tick.
    pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

    /// Default keep-alive cadence in ticks.
    pub const DEFAULT_KEEPALIVE_TICKS: u32 = 5;

    /// Default niceness increment for pool threads.
    pub const DEFAULT_WORKER_NICE: i32 = 10;

    /// Default maximum job lifetime.
    pub const DEFAULT_MAX_JOB_AGE: Duration = Duration::from_secs(60 * 60);

    /// Default cache write threshold.
    pub const DEFAULT_CACHE_MIN_ELAPSED: Duration = Duration::from_millis(30);

    /// Pool size matching the available parallelism.
    pub fn default_pool_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Zero tick, keep-alive cadence, pool size or job age fall back to defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.tick.is_zero() {
            self.tick = Self::DEFAULT_TICK;
        }
        if self.keepalive_ticks == 0 {
            self.keepalive_ticks = Self::DEFAULT_KEEPALIVE_TICKS;
        }
        if self.pool_size == 0 {
            self.pool_size = Self::default_pool_size();
        }
        if self.max_job_age.is_zero() {
            self.max_job_age = Self::DEFAULT_MAX_JOB_AGE;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Self::DEFAULT_TICK,
            keepalive_ticks: Self::DEFAULT_KEEPALIVE_TICKS,
            pool_size: Self::default_pool_size(),
            worker_nice: Self::DEFAULT_WORKER_NICE,
            max_job_age: Self::DEFAULT_MAX_JOB_AGE,
            cache_min_elapsed: Self::DEFAULT_CACHE_MIN_ELAPSED,
            computations_dir: std::env::temp_dir(),
        }
    }
}

/// Errors surfaced by [`crate::SearchEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No job with this identifier is registered.
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// Submission parameters out of range.
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    /// The structure has no indexed chain long enough to search with.
    #[error("no chains having at least {min_residues} residues detected")]
    NoCandidatesFound {
        /// Minimum chain length considered usable.
        min_residues: u32,
    },
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Structure store failure.
    #[error("structure store: {0:#}")]
    Store(anyhow::Error),
    /// Worker pool could not be started.
    #[error("worker pool: {0}")]
    Pool(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(threshold: f64) -> SearchRequest {
        SearchRequest {
            query: "1ABC:A".to_string(),
            query_name: "1ABC".to_string(),
            qscore_threshold: threshold,
            num_results: 10,
            disable_visualizations: false,
            disable_search_stats: false,
        }
    }

    #[test]
    fn new_descriptor_starts_coarse_phase() {
        let d = JobDescriptor::new(JobId::from("j"), &request(0.7));
        assert_eq!(d.phase_state(Phase::SketchCoarse), PhaseState::Computing);
        assert_eq!(d.phase_state(Phase::SketchFine), PhaseState::Waiting);
        assert_eq!(d.phase_state(Phase::Exhaustive), PhaseState::Waiting);
        assert!((d.radius - 0.3).abs() < 1e-9);
        assert_eq!(d.status, JobStatus::Computing);
    }

    #[test]
    fn request_validation_bounds() {
        assert!(request(0.0).validate().is_ok());
        assert!(request(1.0).validate().is_ok());
        assert!(request(-0.1).validate().is_err());
        let mut empty = request(0.5);
        empty.query = "  ".to_string();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn phase_names_match_wire_format() {
        let json = serde_json::to_string(&Phase::ALL).unwrap();
        assert_eq!(json, r#"["sketches_small","sketches_large","full"]"#);
        assert!(!Phase::SketchCoarse.uses_radius());
        assert_eq!(Phase::SketchFine.next(), Some(Phase::Exhaustive));
    }

    #[test]
    fn zero_config_values_fall_back_to_defaults() {
        let cfg = EngineConfig {
            tick: Duration::ZERO,
            keepalive_ticks: 0,
            pool_size: 0,
            max_job_age: Duration::ZERO,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(cfg.tick, EngineConfig::DEFAULT_TICK);
        assert_eq!(cfg.keepalive_ticks, EngineConfig::DEFAULT_KEEPALIVE_TICKS);
        assert!(cfg.pool_size >= 1);
        assert_eq!(cfg.max_job_age, EngineConfig::DEFAULT_MAX_JOB_AGE);
    }

    #[test]
    fn update_frame_omits_absent_fields() {
        let frame = UpdateFrame {
            job_id: JobId::from("j"),
            chain_ids: vec!["2XYZ:A".to_string()],
            status: JobStatus::Computing,
            sketches_small_status: PhaseState::Done,
            sketches_large_status: PhaseState::Computing,
            full_status: PhaseState::Waiting,
            sketches_small_statistics: None,
            sketches_large_statistics: None,
            full_statistics: None,
            sketches_small_progress: None,
            sketches_large_progress: None,
            full_progress: None,
            statistics: None,
            completed: 0,
            error_message: None,
        };
        let value: serde_json::Value =
            serde_json::to_value(StreamFrame::Update(Box::new(frame))).unwrap();
        assert_eq!(value["sketches_small_status"], "DONE");
        assert_eq!(value["sketches_large_status"], "COMPUTING");
        assert!(value.get("statistics").is_none());
        assert!(value.get("full_progress").is_none());
        assert_eq!(value["completed"], 0);
    }
}
