use crate::api::{
    CandidateEntry, CandidateStatus, JobDescriptor, JobId, JobStatus, KeepAlive, PhaseProgress,
    PhaseState, PhaseStatistics, StreamFrame, UpdateFrame,
};

/// Everything a subscriber can observe about a job, compared by value between ticks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobView {
    job_id: JobId,
    chain_ids: Vec<String>,
    status: JobStatus,
    phase_state: [PhaseState; 3],
    phase_statistics: [Option<PhaseStatistics>; 3],
    phase_progress: [Option<PhaseProgress>; 3],
    statistics: Vec<CandidateEntry>,
    completed: usize,
    error_message: Option<String>,
}

impl JobView {
    pub(crate) fn from_descriptor(descriptor: &JobDescriptor) -> Self {
        let (statistics, completed) = ranked_candidates(descriptor);
        let (phase_statistics, phase_progress) = if descriptor.disable_search_stats {
            ([None; 3], [None; 3])
        } else {
            (descriptor.phase_statistics, descriptor.phase_progress)
        };
        Self {
            job_id: descriptor.job_id.clone(),
            chain_ids: descriptor.candidate_ids.clone(),
            status: descriptor.status,
            phase_state: descriptor.phase_state,
            phase_statistics,
            phase_progress,
            statistics,
            completed,
            error_message: descriptor.error_message.clone(),
        }
    }

    /// Data frame carrying the full candidate list.
    pub(crate) fn full_frame(&self) -> StreamFrame {
        StreamFrame::Update(Box::new(self.to_update(true)))
    }

    fn to_update(&self, include_list: bool) -> UpdateFrame {
        let [small_status, large_status, full_status] = self.phase_state;
        let [small_stats, large_stats, full_stats] = self.phase_statistics;
        let [small_progress, large_progress, full_progress] = self.phase_progress;
        UpdateFrame {
            job_id: self.job_id.clone(),
            chain_ids: self.chain_ids.clone(),
            status: self.status,
            sketches_small_status: small_status,
            sketches_large_status: large_status,
            full_status,
            sketches_small_statistics: small_stats,
            sketches_large_statistics: large_stats,
            full_statistics: full_stats,
            sketches_small_progress: small_progress,
            sketches_large_progress: large_progress,
            full_progress,
            statistics: include_list.then(|| self.statistics.clone()),
            completed: self.completed,
            error_message: self.error_message.clone(),
        }
    }
}

/// Resolved candidates of the current list at or above the job's threshold, best
/// first, plus the number of resolved candidates.
///
/// Ties keep backend order. Failed candidates count as resolved but are not listed.
pub(crate) fn ranked_candidates(descriptor: &JobDescriptor) -> (Vec<CandidateEntry>, usize) {
    let min_qscore = descriptor.min_qscore();
    let mut completed = 0;
    let mut entries = Vec::new();

    for id in &descriptor.candidate_ids {
        let Some(slot) = descriptor.candidate_stats.get(id) else {
            continue;
        };
        match (slot.status, slot.stat) {
            (CandidateStatus::Pending, _) => {}
            (CandidateStatus::Done, Some(stat)) => {
                completed += 1;
                if stat.qscore >= min_qscore {
                    entries.push(CandidateEntry {
                        object: id.clone(),
                        qscore: stat.qscore,
                        rmsd: stat.rmsd,
                        seq_id: stat.seq_identity,
                        aligned: stat.aligned_length,
                    });
                }
            }
            (CandidateStatus::Done, None) | (CandidateStatus::Failed, _) => completed += 1,
        }
    }

    entries.sort_by(|a, b| b.qscore.total_cmp(&a.qscore));
    (entries, completed)
}

/// Turns per-tick views into the frames pushed to subscribers.
#[derive(Debug)]
pub(crate) struct FrameEmitter {
    last: Option<JobView>,
    unchanged_ticks: u32,
    keepalive_ticks: u32,
}

impl FrameEmitter {
    pub(crate) fn new(keepalive_ticks: u32) -> Self {
        Self {
            last: None,
            unchanged_ticks: 0,
            keepalive_ticks: keepalive_ticks.max(1),
        }
    }

    /// Frame for this tick, if any.
    ///
    /// A changed view yields a data frame whose candidate list is elided when equal to
    /// the previously emitted one. An unchanged view yields nothing, except a keep-alive
    /// every `keepalive_ticks` consecutive unchanged ticks.
    pub(crate) fn next(&mut self, view: JobView) -> Option<StreamFrame> {
        if self.last.as_ref() == Some(&view) {
            self.unchanged_ticks += 1;
            if self.unchanged_ticks >= self.keepalive_ticks {
                self.unchanged_ticks = 0;
                return Some(StreamFrame::KeepAlive(KeepAlive::default()));
            }
            return None;
        }

        self.unchanged_ticks = 0;
        let include_list = self
            .last
            .as_ref()
            .is_none_or(|last| last.statistics != view.statistics);
        let frame = view.to_update(include_list);
        self.last = Some(view);
        Some(StreamFrame::Update(Box::new(frame)))
    }
}
