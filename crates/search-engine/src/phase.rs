use crate::api::{Phase, PhaseResult, PhaseState};
use crate::backend::BackendError;
use crate::pool::TaskHandle;

pub(crate) type PhaseTask = TaskHandle<Result<PhaseResult, BackendError>>;

/// Observable effect of one [`PhaseScheduler::poll`].
#[derive(Debug)]
pub(crate) enum PhaseOutcome {
    Done { phase: Phase, result: PhaseResult },
    Failed { phase: Phase, message: String },
}

/// Drives the coarse -> fine -> exhaustive cascade one dependency step at a time.
///
/// At most one phase is `Computing`; phase `n + 1` is launched only after
/// phase `n` reached `Done`, and an `Error` halts the cascade.
#[derive(Debug)]
pub(crate) struct PhaseScheduler {
    states: [PhaseState; 3],
    task: Option<(Phase, PhaseTask)>,
}

impl PhaseScheduler {
    pub(crate) fn new() -> Self {
        Self {
            states: [PhaseState::Waiting; 3],
            task: None,
        }
    }

    pub(crate) fn states(&self) -> [PhaseState; 3] {
        self.states
    }

    pub(crate) fn state(&self, phase: Phase) -> PhaseState {
        self.states[phase.index()]
    }

    pub(crate) fn computing(&self) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|phase| self.state(*phase) == PhaseState::Computing)
    }

    pub(crate) fn has_error(&self) -> bool {
        self.states.contains(&PhaseState::Error)
    }

    /// Launch the coarse phase.
    pub(crate) fn start(&mut self, launch: impl FnOnce(Phase) -> PhaseTask) {
        if self.state(Phase::SketchCoarse) == PhaseState::Waiting && self.task.is_none() {
            self.launch(Phase::SketchCoarse, launch);
        }
    }

    fn launch(&mut self, phase: Phase, launch: impl FnOnce(Phase) -> PhaseTask) {
        self.states[phase.index()] = PhaseState::Computing;
        self.task = Some((phase, launch(phase)));
    }

    /// Collect a finished phase task, if any, and launch its successor on success.
    pub(crate) async fn poll(
        &mut self,
        launch: impl FnOnce(Phase) -> PhaseTask,
    ) -> Option<PhaseOutcome> {
        if !self.task.as_ref().is_some_and(|(_, task)| task.is_done()) {
            return None;
        }
        let (phase, task) = self.task.take()?;

        let outcome = match task.result().await {
            Ok(Ok(result)) => {
                self.states[phase.index()] = PhaseState::Done;
                if let Some(next) = phase.next() {
                    self.launch(next, launch);
                }
                PhaseOutcome::Done { phase, result }
            }
            Ok(Err(err)) => {
                self.states[phase.index()] = PhaseState::Error;
                PhaseOutcome::Failed {
                    phase,
                    message: err.to_string(),
                }
            }
            Err(err) => {
                self.states[phase.index()] = PhaseState::Error;
                PhaseOutcome::Failed {
                    phase,
                    message: format!("{phase} search task failed: {err}"),
                }
            }
        };
        Some(outcome)
    }

    /// Mark the running `phase` failed (e.g. its progress poll failed) and drop its task.
    pub(crate) fn fail(&mut self, phase: Phase) {
        if self.state(phase) != PhaseState::Computing {
            return;
        }
        self.states[phase.index()] = PhaseState::Error;
        if let Some((_, task)) = self.task.take() {
            task.cancel();
        }
    }

    /// Cancel the in-flight phase task, returning the phase that was still computing.
    pub(crate) fn cancel(&mut self) -> Option<Phase> {
        let computing = self.computing();
        if let Some((_, task)) = self.task.take() {
            task.cancel();
        }
        computing
    }
}
