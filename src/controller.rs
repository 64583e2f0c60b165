//! Run controller: owns the run state machine and drives perceive → decide → act.
//!
//! At most one run task touches the page at a time. A new task cancels its
//! predecessor and waits for it to exit before its first page call. Every
//! state write made from a run task carries that run's id and is dropped once
//! a newer run (or `stop`) has taken over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::brain::Brain;
use crate::config::AgentConfig;
use crate::error::{AgentError, Disposition, PerceptionError};
use crate::executor::{ActionExecutor, ExecutionOutcome, GateMode};
use crate::journal::Journal;
use crate::parser;
use crate::perception::PerceptionSource;
use crate::safety::SafetyGate;
use crate::surface::ActiveSurface;
use crate::types::{Action, RunState, RunStatus, Viewport};

/// Actions held back by the safety gate, with what is needed to continue the run.
#[derive(Debug, Clone)]
struct PendingPause {
    actions: Vec<Action>,
    viewport: Viewport,
}

struct ControllerState {
    run_state: RunState,
    /// Id of the run allowed to write; 0 when none is.
    run_id: u64,
    goal: String,
    automation_enabled: bool,
    configured_budget: u32,
    run_budget: u32,
    current_step: u32,
    last_hash: Option<u64>,
    pending: Option<PendingPause>,
    /// Most recently spawned run task, kept after `stop` so the next run can join it.
    task: Option<RunTask>,
}

struct RunTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum StepOutcome {
    Continue,
    Completed,
    Paused,
}

struct Inner {
    journal: Arc<Journal>,
    brain: Arc<Brain>,
    perception: PerceptionSource,
    executor: ActionExecutor,
    context_window: usize,
    state: Mutex<ControllerState>,
    next_run_id: AtomicU64,
    status_tx: watch::Sender<RunStatus>,
}

#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    pub fn new(
        config: &AgentConfig,
        surfaces: ActiveSurface,
        brain: Arc<Brain>,
        journal: Arc<Journal>,
    ) -> Self {
        let state = ControllerState {
            run_state: RunState::Idle,
            run_id: 0,
            goal: String::new(),
            automation_enabled: true,
            configured_budget: config.step_budget.max(1),
            run_budget: config.step_budget.max(1),
            current_step: 0,
            last_hash: None,
            pending: None,
            task: None,
        };
        let initial = status_of(&state, brain.model());
        let (status_tx, _) = watch::channel(initial);

        let executor = ActionExecutor::new(SafetyGate::new(config.body_text_max_chars), journal.clone());
        Self {
            inner: Arc::new(Inner {
                perception: PerceptionSource::new(surfaces, config),
                executor,
                context_window: config.context_window,
                journal,
                brain,
                state: Mutex::new(state),
                next_run_id: AtomicU64::new(1),
                status_tx,
            }),
        }
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.inner.journal
    }

    pub fn brain(&self) -> &Arc<Brain> {
        &self.inner.brain
    }

    pub fn surfaces(&self) -> &ActiveSurface {
        self.inner.perception.surfaces()
    }

    pub fn set_goal(&self, goal: impl Into<String>) {
        let goal = goal.into();
        self.inner.edit(|st| st.goal = goal.trim().to_string());
    }

    pub fn goal(&self) -> String {
        self.inner.lock().goal.clone()
    }

    pub fn set_automation_enabled(&self, enabled: bool) {
        self.inner.edit(|st| st.automation_enabled = enabled);
    }

    pub fn set_step_budget(&self, budget: u32) {
        self.inner.edit(|st| st.configured_budget = budget.max(1));
    }

    pub fn status(&self) -> RunStatus {
        let st = self.inner.lock();
        status_of(&st, self.inner.brain.model())
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Run a single perceive/decide/act iteration.
    pub fn step(&self) {
        self.start_run(Some(1));
    }

    /// Run until the goal completes, the run pauses, or the step budget is spent.
    pub fn run_automatically(&self) {
        self.start_run(None);
    }

    /// Cancel any run, forget held-back actions and return to idle.
    pub fn stop(&self) {
        let was = {
            let mut st = self.inner.lock();
            if let Some(task) = &st.task {
                task.cancel.cancel();
            }
            let was = st.run_state;
            st.run_id = 0;
            st.run_state = RunState::Idle;
            st.pending = None;
            self.inner.publish(&st);
            was
        };
        if was != RunState::Idle {
            self.inner.journal.info("Stopped.");
        }
    }

    /// Execute the actions held back by the safety gate and continue the run.
    ///
    /// Returns `false` (and changes nothing) when no actions are pending.
    pub fn resume_after_safety_check(&self) -> bool {
        let mut st = self.inner.lock();
        let Some(pending) = st.pending.take() else {
            return false;
        };
        self.inner
            .journal
            .info(format!("Safety check confirmed; resuming {} pending actions.", pending.actions.len()));
        let (start, budget) = (st.current_step, st.run_budget);
        self.launch(&mut st, start, budget, Some(pending));
        true
    }

    /// Resolves once no run is in progress (idle or paused).
    pub async fn wait_until_settled(&self) -> RunStatus {
        let mut rx = self.inner.status_tx.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            if status.state != RunState::Running {
                return status;
            }
            if rx.changed().await.is_err() {
                return status;
            }
        }
    }

    fn start_run(&self, budget: Option<u32>) {
        let mut st = self.inner.lock();
        let budget = budget.unwrap_or(st.configured_budget);
        st.run_budget = budget;
        st.current_step = 0;
        st.last_hash = None;
        st.pending = None;
        self.launch(&mut st, 0, budget, None);
    }

    /// Spawn a run task that owns the state from now on. Called with the state
    /// lock held so `stop` always sees the task it has to cancel.
    fn launch(
        &self,
        st: &mut ControllerState,
        first_step: u32,
        budget: u32,
        resume: Option<PendingPause>,
    ) {
        let previous = st.task.take();
        if let Some(task) = &previous {
            task.cancel.cancel();
        }

        let id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        st.run_id = id;
        st.run_state = RunState::Running;
        self.inner.publish(st);

        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Some(task) = previous {
                // A page call already in flight finishes before ours start.
                if let Err(e) = task.handle.await {
                    tracing::warn!("previous run task ended abnormally: {e}");
                }
            }
            inner.drive(id, token, first_step, budget, resume).await;
        });
        st.task = Some(RunTask { cancel, handle });
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, st: &ControllerState) {
        self.status_tx.send_replace(status_of(st, self.brain.model()));
    }

    /// Caller-side edits that are not tied to a run.
    fn edit(&self, f: impl FnOnce(&mut ControllerState)) {
        let mut st = self.lock();
        f(&mut st);
        self.publish(&st);
    }

    /// Apply `f` only if run `id` still owns the state.
    fn update<R>(&self, id: u64, f: impl FnOnce(&mut ControllerState) -> R) -> Option<R> {
        let mut st = self.lock();
        if st.run_id != id {
            return None;
        }
        let out = f(&mut st);
        self.publish(&st);
        Some(out)
    }

    fn finish(&self, id: u64) {
        self.update(id, |st| {
            st.run_state = RunState::Idle;
            st.pending = None;
            st.run_id = 0;
        });
    }

    fn pause(&self, id: u64, pending: Option<PendingPause>) {
        self.update(id, |st| {
            st.run_state = RunState::Paused;
            st.pending = pending;
            st.run_id = 0;
        });
    }

    fn preconditions(&self) -> Result<(), String> {
        let (enabled, goal_empty) = {
            let st = self.lock();
            (st.automation_enabled, st.goal.trim().is_empty())
        };
        if !enabled {
            return Err("Automation is disabled.".to_string());
        }
        if goal_empty {
            return Err("No goal set.".to_string());
        }
        if !self.perception.surfaces().is_attached() {
            return Err("No page is open.".to_string());
        }
        Ok(())
    }

    async fn drive(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
        first_step: u32,
        budget: u32,
        resume: Option<PendingPause>,
    ) {
        if let Some(pending) = resume {
            match self.execute_pending(&pending, &cancel).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Completed) => {
                    self.journal.result("Goal complete.");
                    self.finish(id);
                    return;
                }
                Ok(StepOutcome::Paused) => return,
                Err(e) => {
                    self.handle_error(id, first_step, e);
                    return;
                }
            }
        }

        for index in first_step..budget {
            if cancel.is_cancelled() {
                self.journal.info("Run cancelled.");
                self.finish(id);
                return;
            }
            if let Err(reason) = self.preconditions() {
                self.journal.warning(reason);
                self.finish(id);
                return;
            }
            if self.update(id, |st| st.current_step = index + 1).is_none() {
                return;
            }

            match self.iterate(id, &cancel).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Completed) => {
                    self.journal.result("Goal complete.");
                    self.finish(id);
                    return;
                }
                Ok(StepOutcome::Paused) => return,
                Err(e) => {
                    if self.handle_error(id, index + 1, e) {
                        return;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            self.journal.info("Run cancelled.");
        } else {
            self.journal.info(format!("Step limit reached ({budget})."));
        }
        self.finish(id);
    }

    /// Logs the error and applies its state transition. Returns `true` when the run is over.
    fn handle_error(&self, id: u64, step: u32, error: AgentError) -> bool {
        match error.disposition() {
            Disposition::Cancelled => {
                self.journal.info("Run cancelled.");
                self.finish(id);
                true
            }
            Disposition::Abort => {
                self.journal.error(user_message(&error));
                self.finish(id);
                true
            }
            Disposition::Pause => {
                self.journal.warning(format!(
                    "{error}. Paused; start the run again once the limit clears."
                ));
                self.pause(id, None);
                true
            }
            Disposition::Skip => {
                self.journal.error(format!("Step {step} failed: {error}"));
                false
            }
        }
    }

    async fn iterate(&self, id: u64, cancel: &CancellationToken) -> Result<StepOutcome, AgentError> {
        let snapshot = self.perception.capture(cancel).await?;

        let (goal, last_hash) = {
            let st = self.lock();
            (st.goal.clone(), st.last_hash)
        };
        if last_hash == Some(snapshot.content_hash) {
            self.journal.info("No visual change since the last step; skipping.");
            return Ok(StepOutcome::Continue);
        }

        let context = self.journal.recent(self.context_window);
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let raw = self
            .brain
            .generate_actions(&goal, &context, &snapshot.encoded_image, cancel)
            .await?;
        self.update(id, |st| st.last_hash = Some(snapshot.content_hash));

        let response = parser::parse(&raw);
        self.journal.model(response.raw_text.clone());
        for warning in &response.warnings {
            self.journal.warning(format!("Model reply: {warning}"));
        }

        if response.is_complete {
            return Ok(StepOutcome::Completed);
        }
        if response.actions.is_empty() {
            self.journal.info("Model proposed no actions.");
            return Ok(StepOutcome::Continue);
        }

        let surface = self
            .perception
            .surfaces()
            .current()
            .ok_or(PerceptionError::SurfaceUnavailable)?;
        let outcome = self
            .executor
            .execute(
                surface.as_ref(),
                &response.actions,
                snapshot.viewport,
                GateMode::Enforce,
                cancel,
            )
            .await;

        match outcome {
            ExecutionOutcome::Finished => Ok(StepOutcome::Continue),
            ExecutionOutcome::Completed => Ok(StepOutcome::Completed),
            ExecutionOutcome::Cancelled => Err(AgentError::Cancelled),
            ExecutionOutcome::Paused { pending, .. } => {
                self.pause(
                    id,
                    Some(PendingPause {
                        actions: pending,
                        viewport: snapshot.viewport,
                    }),
                );
                Ok(StepOutcome::Paused)
            }
        }
    }

    async fn execute_pending(
        &self,
        pending: &PendingPause,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, AgentError> {
        let surface = self
            .perception
            .surfaces()
            .current()
            .ok_or(PerceptionError::SurfaceUnavailable)?;
        let outcome = self
            .executor
            .execute(
                surface.as_ref(),
                &pending.actions,
                pending.viewport,
                GateMode::Bypass,
                cancel,
            )
            .await;
        match outcome {
            ExecutionOutcome::Finished => Ok(StepOutcome::Continue),
            ExecutionOutcome::Completed => Ok(StepOutcome::Completed),
            ExecutionOutcome::Cancelled => Err(AgentError::Cancelled),
            // The gate is bypassed here, so this cannot happen; treat it as finished.
            ExecutionOutcome::Paused { .. } => Ok(StepOutcome::Continue),
        }
    }
}

fn status_of(st: &ControllerState, model: Option<String>) -> RunStatus {
    RunStatus {
        state: st.run_state,
        goal: st.goal.clone(),
        current_step: st.current_step,
        step_budget: st.run_budget,
        awaiting_safety_confirmation: st.pending.is_some(),
        pending_actions: st.pending.as_ref().map(|p| p.actions.clone()),
        model,
    }
}

fn user_message(error: &AgentError) -> String {
    match error {
        AgentError::MissingCredential { .. } => {
            format!("{error}. Save an API key and try again.")
        }
        AgentError::Perception(e) => format!("Could not read the page: {e}"),
        AgentError::Status { .. } => format!("Run aborted: {error}"),
        _ => error.to_string(),
    }
}
