//! Iteration scheduler: the loop that walks a task to completion.
//!
//! Each iteration selects the next unfinished story, picks a backend (the
//! story's pinned one, else the failover pointer), invokes it, classifies the
//! result, and decides whether to continue. The scheduler is the only writer
//! of `prd.json` notes and `progress.txt`.
//!
//! Stop requests (`checkpoint`, operator quit, Ctrl-C) arrive on a channel
//! and are honoured only at two safe points: before an invocation starts and
//! after its result has been recorded. An invocation in flight is never cut
//! short by a checkpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, info_span, warn};

use crate::agent::{self, AgentAdapter};
use crate::classifier::{self, Classification};
use crate::config::{BackendsConfig, RunSettings};
use crate::display::format_elapsed;
use crate::failover::{FailoverDecision, FailoverState};
use crate::interactive::{self, OperatorQueue};
use crate::invoker::{Invocation, Invoke, InvokeRequest};
use crate::log::{ExecutionLog, LogEvent};
use crate::paths;
use crate::progress::{Entry, ProgressLog};
use crate::prompt::{self, PromptContext, TemplateSources};
use crate::registry::{ProgressUpdate, Registry, SessionStatus};
use crate::task::{Story, Task, TaskStore};

/// Requests delivered to the scheduler from outside the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Stop cleanly at the next safe point.
    Checkpoint,
    /// Operator quit; the invocation in flight has already been killed.
    Quit,
    /// Ctrl-C or SIGTERM.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Checkpoint,
    Quit,
    Shutdown,
}

impl StopReason {
    fn from_request(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Checkpoint => Self::Checkpoint,
            ControlRequest::Quit => Self::Quit,
            ControlRequest::Shutdown => Self::Shutdown,
        }
    }

    /// Quit and shutdown win over a checkpoint requested at the same time.
    fn rank(self) -> u8 {
        match self {
            Self::Checkpoint => 0,
            Self::Shutdown => 1,
            Self::Quit => 2,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every story passes.
    Complete,
    /// Every backend hit the failure threshold.
    Exhausted,
    /// The iteration budget ran out.
    Budget,
    Stopped(StopReason),
    /// A non-retryable error (e.g. the backend executable vanished).
    Failed(String),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete | Self::Stopped(_) => 0,
            Self::Failed(_) => 1,
            Self::Budget => 2,
            Self::Exhausted => 3,
        }
    }

    pub fn session_status(&self) -> SessionStatus {
        match self {
            Self::Complete => SessionStatus::Completed,
            Self::Exhausted | Self::Failed(_) => SessionStatus::Failed,
            Self::Budget | Self::Stopped(_) => SessionStatus::Stopped,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Exhausted => "exhausted",
            Self::Budget => "budget",
            Self::Stopped(StopReason::Checkpoint) => "checkpoint",
            Self::Stopped(StopReason::Quit) => "quit",
            Self::Stopped(StopReason::Shutdown) => "interrupted",
            Self::Failed(_) => "failed",
        }
    }

    fn reason(&self) -> String {
        match self {
            Self::Complete => "all stories pass".to_string(),
            Self::Exhausted => "every backend reached the failure threshold".to_string(),
            Self::Budget => "iteration budget reached".to_string(),
            Self::Stopped(StopReason::Checkpoint) => "checkpoint requested".to_string(),
            Self::Stopped(StopReason::Quit) => "operator quit".to_string(),
            Self::Stopped(StopReason::Shutdown) => "interrupted by signal".to_string(),
            Self::Failed(reason) => reason.clone(),
        }
    }
}

/// What a finished run reports back to the job.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    pub iterations: u32,
    pub completed: usize,
    pub total: usize,
    pub backend: String,
}

/// Static inputs for one run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub session: String,
    pub task_dir: PathBuf,
    /// Holds the fallback `prompt.md` and the per-session logs.
    pub data_dir: PathBuf,
    pub settings: RunSettings,
    pub backends: BackendsConfig,
}

impl SchedulerConfig {
    fn iteration_delay(&self) -> Duration {
        Duration::from_millis(self.settings.iteration_delay_millis)
    }

    fn invocation_timeout(&self) -> Option<Duration> {
        self.settings.invocation_timeout_secs.map(Duration::from_secs)
    }
}

/// Result of one pass through Selecting/Invoking/Evaluating.
enum Step {
    Continue,
    Terminal(Outcome),
}

pub struct Scheduler<I: Invoke> {
    config: SchedulerConfig,
    invoker: I,
    requests: Receiver<ControlRequest>,
    store: TaskStore,
    progress: ProgressLog,
    failover: FailoverState,
    queue: OperatorQueue,
    execution_log: Arc<ExecutionLog>,
    registry: Option<Registry>,
    templates: TemplateSources,
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    pinned_failures: HashMap<String, u32>,
    pending: Option<StopReason>,
    iteration: u32,
    last_backend: String,
    /// Completed and total story counts from the last good checklist read.
    last_counts: (usize, usize),
}

impl<I: Invoke> Scheduler<I> {
    pub fn new(
        config: SchedulerConfig,
        invoker: I,
        requests: Receiver<ControlRequest>,
        execution_log: Arc<ExecutionLog>,
    ) -> Result<Self> {
        let settings = &config.settings;
        let failover = FailoverState::new(
            settings.backend_order.clone(),
            &settings.agent,
            settings.failover_threshold,
        )?;
        Ok(Self {
            store: TaskStore::new(&config.task_dir),
            progress: ProgressLog::new(&config.task_dir),
            templates: TemplateSources::standard(&config.task_dir, &config.data_dir),
            last_backend: settings.agent.clone(),
            failover,
            config,
            invoker,
            requests,
            queue: OperatorQueue::new(),
            execution_log,
            registry: None,
            adapters: HashMap::new(),
            pinned_failures: HashMap::new(),
            pending: None,
            iteration: 0,
            last_counts: (0, 0),
        })
    }

    /// Share the operator queue with the control server.
    pub fn with_queue(mut self, queue: OperatorQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Keep the registry row current and finish it at the end.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn failover(&self) -> &FailoverState {
        &self.failover
    }

    /// Drive the task to a terminal state and record the summary.
    pub fn run(&mut self) -> Result<RunReport> {
        let task = self.store.load()?;
        self.last_counts = (task.completed_count(), task.total_count());
        let effort = task
            .project
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| task.description.clone());
        self.progress
            .ensure_header(&effort, task.effort_type.as_deref().unwrap_or("feature"))?;

        let outcome = loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Terminal(outcome)) => break outcome,
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(error = %reason, "iteration aborted");
                    break Outcome::Failed(reason);
                }
            }
            self.pause_between_iterations();
        };

        self.finish(outcome)
    }

    fn step(&mut self) -> Result<Step> {
        // Selecting
        if let Some(reason) = self.drain_requests() {
            self.record_stop(reason)?;
            return Ok(Step::Terminal(Outcome::Stopped(reason)));
        }
        if let Some(archive) = self.progress.rotate_if_needed(self.config.settings.rotate_at)? {
            info!(archive = %archive.display(), "rotated progress log");
        }

        let task = self.load_task()?;
        let Some(story) = task.next_story().cloned() else {
            info!("no unfinished stories");
            return Ok(Step::Terminal(Outcome::Complete));
        };

        self.iteration += 1;
        let iteration = self.iteration;
        let (backend, pinned) = match story.agent.as_deref().filter(|a| !a.is_empty()) {
            Some(pinned) => (pinned.to_string(), true),
            None => (self.failover.current().to_string(), false),
        };
        self.last_backend = backend.clone();

        let span = info_span!("iteration", iteration, story = %story.id, backend = %backend);
        let _guard = span.enter();

        let adapter = match self.adapter(&backend) {
            Ok(adapter) => adapter,
            Err(e) => return Ok(Step::Terminal(Outcome::Failed(format!("{e:#}")))),
        };

        info!(
            max = self.config.settings.max_iterations,
            title = %story.title,
            pinned,
            "starting iteration"
        );
        self.update_registry(Some(&story.id), &backend, task.completed_count(), task.total_count());
        self.execution_log.record(LogEvent::IterationStarted {
            iteration,
            story: story.id.clone(),
            backend: backend.clone(),
            model: story.model.clone(),
            pinned,
        });

        // Invoking
        let ctx = PromptContext {
            task_dir: self.config.task_dir.clone(),
            branch_name: task.branch_name.clone(),
            agent: backend.clone(),
            story_id: story.id.clone(),
            story_title: story.title.clone(),
            extra_vars: Default::default(),
        };
        let queued = self.queue.drain();
        if !queued.is_empty() {
            info!(messages = queued.len(), "prepending queued operator messages");
        }
        let prompt = prompt::prepend_operator_messages(&prompt::build_prompt(&ctx, &self.templates), &queued);

        let work_dir = paths::project_root(&self.config.task_dir);
        let request = InvokeRequest {
            adapter: Arc::clone(&adapter),
            prompt: &prompt,
            model: story.model.as_deref(),
            work_dir: &work_dir,
            timeout: self.config.invocation_timeout(),
        };
        let invocation = match self.invoker.invoke(&request) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(error = %e, "invocation could not start");
                return Ok(Step::Terminal(Outcome::Failed(e.to_string())));
            }
        };

        // Evaluating
        let text = classified_text(&invocation);
        if let Some(outcome) = self.evaluate(&story, &backend, pinned, &invocation, &text)? {
            return Ok(Step::Terminal(outcome));
        }

        // Safe point
        if let Some(reason) = self.drain_requests() {
            self.record_stop(reason)?;
            return Ok(Step::Terminal(Outcome::Stopped(reason)));
        }

        // Advancing
        let task = self
            .load_task()
            .with_context(|| format!("checklist unreadable after iteration {iteration}"))?;
        let remaining = task.remaining_count();
        self.update_registry(None, &self.failover.current().to_string(), task.completed_count(), task.total_count());
        if classifier::detect_completion_marker(&text) {
            if remaining == 0 {
                info!("completion marker confirmed by checklist");
                return Ok(Step::Terminal(Outcome::Complete));
            }
            warn!(remaining, "completion marker with unfinished stories");
            self.progress.append(&Entry::Warning {
                iteration,
                message: format!(
                    "Agent signalled completion but {remaining} of {} stories are unfinished; continuing.",
                    task.total_count()
                ),
            })?;
        }
        if iteration >= self.config.settings.max_iterations {
            if remaining == 0 {
                return Ok(Step::Terminal(Outcome::Complete));
            }
            return Ok(Step::Terminal(Outcome::Budget));
        }
        Ok(Step::Continue)
    }

    /// Classify, annotate and feed failover. Returns a terminal outcome when
    /// the result ends the run.
    fn evaluate(
        &mut self,
        story: &Story,
        backend: &str,
        pinned: bool,
        invocation: &Invocation,
        text: &str,
    ) -> Result<Option<Outcome>> {
        let iteration = self.iteration;

        if invocation.killed {
            info!("invocation killed by operator");
            self.log_invocation(invocation, "killed", None);
            self.progress.append(&Entry::Iteration {
                iteration,
                story: story.id.clone(),
                title: story.title.clone(),
                backend: backend.to_string(),
                outcome: "interrupted by operator".to_string(),
                elapsed: invocation.elapsed,
            })?;
            return Ok(None);
        }

        let classification = classifier::classify(invocation.exit_code, text);
        match classification {
            Classification::Success => {
                info!(elapsed = %format_elapsed(invocation.elapsed), "iteration succeeded");
                self.log_invocation(invocation, "success", None);
                self.progress.append(&Entry::Iteration {
                    iteration,
                    story: story.id.clone(),
                    title: story.title.clone(),
                    backend: backend.to_string(),
                    outcome: "success".to_string(),
                    elapsed: invocation.elapsed,
                })?;
                if pinned {
                    self.pinned_failures.insert(backend.to_string(), 0);
                } else {
                    self.failover.record(backend, classification, "");
                }
                Ok(None)
            }
            Classification::Retryable | Classification::Fatal => {
                let error = if invocation.timed_out {
                    format!("Timed out after {}", format_elapsed(invocation.elapsed))
                } else {
                    classifier::extract_error(invocation.exit_code, text)
                };
                warn!(exit_code = invocation.exit_code, error = %error, "iteration failed");
                self.log_invocation(invocation, classification_label(classification), Some(&error));

                let note = format!("[ralph] iteration {iteration} failed on {backend}: {error}");
                self.store
                    .append_note(&story.id, &note)
                    .with_context(|| format!("failed to annotate story {}", story.id))?;

                if classification == Classification::Fatal {
                    self.append_failure(story, backend, 1, &error)?;
                    return Ok(Some(Outcome::Failed(error)));
                }
                if pinned {
                    let failures = {
                        let count = self.pinned_failures.entry(backend.to_string()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    self.append_failure(story, backend, failures, &error)?;
                    return Ok(None);
                }

                let decision = self.failover.record(backend, classification, &error);
                self.append_failure(story, backend, self.failover.failures(backend), &error)?;
                self.apply_decision(story, decision)
            }
        }
    }

    fn apply_decision(&mut self, story: &Story, decision: FailoverDecision) -> Result<Option<Outcome>> {
        match decision {
            FailoverDecision::Continue | FailoverDecision::Retry { .. } => Ok(None),
            FailoverDecision::Switch {
                from,
                to,
                failures,
                last_error,
            } => {
                warn!(from = %from, to = %to, failures, "failing over");
                self.progress.append(&Entry::Failover {
                    from: from.clone(),
                    to: to.clone(),
                    story: story.id.clone(),
                    failures,
                    reason: last_error.clone(),
                })?;
                self.execution_log.record(LogEvent::Failover {
                    from,
                    to: to.clone(),
                    failures,
                    reason: last_error,
                });
                self.last_backend = to;
                Ok(None)
            }
            FailoverDecision::AllExhausted => {
                warn!("all backends exhausted");
                Ok(Some(Outcome::Exhausted))
            }
        }
    }

    fn append_failure(&self, story: &Story, backend: &str, failures: u32, error: &str) -> Result<()> {
        self.progress.append(&Entry::Failure {
            iteration: self.iteration,
            backend: backend.to_string(),
            story: story.id.clone(),
            failures,
            error: error.to_string(),
        })
    }

    fn log_invocation(&self, invocation: &Invocation, classification: &str, error: Option<&str>) {
        self.execution_log.record(LogEvent::InvocationFinished {
            iteration: self.iteration,
            backend: invocation.backend.clone(),
            exit_code: invocation.exit_code,
            classification: classification.to_string(),
            elapsed_secs: invocation.elapsed.as_secs(),
            timed_out: invocation.timed_out,
            output_bytes: invocation.output.len(),
            error: error.map(str::to_string),
        });
    }

    fn adapter(&mut self, name: &str) -> Result<Arc<dyn AgentAdapter>> {
        if let Some(adapter) = self.adapters.get(name) {
            return Ok(Arc::clone(adapter));
        }
        let adapter: Arc<dyn AgentAdapter> = agent::adapter_from_name(name, &self.config.backends)
            .map(Arc::from)
            .ok_or_else(|| {
                anyhow!(
                    "unknown backend '{name}' (known: {})",
                    agent::known_backends(&self.config.backends).join(", ")
                )
            })?;
        self.adapters.insert(name.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Collect every queued request, keeping the strongest.
    fn drain_requests(&mut self) -> Option<StopReason> {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.note_request(request),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.pending.take()
    }

    fn note_request(&mut self, request: ControlRequest) {
        let reason = StopReason::from_request(request);
        debug!(request = ?request, "control request received");
        if self.pending.is_none_or(|current| reason.rank() > current.rank()) {
            self.pending = Some(reason);
        }
    }

    /// Sleep the inter-iteration delay, waking early for a control request.
    fn pause_between_iterations(&mut self) {
        let delay = self.config.iteration_delay();
        if delay.is_zero() {
            return;
        }
        match self.requests.recv_timeout(delay) {
            Ok(request) => self.note_request(request),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(delay),
        }
    }

    /// Read the checklist and remember its counts.
    fn load_task(&mut self) -> Result<Task> {
        let task = self.store.load()?;
        self.last_counts = (task.completed_count(), task.total_count());
        Ok(task)
    }

    /// Current counts, falling back to the last good read when the checklist
    /// cannot be parsed.
    fn counts(&mut self) -> (usize, usize) {
        match self.load_task() {
            Ok(_) => self.last_counts,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "checklist unreadable, using last known counts");
                self.last_counts
            }
        }
    }

    fn record_stop(&mut self, reason: StopReason) -> Result<()> {
        let (completed, total) = self.counts();
        let entry = match reason {
            StopReason::Quit => Entry::Quit {
                iteration: self.iteration,
                max_iterations: self.config.settings.max_iterations,
                completed,
                total,
                backend: self.last_backend.clone(),
            },
            StopReason::Checkpoint | StopReason::Shutdown => Entry::Checkpoint {
                iteration: self.iteration,
                max_iterations: self.config.settings.max_iterations,
                completed,
                total,
                backend: self.last_backend.clone(),
                reason: match reason {
                    StopReason::Shutdown => "interrupted by signal".to_string(),
                    _ => "operator request".to_string(),
                },
            },
        };
        info!(reason = ?reason, "stopping at safe point");
        self.progress.append(&entry)?;
        self.execution_log.record(LogEvent::Checkpoint {
            iteration: self.iteration,
            reason: Outcome::Stopped(reason).reason(),
        });
        Ok(())
    }

    fn update_registry(&self, story: Option<&str>, backend: &str, completed: usize, total: usize) {
        let Some(registry) = &self.registry else {
            return;
        };
        let update = ProgressUpdate {
            iteration: self.iteration,
            story,
            backend,
            completed_stories: completed as u32,
            total_stories: total as u32,
        };
        if let Err(e) = registry.update_progress(&self.config.session, &update) {
            warn!(error = %e, "failed to update session registry");
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Result<RunReport> {
        let (completed, total) = self.counts();
        let backend = self.last_backend.clone();
        let data_dir = &self.config.data_dir;
        let session = &self.config.session;

        self.progress.append(&Entry::RunSummary {
            outcome: outcome.label().to_string(),
            completed,
            total,
            iterations: self.iteration,
            backend: backend.clone(),
            progress_log: display(self.progress.path()),
            execution_log: display(self.execution_log.path()),
            output_log: display(&paths::output_log(data_dir, session)),
        })?;

        if outcome == Outcome::Complete {
            self.execution_log.record(LogEvent::RunCompleted {
                iterations: self.iteration,
                completed,
                total,
            });
        } else {
            self.execution_log.record(LogEvent::RunFailed {
                outcome: outcome.label().to_string(),
                reason: outcome.reason(),
                iterations: self.iteration,
            });
        }

        self.update_registry(None, &backend, completed, total);
        if let Some(registry) = &self.registry
            && let Err(e) = registry.finish(session, outcome.session_status())
        {
            warn!(error = %e, "failed to record final session status");
        }

        info!(
            outcome = outcome.label(),
            iterations = self.iteration,
            completed,
            total,
            "run finished"
        );
        Ok(RunReport {
            outcome,
            iterations: self.iteration,
            completed,
            total,
            backend,
        })
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn classification_label(classification: Classification) -> &'static str {
    match classification {
        Classification::Success => "success",
        Classification::Retryable => "retryable",
        Classification::Fatal => "fatal",
    }
}

/// The invocation's result text minus any echo of what was fed to the agent
/// (the stdin prompt and operator messages).
fn classified_text(invocation: &Invocation) -> String {
    let typed: Vec<String> = invocation
        .stdin_prompt
        .iter()
        .chain(invocation.operator_inputs.iter())
        .cloned()
        .collect();
    if typed.is_empty() {
        return invocation.result_text.clone();
    }
    interactive::strip_operator_echo(&invocation.result_text, &typed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomBackend;
    use crate::invoker::InvokeError;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::mpsc::{self, Sender};

    /// What the scripted agent does on one call.
    #[derive(Clone, Default)]
    struct Turn {
        exit_code: i32,
        output: String,
        /// Mark the next unfinished story as passing, like a real agent would.
        complete_story: bool,
        /// Sent on the control channel while "running".
        request: Option<ControlRequest>,
        killed: bool,
        missing_executable: bool,
        /// Leave `prd.json` half-written, like an agent interrupted mid-save.
        corrupt_checklist: bool,
    }

    fn ok() -> Turn {
        Turn {
            output: "implemented the story".into(),
            complete_story: true,
            ..Turn::default()
        }
    }

    fn fail(output: &str) -> Turn {
        Turn {
            exit_code: 1,
            output: output.into(),
            ..Turn::default()
        }
    }

    struct ScriptedInvoker {
        task_dir: PathBuf,
        turns: Vec<Turn>,
        fallback: Turn,
        control: Sender<ControlRequest>,
        calls: Vec<(String, String)>,
    }

    impl Invoke for ScriptedInvoker {
        fn invoke(&mut self, request: &InvokeRequest<'_>) -> Result<Invocation, InvokeError> {
            let backend = request.adapter.name().to_string();
            self.calls.push((backend.clone(), request.prompt.to_string()));
            let turn = if self.turns.is_empty() {
                self.fallback.clone()
            } else {
                self.turns.remove(0)
            };
            if turn.missing_executable {
                return Err(InvokeError::MissingExecutable {
                    backend,
                    program: "ghost-agent".into(),
                });
            }
            if let Some(request) = turn.request {
                self.control.send(request).unwrap();
            }
            if turn.complete_story {
                let store = TaskStore::new(&self.task_dir);
                let mut task = store.load().unwrap();
                let id = task.next_story().map(|s| s.id.clone()).unwrap();
                let story = task.user_stories.iter_mut().find(|s| s.id == id).unwrap();
                story.passes = true;
                store.save(&task).unwrap();
            }
            if turn.corrupt_checklist {
                fs::write(self.task_dir.join("prd.json"), r#"{ "userStories": [ {"id": "#).unwrap();
            }
            Ok(Invocation {
                backend,
                exit_code: turn.exit_code,
                result_text: turn.output.clone(),
                output: turn.output,
                elapsed: Duration::from_secs(5),
                killed: turn.killed,
                ..Invocation::default()
            })
        }
    }

    struct Harness {
        tmp: tempfile::TempDir,
        task_dir: PathBuf,
        scheduler: Scheduler<ScriptedInvoker>,
        control: Sender<ControlRequest>,
    }

    impl Harness {
        fn progress(&self) -> String {
            fs::read_to_string(self.task_dir.join("progress.txt")).unwrap()
        }

        fn task(&self) -> Task {
            TaskStore::new(&self.task_dir).load().unwrap()
        }

        fn calls(&self) -> Vec<String> {
            self.scheduler.invoker.calls.iter().map(|(b, _)| b.clone()).collect()
        }

        fn execution_log(&self) -> Vec<serde_json::Value> {
            let path = paths::execution_log(&self.tmp.path().join("data"), "auth");
            fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn prd(stories: usize) -> String {
        let stories: Vec<String> = (1..=stories)
            .map(|i| {
                format!(
                    r#"{{"id": "US-00{i}", "title": "Story {i}", "priority": {i}, "passes": false, "notes": ""}}"#
                )
            })
            .collect();
        format!(
            r#"{{"project": "Auth", "branchName": "ralph/auth", "description": "Login", "userStories": [{}]}}"#,
            stories.join(",")
        )
    }

    fn harness(prd_json: &str, order: &[&str], threshold: u32, max_iterations: u32, turns: Vec<Turn>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let task_dir = tmp.path().join("project").join("tasks").join("auth");
        fs::create_dir_all(&task_dir).unwrap();
        fs::write(task_dir.join("prd.json"), prd_json).unwrap();
        let data_dir = tmp.path().join("data");

        let custom: BTreeMap<String, CustomBackend> = order
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    CustomBackend {
                        program: format!("{name}-agent"),
                        args: vec![],
                        prompt: Default::default(),
                    },
                )
            })
            .collect();
        let config = SchedulerConfig {
            session: "auth".into(),
            task_dir: task_dir.clone(),
            data_dir: data_dir.clone(),
            settings: RunSettings {
                agent: order[0].to_string(),
                failover_threshold: threshold,
                max_iterations,
                rotate_at: 300,
                iteration_delay_millis: 0,
                invocation_timeout_secs: None,
                backend_order: order.iter().map(|s| s.to_string()).collect(),
            },
            backends: BackendsConfig {
                order: order.iter().map(|s| s.to_string()).collect(),
                custom,
            },
        };

        let (tx, rx) = mpsc::channel();
        let invoker = ScriptedInvoker {
            task_dir: task_dir.clone(),
            turns,
            fallback: ok(),
            control: tx.clone(),
            calls: Vec::new(),
        };
        let log = Arc::new(ExecutionLog::new(&paths::execution_log(&data_dir, "auth")).unwrap());
        let scheduler = Scheduler::new(config, invoker, rx, log).unwrap();
        Harness {
            tmp,
            task_dir,
            scheduler,
            control: tx,
        }
    }

    fn count(haystack: &str, needle: &str) -> usize {
        haystack.matches(needle).count()
    }

    #[test]
    fn completes_n_stories_in_n_iterations() {
        let mut h = harness(&prd(3), &["a"], 3, 3, vec![]);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.iterations, 3);
        assert_eq!((report.completed, report.total), (3, 3));
        assert_eq!(report.outcome.exit_code(), 0);
        assert!(h.task().is_complete());
        assert!(h.progress().contains("RUN SUMMARY"));
    }

    #[test]
    fn already_complete_task_never_invokes() {
        let done = prd(1).replace("\"passes\": false", "\"passes\": true");
        let mut h = harness(&done, &["a"], 3, 5, vec![]);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.iterations, 0);
        assert!(h.calls().is_empty());
    }

    #[test]
    fn two_failures_then_success_resets_counter() {
        let turns = vec![fail("API Error: 500"), fail("rate limit exceeded"), ok()];
        let mut h = harness(&prd(3), &["a"], 3, 3, turns);
        let report = h.scheduler.run().unwrap();

        assert_eq!(report.outcome, Outcome::Budget);
        let progress = h.progress();
        assert_eq!(count(&progress, "- FAILURE (Iteration"), 2);
        assert_eq!(count(&progress, "**Result:** success"), 1);
        assert_eq!(h.scheduler.failover().failures("a"), 0);

        let task = h.task();
        let story = task.story("US-001").unwrap();
        assert!(story.passes);
        assert_eq!(count(&story.notes, "[ralph] iteration"), 2);
        assert!(!task.story("US-002").unwrap().passes);
    }

    #[test]
    fn failover_after_threshold_switches_once() {
        let turns = vec![fail("Connection refused"), fail("Connection refused")];
        let mut h = harness(&prd(3), &["a", "b"], 2, 5, turns);
        let report = h.scheduler.run().unwrap();

        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(h.calls(), vec!["a", "a", "b", "b", "b"]);
        assert_eq!(report.backend, "b");
        assert_eq!(h.scheduler.failover().failures("b"), 0);

        let progress = h.progress();
        assert_eq!(count(&progress, "- FAILOVER"), 1);
        assert!(progress.contains("**From agent:** a"));
        assert!(progress.contains("**To agent:** b"));
        assert!(progress.contains("**Consecutive failures before failover:** 2"));

        let failovers: Vec<_> = h
            .execution_log()
            .into_iter()
            .filter(|e| e["event"] == "failover")
            .collect();
        assert_eq!(failovers.len(), 1);
        assert_eq!(failovers[0]["data"]["from"], "a");
        assert_eq!(failovers[0]["data"]["to"], "b");
        assert_eq!(failovers[0]["data"]["failures"], 2);
    }

    #[test]
    fn every_backend_failing_exhausts_the_run() {
        let mut h = harness(&prd(2), &["a", "b"], 2, 20, vec![]);
        h.scheduler.invoker.fallback = fail("503 Service Unavailable");
        let report = h.scheduler.run().unwrap();

        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.outcome.exit_code(), 3);
        assert_eq!(h.calls(), vec!["a", "a", "b", "b"]);
        let progress = h.progress();
        assert!(progress.contains("**Outcome:** exhausted"));
        assert!(
            h.execution_log()
                .iter()
                .any(|e| e["event"] == "run_failed" && e["data"]["outcome"] == "exhausted")
        );
    }

    #[test]
    fn checkpoint_mid_invocation_lands_after_result() {
        let turns = vec![Turn {
            request: Some(ControlRequest::Checkpoint),
            ..ok()
        }];
        let mut h = harness(&prd(3), &["a"], 3, 10, turns);
        let report = h.scheduler.run().unwrap();

        assert_eq!(report.outcome, Outcome::Stopped(StopReason::Checkpoint));
        assert_eq!(report.outcome.exit_code(), 0);
        assert_eq!(h.calls().len(), 1);
        assert!(h.task().story("US-001").unwrap().passes);

        let progress = h.progress();
        let result_at = progress.find("**Result:** success").unwrap();
        let checkpoint_at = progress.find("CHECKPOINT at").unwrap();
        assert!(checkpoint_at > result_at);
        assert!(progress.contains("Iteration: 1/10 | Stories: 1/3 | Agent: a"));
    }

    #[test]
    fn pending_request_stops_before_any_invocation() {
        let mut h = harness(&prd(2), &["a"], 3, 10, vec![]);
        h.control.send(ControlRequest::Checkpoint).unwrap();
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Stopped(StopReason::Checkpoint));
        assert!(h.calls().is_empty());
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn quit_kills_without_counting_a_failure() {
        let turns = vec![Turn {
            exit_code: -1,
            request: Some(ControlRequest::Quit),
            killed: true,
            ..Turn::default()
        }];
        let mut h = harness(&prd(2), &["a"], 1, 10, turns);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Stopped(StopReason::Quit));
        assert_eq!(h.scheduler.failover().failures("a"), 0);
        let progress = h.progress();
        assert!(progress.contains("QUIT at"));
        assert!(!progress.contains("FAILURE"));
    }

    #[test]
    fn quit_outranks_checkpoint() {
        let mut h = harness(&prd(2), &["a"], 3, 10, vec![]);
        h.control.send(ControlRequest::Checkpoint).unwrap();
        h.control.send(ControlRequest::Quit).unwrap();
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Stopped(StopReason::Quit));
    }

    #[test]
    fn premature_completion_marker_warns_and_continues() {
        let turns = vec![Turn {
            output: format!("done {}", classifier::COMPLETION_MARKER),
            ..ok()
        }];
        let mut h = harness(&prd(2), &["a"], 3, 5, turns);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.iterations, 2);
        assert_eq!(count(&h.progress(), "- WARNING (Iteration 1)"), 1);
    }

    #[test]
    fn completion_marker_with_checklist_done_ends_run() {
        let turns = vec![Turn {
            output: format!("all done\n{}", classifier::COMPLETION_MARKER),
            ..ok()
        }];
        let mut h = harness(&prd(1), &["a"], 3, 5, turns);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.iterations, 1);
        assert!(!h.progress().contains("WARNING"));
    }

    #[test]
    fn budget_exhaustion_exits_two() {
        let mut h = harness(&prd(3), &["a"], 5, 2, vec![]);
        let report = h.scheduler.run().unwrap();
        assert_eq!(report.outcome, Outcome::Budget);
        assert_eq!(report.outcome.exit_code(), 2);
        assert_eq!(report.completed, 2);
        assert!(h.progress().contains("**Outcome:** budget"));
    }

    #[test]
    fn pinned_story_bypasses_failover() {
        let pinned = prd(2).replacen(
            r#""id": "US-001","#,
            r#""id": "US-001", "agent": "b", "model": "opus","#,
            1,
        );
        let turns = vec![fail("rate limit"), fail("rate limit"), ok(), ok()];
        let mut h = harness(&pinned, &["a", "b"], 2, 10, turns);
        let report = h.scheduler.run().unwrap();

        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(h.calls(), vec!["b", "b", "b", "a"]);
        assert_eq!(h.scheduler.failover().current(), "a");
        assert_eq!(h.scheduler.failover().failures("b"), 0);
        assert!(!h.progress().contains("FAILOVER"));
    }

    #[test]
    fn missing_executable_fails_the_run() {
        let turns = vec![Turn {
            missing_executable: true,
            ..Turn::default()
        }];
        let mut h = harness(&prd(1), &["a"], 3, 5, turns);
        let report = h.scheduler.run().unwrap();
        assert!(matches!(report.outcome, Outcome::Failed(ref reason) if reason.contains("ghost-agent")));
        assert_eq!(report.outcome.exit_code(), 1);
        assert!(h.progress().contains("**Outcome:** failed"));
    }

    #[test]
    fn corrupt_checklist_after_invocation_fails_with_summary() {
        let turns = vec![
            ok(),
            Turn {
                corrupt_checklist: true,
                ..ok()
            },
        ];
        let mut h = harness(&prd(3), &["a"], 3, 5, turns);
        let report = h.scheduler.run().unwrap();

        assert!(matches!(report.outcome, Outcome::Failed(ref reason) if reason.contains("prd.json")));
        assert_eq!(report.outcome.exit_code(), 1);
        assert_eq!(report.iterations, 2);
        assert_eq!(h.calls().len(), 2);

        // counts come from the last good read, which saw the first story
        // done and the second still open
        assert_eq!((report.completed, report.total), (1, 3));
        let progress = h.progress();
        assert_eq!(count(&progress, "RUN SUMMARY"), 1);
        let events = h.execution_log();
        let last = events.last().unwrap();
        assert_eq!(last["event"], "run_failed");
        assert_eq!(last["data"]["outcome"], "failed");
    }

    #[test]
    fn queued_operator_message_leads_next_prompt() {
        let queue = OperatorQueue::new();
        let mut h = harness(&prd(1), &["a"], 3, 5, vec![]);
        queue.push("Use the existing session table.");
        h.scheduler = h.scheduler.with_queue(queue.clone());
        h.scheduler.run().unwrap();

        let (_, prompt) = &h.scheduler.invoker.calls[0];
        assert!(prompt.starts_with("## Message from the operator"));
        assert!(prompt.contains("Use the existing session table."));
        assert!(queue.is_empty());
    }

    #[test]
    fn echoed_prompt_does_not_count_as_completion() {
        let inv = Invocation {
            result_text: format!("emit {} when finished\nworking\n", classifier::COMPLETION_MARKER),
            stdin_prompt: Some(format!("emit {} when finished\n", classifier::COMPLETION_MARKER)),
            ..Invocation::default()
        };
        let text = classified_text(&inv);
        assert!(!classifier::detect_completion_marker(&text));
        assert!(text.contains("working"));
    }

    #[test]
    fn execution_log_traces_iterations() {
        let mut h = harness(&prd(1), &["a"], 3, 5, vec![]);
        h.scheduler.run().unwrap();
        let events: Vec<String> = h
            .execution_log()
            .iter()
            .map(|e| e["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            events,
            vec!["iteration_started", "invocation_finished", "run_completed"]
        );
    }

    #[test]
    fn outcome_maps_to_session_status() {
        assert_eq!(Outcome::Complete.session_status(), SessionStatus::Completed);
        assert_eq!(Outcome::Exhausted.session_status(), SessionStatus::Failed);
        assert_eq!(Outcome::Budget.session_status(), SessionStatus::Stopped);
        assert_eq!(
            Outcome::Stopped(StopReason::Shutdown).session_status(),
            SessionStatus::Stopped
        );
    }
}
