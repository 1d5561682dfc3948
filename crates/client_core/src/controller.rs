//! Upload-and-poll controller: submits a statement, follows the deferred task
//! and exposes the resulting phase to the presentation layer.
//!
//! Every submission and every teardown bumps a generation counter. Work that
//! finishes under an older generation (an upload response, a poll tick) is
//! discarded, so a superseded task can never touch the current state.

use std::{
    ops::ControlFlow,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use shared::{
    domain::TaskId,
    protocol::{Profile, Submission, TaskOutcome, TaskResultResponse},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult, UPLOAD_FAILED_MESSAGE},
    ProcessingService, ProfileService, UploadFile,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

const IDLE_TEXT: &str = "Waiting for a file.";
const SUBMITTING_TEXT: &str = "Uploading file to the server...";
const PROCESSING_TEXT: &str = "File is being processed on the server...";
const SUCCEEDED_TEXT: &str = "Processing complete.";
const PROCESSING_FAILED_TEXT: &str = "Processing failed.";
const POLL_FAILED_TEXT: &str = "An error occurred while fetching the result.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Polling,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    pub fn is_busy(self) -> bool {
        matches!(self, Phase::Submitting | Phase::Polling)
    }
}

/// Read-only view of the controller for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub phase: Phase,
    pub selected_file: Option<String>,
    pub task_id: Option<TaskId>,
    pub result: Option<Value>,
    pub status_text: String,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged(ControllerSnapshot),
    ProfileUpdated(Profile),
}

/// Cancellable handle to one running poll loop.
pub struct PollHandle {
    task_id: TaskId,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

struct ControllerState {
    generation: u64,
    phase: Phase,
    selected_file: Option<UploadFile>,
    current_task: Option<TaskId>,
    result: Option<Value>,
    status_text: String,
    profile: Option<Profile>,
    poll: Option<PollHandle>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            generation: 0,
            phase: Phase::Idle,
            selected_file: None,
            current_task: None,
            result: None,
            status_text: IDLE_TEXT.to_string(),
            profile: None,
            poll: None,
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            phase: self.phase,
            selected_file: self
                .selected_file
                .as_ref()
                .map(|file| file.filename.clone()),
            task_id: self.current_task.clone(),
            result: self.result.clone(),
            status_text: self.status_text.clone(),
            profile: self.profile.clone(),
        }
    }

    fn stop_polling(&mut self) {
        if let Some(handle) = self.poll.take() {
            debug!(task_id = %handle.task_id(), "poll: stopping timer");
            handle.stop();
        }
    }

    /// Invalidates every in-flight upload and poll tick.
    fn advance_generation(&mut self) -> u64 {
        self.stop_polling();
        self.generation += 1;
        self.current_task = None;
        self.generation
    }

    fn finish(&mut self, outcome: TaskOutcome) {
        // Inside the poll loop this detaches the handle; the loop returns on its own.
        self.poll = None;
        self.current_task = None;
        match outcome {
            TaskOutcome::Done(payload) => {
                self.phase = Phase::Succeeded;
                self.status_text = SUCCEEDED_TEXT.to_string();
                self.result = Some(payload);
            }
            TaskOutcome::Failed(payload) => {
                self.phase = Phase::Failed;
                self.status_text = PROCESSING_FAILED_TEXT.to_string();
                self.result = Some(payload);
            }
        }
    }

    fn fail(&mut self, status_text: String) {
        self.poll = None;
        self.current_task = None;
        self.result = None;
        self.phase = Phase::Failed;
        self.status_text = status_text;
    }
}

struct Shared {
    processing: Arc<dyn ProcessingService>,
    profiles: Arc<dyn ProfileService>,
    poll_interval: Duration,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_phase(&self, state: &ControllerState) {
        let _ = self
            .events
            .send(ControllerEvent::PhaseChanged(state.snapshot()));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn fail_submission(&self, generation: u64, err: &ClientError) {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(generation, error = %err, "upload: failure for superseded submission");
            return;
        }
        warn!(generation, error = %err, "upload: submission failed");
        state.fail(failure_text(err));
        self.emit_phase(&state);
    }

    /// Applies the upload response. `None` when a newer submission took over.
    fn accept_submission(
        self: &Arc<Self>,
        generation: u64,
        submission: Submission,
    ) -> Option<ControllerSnapshot> {
        let mut state = self.lock();
        if state.generation != generation {
            debug!(generation, "upload: discarding superseded response");
            return None;
        }

        match submission {
            Submission::Terminal(outcome) => {
                info!(generation, status = %outcome.status(), "upload: result returned directly");
                state.finish(outcome);
            }
            Submission::Deferred { task_id, status } => {
                info!(generation, task_id = %task_id, %status, "upload: task deferred, polling");
                state.current_task = Some(task_id.clone());
                state.result = None;
                state.phase = Phase::Polling;
                state.status_text = PROCESSING_TEXT.to_string();
                state.poll = Some(self.start_polling(generation, task_id));
            }
        }

        self.emit_phase(&state);
        Some(state.snapshot())
    }

    fn start_polling(self: &Arc<Self>, generation: u64, task_id: TaskId) -> PollHandle {
        let shared = Arc::clone(self);
        let loop_task_id = task_id.clone();
        let task = tokio::spawn(async move {
            shared.run_poll_loop(generation, loop_task_id).await;
        });
        PollHandle { task_id, task }
    }

    async fn run_poll_loop(&self, generation: u64, task_id: TaskId) {
        let mut ticker = time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                debug!(generation, task_id = %task_id, "poll: generation retired");
                return;
            }

            debug!(generation, task_id = %task_id, "poll: querying task status");
            let response = self.processing.task_result(&task_id).await;
            if self
                .apply_poll_response(generation, &task_id, response)
                .is_break()
            {
                return;
            }
        }
    }

    fn apply_poll_response(
        &self,
        generation: u64,
        task_id: &TaskId,
        response: ClientResult<TaskResultResponse>,
    ) -> ControlFlow<()> {
        let mut state = self.lock();
        if state.generation != generation || state.current_task.as_ref() != Some(task_id) {
            debug!(generation, task_id = %task_id, "poll: discarding stale response");
            return ControlFlow::Break(());
        }

        match response {
            Ok(response) => {
                let status = response.status;
                let Some(outcome) = response.into_outcome() else {
                    debug!(task_id = %task_id, %status, "poll: task still running");
                    return ControlFlow::Continue(());
                };
                info!(task_id = %task_id, %status, "poll: task finished");
                state.finish(outcome);
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "poll: status query failed, abandoning task");
                state.fail(POLL_FAILED_TEXT.to_string());
            }
        }

        self.emit_phase(&state);
        ControlFlow::Break(())
    }

    async fn load_profile(&self) -> ClientResult<Profile> {
        let profile = self.profiles.profile().await?;
        self.lock().profile = Some(profile.clone());
        let _ = self
            .events
            .send(ControllerEvent::ProfileUpdated(profile.clone()));
        Ok(profile)
    }
}

/// Resets a `Submitting` phase whose `submit` future was dropped mid-upload.
struct PendingUpload<'a> {
    shared: &'a Shared,
    generation: u64,
    armed: bool,
}

impl PendingUpload<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingUpload<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.lock();
        if state.generation == self.generation && state.phase == Phase::Submitting {
            info!(generation = self.generation, "upload: abandoned before the service answered");
            state.phase = Phase::Idle;
            state.status_text = IDLE_TEXT.to_string();
            self.shared.emit_phase(&state);
        }
    }
}

fn failure_text(err: &ClientError) -> String {
    let text = err.to_string();
    if text.trim().is_empty() {
        UPLOAD_FAILED_MESSAGE.to_string()
    } else {
        text
    }
}

/// Drives one user's upload: at most one task and one poll timer at a time.
///
/// Dropping the controller tears it down and cancels any running poll.
pub struct UploadController {
    shared: Arc<Shared>,
}

impl UploadController {
    pub fn new(processing: Arc<dyn ProcessingService>, profiles: Arc<dyn ProfileService>) -> Self {
        Self::build(processing, profiles, DEFAULT_POLL_INTERVAL)
    }

    /// Fails with [`ClientError::InvalidPollInterval`] for a zero interval.
    pub fn with_poll_interval(
        processing: Arc<dyn ProcessingService>,
        profiles: Arc<dyn ProfileService>,
        poll_interval: Duration,
    ) -> ClientResult<Self> {
        if poll_interval.is_zero() {
            return Err(ClientError::InvalidPollInterval);
        }
        Ok(Self::build(processing, profiles, poll_interval))
    }

    fn build(
        processing: Arc<dyn ProcessingService>,
        profiles: Arc<dyn ProfileService>,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                processing,
                profiles,
                poll_interval,
                state: Mutex::new(ControllerState::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.shared.lock().snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Replaces the selected file without submitting it.
    pub fn select_file(&self, file: UploadFile) {
        self.shared.lock().selected_file = Some(file);
    }

    pub async fn submit_selected(&self) -> ClientResult<ControllerSnapshot> {
        let file = self.shared.lock().selected_file.clone();
        match file {
            Some(file) => self.submit(file).await,
            None => Err(ClientError::NoFileSelected),
        }
    }

    /// Uploads `file`, superseding whatever the controller was doing.
    ///
    /// Returns the state right after the upload was answered: `Polling` for a
    /// deferred task, `Succeeded`/`Failed` for a direct result. If another
    /// submission or a teardown happened while the upload was in flight, its
    /// response is dropped and the snapshot reflects the newer state.
    ///
    /// Dropping the returned future before the upload answers puts the
    /// controller back to `Idle`.
    pub async fn submit(&self, file: UploadFile) -> ClientResult<ControllerSnapshot> {
        let generation = {
            let mut state = self.shared.lock();
            let generation = state.advance_generation();
            state.selected_file = Some(file.clone());
            state.result = None;
            state.phase = Phase::Submitting;
            state.status_text = SUBMITTING_TEXT.to_string();
            self.shared.emit_phase(&state);
            generation
        };
        info!(generation, filename = %file.filename, bytes = file.bytes.len(), "upload: submitting");

        if file.is_empty() {
            let err = ClientError::EmptyFile;
            self.shared.fail_submission(generation, &err);
            return Err(err);
        }

        let pending = PendingUpload {
            shared: &self.shared,
            generation,
            armed: true,
        };
        let uploaded = self.shared.processing.upload(&file).await;
        pending.disarm();

        let submission = match uploaded {
            Ok(submission) => submission,
            Err(err) => {
                self.shared.fail_submission(generation, &err);
                return Err(err);
            }
        };

        let Some(snapshot) = self.shared.accept_submission(generation, submission) else {
            return Ok(self.snapshot());
        };

        if let Err(err) = self.shared.load_profile().await {
            warn!(error = %err, "profile refresh after upload failed");
        }
        Ok(snapshot)
    }

    /// Fetches the profile and publishes it to subscribers.
    pub async fn refresh_profile(&self) -> ClientResult<Profile> {
        self.shared.load_profile().await
    }

    /// Waits until the current submission reaches a terminal phase.
    pub async fn wait_for_completion(&self) -> ClientResult<Value> {
        let mut events = self.subscribe();
        loop {
            let snapshot = self.snapshot();
            match snapshot.phase {
                Phase::Succeeded => return Ok(snapshot.result.unwrap_or(Value::Null)),
                Phase::Failed => {
                    return Err(match snapshot.result {
                        Some(payload) => ClientError::ProcessingFailed(payload),
                        None => ClientError::transport(snapshot.status_text),
                    });
                }
                Phase::Idle => return Err(ClientError::NoActiveTask),
                Phase::Submitting | Phase::Polling => {}
            }

            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(ClientError::NoActiveTask),
            }
        }
    }

    /// Cancels the poll timer and abandons the current task, if any.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        let abandoned = state.current_task.clone();
        state.advance_generation();
        if state.phase.is_busy() {
            info!(task_id = ?abandoned, "controller: torn down while busy");
            state.phase = Phase::Idle;
            state.status_text = IDLE_TEXT.to_string();
            self.shared.emit_phase(&state);
        }
    }
}

impl Drop for UploadController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
