use log::{ info, warn };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{ watch, Mutex };
use tokio::time::{ sleep, Instant };
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialProvider;
use crate::llm::video::VideoGenerator;
use crate::models::video::VideoRequest;
use crate::video::job::{ JobEvent, JobState, VideoError, VideoJob };
use crate::video::poller::{ poll_until_settled, wait_for_deadline, PollOutcome, PollPolicy };

pub const LABEL_INITIALIZING: &str = "Initializing Veo...";
pub const LABEL_CHECKING: &str = "Checking permissions...";
pub const LABEL_ANIMATING: &str = "Animating... this takes about 1-2 mins...";

const CREDENTIAL_SETTLE_DELAY: Duration = Duration::from_secs(1);
const ANIMATING_LABEL_DELAY: Duration = Duration::from_secs(2);

/// What the animator view renders. The label is cosmetic and changes on a
/// timer; `job` is authoritative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimatorState {
    pub job: Option<VideoJob>,
    pub progress_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(String),
    Failed(VideoError),
    /// A newer generate() or a shutdown took over.
    Superseded,
}

/// Applies `f` only while `generation` is still the job on display.
fn update_current(
    state: &watch::Sender<AnimatorState>,
    generation: u64,
    f: impl FnOnce(&mut AnimatorState)
) -> bool {
    state.send_if_modified(|current| {
        let is_current = current.job
            .as_ref()
            .map(|job| job.generation() == generation)
            .unwrap_or(false);
        if is_current {
            f(current);
        }
        is_current
    })
}

/// Labels only decorate a running job.
fn set_label(state: &watch::Sender<AnimatorState>, generation: u64, label: &str) -> bool {
    update_current(state, generation, |current| {
        if current.job.as_ref().map_or(false, |job| !job.status().is_terminal()) {
            current.progress_label = Some(label.to_string());
        }
    })
}

/// Lives as long as one `generate` call. Whatever way the call ends, the
/// job's loops are cancelled and a job left running is marked cancelled, so
/// a dropped call never leaves a job on display that nothing drives.
struct RunningJob {
    state: Arc<watch::Sender<AnimatorState>>,
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.cancel.cancel();
        let generation = self.generation;
        self.state.send_if_modified(|current| {
            match current.job.as_mut() {
                Some(job) if job.generation() == generation && !job.status().is_terminal() => {
                    if let Err(e) = job.apply(JobEvent::Fail(VideoError::Cancelled)) {
                        warn!("Video job {}: {}", generation, e);
                    }
                    current.progress_label = None;
                    info!("Video job {} cancelled", generation);
                    true
                }
                _ => false,
            }
        });
    }
}

/// Drives one image-to-video job at a time. Starting a new job cancels the
/// poll loop of the previous one and hides its results.
pub struct VideoAnimatorOrchestrator {
    generator: Arc<dyn VideoGenerator>,
    credentials: Arc<dyn CredentialProvider>,
    policy: PollPolicy,
    generation: AtomicU64,
    cancel: Mutex<CancellationToken>,
    state: Arc<watch::Sender<AnimatorState>>,
}

impl VideoAnimatorOrchestrator {
    pub fn new(
        generator: Arc<dyn VideoGenerator>,
        credentials: Arc<dyn CredentialProvider>,
        policy: PollPolicy
    ) -> Self {
        let (state, _) = watch::channel(AnimatorState::default());
        Self {
            generator,
            credentials,
            policy,
            generation: AtomicU64::new(0),
            cancel: Mutex::new(CancellationToken::new()),
            state: Arc::new(state),
        }
    }

    pub fn view(&self) -> AnimatorState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AnimatorState> {
        self.state.subscribe()
    }

    fn advance(&self, generation: u64, event: JobEvent) -> bool {
        update_current(&self.state, generation, |current| {
            if let Some(job) = current.job.as_mut() {
                if let Err(e) = job.apply(event) {
                    warn!("Video job {}: {}", generation, e);
                }
            }
        })
    }

    /// Applies the terminal event and clears the progress label.
    fn finish(&self, generation: u64, event: JobEvent) -> JobOutcome {
        let mut outcome = JobOutcome::Superseded;
        update_current(&self.state, generation, |current| {
            if let Some(job) = current.job.as_mut() {
                if let Err(e) = job.apply(event) {
                    warn!("Video job {}: {}", generation, e);
                }
                outcome = match job.state() {
                    JobState::Done { uri } => JobOutcome::Done(uri.clone()),
                    JobState::Failed { error } => JobOutcome::Failed(error.clone()),
                    _ => JobOutcome::Superseded,
                };
            }
            current.progress_label = None;
        });
        match &outcome {
            JobOutcome::Done(_) => info!("Video job {} finished", generation),
            JobOutcome::Failed(e) => warn!("Video job {} failed: {}", generation, e),
            JobOutcome::Superseded => info!("Video job {} superseded", generation),
        }
        outcome
    }

    /// Runs a whole job: credential check, submission, polling. Only a
    /// source that is not an image is rejected up front; every other failure
    /// ends the job in FAILED.
    pub async fn generate(&self, request: VideoRequest) -> Result<JobOutcome, VideoError> {
        if !request.image.is_image() {
            return Err(VideoError::InvalidSource);
        }

        let running = {
            let mut token = self.cancel.lock().await;
            token.cancel();
            *token = CancellationToken::new();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.send_replace(AnimatorState {
                job: Some(VideoJob::new(generation, request.clone())),
                progress_label: Some(LABEL_INITIALIZING.to_string()),
            });
            RunningJob {
                state: Arc::clone(&self.state),
                generation,
                cancel: token.clone(),
            }
        };
        let generation = running.generation;
        let cancel = running.cancel.clone();
        info!("Video job {} started ({})", generation, request.aspect_ratio);
        self.advance(generation, JobEvent::Submit);

        if !set_label(&self.state, generation, LABEL_CHECKING) {
            return Ok(JobOutcome::Superseded);
        }
        {
            let state = Arc::clone(&self.state);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(ANIMATING_LABEL_DELAY) => {
                        set_label(&state, generation, LABEL_ANIMATING);
                    }
                }
            });
        }

        if !self.credentials.has_credential().await {
            if let Err(e) = self.credentials.request_selection().await {
                warn!("Credential selection failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(JobOutcome::Superseded),
                _ = sleep(CREDENTIAL_SETTLE_DELAY) => {}
            }
            if !self.credentials.has_credential().await {
                return Ok(self.finish(generation, JobEvent::Fail(VideoError::MissingCredential)));
            }
        }

        Ok(self.submit_and_poll(generation, &request, &cancel).await)
    }

    async fn submit_and_poll(
        &self,
        generation: u64,
        request: &VideoRequest,
        cancel: &CancellationToken
    ) -> JobOutcome {
        let deadline = self.policy.deadline_from(Instant::now());
        let submitted = tokio::select! {
            _ = cancel.cancelled() => return JobOutcome::Superseded,
            _ = wait_for_deadline(deadline) => {
                let limit = self.policy.timeout.map_or(0, |limit| limit.as_secs());
                return self.finish(generation, JobEvent::Fail(VideoError::TimedOut(limit)));
            }
            submitted = self.generator.submit(request) => submitted,
        };
        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                return self.finish(generation, JobEvent::Fail(VideoError::Submission(e.to_string())));
            }
        };
        info!("Video job {} accepted as {}", generation, handle.name());
        if !self.advance(generation, JobEvent::Accepted(handle.clone())) {
            return JobOutcome::Superseded;
        }

        let polled = poll_until_settled(
            self.generator.as_ref(),
            &handle,
            &self.policy,
            cancel,
            |operation| self.advance(generation, JobEvent::Polled(operation.clone()))
        ).await;

        match polled {
            PollOutcome::Settled(operation) => self.finish(generation, JobEvent::Polled(operation)),
            PollOutcome::Failed(error) => self.finish(generation, JobEvent::Fail(error)),
            PollOutcome::Cancelled => JobOutcome::Superseded,
        }
    }

    /// Stops the job in flight, if any; it ends FAILED as cancelled.
    pub async fn shutdown(&self) {
        self.cancel.lock().await.cancel();
    }
}
