use thiserror::Error;

use crate::llm::video::{ Operation, OperationHandle };
use crate::models::video::{ JobStatus, VideoRequest };

const GENERIC_FAILURE: &str = "Video generation failed";

/// Why a video job ended in FAILED. The display text is what the user sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VideoError {
    #[error("{0}")]
    Submission(String),
    #[error("An access credential is required to generate videos.")]
    MissingCredential,
    #[error("{0}")]
    RemoteOperation(String),
    #[error("No video URI returned")]
    MissingResult,
    #[error("Lost contact with the video service: {0}")]
    Transport(String),
    #[error("Video generation did not finish within {0} seconds")]
    TimedOut(u64),
    #[error("Please upload a valid image file.")]
    InvalidSource,
    #[error("Video generation was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Idle,
    Submitting,
    Polling {
        operation: OperationHandle,
        ticks: u32,
    },
    Done {
        uri: String,
    },
    Failed {
        error: VideoError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Submit,
    Accepted(OperationHandle),
    Polled(Operation),
    Fail(VideoError),
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Submit => "submit",
            JobEvent::Accepted(_) => "accepted",
            JobEvent::Polled(_) => "polled",
            JobEvent::Fail(_) => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event '{event}' is not valid in state {from:?}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub event: &'static str,
}

/// Reads a finished operation: the error field wins over any result.
pub fn resolve_operation(operation: &Operation) -> Result<String, VideoError> {
    if let Some(error) = &operation.error {
        let message = error.message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(GENERIC_FAILURE);
        return Err(VideoError::RemoteOperation(message.to_string()));
    }
    operation
        .video_uri()
        .map(str::to_string)
        .ok_or(VideoError::MissingResult)
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Idle => JobStatus::Idle,
            JobState::Submitting => JobStatus::Submitting,
            JobState::Polling { .. } => JobStatus::Polling,
            JobState::Done { .. } => JobStatus::Done,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn transition(self, event: JobEvent) -> Result<JobState, InvalidTransition> {
        let from = self.status();
        match (self, event) {
            (JobState::Idle, JobEvent::Submit) => Ok(JobState::Submitting),
            (JobState::Submitting, JobEvent::Accepted(operation)) =>
                Ok(JobState::Polling { operation, ticks: 0 }),
            (JobState::Polling { operation, ticks }, JobEvent::Polled(op)) => {
                if !op.done {
                    return Ok(JobState::Polling { operation, ticks: ticks + 1 });
                }
                Ok(match resolve_operation(&op) {
                    Ok(uri) => JobState::Done { uri },
                    Err(error) => JobState::Failed { error },
                })
            }
            (JobState::Idle | JobState::Submitting | JobState::Polling { .. }, JobEvent::Fail(error)) =>
                Ok(JobState::Failed { error }),
            (_, event) => Err(InvalidTransition { from, event: event.name() }),
        }
    }
}

/// One generate() invocation. Replaced wholesale by the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoJob {
    generation: u64,
    request: VideoRequest,
    state: JobState,
}

impl VideoJob {
    pub fn new(generation: u64, request: VideoRequest) -> Self {
        Self { generation, request, state: JobState::Idle }
    }

    pub fn apply(&mut self, event: JobEvent) -> Result<(), InvalidTransition> {
        self.state = self.state.clone().transition(event)?;
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn result_uri(&self) -> Option<&str> {
        match &self.state {
            JobState::Done { uri } => Some(uri),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&VideoError> {
        match &self.state {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn operation(&self) -> Option<&OperationHandle> {
        match &self.state {
            JobState::Polling { operation, .. } => Some(operation),
            _ => None,
        }
    }
}
