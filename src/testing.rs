//! Hand-written fakes for the remote collaborators and the audio device.

use async_trait::async_trait;
use futures::{ stream, StreamExt };
use std::collections::{ HashMap, VecDeque };
use std::error::Error as StdError;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use tokio::sync::{ oneshot, watch, Notify };

use crate::audio::output::{
    AudioEngine,
    EngineFactory,
    OutputError,
    PlaybackControl,
    PlaybackHandle,
};
use crate::audio::pcm::AudioBuffer;
use crate::credentials::CredentialProvider;
use crate::llm::chat::{ ChatBackend, ChatRequest, ChatSession, FragmentStream, SessionConfig };
use crate::llm::speech::{ SpeechSynthesizer, SynthesisError };
use crate::llm::video::{ Operation, OperationHandle, VideoGenerator };
use crate::models::video::VideoRequest;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Waits until `ready` holds, re-checking on every notification.
async fn wait_until(notify: &Notify, ready: impl Fn() -> bool) {
    loop {
        let notified = notify.notified();
        if ready() {
            return;
        }
        notified.await;
    }
}

// ---------------------------------------------------------------- speech

pub struct FakeSynthesizer {
    pcm: Option<Vec<u8>>,
    calls: Mutex<Vec<String>>,
    called: Notify,
    gate: watch::Sender<bool>,
}

impl FakeSynthesizer {
    fn build(pcm: Option<Vec<u8>>, open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            pcm,
            calls: Mutex::new(Vec::new()),
            called: Notify::new(),
            gate,
        }
    }

    pub fn returning(pcm: Vec<u8>) -> Self {
        Self::build(Some(pcm), true)
    }

    pub fn failing() -> Self {
        Self::build(None, true)
    }

    /// Holds every call until [`FakeSynthesizer::open_gate`].
    pub fn gated(pcm: Vec<u8>) -> Self {
        Self::build(Some(pcm), false)
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        wait_until(&self.called, || self.calls.lock().unwrap().len() >= count).await;
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        self.calls.lock().unwrap().push(text.to_string());
        self.called.notify_waiters();
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.pcm.clone().ok_or(SynthesisError::Status {
            status: 503,
            body: "unavailable".into(),
        })
    }
}

// ---------------------------------------------------------------- audio device

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Start(String),
    Stop(String),
}

#[derive(Default)]
struct EngineLog {
    events: Vec<EngineEvent>,
    samples: HashMap<String, Vec<f32>>,
    finishers: HashMap<String, oneshot::Sender<()>>,
    active: usize,
    max_concurrent: usize,
    acquired: usize,
    closed: usize,
}

/// Records every start and stop. Playbacks end only when the test calls
/// [`RecordingEngine::finish`].
#[derive(Clone, Default)]
pub struct RecordingEngine {
    log: Arc<Mutex<EngineLog>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> EngineFactory {
        let log = Arc::clone(&self.log);
        Box::new(move || -> Result<Box<dyn AudioEngine>, OutputError> {
            log.lock().unwrap().acquired += 1;
            Ok(Box::new(RecordingDevice { log: Arc::clone(&log) }))
        })
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.log.lock().unwrap().events.clone()
    }

    pub fn started_samples(&self, label: &str) -> Option<Vec<f32>> {
        self.log.lock().unwrap().samples.get(label).cloned()
    }

    pub fn max_concurrent(&self) -> usize {
        self.log.lock().unwrap().max_concurrent
    }

    pub fn acquired(&self) -> usize {
        self.log.lock().unwrap().acquired
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }

    /// Ends the playback for `label` as if the audio ran out.
    pub fn finish(&self, label: &str) {
        let mut log = self.log.lock().unwrap();
        if let Some(done) = log.finishers.remove(label) {
            log.active -= 1;
            let _ = done.send(());
        }
    }
}

struct RecordingDevice {
    log: Arc<Mutex<EngineLog>>,
}

impl AudioEngine for RecordingDevice {
    fn start(&mut self, buffer: &AudioBuffer, label: &str) -> Result<PlaybackHandle, OutputError> {
        let (done_tx, done_rx) = oneshot::channel();
        let mut log = self.log.lock().unwrap();
        log.events.push(EngineEvent::Start(label.to_string()));
        log.samples.insert(label.to_string(), buffer.samples.clone());
        log.finishers.insert(label.to_string(), done_tx);
        log.active += 1;
        log.max_concurrent = log.max_concurrent.max(log.active);
        Ok(PlaybackHandle {
            control: Box::new(RecordingControl {
                label: label.to_string(),
                log: Arc::clone(&self.log),
            }),
            finished: done_rx,
        })
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closed += 1;
    }
}

struct RecordingControl {
    label: String,
    log: Arc<Mutex<EngineLog>>,
}

impl PlaybackControl for RecordingControl {
    fn stop(&mut self) -> Result<(), OutputError> {
        let mut log = self.log.lock().unwrap();
        match log.finishers.remove(&self.label) {
            Some(_) => {
                log.active -= 1;
                log.events.push(EngineEvent::Stop(self.label.clone()));
                Ok(())
            }
            None => Err(OutputError::AlreadyStopped),
        }
    }
}

// ---------------------------------------------------------------- chat

/// One scripted reply of the remote chat session.
#[derive(Clone, Debug)]
pub struct ScriptedTurn {
    fragments: Vec<String>,
    fail_with: Option<String>,
    reject_with: Option<String>,
    hang: bool,
}

impl ScriptedTurn {
    pub fn reply(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_with: None,
            reject_with: None,
            hang: false,
        }
    }

    /// Streams `fragments`, then raises.
    pub fn fail_after(fragments: &[&str], message: &str) -> Self {
        Self { fail_with: Some(message.to_string()), ..Self::reply(fragments) }
    }

    /// Streams `fragments`, then never ends.
    pub fn hang_after(fragments: &[&str]) -> Self {
        Self { hang: true, ..Self::reply(fragments) }
    }

    /// The send itself is refused before any stream exists.
    pub fn rejected(message: &str) -> Self {
        Self { reject_with: Some(message.to_string()), ..Self::reply(&[]) }
    }

    fn into_stream(self) -> FragmentStream {
        let items: Vec<Result<String, BoxError>> = self.fragments
            .into_iter()
            .map(Ok)
            .chain(self.fail_with.map(|m| Err(m.into())))
            .collect();
        let head = stream::iter(items);
        if self.hang {
            Box::pin(head.chain(stream::pending()))
        } else {
            Box::pin(head)
        }
    }
}

#[derive(Default)]
struct ChatScript {
    turns: VecDeque<ScriptedTurn>,
    requests: Vec<ChatRequest>,
    configs: Vec<SessionConfig>,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Mutex<ChatScript>>,
    sent: Arc<Notify>,
    created: Arc<AtomicUsize>,
    fail_create: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: ScriptedTurn) -> &Self {
        self.script.lock().unwrap().turns.push_back(turn);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn configs(&self) -> Vec<SessionConfig> {
        self.script.lock().unwrap().configs.clone()
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub async fn wait_for_requests(&self, count: usize) {
        wait_until(&self.sent, || self.script.lock().unwrap().requests.len() >= count).await;
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn create_session(&self, config: &SessionConfig) -> Result<Arc<dyn ChatSession>, BoxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err("session service unavailable".into());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().configs.push(config.clone());
        Ok(Arc::new(ScriptedSession { backend: self.clone() }))
    }
}

pub struct ScriptedSession {
    backend: ScriptedBackend,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn send_stream(&self, request: ChatRequest) -> Result<FragmentStream, BoxError> {
        let turn = {
            let mut script = self.backend.script.lock().unwrap();
            script.requests.push(request);
            script.turns.pop_front().unwrap_or_else(|| ScriptedTurn::reply(&["ok"]))
        };
        self.backend.sent.notify_waiters();
        if let Some(message) = turn.reject_with.clone() {
            return Err(message.into());
        }
        Ok(turn.into_stream())
    }
}

// ---------------------------------------------------------------- video

#[derive(Default)]
struct VideoScript {
    submissions: VecDeque<Result<String, String>>,
    operations: HashMap<String, VecDeque<Result<Operation, String>>>,
    polls: Vec<String>,
    prompts: Vec<String>,
    stalled: bool,
}

/// Accepts jobs by name and replays a fixed sequence of poll results per
/// job. Once a sequence runs out the job stays pending.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    script: Arc<Mutex<VideoScript>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, name: &str, polls: Vec<Result<Operation, String>>) -> &Self {
        let mut script = self.script.lock().unwrap();
        script.submissions.push_back(Ok(name.to_string()));
        script.operations.insert(name.to_string(), polls.into());
        self
    }

    pub fn reject(&self, message: &str) -> &Self {
        self.script.lock().unwrap().submissions.push_back(Err(message.to_string()));
        self
    }

    /// Every later submit and poll is recorded but never answers.
    pub fn stall(&self) -> &Self {
        self.script.lock().unwrap().stalled = true;
        self
    }

    pub fn poll_count(&self, name: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .polls.iter()
            .filter(|p| p.as_str() == name)
            .count()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.script.lock().unwrap().prompts.clone()
    }
}

#[async_trait]
impl VideoGenerator for ScriptedGenerator {
    async fn submit(&self, request: &VideoRequest) -> Result<OperationHandle, BoxError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.prompts.push(request.effective_prompt().to_string());
            (!script.stalled).then(|| script.submissions.pop_front())
        };
        match next {
            None => std::future::pending().await,
            Some(Some(Ok(name))) => Ok(OperationHandle(name)),
            Some(Some(Err(message))) => Err(message.into()),
            Some(None) => Err("no submission scripted".into()),
        }
    }

    async fn poll(&self, handle: &OperationHandle) -> Result<Operation, BoxError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.polls.push(handle.name().to_string());
            let stalled = script.stalled;
            (!stalled).then(|| script.operations.get_mut(handle.name()).and_then(|ops| ops.pop_front()))
        };
        match next {
            None => std::future::pending().await,
            Some(Some(Ok(op))) => Ok(op),
            Some(Some(Err(message))) => Err(message.into()),
            Some(None) => Ok(Operation::pending()),
        }
    }
}

// ---------------------------------------------------------------- credentials

/// No credential until the selection flow runs; the flow grants `key` when
/// one was given.
pub struct SelectableCredentials {
    key: Mutex<Option<String>>,
    grant: Option<String>,
    selections: AtomicUsize,
}

impl SelectableCredentials {
    pub fn granting(key: &str) -> Self {
        Self {
            key: Mutex::new(None),
            grant: Some(key.to_string()),
            selections: AtomicUsize::new(0),
        }
    }

    pub fn refusing() -> Self {
        Self {
            key: Mutex::new(None),
            grant: None,
            selections: AtomicUsize::new(0),
        }
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for SelectableCredentials {
    async fn request_selection(&self) -> Result<(), BoxError> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        let mut key = self.key.lock().unwrap();
        if key.is_none() {
            *key = self.grant.clone();
        }
        Ok(())
    }

    fn current(&self) -> Option<String> {
        self.key.lock().unwrap().clone()
    }
}
