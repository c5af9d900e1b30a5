use futures::StreamExt;
use log::{ debug, info, warn };
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::prompt::Persona;
use crate::llm::chat::{ ChatBackend, ChatRequest, ChatSession, SessionConfig };
use crate::models::chat::{ Attachment, Message };

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("a response is still streaming")]
    Busy,
    #[error("nothing to send")]
    EmptyInput,
    #[error("unsupported attachment type: {0}")]
    UnsupportedAttachment(String),
    #[error("could not open a chat session: {0}")]
    Session(String),
    #[error("response stream failed: {0}")]
    Streaming(String),
}

/// How a send ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The stream completed; this MODEL message is now in the history.
    Completed(Message),
    /// The stream raised; the apology message is now in the history.
    Failed {
        error_message: Message,
        cause: ChatError,
    },
    /// The session was cleared or detached while this send was in flight.
    Superseded,
}

/// Progress reported to the caller while a send runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionUpdate<'a> {
    UserMessage(&'a Message),
    Fragment(&'a str),
}

/// Accumulation of one streamed reply. Every transition goes through
/// [`StreamState::apply`]; events carrying another generation than the one
/// being streamed are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming {
        generation: u64,
        buffer: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    Begin(u64),
    Fragment(u64, &'a str),
    End(u64),
    Fail(u64),
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEffect {
    Ignored,
    Accepted,
    /// The stream ended; the accumulated text.
    Materialized(String),
    /// The partial text was thrown away.
    Discarded,
}

impl StreamState {
    fn is_current(&self, generation: u64) -> bool {
        matches!(self, StreamState::Streaming { generation: g, .. } if *g == generation)
    }

    pub fn apply(&mut self, event: StreamEvent<'_>) -> StreamEffect {
        match event {
            StreamEvent::Begin(generation) => {
                *self = StreamState::Streaming { generation, buffer: String::new() };
                StreamEffect::Accepted
            }
            StreamEvent::Fragment(generation, fragment) => {
                match self {
                    StreamState::Streaming { generation: g, buffer } if *g == generation => {
                        buffer.push_str(fragment);
                        StreamEffect::Accepted
                    }
                    _ => StreamEffect::Ignored,
                }
            }
            StreamEvent::End(generation) => {
                if !self.is_current(generation) {
                    return StreamEffect::Ignored;
                }
                match std::mem::take(self) {
                    StreamState::Streaming { buffer, .. } => StreamEffect::Materialized(buffer),
                    StreamState::Idle => StreamEffect::Ignored,
                }
            }
            StreamEvent::Fail(generation) => {
                if !self.is_current(generation) {
                    return StreamEffect::Ignored;
                }
                *self = StreamState::Idle;
                StreamEffect::Discarded
            }
            StreamEvent::Reset => {
                match std::mem::take(self) {
                    StreamState::Idle => StreamEffect::Ignored,
                    StreamState::Streaming { .. } => StreamEffect::Discarded,
                }
            }
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            StreamState::Idle => None,
            StreamState::Streaming { buffer, .. } => Some(buffer),
        }
    }
}

struct Inner {
    history: Vec<Message>,
    remote: Option<Arc<dyn ChatSession>>,
    generation: u64,
    stream: StreamState,
    cancel: CancellationToken,
}

impl Inner {
    /// Detaches whatever is in flight and moves to a new generation.
    fn invalidate(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.generation += 1;
        if self.stream.apply(StreamEvent::Reset) == StreamEffect::Discarded {
            debug!("Discarded in-flight response of generation {}", self.generation - 1);
        }
    }
}

/// Resets the stream of one send if its future is dropped before the send
/// settled, so an abandoned send does not leave the session busy.
struct InFlight {
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    settled: bool,
}

impl InFlight {
    fn abandon(inner: &mut Inner, generation: u64) {
        if inner.stream.apply(StreamEvent::Fail(generation)) == StreamEffect::Discarded {
            debug!("Send of generation {} abandoned by its caller", generation);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let generation = self.generation;
        match self.inner.try_lock() {
            Ok(mut inner) => Self::abandon(&mut inner, generation),
            Err(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let inner = Arc::clone(&self.inner);
                    runtime.spawn(async move {
                        Self::abandon(&mut *inner.lock().await, generation);
                    });
                }
            }
        }
    }
}

/// Message history plus the remote conversational context it was built
/// against. History only changes through `send_with` and `clear`.
pub struct ConversationSession {
    backend: Arc<dyn ChatBackend>,
    persona: Arc<Persona>,
    config: SessionConfig,
    inner: Arc<Mutex<Inner>>,
}

impl ConversationSession {
    /// Opens the remote context and seeds the welcome message.
    pub async fn start(
        backend: Arc<dyn ChatBackend>,
        persona: Arc<Persona>,
        config: SessionConfig
    ) -> Result<Self, ChatError> {
        let remote = backend
            .create_session(&config).await
            .map_err(|e| ChatError::Session(e.to_string()))?;
        info!("Chat session started with model {}", config.model);
        let welcome = Message::welcome(persona.welcome_text.clone());
        Ok(Self {
            backend,
            persona,
            config,
            inner: Arc::new(
                Mutex::new(Inner {
                    history: vec![welcome],
                    remote: Some(remote),
                    generation: 0,
                    stream: StreamState::Idle,
                    cancel: CancellationToken::new(),
                })
            ),
        })
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub async fn send(
        &self,
        text: &str,
        attachment: Option<Attachment>
    ) -> Result<SendOutcome, ChatError> {
        self.send_with(text, attachment, |_| {}).await
    }

    /// Appends the USER message, then streams the reply. `observer` sees the
    /// USER message first and then every accepted fragment in arrival order.
    pub async fn send_with<F>(
        &self,
        text: &str,
        attachment: Option<Attachment>,
        mut observer: F
    ) -> Result<SendOutcome, ChatError>
        where F: FnMut(SessionUpdate<'_>) + Send
    {
        let text = text.trim();
        if text.is_empty() && attachment.is_none() {
            return Err(ChatError::EmptyInput);
        }

        let (mut in_flight, remote, cancel, request) = {
            let mut inner = self.inner.lock().await;
            if inner.stream != StreamState::Idle {
                return Err(ChatError::Busy);
            }

            let (display, prompt) = match &attachment {
                Some(file) if text.is_empty() =>
                    (self.persona.attachment_label(&file.name), self.persona.attachment_prompt.clone()),
                _ => (text.to_string(), text.to_string()),
            };
            let user = Message::user(display);
            inner.history.push(user.clone());
            observer(SessionUpdate::UserMessage(&user));

            let generation = inner.generation;
            inner.stream.apply(StreamEvent::Begin(generation));
            let in_flight = InFlight {
                inner: Arc::clone(&self.inner),
                generation,
                settled: false,
            };

            let remote = match inner.remote.clone() {
                Some(remote) => Ok(remote),
                None => {
                    let created = self.backend.create_session(&self.config).await;
                    if let Ok(remote) = &created {
                        inner.remote = Some(Arc::clone(remote));
                    }
                    created
                }
            };

            let request = ChatRequest { text: prompt, attachment };
            (in_flight, remote, inner.cancel.child_token(), request)
        };
        let generation = in_flight.generation;

        let result = match remote {
            Ok(remote) => {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    pumped = self.pump(remote, request, generation, &mut observer) => Some(pumped),
                }
            }
            Err(e) => Some(Err(e)),
        };

        let mut inner = self.inner.lock().await;
        in_flight.settled = true;
        match result {
            None => {
                debug!("Send of generation {} detached", generation);
                Ok(SendOutcome::Superseded)
            }
            Some(Ok(())) =>
                match inner.stream.apply(StreamEvent::End(generation)) {
                    StreamEffect::Materialized(reply) => {
                        let message = Message::model(reply);
                        inner.history.push(message.clone());
                        Ok(SendOutcome::Completed(message))
                    }
                    _ => Ok(SendOutcome::Superseded),
                }
            Some(Err(e)) =>
                match inner.stream.apply(StreamEvent::Fail(generation)) {
                    StreamEffect::Discarded => {
                        warn!("Chat stream failed: {}", e);
                        let error_message = Message::error(self.persona.apology_text.clone());
                        inner.history.push(error_message.clone());
                        Ok(SendOutcome::Failed {
                            error_message,
                            cause: ChatError::Streaming(e.to_string()),
                        })
                    }
                    _ => Ok(SendOutcome::Superseded),
                }
        }
    }

    async fn pump<F>(
        &self,
        remote: Arc<dyn ChatSession>,
        request: ChatRequest,
        generation: u64,
        observer: &mut F
    ) -> Result<(), Box<dyn StdError + Send + Sync>>
        where F: FnMut(SessionUpdate<'_>) + Send
    {
        let mut stream = remote.send_stream(request).await?;
        while let Some(item) = stream.next().await {
            let fragment = item?;
            let accepted = {
                let mut inner = self.inner.lock().await;
                inner.stream.apply(StreamEvent::Fragment(generation, &fragment))
            };
            if accepted != StreamEffect::Accepted {
                break;
            }
            observer(SessionUpdate::Fragment(&fragment));
        }
        Ok(())
    }

    /// Resets the history to the welcome message and binds a fresh remote
    /// context. A send in flight is cancelled and its result never reaches
    /// the new history. When the new context cannot be opened the history is
    /// still reset and the next send retries.
    pub async fn clear(&self) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        inner.invalidate();
        inner.history = vec![Message::welcome(self.persona.welcome_text.clone())];
        inner.remote = None;
        match self.backend.create_session(&self.config).await {
            Ok(remote) => {
                inner.remote = Some(remote);
                info!("Chat session cleared");
                Ok(())
            }
            Err(e) => {
                warn!("Chat session cleared but no new remote session: {}", e);
                Err(ChatError::Session(e.to_string()))
            }
        }
    }

    /// Cancels a send in flight without touching the history.
    pub async fn detach(&self) {
        self.inner.lock().await.invalidate();
    }

    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.history.clone()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.inner
            .lock().await
            .history.iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Text accumulated so far for the reply being streamed.
    pub async fn streaming_text(&self) -> Option<String> {
        self.inner.lock().await.stream.text().map(str::to_string)
    }

    pub async fn is_streaming(&self) -> bool {
        self.inner.lock().await.stream != StreamState::Idle
    }
}
