use log::{ debug, info };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::audio::playback::{ AudioPlaybackController, PlayOutcome, PlaybackState };
use crate::conversation::{ ChatError, ConversationSession, SendOutcome, SessionUpdate };
use crate::models::chat::{ Attachment, Message, PDF_MIME_TYPE };

const EVENT_CAPACITY: usize = 256;

/// Everything the chat view needs to redraw, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Thinking(bool),
    Fragment(String),
    MessageAppended(Message),
    Playback(PlaybackState),
    Cleared,
}

/// Glue between the conversation and the speaker: auto-plays replies,
/// keeps audio quiet while a new question is being sent, and owns the
/// thinking and mute flags.
pub struct ChatOrchestrator {
    session: ConversationSession,
    audio: Arc<AudioPlaybackController>,
    muted: AtomicBool,
    thinking: AtomicBool,
    events: broadcast::Sender<ChatEvent>,
    playback_forwarder: JoinHandle<()>,
}

impl ChatOrchestrator {
    pub fn new(session: ConversationSession, audio: Arc<AudioPlaybackController>, muted: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let playback_forwarder = {
            let mut states = audio.subscribe();
            let events = events.clone();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = states.borrow_and_update().clone();
                    let _ = events.send(ChatEvent::Playback(state));
                }
            })
        };
        Self {
            session,
            audio,
            muted: AtomicBool::new(muted),
            thinking: AtomicBool::new(false),
            events,
            playback_forwarder,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn set_thinking(&self, thinking: bool) {
        if self.thinking.swap(thinking, Ordering::SeqCst) != thinking {
            self.emit(ChatEvent::Thinking(thinking));
        }
    }

    /// Sends a question. Current playback is stopped first; a successful
    /// reply is spoken unless muted, and this call returns once that
    /// playback has started or failed.
    pub async fn send(
        &self,
        text: &str,
        attachment: Option<Attachment>
    ) -> Result<SendOutcome, ChatError> {
        if let Some(file) = &attachment {
            if file.mime_type != PDF_MIME_TYPE {
                return Err(ChatError::UnsupportedAttachment(file.mime_type.clone()));
            }
        }
        if text.trim().is_empty() && attachment.is_none() {
            return Err(ChatError::EmptyInput);
        }
        if self.session.is_streaming().await {
            return Err(ChatError::Busy);
        }

        self.audio.stop().await;
        self.set_thinking(true);

        let events = &self.events;
        let outcome = self.session.send_with(text, attachment, |update| {
            let event = match update {
                SessionUpdate::UserMessage(message) => ChatEvent::MessageAppended(message.clone()),
                SessionUpdate::Fragment(fragment) => ChatEvent::Fragment(fragment.to_string()),
            };
            let _ = events.send(event);
        }).await;

        if matches!(outcome, Err(ChatError::Busy)) {
            return outcome;
        }
        match &outcome {
            Ok(SendOutcome::Completed(reply)) => self.emit(ChatEvent::MessageAppended(reply.clone())),
            Ok(SendOutcome::Failed { error_message, .. }) => {
                self.emit(ChatEvent::MessageAppended(error_message.clone()))
            }
            // Whoever superseded this send owns the thinking flag now.
            Ok(SendOutcome::Superseded) => {
                return outcome;
            }
            Err(_) => {}
        }
        self.set_thinking(false);

        if let Ok(SendOutcome::Completed(reply)) = &outcome {
            if self.is_muted() {
                debug!("Muted; not speaking reply {}", reply.id);
            } else if !reply.text.trim().is_empty() {
                self.audio.play(&reply.id, &reply.text).await;
            }
        }
        outcome
    }

    /// Speaker button of one message. `None` when no such message exists.
    pub async fn play_message(&self, message_id: &str) -> Option<PlayOutcome> {
        let message = self.session.message(message_id).await?;
        Some(self.audio.play(&message.id, &message.text).await)
    }

    pub async fn stop_audio(&self) {
        self.audio.stop().await;
    }

    /// Stops any playback and flips auto-play. Returns the new muted flag.
    pub async fn toggle_mute(&self) -> bool {
        self.audio.stop().await;
        let muted = !self.muted.fetch_xor(true, Ordering::SeqCst);
        info!("Auto-play {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    pub async fn clear(&self) -> Result<(), ChatError> {
        self.audio.stop().await;
        let cleared = self.session.clear().await;
        self.set_thinking(false);
        self.emit(ChatEvent::Cleared);
        cleared
    }

    /// Detaches from any reply in flight and releases the audio engine.
    pub async fn shutdown(&self) {
        self.session.detach().await;
        self.audio.shutdown().await;
        self.set_thinking(false);
    }

    pub async fn history(&self) -> Vec<Message> {
        self.session.history().await
    }

    pub async fn streaming_text(&self) -> Option<String> {
        self.session.streaming_text().await
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.audio.state()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking.load(Ordering::SeqCst)
    }
}

impl Drop for ChatOrchestrator {
    fn drop(&mut self) {
        self.playback_forwarder.abort();
    }
}
