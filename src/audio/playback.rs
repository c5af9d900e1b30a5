use log::{ debug, info, warn };
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{ watch, Mutex };

use super::output::{ AudioEngine, EngineFactory, OutputError, PlaybackControl, PlaybackHandle };
use super::pcm::{ decode_pcm16, DecodeError };
use super::text::clean_text_for_tts;
use crate::llm::speech::{ SpeechSynthesizer, SynthesisError };

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Engine(#[from] OutputError),
}

/// What the UI needs to draw speaker buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub active_message_id: Option<String>,
    pub is_loading: bool,
}

#[derive(Debug)]
pub enum PlayOutcome {
    /// Audio for the message is now playing.
    Started,
    /// The message was already active; it has been stopped.
    Stopped,
    /// Nothing speakable was left after cleaning the text.
    Skipped,
    /// A stop or another play request won while synthesis was in flight.
    Superseded,
    Failed(PlaybackError),
}

enum Slot {
    Idle,
    Loading {
        message_id: String,
        ticket: u64,
    },
    Playing {
        message_id: String,
        ticket: u64,
        control: Box<dyn PlaybackControl>,
    },
}

impl Slot {
    fn message_id(&self) -> Option<&str> {
        match self {
            Slot::Idle => None,
            Slot::Loading { message_id, .. } | Slot::Playing { message_id, .. } => Some(message_id),
        }
    }

    fn ticket(&self) -> Option<u64> {
        match self {
            Slot::Idle => None,
            Slot::Loading { ticket, .. } | Slot::Playing { ticket, .. } => Some(*ticket),
        }
    }

    fn state(&self) -> PlaybackState {
        PlaybackState {
            active_message_id: self.message_id().map(str::to_string),
            is_loading: matches!(self, Slot::Loading { .. }),
        }
    }
}

struct Inner {
    slot: Slot,
    engine: Option<Box<dyn AudioEngine>>,
    next_ticket: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<PlaybackState>,
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.slot.state());
    }

    /// Releases whatever the slot holds. Stop errors are ignored: a playback
    /// that already ended is as good as stopped.
    fn halt(&self, inner: &mut Inner) {
        if let Slot::Playing { mut control, message_id, .. } = std::mem::replace(&mut inner.slot, Slot::Idle) {
            if let Err(e) = control.stop() {
                debug!("Ignoring stop error for '{}': {}", message_id, e);
            }
        }
        self.publish(inner);
    }
}

/// Speaks chat messages, one at a time. The single playback slot is the
/// only place an engine playback lives, so starting a new one always goes
/// through stopping the previous one under the same lock.
pub struct AudioPlaybackController {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    engine_factory: EngineFactory,
    shared: Arc<Shared>,
}

impl AudioPlaybackController {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, engine_factory: EngineFactory) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::default());
        Self {
            synthesizer,
            engine_factory,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slot: Slot::Idle,
                    engine: None,
                    next_ticket: 0,
                }),
                state_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state_tx.borrow().clone()
    }

    /// Toggle semantics: playing the active message stops it, playing any
    /// other message stops the current one first.
    pub async fn play(&self, message_id: &str, raw_text: &str) -> PlayOutcome {
        let (ticket, text) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.slot.message_id() == Some(message_id) {
                self.shared.halt(&mut inner);
                info!("Playback toggled off for '{}'", message_id);
                return PlayOutcome::Stopped;
            }
            self.shared.halt(&mut inner);

            let text = clean_text_for_tts(raw_text);
            if text.is_empty() {
                debug!("Nothing to speak for '{}'", message_id);
                return PlayOutcome::Skipped;
            }

            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            inner.slot = Slot::Loading { message_id: message_id.to_string(), ticket };
            self.shared.publish(&inner);
            (ticket, text)
        };

        let decoded = match self.synthesizer.synthesize(&text).await {
            Ok(bytes) => decode_pcm16(&bytes).map_err(PlaybackError::from),
            Err(e) => Err(PlaybackError::from(e)),
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.slot.ticket() != Some(ticket) {
            debug!("Dropping speech for '{}': superseded while loading", message_id);
            return PlayOutcome::Superseded;
        }

        let started = decoded.and_then(|buffer| {
            let engine = match inner.engine.take() {
                Some(engine) => engine,
                None => (self.engine_factory)()?,
            };
            Ok(inner.engine.insert(engine).start(&buffer, message_id)?)
        });

        match started {
            Ok(PlaybackHandle { control, finished }) => {
                inner.slot = Slot::Playing {
                    message_id: message_id.to_string(),
                    ticket,
                    control,
                };
                self.shared.publish(&inner);

                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    if finished.await.is_ok() {
                        let mut inner = shared.inner.lock().await;
                        if inner.slot.ticket() == Some(ticket) {
                            inner.slot = Slot::Idle;
                            shared.publish(&inner);
                        }
                    }
                });
                PlayOutcome::Started
            }
            Err(e) => {
                warn!("Speech playback failed for '{}': {}", message_id, e);
                inner.slot = Slot::Idle;
                self.shared.publish(&inner);
                PlayOutcome::Failed(e)
            }
        }
    }

    /// Clears active and loading state. Safe to call when idle.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.halt(&mut inner);
    }

    /// Stops playback and releases the engine; the next `play` acquires a
    /// fresh one.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.halt(&mut inner);
        if let Some(mut engine) = inner.engine.take() {
            engine.close();
            info!("Audio engine released");
        }
    }
}

impl Drop for AudioPlaybackController {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            self.shared.halt(&mut inner);
            if let Some(mut engine) = inner.engine.take() {
                engine.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ EngineEvent, FakeSynthesizer, RecordingEngine };
    use std::time::Duration;

    const TWO_SAMPLES: [u8; 4] = [0x00, 0x00, 0x00, 0x80];

    fn controller(synth: Arc<FakeSynthesizer>, engine: &RecordingEngine) -> AudioPlaybackController {
        AudioPlaybackController::new(synth, engine.factory())
    }

    #[tokio::test]
    async fn plays_cleaned_text_and_marks_message_active() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);

        let outcome = audio.play("a", "**Ciao** 😀 mondo").await;

        assert!(matches!(outcome, PlayOutcome::Started));
        assert_eq!(synth.calls(), vec!["Ciao mondo".to_string()]);
        assert_eq!(audio.state(), PlaybackState {
            active_message_id: Some("a".into()),
            is_loading: false,
        });
        assert_eq!(engine.started_samples("a"), Some(vec![0.0, -1.0]));
    }

    #[tokio::test]
    async fn playing_same_message_again_toggles_off() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);

        audio.play("a", "uno").await;
        let outcome = audio.play("a", "uno").await;

        assert!(matches!(outcome, PlayOutcome::Stopped));
        assert_eq!(audio.state(), PlaybackState::default());
        assert_eq!(engine.events(), vec![EngineEvent::Start("a".into()), EngineEvent::Stop("a".into())]);
        assert_eq!(synth.calls().len(), 1);
    }

    #[tokio::test]
    async fn switching_messages_stops_before_starting() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);

        audio.play("a", "uno").await;
        audio.play("b", "due").await;

        assert_eq!(
            engine.events(),
            vec![
                EngineEvent::Start("a".into()),
                EngineEvent::Stop("a".into()),
                EngineEvent::Start("b".into())
            ]
        );
        assert_eq!(engine.max_concurrent(), 1);
        assert_eq!(audio.state().active_message_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn natural_end_clears_active_marker() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);
        let mut states = audio.subscribe();

        audio.play("a", "uno").await;
        engine.finish("a");

        tokio::time::timeout(Duration::from_secs(1), async {
            while states.borrow_and_update().active_message_id.is_some() {
                states.changed().await.unwrap();
            }
        }).await.unwrap();
        assert_eq!(audio.state(), PlaybackState::default());
    }

    #[tokio::test]
    async fn synthesis_failure_resets_state_and_is_reported() {
        let synth = Arc::new(FakeSynthesizer::failing());
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);

        let outcome = audio.play("a", "uno").await;

        assert!(matches!(outcome, PlayOutcome::Failed(PlaybackError::Synthesis(_))));
        assert_eq!(audio.state(), PlaybackState::default());
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn odd_pcm_payload_is_a_failure() {
        let synth = Arc::new(FakeSynthesizer::returning(vec![0x00, 0x00, 0x01]));
        let engine = RecordingEngine::new();
        let audio = controller(synth, &engine);

        let outcome = audio.play("a", "uno").await;

        assert!(matches!(outcome, PlayOutcome::Failed(PlaybackError::Decode(_))));
        assert_eq!(audio.state(), PlaybackState::default());
    }

    #[tokio::test]
    async fn emoji_only_text_is_skipped() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(Arc::clone(&synth), &engine);

        assert!(matches!(audio.play("a", "👋 ✨").await, PlayOutcome::Skipped));
        assert!(synth.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_while_loading_drops_the_late_audio() {
        let synth = Arc::new(FakeSynthesizer::gated(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = Arc::new(controller(Arc::clone(&synth), &engine));

        let pending = {
            let audio = Arc::clone(&audio);
            tokio::spawn(async move { audio.play("a", "uno").await })
        };
        synth.wait_for_calls(1).await;
        assert_eq!(audio.state(), PlaybackState {
            active_message_id: Some("a".into()),
            is_loading: true,
        });

        audio.stop().await;
        synth.open_gate();

        assert!(matches!(pending.await.unwrap(), PlayOutcome::Superseded));
        assert_eq!(audio.state(), PlaybackState::default());
        assert!(engine.events().is_empty());
    }

    #[tokio::test]
    async fn stop_is_safe_when_idle() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(synth, &engine);

        audio.stop().await;
        audio.stop().await;
        assert_eq!(audio.state(), PlaybackState::default());
    }

    #[tokio::test]
    async fn engine_is_acquired_lazily_and_released_on_shutdown() {
        let synth = Arc::new(FakeSynthesizer::returning(TWO_SAMPLES.to_vec()));
        let engine = RecordingEngine::new();
        let audio = controller(synth, &engine);
        assert_eq!(engine.acquired(), 0);

        audio.play("a", "uno").await;
        audio.play("b", "due").await;
        assert_eq!(engine.acquired(), 1);

        audio.shutdown().await;
        assert_eq!(engine.closed(), 1);
        assert_eq!(audio.state(), PlaybackState::default());

        audio.play("c", "tre").await;
        assert_eq!(engine.acquired(), 2);
    }
}
