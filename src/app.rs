use futures::StreamExt;
use log::{ error, info, warn };
use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::audio::output::default_factory;
use crate::audio::playback::{ AudioPlaybackController, PlayOutcome };
use crate::cli::Args;
use crate::config::prompt::load_persona;
use crate::conversation::{ ConversationSession, SendOutcome };
use crate::credentials::{ CredentialProvider, EnvCredentials };
use crate::llm::chat::gemini::GeminiChatClient;
use crate::llm::chat::SessionConfig;
use crate::llm::speech::GeminiSpeechClient;
use crate::llm::video::GeminiVideoClient;
use crate::models::chat::{ Attachment, Role };
use crate::models::video::{ AspectRatio, SourceImage, VideoRequest };
use crate::orchestrator::animator::{ JobOutcome, VideoAnimatorOrchestrator };
use crate::orchestrator::chat::{ ChatEvent, ChatOrchestrator };

const HELP: &str =
    "Commands: /attach <file.pdf>, /play <n>, /stop, /mute, /clear, /history, /quit";

/// The assembled assistant: one chat, one animator, shared credentials.
pub struct SchoolBuddy {
    chat: Arc<ChatOrchestrator>,
    animator: Arc<VideoAnimatorOrchestrator>,
    http: reqwest::Client,
}

impl SchoolBuddy {
    pub async fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let llm = args.llm_config();
        let credentials: Arc<dyn CredentialProvider> = Arc::new(
            EnvCredentials::new(args.api_key.clone())
        );
        if credentials.current().is_none() {
            warn!("No API key configured yet; remote calls will fail until one is provided");
        }

        let persona = load_persona(args.prompts_path.as_ref())?;
        let backend = Arc::new(GeminiChatClient::new(llm.base_url.clone(), Arc::clone(&credentials)));
        let session = ConversationSession::start(backend, Arc::clone(&persona), SessionConfig {
            system_instruction: persona.system_instruction(),
            model: llm.chat_model.clone(),
            temperature: llm.temperature,
        }).await?;

        let synthesizer = Arc::new(
            GeminiSpeechClient::new(
                llm.base_url.clone(),
                llm.tts_model.clone(),
                llm.tts_voice.clone(),
                Arc::clone(&credentials)
            )?
        );
        let audio = Arc::new(
            AudioPlaybackController::new(synthesizer, default_factory(args.audio_out.clone()))
        );
        let chat = Arc::new(ChatOrchestrator::new(session, audio, args.muted));

        let generator = Arc::new(
            GeminiVideoClient::new(
                llm.base_url.clone(),
                llm.video_model.clone(),
                llm.video_resolution.clone(),
                Arc::clone(&credentials)
            )?
        );
        let animator = Arc::new(
            VideoAnimatorOrchestrator::new(generator, credentials, args.poll_policy())
        );

        Ok(Self {
            chat,
            animator,
            http: reqwest::Client::new(),
        })
    }

    /// Line-oriented chat shell on stdin/stdout. Replies stream in the
    /// background so `/stop`, `/clear` and Ctrl-C stay available.
    pub async fn run_chat(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(welcome) = self.chat.history().await.first() {
            println!("SchoolBuddy: {}", welcome.text);
        }
        println!("{}", HELP);

        let printer = tokio::spawn(print_chat_events(self.chat.subscribe()));
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut pending: Option<Attachment> = None;
        let mut sending: Option<JoinHandle<()>> = None;

        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "" => {}
                "/quit" | "/exit" => break,
                "/clear" => {
                    pending = None;
                    if let Err(e) = self.chat.clear().await {
                        warn!("{}", e);
                    }
                    println!("-- conversation cleared --");
                }
                "/mute" => {
                    let muted = self.chat.toggle_mute().await;
                    println!("-- auto-play {} --", if muted { "off" } else { "on" });
                }
                "/stop" => self.chat.stop_audio().await,
                "/history" => self.print_history().await,
                "/play" => self.play_nth(rest.trim()).await,
                "/attach" => {
                    match Attachment::pdf_from_file(rest.trim()) {
                        Ok(file) => {
                            println!("-- attached {} (sent with your next message) --", file.name);
                            pending = Some(file);
                        }
                        Err(e) => println!("-- {} --", e),
                    }
                }
                _ if command.starts_with('/') => println!("{}", HELP),
                _ if self.chat.is_thinking() => {
                    println!("-- still answering; wait, or /clear to drop the reply --");
                }
                _ => {
                    let chat = Arc::clone(&self.chat);
                    let text = line.to_string();
                    let attachment = pending.take();
                    sending = Some(
                        tokio::spawn(async move {
                            match chat.send(&text, attachment).await {
                                Ok(SendOutcome::Completed(_)) | Ok(SendOutcome::Failed { .. }) => {}
                                Ok(SendOutcome::Superseded) => info!("Reply dropped"),
                                Err(e) => println!("-- {} --", e),
                            }
                        })
                    );
                }
            }
        }

        self.chat.shutdown().await;
        if let Some(send) = sending {
            let _ = send.await;
        }
        printer.abort();
        Ok(())
    }

    async fn print_history(&self) {
        let history = self.chat.history().await;
        for (i, message) in history.iter().enumerate() {
            println!("[{}] {}: {}", i + 1, message.role.as_str(), message.text);
        }
        if let Some(partial) = self.chat.streaming_text().await {
            println!("[...] model (answering): {}", partial);
        }
    }

    async fn play_nth(&self, index: &str) {
        let history = self.chat.history().await;
        let message = index
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| history.get(i));
        let Some(message) = message else {
            println!("-- usage: /play <n> with n from /history --");
            return;
        };
        match self.chat.play_message(&message.id).await {
            Some(PlayOutcome::Started) => println!("-- playing [{}] --", index),
            Some(PlayOutcome::Stopped) => println!("-- stopped --"),
            Some(PlayOutcome::Skipped) => println!("-- nothing to read aloud --"),
            Some(PlayOutcome::Failed(e)) => println!("-- audio unavailable: {} --", e),
            Some(PlayOutcome::Superseded) | None => {}
        }
    }

    /// Runs one image-to-video job, printing the progress labels as they
    /// change.
    pub async fn run_animate(
        &self,
        image: &Path,
        prompt: &str,
        aspect_ratio: AspectRatio,
        output: Option<&Path>
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let source = SourceImage::from_file(image)?;
        let request = VideoRequest::new(source, prompt, aspect_ratio);
        println!("Animating ({}): {}", request.aspect_ratio, request.effective_prompt());

        let mut states = self.animator.subscribe();
        let progress = tokio::spawn(async move {
            let mut last: Option<String> = None;
            let mut announced = false;
            while states.changed().await.is_ok() {
                let (label, operation) = {
                    let state = states.borrow_and_update();
                    let operation = state.job
                        .as_ref()
                        .and_then(|job| job.operation())
                        .map(|op| op.name().to_string());
                    (state.progress_label.clone(), operation)
                };
                if label.is_some() && label != last {
                    println!("{}", label.as_deref().unwrap_or_default());
                }
                if let (Some(name), false) = (operation, announced) {
                    info!("Video job accepted as {}", name);
                    announced = true;
                }
                last = label;
            }
        });

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                self.animator.shutdown().await;
                Ok(JobOutcome::Superseded)
            }
            outcome = self.animator.generate(request) => outcome,
        };
        progress.abort();

        match outcome? {
            JobOutcome::Done(uri) => {
                println!("Video ready: {}", uri);
                if let Some(path) = output {
                    let written = download(&self.http, &uri, path).await?;
                    info!("Saved {} bytes to {}", written, path.display());
                }
                Ok(())
            }
            JobOutcome::Failed(e) => {
                error!("Video generation failed: {}", e);
                Err(e.into())
            }
            JobOutcome::Superseded => {
                info!("Video generation cancelled");
                Ok(())
            }
        }
    }
}

async fn print_chat_events(mut events: tokio::sync::broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::Thinking(true)) => {
                print!("SchoolBuddy: ");
                let _ = std::io::stdout().flush();
            }
            Ok(ChatEvent::Fragment(fragment)) => {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            }
            Ok(ChatEvent::MessageAppended(message)) if message.role == Role::Model => {
                if message.is_error {
                    println!("\n[!] {}", message.text);
                } else {
                    println!();
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Chat output skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn download(
    client: &reqwest::Client,
    uri: &str,
    path: &Path
) -> Result<u64, Box<dyn Error + Send + Sync>> {
    let resp = client.get(uri).send().await?.error_for_status()?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut body = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
