use clap::{ Parser, Subcommand };
use std::path::PathBuf;

use crate::llm::{
    LlmConfig,
    DEFAULT_BASE_URL,
    DEFAULT_CHAT_MODEL,
    DEFAULT_TTS_MODEL,
    DEFAULT_TTS_VOICE,
    DEFAULT_VIDEO_MODEL,
    DEFAULT_VIDEO_RESOLUTION,
};
use crate::models::video::AspectRatio;
use crate::video::poller::PollPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Access ---
    /// API key for the hosted models. When missing, the key is looked up again
    /// (environment and .env) the first time a video is requested.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the generative language API.
    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    // --- Chat ---
    /// Model used for the conversation.
    #[arg(long, env = "CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    pub chat_model: String,

    /// Sampling temperature for the conversation.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    /// Path to a JSON file overriding the built-in persona texts.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<PathBuf>,

    // --- Speech ---
    /// Text-to-speech model.
    #[arg(long, env = "TTS_MODEL", default_value = DEFAULT_TTS_MODEL)]
    pub tts_model: String,

    /// Prebuilt voice used for every reply.
    #[arg(long, env = "TTS_VOICE", default_value = DEFAULT_TTS_VOICE)]
    pub tts_voice: String,

    /// Start with auto-play of replies disabled.
    #[arg(long, env = "MUTED", default_value = "false")]
    pub muted: bool,

    /// Also write every played reply to <dir>/<message-id>.wav.
    #[arg(long, env = "AUDIO_OUT_DIR")]
    pub audio_out: Option<PathBuf>,

    // --- Video ---
    /// Image-to-video model.
    #[arg(long, env = "VIDEO_MODEL", default_value = DEFAULT_VIDEO_MODEL)]
    pub video_model: String,

    /// Resolution requested for generated videos.
    #[arg(long, env = "VIDEO_RESOLUTION", default_value = DEFAULT_VIDEO_RESOLUTION)]
    pub video_resolution: String,

    /// Seconds between two status checks of a video job.
    #[arg(long, env = "VIDEO_POLL_INTERVAL_SECS", default_value = "5")]
    pub poll_interval_secs: u64,

    /// Give up on a video job after this many seconds. 0 waits forever.
    #[arg(long, env = "VIDEO_POLL_TIMEOUT_SECS", default_value = "600")]
    pub poll_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Interactive chat with the school assistant (default).
    Chat,
    /// Turn a still image into a short video.
    Animate {
        /// Source image (png, jpg, webp, ...).
        #[arg(long)]
        image: PathBuf,

        /// What should happen in the video.
        #[arg(long, default_value = "")]
        prompt: String,

        /// landscape (16:9) or portrait (9:16).
        #[arg(long, default_value = "landscape")]
        aspect_ratio: AspectRatio,

        /// Download the finished video to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

impl Args {
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.base_url.clone(),
            chat_model: self.chat_model.clone(),
            temperature: self.temperature,
            tts_model: self.tts_model.clone(),
            tts_voice: self.tts_voice.clone(),
            video_model: self.video_model.clone(),
            video_resolution: self.video_resolution.clone(),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_secs(self.poll_interval_secs, self.poll_timeout_secs)
    }
}
