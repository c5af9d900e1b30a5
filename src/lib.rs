pub mod app;
pub mod audio;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod video;

#[cfg(test)]
mod testing;

use app::SchoolBuddy;
use cli::{ Args, Command };
use log::info;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Base URL: {}", args.base_url);
    info!("Chat Model: {} (temperature {})", args.chat_model, args.temperature);
    info!("TTS Model: {} (voice {})", args.tts_model, args.tts_voice);
    info!("Video Model: {} ({})", args.video_model, args.video_resolution);
    info!("Poll Interval: {}s", args.poll_interval_secs);
    info!("Poll Timeout: {}", match args.poll_timeout_secs {
        0 => "none".to_string(),
        secs => format!("{}s", secs),
    });
    info!("Prompts Path: {}", match &args.prompts_path {
        Some(path) => path.display().to_string(),
        None => "built-in".to_string(),
    });
    info!("Muted: {}", args.muted);
    if let Some(dir) = &args.audio_out {
        info!("Audio Output Dir: {}", dir.display());
    }
    info!("API Key Configured: {}", args.api_key.as_deref().map_or(false, |k| !k.trim().is_empty()));
    info!("-------------------------");

    let app = SchoolBuddy::new(&args).await?;
    match args.command.unwrap_or(Command::Chat) {
        Command::Chat => app.run_chat().await,
        Command::Animate { image, prompt, aspect_ratio, output } => {
            app.run_animate(&image, &prompt, aspect_ratio, output.as_deref()).await
        }
    }
}
