use std::time::Duration;

pub mod chat;
pub mod speech;
pub mod video;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_TTS_VOICE: &str = "Charon";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.1-fast-generate-preview";
pub const DEFAULT_VIDEO_RESOLUTION: &str = "720p";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Upper bound for one non-streaming request (speech, video submit and poll).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub chat_model: String,
    pub temperature: f32,
    pub tts_model: String,
    pub tts_voice: String,
    pub video_model: String,
    pub video_resolution: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            tts_voice: DEFAULT_TTS_VOICE.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            video_resolution: DEFAULT_VIDEO_RESOLUTION.to_string(),
        }
    }
}

/// `{base}/models/{model}:{method}`
pub fn model_url(base_url: &str, model: &str, method: &str) -> String {
    format!("{}/models/{}:{}", base_url.trim_end_matches('/'), model, method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_url_trims_trailing_slash() {
        assert_eq!(
            model_url("https://example.test/v1beta/", "gemini-2.5-flash", "streamGenerateContent"),
            "https://example.test/v1beta/models/gemini-2.5-flash:streamGenerateContent"
        );
    }
}
