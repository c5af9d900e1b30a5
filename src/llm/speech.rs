use async_trait::async_trait;
use base64::Engine;
use log::info;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

use crate::credentials::{ require_credential, CredentialProvider };
use crate::llm::{ model_url, REQUEST_TIMEOUT };

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech request failed: {0}")]
    Request(String),
    #[error("speech service returned status {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("no audio data returned from the speech service")]
    NoAudio,
    #[error("audio payload is not valid base64: {0}")]
    InvalidPayload(String),
}

/// Text-to-speech with a fixed voice. Returns raw 16-bit PCM, 24 kHz mono.
/// No retries: a failed call is returned to the caller as is.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechRequest<'a> {
    contents: Vec<SpeechContent<'a>>,
    generation_config: SpeechGenerationConfig<'a>,
}

#[derive(Serialize)]
struct SpeechContent<'a> {
    parts: Vec<SpeechPart<'a>>,
}

#[derive(Serialize)]
struct SpeechPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechGenerationConfig<'a> {
    response_modalities: Vec<&'a str>,
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig<'a> {
    voice_name: &'a str,
}

#[derive(Deserialize)]
struct SpeechResponse {
    #[serde(default)]
    candidates: Vec<SpeechCandidate>,
}

#[derive(Deserialize)]
struct SpeechCandidate {
    content: Option<SpeechResponseContent>,
}

#[derive(Deserialize)]
struct SpeechResponseContent {
    #[serde(default)]
    parts: Vec<SpeechResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeechResponsePart {
    inline_data: Option<SpeechInlineData>,
}

#[derive(Deserialize)]
struct SpeechInlineData {
    data: Option<String>,
}

fn build_request<'a>(text: &'a str, voice: &'a str) -> SpeechRequest<'a> {
    SpeechRequest {
        contents: vec![SpeechContent { parts: vec![SpeechPart { text }] }],
        generation_config: SpeechGenerationConfig {
            response_modalities: vec!["AUDIO"],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig { voice_name: voice },
                },
            },
        },
    }
}

/// Pulls the first inline audio part out of a `generateContent` response body.
fn extract_audio(body: &str) -> Result<Vec<u8>, SynthesisError> {
    let response: SpeechResponse = serde_json
        ::from_str(body)
        .map_err(|e| SynthesisError::Request(format!("Invalid speech response: {}", e)))?;

    let encoded = response.candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.inline_data)
        .and_then(|d| d.data)
        .filter(|d| !d.is_empty())
        .ok_or(SynthesisError::NoAudio)?;

    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| SynthesisError::InvalidPayload(e.to_string()))
}

pub struct GeminiSpeechClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GeminiSpeechClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let client = reqwest::Client
            ::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            voice: voice.into(),
            credentials,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiSpeechClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let api_key = require_credential(self.credentials.as_ref()).map_err(|e|
            SynthesisError::Request(e.to_string())
        )?;
        info!(
            "GeminiSpeechClient::synthesize() → model={} voice={} chars={}",
            self.model,
            self.voice,
            text.chars().count()
        );

        let url = format!("{}?key={}", model_url(&self.base_url, &self.model, "generateContent"), api_key);
        let resp = self.client
            .post(&url)
            .json(&build_request(text, &self.voice))
            .send().await
            .map_err(|e| SynthesisError::Request(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| SynthesisError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(SynthesisError::Status { status: status.as_u16(), body });
        }
        extract_audio(&body)
    }
}
