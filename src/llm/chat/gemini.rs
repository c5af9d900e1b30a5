use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use log::{ debug, info };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{
    create_streaming_response,
    http_stream_generate,
    ChatBackend,
    ChatRequest,
    ChatSession,
    FragmentStream,
    SessionConfig,
};
use crate::credentials::{ require_credential, CredentialProvider };
use crate::llm::model_url;

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub(crate) struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug, Clone)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GoogleChunk {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    error: Option<GoogleError>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: Option<GoogleContent>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GoogleError {
    message: Option<String>,
}

impl GeminiContent {
    fn text(role: &str, text: String) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![GeminiPart { text: Some(text), inline_data: None }],
        }
    }

    fn from_request(request: &ChatRequest) -> Self {
        let mut parts = Vec::with_capacity(2);
        if let Some(attachment) = &request.attachment {
            parts.push(GeminiPart {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: attachment.mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(&attachment.data),
                }),
            });
        }
        parts.push(GeminiPart { text: Some(request.text.clone()), inline_data: None });
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }
}

/// Parses one server-sent-events line of `streamGenerateContent?alt=sse`.
pub(crate) fn parse_gemini_line(
    line: &str
) -> Option<Result<String, Box<dyn StdError + Send + Sync>>> {
    let line = line.trim();
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let chunk = match serde_json::from_str::<GoogleChunk>(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Some(Err(format!("Malformed stream chunk: {}", e).into()));
        }
    };

    if let Some(err) = chunk.error {
        let message = err.message.unwrap_or_else(|| "Gemini stream reported an error".to_string());
        return Some(Err(message.into()));
    }

    let text: String = chunk.candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .filter_map(|p| p.text.as_deref())
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(Ok(text))
    }
}

pub struct GeminiChatClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GeminiChatClient {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            credentials,
        }
    }
}

#[async_trait]
impl ChatBackend for GeminiChatClient {
    async fn create_session(
        &self,
        config: &SessionConfig
    ) -> Result<Arc<dyn ChatSession>, Box<dyn StdError + Send + Sync>> {
        info!(
            "GeminiChatClient::create_session() → model={} temperature={}",
            config.model,
            config.temperature
        );
        Ok(
            Arc::new(GeminiChatSession {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
                credentials: Arc::clone(&self.credentials),
                config: config.clone(),
                contents: Arc::new(Mutex::new(Vec::new())),
            })
        )
    }
}

/// Remote context kept as the list of completed turns, replayed on every
/// request.
pub struct GeminiChatSession {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    config: SessionConfig,
    contents: Arc<Mutex<Vec<GeminiContent>>>,
}

impl GeminiChatSession {
    async fn build_payload(&self, user: GeminiContent) -> GeminiStreamRequest {
        let mut contents = self.contents.lock().await.clone();
        contents.push(user);
        GeminiStreamRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: Some(self.config.system_instruction.clone()),
                    inline_data: None,
                }],
            },
            contents,
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
            },
        }
    }
}

#[async_trait]
impl ChatSession for GeminiChatSession {
    async fn send_stream(
        &self,
        request: ChatRequest
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
        let api_key = require_credential(self.credentials.as_ref())?;
        let user = GeminiContent::from_request(&request);
        let payload = self.build_payload(user.clone()).await;
        info!(
            "GeminiChatSession::send_stream() → model={} turns={} attachment={}",
            self.config.model,
            payload.contents.len(),
            request.attachment.is_some()
        );

        let url = format!(
            "{}?alt=sse&key={}",
            model_url(&self.base_url, &self.config.model, "streamGenerateContent"),
            api_key
        );
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let mut inner = http_stream_generate(
            self.client.clone(),
            url,
            payload,
            parse_gemini_line,
            Some(headers)
        ).await?;

        let contents = Arc::clone(&self.contents);
        Ok(
            create_streaming_response(move |tx| async move {
                let mut reply = String::new();
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(fragment) => {
                            reply.push_str(&fragment);
                            if tx.send(Ok(fragment)).await.is_err() {
                                debug!("Stream consumer went away; turn not recorded");
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                let mut turns = contents.lock().await;
                turns.push(user);
                turns.push(GeminiContent::text("model", reply));
            })
        )
    }
}
