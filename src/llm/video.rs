use async_trait::async_trait;
use base64::Engine;
use log::info;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use std::sync::Arc;
use url::Url;

use crate::credentials::{ require_credential, CredentialProvider };
use crate::llm::{ model_url, REQUEST_TIMEOUT };
use crate::models::video::VideoRequest;

/// Opaque reference to a long-running remote job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

impl OperationHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Snapshot of a remote operation as returned by a poll.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Operation {
    pub name: Option<String>,
    #[serde(default)]
    pub done: bool,
    pub error: Option<OperationError>,
    pub response: Option<OperationResponse>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct OperationError {
    pub code: Option<i64>,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    #[serde(default, alias = "generatedVideos")]
    pub generated_samples: Vec<GeneratedVideo>,
    pub generate_video_response: Option<Box<OperationResponse>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct GeneratedVideo {
    pub video: Option<VideoReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct VideoReference {
    pub uri: Option<String>,
}

impl Operation {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(OperationError { code: None, message: Some(message.into()) }),
            ..Self::default()
        }
    }

    pub fn succeeded(uri: impl Into<String>) -> Self {
        Self {
            done: true,
            response: Some(OperationResponse {
                generated_samples: vec![GeneratedVideo {
                    video: Some(VideoReference { uri: Some(uri.into()) }),
                }],
                generate_video_response: None,
            }),
            ..Self::default()
        }
    }

    /// URI of the first generated video, wherever the service nested it.
    pub fn video_uri(&self) -> Option<&str> {
        let response = self.response.as_ref()?;
        let samples = match &response.generate_video_response {
            Some(inner) if !inner.generated_samples.is_empty() => &inner.generated_samples,
            _ => &response.generated_samples,
        };
        samples
            .first()
            .and_then(|s| s.video.as_ref())
            .and_then(|v| v.uri.as_deref())
            .filter(|uri| !uri.is_empty())
    }

    fn video_uri_mut(&mut self) -> Option<&mut String> {
        let response = self.response.as_mut()?;
        let samples = match &mut response.generate_video_response {
            Some(inner) if !inner.generated_samples.is_empty() => &mut inner.generated_samples,
            _ => &mut response.generated_samples,
        };
        samples
            .first_mut()
            .and_then(|s| s.video.as_mut())
            .and_then(|v| v.uri.as_mut())
            .filter(|uri| !uri.is_empty())
    }
}

/// Submit-then-poll contract of the hosted video model. A finished
/// operation carries a result URI that can be fetched as is.
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    async fn submit(
        &self,
        request: &VideoRequest
    ) -> Result<OperationHandle, Box<dyn StdError + Send + Sync>>;

    async fn poll(
        &self,
        handle: &OperationHandle
    ) -> Result<Operation, Box<dyn StdError + Send + Sync>>;

}

/// Appends the access credential as a `key` query parameter.
pub fn append_credential(uri: &str, api_key: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(uri)?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url.into())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest<'a> {
    instances: Vec<PredictInstance<'a>>,
    parameters: PredictParameters<'a>,
}

#[derive(Serialize)]
struct PredictInstance<'a> {
    prompt: &'a str,
    image: PredictImage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictImage {
    bytes_base64_encoded: String,
    mime_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters<'a> {
    aspect_ratio: &'a str,
    resolution: &'a str,
    sample_count: u32,
}

#[derive(Deserialize)]
struct SubmitResponse {
    name: Option<String>,
}

fn build_request<'a>(request: &'a VideoRequest, resolution: &'a str) -> PredictRequest<'a> {
    PredictRequest {
        instances: vec![PredictInstance {
            prompt: request.effective_prompt(),
            image: PredictImage {
                bytes_base64_encoded: base64::engine::general_purpose::STANDARD.encode(
                    &request.image.data
                ),
                mime_type: request.image.mime_type.clone(),
            },
        }],
        parameters: PredictParameters {
            aspect_ratio: request.aspect_ratio.as_str(),
            resolution,
            sample_count: 1,
        },
    }
}

pub struct GeminiVideoClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    resolution: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl GeminiVideoClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        resolution: impl Into<String>,
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
            resolution: resolution.into(),
            credentials,
        })
    }

    async fn read_body(resp: reqwest::Response) -> Result<String, Box<dyn StdError + Send + Sync>> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(format!("Video service returned status {}: {}", status, body).into());
        }
        Ok(body)
    }
}

#[async_trait]
impl VideoGenerator for GeminiVideoClient {
    async fn submit(
        &self,
        request: &VideoRequest
    ) -> Result<OperationHandle, Box<dyn StdError + Send + Sync>> {
        let api_key = require_credential(self.credentials.as_ref())?;
        info!(
            "GeminiVideoClient::submit() → model={} aspect_ratio={} resolution={} image={}",
            self.model,
            request.aspect_ratio,
            self.resolution,
            request.image.mime_type
        );
        let url = format!(
            "{}?key={}",
            model_url(&self.base_url, &self.model, "predictLongRunning"),
            api_key
        );
        let resp = self.client.post(&url).json(&build_request(request, &self.resolution)).send().await?;
        let body = Self::read_body(resp).await?;
        let submitted: SubmitResponse = serde_json
            ::from_str(&body)
            .map_err(|e| format!("Invalid submit response: {}", e))?;
        submitted.name
            .filter(|n| !n.is_empty())
            .map(OperationHandle)
            .ok_or_else(|| "Video service did not return an operation name".into())
    }

    async fn poll(
        &self,
        handle: &OperationHandle
    ) -> Result<Operation, Box<dyn StdError + Send + Sync>> {
        let api_key = require_credential(self.credentials.as_ref())?;
        let url = format!("{}/{}?key={}", self.base_url.trim_end_matches('/'), handle.name(), api_key);
        let resp = self.client.get(&url).send().await?;
        let body = Self::read_body(resp).await?;
        let mut operation: Operation = serde_json
            ::from_str(&body)
            .map_err(|e| format!("Invalid operation response: {}", e))?;
        if let Some(uri) = operation.video_uri_mut() {
            *uri = append_credential(uri, &api_key)?;
        }
        Ok(operation)
    }
}
