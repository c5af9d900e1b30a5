pub mod gemini;

use async_trait::async_trait;
use futures::{ Future, Stream, StreamExt };
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::chat::Attachment;

/// Lazy, finite, non-restartable sequence of text fragments.
pub type FragmentStream = Pin<
    Box<dyn Stream<Item = Result<String, Box<dyn StdError + Send + Sync>>> + Send>
>;

pub type LineParser = fn(&str) -> Option<Result<String, Box<dyn StdError + Send + Sync>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub system_instruction: String,
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl ChatRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(text: impl Into<String>, attachment: Attachment) -> Self {
        Self {
            text: text.into(),
            attachment: Some(attachment),
        }
    }
}

/// Factory for remote conversational contexts.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_session(
        &self,
        config: &SessionConfig
    ) -> Result<Arc<dyn ChatSession>, Box<dyn StdError + Send + Sync>>;
}

/// One remote conversational context. Successful turns become part of the
/// context seen by later turns.
#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn send_stream(
        &self,
        request: ChatRequest
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>>;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> FragmentStream
    where
        F: FnOnce(mpsc::Sender<Result<String, Box<dyn StdError + Send + Sync>>>) -> Fut +
            Send +
            'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// POSTs `payload` and turns the response body into fragments, one parsed
/// line at a time. Lines may span several network chunks.
pub async fn http_stream_generate(
    client: reqwest::Client,
    url: String,
    payload: impl serde::Serialize + Send + 'static,
    line_parser: LineParser,
    headers: Option<Vec<(String, String)>>
) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
    let mut req = client.post(&url).json(&payload);
    if let Some(header_list) = headers {
        for (name, value) in header_list {
            req = req.header(name, value);
        }
    }

    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("Chat stream request failed with status {}: {}", status, body).into());
    }

    Ok(
        create_streaming_response(move |tx| async move {
            let mut bytes = resp.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(buf) => {
                        pending.extend_from_slice(&buf);
                        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = pending.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line);
                            if let Some(item) = line_parser(&line) {
                                let failed = item.is_err();
                                if tx.send(item).await.is_err() || failed {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Box::new(e) as _)).await;
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                let line = String::from_utf8_lossy(&pending).into_owned();
                if let Some(item) = line_parser(&line) {
                    let _ = tx.send(item).await;
                }
            }
        })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streaming_response_yields_items_in_order() {
        let mut stream = create_streaming_response(|tx| async move {
            for part in ["a", "b", "c"] {
                let _ = tx.send(Ok(part.to_string())).await;
            }
        });
        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
