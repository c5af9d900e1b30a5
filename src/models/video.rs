use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::chat::mime_type_for_path;

pub const DEFAULT_VIDEO_PROMPT: &str = "Animate this image naturally";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAspectRatioError {
    message: String,
}

impl fmt::Display for ParseAspectRatioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ParseAspectRatioError {}

impl FromStr for AspectRatio {
    type Err = ParseAspectRatioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "landscape" | "16:9" => Ok(AspectRatio::Landscape),
            "portrait" | "9:16" => Ok(AspectRatio::Portrait),
            _ =>
                Err(ParseAspectRatioError {
                    message: format!("Invalid aspect ratio: '{}'", s),
                }),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct SourceImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for SourceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceImage")
            .field("mime_type", &self.mime_type)
            .field("data", &format_args!("<{} bytes>", self.data.len()))
            .finish()
    }
}

impl SourceImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/") && !self.data.is_empty()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let path = path.as_ref();
        let mime_type = mime_type_for_path(path)
            .filter(|m| m.starts_with("image/"))
            .ok_or_else(|| format!("'{}' is not a supported image file", path.display()))?;
        let data = fs
            ::read(path)
            .map_err(|e| format!("Failed to read image '{}': {}", path.display(), e))?;
        Ok(Self::new(mime_type, data))
    }
}

/// What the user asked to animate.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoRequest {
    pub image: SourceImage,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

impl VideoRequest {
    pub fn new(image: SourceImage, prompt: impl Into<String>, aspect_ratio: AspectRatio) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            aspect_ratio,
        }
    }

    /// Prompt actually submitted; an empty prompt falls back to a generic one.
    pub fn effective_prompt(&self) -> &str {
        let trimmed = self.prompt.trim();
        if trimmed.is_empty() { DEFAULT_VIDEO_PROMPT } else { trimmed }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Submitting,
    Polling,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratio_parses_names_and_ratios() {
        assert_eq!("landscape".parse::<AspectRatio>(), Ok(AspectRatio::Landscape));
        assert_eq!("9:16".parse::<AspectRatio>(), Ok(AspectRatio::Portrait));
        assert!("square".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn aspect_ratio_serializes_as_ratio() {
        let json = serde_json::to_string(&AspectRatio::Portrait).unwrap();
        assert_eq!(json, "\"9:16\"");
    }

    #[test]
    fn empty_prompt_uses_default() {
        let req = VideoRequest::new(SourceImage::new("image/png", vec![1]), "   ", AspectRatio::Landscape);
        assert_eq!(req.effective_prompt(), DEFAULT_VIDEO_PROMPT);
        let req = VideoRequest::new(SourceImage::new("image/png", vec![1]), " waves ", AspectRatio::Landscape);
        assert_eq!(req.effective_prompt(), "waves");
    }

    #[test]
    fn source_image_requires_image_mime() {
        assert!(SourceImage::new("image/png", vec![1, 2]).is_image());
        assert!(!SourceImage::new("application/pdf", vec![1, 2]).is_image());
        assert!(!SourceImage::new("image/png", vec![]).is_image());
    }
}
