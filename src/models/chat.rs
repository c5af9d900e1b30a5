use chrono::Utc;
use serde::{ Deserialize, Serialize };
use std::error::Error;
use std::fs;
use std::path::Path;
use uuid::Uuid;

pub const WELCOME_MESSAGE_ID: &str = "welcome";
pub const PDF_MIME_TYPE: &str = "application/pdf";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One entry of the conversation history. Never mutated after it has been
/// appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub created_at: i64,
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::build(Role::User, text.into(), false)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::build(Role::Model, text.into(), false)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::build(Role::Model, text.into(), true)
    }

    pub fn welcome(text: impl Into<String>) -> Self {
        Self {
            id: WELCOME_MESSAGE_ID.to_string(),
            role: Role::Model,
            text: text.into(),
            created_at: Utc::now().timestamp_millis(),
            is_error: false,
        }
    }

    fn build(role: Role, text: String, is_error: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text,
            created_at: Utc::now().timestamp_millis(),
            is_error,
        }
    }
}

/// Binary part sent inline next to the text prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Reads a chat attachment from disk. Only PDF documents are accepted.
    pub fn pdf_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let path = path.as_ref();
        let mime_type = mime_type_for_path(path).unwrap_or("application/octet-stream");
        if mime_type != PDF_MIME_TYPE {
            return Err(format!("'{}' is not a PDF document", path.display()).into());
        }
        let data = fs
            ::read(path)
            .map_err(|e| format!("Failed to read attachment '{}': {}", path.display(), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        Ok(Self::new(name, mime_type, data))
    }
}

pub fn mime_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(PDF_MIME_TYPE),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_get_unique_ids() {
        let a = Message::user("ciao");
        let b = Message::user("ciao");
        assert_ne!(a.id, b.id);
        assert_eq!(a.role, Role::User);
        assert!(!a.is_error);
    }

    #[test]
    fn error_messages_are_model_messages() {
        let msg = Message::error("oops");
        assert_eq!(msg.role, Role::Model);
        assert!(msg.is_error);
    }

    #[test]
    fn mime_type_is_derived_from_extension() {
        assert_eq!(mime_type_for_path(Path::new("a/b/ptof.PDF")), Some(PDF_MIME_TYPE));
        assert_eq!(mime_type_for_path(Path::new("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(mime_type_for_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn non_pdf_attachment_is_rejected() {
        assert!(Attachment::pdf_from_file("notes.txt").is_err());
    }
}
