use async_trait::async_trait;
use log::{ info, warn };
use std::error::Error;
use std::sync::RwLock;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Source of the access credential used by every remote call.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn has_credential(&self) -> bool {
        self.current().is_some()
    }

    /// Runs the external selection flow. Resolves silently when a credential
    /// is already configured.
    async fn request_selection(&self) -> Result<(), Box<dyn Error + Send + Sync>>;

    fn current(&self) -> Option<String>;
}

pub fn require_credential(
    provider: &dyn CredentialProvider
) -> Result<String, Box<dyn Error + Send + Sync>> {
    provider
        .current()
        .ok_or_else(|| format!("No access credential configured ({})", API_KEY_ENV).into())
}

/// Credential taken from the command line or the environment. Selection
/// re-reads `.env` and the process environment.
pub struct EnvCredentials {
    var: String,
    key: RwLock<Option<String>>,
}

impl EnvCredentials {
    pub fn new(initial: Option<String>) -> Self {
        Self::with_var(API_KEY_ENV, initial)
    }

    pub fn with_var(var: impl Into<String>, initial: Option<String>) -> Self {
        Self {
            var: var.into(),
            key: RwLock::new(initial.filter(|k| !k.trim().is_empty())),
        }
    }

    fn store(&self, value: Option<String>) {
        match self.key.write() {
            Ok(mut guard) => {
                *guard = value;
            }
            Err(poisoned) => {
                *poisoned.into_inner() = value;
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn request_selection(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.current().is_some() {
            return Ok(());
        }
        dotenv::dotenv().ok();
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => {
                info!("Access credential picked up from {}", self.var);
                self.store(Some(value));
                Ok(())
            }
            _ => {
                warn!("Credential selection finished without a key in {}", self.var);
                Err(format!("Set {} to enable the remote models", self.var).into())
            }
        }
    }

    fn current(&self) -> Option<String> {
        match self.key.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Fixed credential, mostly for tests and embedding.
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn request_selection(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    fn current(&self) -> Option<String> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_initial_key_is_treated_as_missing() {
        let creds = EnvCredentials::with_var("SCHOOL_BUDDY_TEST_UNSET_KEY", Some("   ".into()));
        assert!(!creds.has_credential().await);
        assert!(require_credential(&creds).is_err());
    }

    #[tokio::test]
    async fn selection_is_silent_when_already_configured() {
        let creds = EnvCredentials::with_var("SCHOOL_BUDDY_TEST_UNSET_KEY", Some("abc".into()));
        creds.request_selection().await.unwrap();
        assert_eq!(creds.current().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn selection_reads_the_environment() {
        std::env::set_var("SCHOOL_BUDDY_TEST_SELECTED_KEY", "from-env");
        let creds = EnvCredentials::with_var("SCHOOL_BUDDY_TEST_SELECTED_KEY", None);
        assert!(!creds.has_credential().await);
        creds.request_selection().await.unwrap();
        assert_eq!(creds.current().as_deref(), Some("from-env"));
    }

    #[tokio::test]
    async fn selection_fails_without_any_key() {
        let creds = EnvCredentials::with_var("SCHOOL_BUDDY_TEST_NEVER_SET_KEY", None);
        assert!(creds.request_selection().await.is_err());
        assert!(!creds.has_credential().await);
    }
}
