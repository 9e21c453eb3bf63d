// Authentication is owned elsewhere; the engine only needs who we are and a
// token to open the connection with.

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::get_config_dir;
use crate::transport::TransportError;

#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    fn user_id(&self) -> String;

    async fn auth_token(&self) -> Result<String, TransportError>;

    /// Called after the server refused the current token.
    async fn refresh_token(&self) -> Result<String, TransportError>;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Credentials {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Fixed identity, e.g. restored from saved credentials.
pub struct StaticAuth {
    user_id: String,
    token: Mutex<String>,
}

impl StaticAuth {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: Mutex::new(token.into()),
        }
    }

    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self::new(
            credentials.user_id.clone(),
            credentials.token.clone().unwrap_or_default(),
        )
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.lock().unwrap_or_else(|p| p.into_inner()) = token.into();
    }

    fn current(&self) -> String {
        self.token.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn user_id(&self) -> String {
        self.user_id.clone()
    }

    async fn auth_token(&self) -> Result<String, TransportError> {
        Ok(self.current())
    }

    async fn refresh_token(&self) -> Result<String, TransportError> {
        // Nothing to refresh against; hand back whatever was set last
        Ok(self.current())
    }
}

fn credentials_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("credentials.json"))
}

pub fn save_credentials(credentials: &Credentials, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => credentials_path()?,
    };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for {}", credentials.user_id);
    Ok(())
}

pub fn load_credentials(path: Option<&Path>) -> Result<Option<Credentials>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => credentials_path()?,
    };

    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(&path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.user_id, path.display());

    Ok(Some(credentials))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        assert!(load_credentials(Some(&path)).unwrap().is_none());

        let credentials = Credentials {
            user_id: "alice".to_string(),
            token: Some("t0ken".to_string()),
        };
        save_credentials(&credentials, Some(&path)).unwrap();
        assert_eq!(load_credentials(Some(&path)).unwrap(), Some(credentials));
    }

    #[tokio::test]
    async fn test_static_auth_token_swap() {
        let auth = StaticAuth::new("alice", "old");
        assert_eq!(auth.auth_token().await.unwrap(), "old");
        auth.set_token("new");
        assert_eq!(auth.refresh_token().await.unwrap(), "new");
        assert_eq!(auth.user_id(), "alice");
    }
}
