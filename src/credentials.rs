use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;

use studyroom::channel::Credential;
use studyroom::config::config_dir;

#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: &str, token: &str) -> Self {
        Credentials {
            user_id: user_id.to_string(),
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }

    /// What the channel and record client authenticate with.
    pub fn to_credential(&self) -> Result<Credential> {
        let token = self
            .get_token()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("No session token stored for {}", self.user_id))?;
        Ok(Credential::new(self.user_id.clone(), token))
    }
}

/// STUDYROOM_USER_ID and STUDYROOM_TOKEN, when both are set, win over the stored file.
pub fn from_env() -> Option<Credentials> {
    let user_id = std::env::var("STUDYROOM_USER_ID").ok()?;
    let token = std::env::var("STUDYROOM_TOKEN").ok()?;
    Some(Credentials::new(&user_id, &token))
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    let path = get_credentials_path()?;
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for {}", credentials.user_id);
    Ok(())
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    let path = get_credentials_path()?;
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)?;
    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.user_id, path.display());

    Ok(Some(credentials))
}

static CREDENTIALS_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_credentials_path_override(path: PathBuf) -> bool {
    CREDENTIALS_PATH_OVERRIDE.set(path).is_ok()
}

fn get_credentials_path() -> Result<PathBuf> {
    if let Some(path) = CREDENTIALS_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(config_dir()?.join("credentials.json"))
}
