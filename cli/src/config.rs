use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use menuplan_core::session::{Session, Subscription, User};

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "menuplan").context("Could not determine home directory")?;
        Self::at(proj_dirs.data_dir())
    }

    pub fn at(data_dir: &Path) -> Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("menuplan.db");

        Ok(Config { db_path, data_dir })
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn load_settings(&self) -> Result<Settings> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&path).context("Failed to read settings file")?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings)?;
        let path = self.settings_path();
        std::fs::write(&path, json).context("Failed to write settings file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // May hold the backend API key
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set settings file permissions")?;
        }
        Ok(())
    }

    /// Load the server's API key from disk, or generate a new one.
    pub fn load_or_create_api_key(&self) -> Result<String> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok(key);
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Point clients at it with: menuplan remote <url> --api-key {key}");
        Ok(key)
    }
}

/// Who is signed in and which backend to sync with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl Settings {
    #[must_use]
    pub fn session(&self) -> Session {
        Session {
            user: self.user_id.clone().map(|id| User { id }),
            subscription: self.subscription.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::at(dir.path()).unwrap();
        assert_eq!(config.load_settings().unwrap(), Settings::default());

        let settings = Settings {
            server_url: Some("http://127.0.0.1:8080".to_string()),
            api_key: Some("k".to_string()),
            user_id: Some("u1".to_string()),
            subscription: Some(Subscription {
                id: "s1".to_string(),
                default_servings: 3,
            }),
        };
        config.save_settings(&settings).unwrap();
        assert_eq!(config.load_settings().unwrap(), settings);

        let session = settings.session();
        assert_eq!(session.user.unwrap().id, "u1");
        assert_eq!(session.subscription.unwrap().default_servings, 3);
    }

    #[test]
    fn test_invalid_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::at(dir.path()).unwrap();
        std::fs::write(dir.path().join("settings.json"), "nope").unwrap();
        let err = config.load_settings().unwrap_err();
        assert!(format!("{err:#}").contains("Invalid settings file"));
    }

    #[test]
    fn test_api_key_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::at(dir.path()).unwrap();
        let key = config.load_or_create_api_key().unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(config.load_or_create_api_key().unwrap(), key);
    }
}
