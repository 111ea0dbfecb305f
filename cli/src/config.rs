use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use tally_core::coordinator::DEFAULT_REFRESH_WINDOW_DAYS;
use tally_core::repository::DEFAULT_MIRROR_CAPACITY;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
}

/// Optional `config.toml` in the config directory.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    remote: RemoteConfig,
    sync: SyncConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    /// Base URL of a `tally serve` instance. Unset means local-only.
    pub url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub refresh_window_days: u32,
    pub mirror_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_window_days: DEFAULT_REFRESH_WINDOW_DAYS,
            mirror_queue_capacity: DEFAULT_MIRROR_CAPACITY,
        }
    }
}

impl Config {
    pub fn load(db_override: Option<PathBuf>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "tally").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let file = read_file_config(&proj_dirs.config_dir().join("config.toml"))?;
        let db_path = db_override.unwrap_or_else(|| data_dir.join("tally.db"));

        Ok(Config {
            db_path,
            data_dir,
            remote: file.remote,
            sync: file.sync,
        })
    }

    /// API key for the remote client: `[remote] api_key`, else the key this
    /// machine's own server generated.
    pub fn remote_api_key(&self) -> Result<Option<String>> {
        if let Some(ref key) = self.remote.api_key {
            return Ok(Some(key.clone()));
        }
        let path = self.data_dir.join("api_key");
        if !path.exists() {
            return Ok(None);
        }
        let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
        let key = key.trim();
        Ok((!key.is_empty()).then(|| key.to_string()))
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
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
        Ok((key, true))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_file_config(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

fn parse_file_config(raw: &str) -> Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}
