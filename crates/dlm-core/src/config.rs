use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Global configuration loaded from `~/.config/dlm/config.toml`.
///
/// CLI flags override individual fields at startup; the file only provides
/// the baseline so a bare `dlm serve` behaves the same across invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlmConfig {
    /// TCP port the control server listens on.
    pub port: u16,
    /// Number of worker threads in the pool.
    pub worker_threads: usize,
    /// Connect/read timeout applied to every HTTP transfer, in seconds.
    pub timeout_secs: u64,
}

impl Default for DlmConfig {
    fn default() -> Self {
        Self {
            port: 10280,
            worker_threads: 8,
            timeout_secs: 30,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dlm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DlmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = DlmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: DlmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
