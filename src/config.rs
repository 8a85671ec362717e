use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub datasets: DatasetsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Path to the SQLite index database file.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    /// Records per internal export batch. Pure I/O tuning: the NDJSON body
    /// is byte-identical whatever this is set to.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetsConfig {
    /// Workspace assumed when a request carries none.
    #[serde(default = "default_workspace")]
    pub default_workspace: String,
}

impl Default for DatasetsConfig {
    fn default() -> Self {
        Self {
            default_workspace: default_workspace(),
        }
    }
}

fn default_workspace() -> String {
    "default".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.export.chunk_size == 0 {
        anyhow::bail!("export.chunk_size must be > 0");
    }

    if config.datasets.default_workspace.trim().is_empty() {
        anyhow::bail!("datasets.default_workspace must not be empty");
    }

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    Ok(config)
}
