use crate::cadapter::s3::{MIN_PART_SIZE, S3Config};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;

fn default_scheme() -> String {
    "blob".to_string()
}

fn default_metadata_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_part_size() -> usize {
    crate::vfs::upload::DEFAULT_PART_SIZE
}

fn default_list_page_size() -> usize {
    crate::vfs::dir::DEFAULT_PAGE_SIZE
}

fn default_lock_wait_ms() -> u64 {
    30_000
}

fn default_max_path_length() -> usize {
    crate::meta::MAX_PATH_LENGTH
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    S3 {
        bucket: String,
        endpoint: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        force_path_style: bool,
    },
    Local {
        root: String,
    },
    Memory {
        #[serde(default)]
        bucket: String,
    },
}

impl BackendConfig {
    pub fn s3_config(&self) -> Option<S3Config> {
        match self {
            Self::S3 {
                bucket,
                endpoint,
                region,
                force_path_style,
            } => Some(S3Config {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                force_path_style: *force_path_style,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// URI scheme served by this filesystem, e.g. `gs` for `gs://path`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub backend: BackendConfig,
    /// SQLite URL of the persistent metadata store.
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub cdn_host: Option<String>,
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheme.is_empty() {
            bail!("scheme must not be empty");
        }
        if self.list_page_size == 0 {
            bail!("list_page_size must be at least 1");
        }
        if self.max_path_length == 0 {
            bail!("max_path_length must be at least 1");
        }
        if matches!(self.backend, BackendConfig::S3 { .. })
            && (self.part_size as u64) < MIN_PART_SIZE
        {
            bail!(
                "part_size {} is below the S3 minimum of {MIN_PART_SIZE} bytes",
                self.part_size
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    Config::from_yaml(&content)
}
