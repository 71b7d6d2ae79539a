use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const DEFAULT_CONFIG_FILE: &str = "kira-ei.json";
pub const DEFAULT_API_BASE_URL: &str = "https://api.gdc.cancer.gov";
pub const DEFAULT_DATA_ROOT: &str = ".kira-ei";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub min_cases: Option<u64>,
    #[serde(default)]
    pub checkpoint_interval: Option<usize>,
    #[serde(default)]
    pub checkpoint_keep: Option<usize>,
    #[serde(default)]
    pub case_concurrency: Option<usize>,
    #[serde(default)]
    pub case_delay_ms: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_concurrent_projects: Option<usize>,
    #[serde(default)]
    pub reduce_workers: Option<usize>,
    #[serde(default)]
    pub chunk_rows: Option<usize>,
    #[serde(default)]
    pub count_column: Option<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub skip_indexed_cases: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub api_base_url: String,
    pub data_root: Utf8PathBuf,
    pub min_cases: u64,
    pub checkpoint_interval: usize,
    pub checkpoint_keep: usize,
    pub case_concurrency: usize,
    pub case_delay: Duration,
    pub download_timeout: Duration,
    pub max_concurrent_projects: usize,
    pub reduce_workers: usize,
    pub chunk_rows: usize,
    pub count_column: String,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub skip_indexed_cases: bool,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            data_root: Utf8PathBuf::from(DEFAULT_DATA_ROOT),
            min_cases: 20,
            checkpoint_interval: 2500,
            checkpoint_keep: 3,
            case_concurrency: 1,
            case_delay: Duration::from_secs(3),
            download_timeout: Duration::from_secs(300),
            max_concurrent_projects: 10,
            reduce_workers: default_reduce_workers(),
            chunk_rows: 10_000,
            count_column: "unstranded".to_string(),
            retry_attempts: 5,
            retry_base_delay: Duration::from_secs(1),
            skip_indexed_cases: false,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let defaults = ResolvedConfig::default();

        let resolved = ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(defaults.schema_version),
            api_base_url: config
                .api_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
            data_root: config
                .data_root
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.data_root),
            min_cases: config.min_cases.unwrap_or(defaults.min_cases),
            checkpoint_interval: positive(
                "checkpoint_interval",
                config.checkpoint_interval,
                defaults.checkpoint_interval,
            )?,
            checkpoint_keep: positive(
                "checkpoint_keep",
                config.checkpoint_keep,
                defaults.checkpoint_keep,
            )?,
            case_concurrency: positive(
                "case_concurrency",
                config.case_concurrency,
                defaults.case_concurrency,
            )?,
            case_delay: config
                .case_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.case_delay),
            download_timeout: config
                .download_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            max_concurrent_projects: positive(
                "max_concurrent_projects",
                config.max_concurrent_projects,
                defaults.max_concurrent_projects,
            )?,
            reduce_workers: positive(
                "reduce_workers",
                config.reduce_workers,
                defaults.reduce_workers,
            )?,
            chunk_rows: positive("chunk_rows", config.chunk_rows, defaults.chunk_rows)?,
            count_column: config.count_column.unwrap_or(defaults.count_column),
            retry_attempts: positive(
                "retry_attempts",
                config.retry_attempts,
                defaults.retry_attempts,
            )?,
            retry_base_delay: config
                .retry_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            skip_indexed_cases: config
                .skip_indexed_cases
                .unwrap_or(defaults.skip_indexed_cases),
        };

        if resolved.download_timeout.is_zero() {
            return Err(KiraError::ConfigValue {
                key: "download_timeout_secs",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(resolved)
    }
}

fn positive<T>(key: &'static str, value: Option<T>, default: T) -> Result<T, KiraError>
where
    T: PartialOrd + Default + Copy,
{
    let value = value.unwrap_or(default);
    if value <= T::default() {
        return Err(KiraError::ConfigValue {
            key,
            message: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn default_reduce_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}
