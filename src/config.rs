//! TOML configuration parsing and validation.
//!
//! A single file describes the backend connection, where run state lives,
//! and one `[[jobs]]` entry per crawled tree. Durations use humantime
//! strings (`"15m"`, `"500ms"`); sizes accept `"10mb"`-style strings or
//! plain byte counts. See [`load_config`] for the validation rules.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::condition;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// Directory holding one `<job>/_status.json` per job.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StateConfig {
    /// Resolved state directory, expanding a leading `~/`.
    pub fn dir(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match &self.dir {
            Some(dir) => match dir.strip_prefix("~") {
                Ok(rest) => home.join(rest),
                Err(_) => dir.clone(),
            },
            None => home.join(".fscrawl"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_byte_size", deserialize_with = "deserialize_byte_size")]
    pub byte_size: u64,
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,
    /// Per-operation error signature that is worth retrying.
    #[serde(default = "default_retry_on")]
    pub retry_on: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    /// Every this many calls the live endpoint list is reset to the configured one.
    #[serde(default = "default_reintroduce_every")]
    pub reintroduce_every: u64,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default = "default_true")]
    pub create_indices: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            username: None,
            password: None,
            api_key: None,
            bulk_size: default_bulk_size(),
            byte_size: default_byte_size(),
            flush_interval: default_flush_interval(),
            retry_on: default_retry_on(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            reintroduce_every: default_reintroduce_every(),
            request_timeout: default_request_timeout(),
            create_indices: true,
        }
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:9200".to_string()]
}
fn default_bulk_size() -> usize {
    100
}
fn default_byte_size() -> u64 {
    10 * 1024 * 1024
}
fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_on() -> String {
    "es_rejected_execution_exception".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_reintroduce_every() -> u64 {
    10
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub folder_index: Option<String>,
    pub fs: FsConfig,
    #[serde(default)]
    pub filters: Vec<PluginConfig>,
    #[serde(default)]
    pub outputs: Vec<PluginConfig>,
}

impl JobConfig {
    /// Target index for file documents (defaults to the job name).
    pub fn index(&self) -> &str {
        self.index.as_deref().unwrap_or(&self.name)
    }

    /// Target index for folder documents (defaults to `<index>_folder`).
    pub fn folder_index(&self) -> String {
        self.folder_index
            .clone()
            .unwrap_or_else(|| format!("{}_folder", self.index()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FsConfig {
    pub url: PathBuf,
    #[serde(with = "humantime_serde", default = "default_update_rate")]
    pub update_rate: Duration,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,
    #[serde(default = "default_ignore_marker")]
    pub ignore_marker: String,
    #[serde(default)]
    pub filename_as_id: bool,
    #[serde(default = "default_true")]
    pub add_filesize: bool,
    #[serde(default = "default_true")]
    pub remove_deleted: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub index_content: bool,
    #[serde(default)]
    pub store_source: bool,
    #[serde(default = "default_true")]
    pub index_folders: bool,
    #[serde(default)]
    pub attributes_support: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_byte_size")]
    pub ignore_above: Option<u64>,
}

impl FsConfig {
    /// Settings for a tree rooted at `url` with every other field at its default.
    pub fn new(url: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            update_rate: default_update_rate(),
            includes: Vec::new(),
            excludes: default_excludes(),
            ignore_marker: default_ignore_marker(),
            filename_as_id: false,
            add_filesize: true,
            remove_deleted: true,
            continue_on_error: false,
            index_content: true,
            store_source: false,
            index_folders: true,
            attributes_support: false,
            follow_symlinks: false,
            checksum: None,
            ignore_above: None,
        }
    }

    /// Whether files must be read at all during a run.
    pub fn needs_content(&self) -> bool {
        self.index_content || self.store_source || self.checksum.is_some()
    }
}

fn default_update_rate() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_excludes() -> Vec<String> {
    vec!["*/~*".to_string()]
}
fn default_ignore_marker() -> String {
    ".fscrawlerignore".to_string()
}

/// A filter or output entry: `type`, optional `id` and `when`, and
/// kind-specific options parsed later by the plugin registry.
#[derive(Debug, Deserialize, Clone)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl PluginConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            when: None,
            options: toml::Table::new(),
        }
    }

    /// Display name: explicit `id`, else `name` option, else the type.
    pub fn label(&self) -> String {
        self.id
            .clone()
            .or_else(|| {
                self.options
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| self.kind.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

fn deserialize_byte_size<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match RawSize::deserialize(d)? {
        RawSize::Bytes(n) => Ok(n),
        RawSize::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_byte_size<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    match Option::<RawSize>::deserialize(d)? {
        None => Ok(None),
        Some(RawSize::Bytes(n)) => Ok(Some(n)),
        Some(RawSize::Text(s)) => parse_byte_size(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse `"10mb"`, `"512 KB"`, `"1.5g"` or `"42"` into bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid byte size: '{}'", input))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        other => return Err(format!("unknown byte size unit '{}' in '{}'", other, input)),
    };
    Ok((value * multiplier as f64) as u64)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate backend
    let backend = &config.backend;
    if backend.endpoints.is_empty() {
        bail!("backend.endpoints must list at least one endpoint");
    }
    for endpoint in &backend.endpoints {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!(
                "backend endpoint '{}' has an unsupported protocol (expected http:// or https://)",
                endpoint
            );
        }
    }
    if backend.bulk_size == 0 {
        bail!("backend.bulk_size must be > 0");
    }
    if backend.reintroduce_every == 0 {
        bail!("backend.reintroduce_every must be > 0");
    }
    if backend.username.is_some() != backend.password.is_some() {
        bail!("backend.username and backend.password must be set together");
    }

    // Validate jobs
    let mut names = HashSet::new();
    for job in &config.jobs {
        if job.name.trim().is_empty() {
            bail!("jobs[].name must not be empty");
        }
        if job.name.contains(|c: char| c == '/' || c == '\\') {
            bail!("job name '{}' must not contain path separators", job.name);
        }
        if !names.insert(job.name.as_str()) {
            bail!("duplicate job name '{}'", job.name);
        }
        if let Some(algo) = &job.fs.checksum {
            if !algo.eq_ignore_ascii_case("SHA-256") {
                bail!(
                    "job '{}': unsupported checksum algorithm '{}' (supported: SHA-256)",
                    job.name,
                    algo
                );
            }
        }
        for pattern in job.fs.includes.iter().chain(job.fs.excludes.iter()) {
            globset::Glob::new(pattern)
                .with_context(|| format!("job '{}': invalid pattern '{}'", job.name, pattern))?;
        }
        for plugin in job.filters.iter().chain(job.outputs.iter()) {
            if plugin.kind.trim().is_empty() {
                bail!("job '{}': plugin entries need a `type`", job.name);
            }
            if let Some(expr) = &plugin.when {
                if let Err(e) = condition::compile(expr) {
                    bail!("job '{}', plugin '{}': {}", job.name, plugin.label(), e);
                }
            }
        }
    }

    Ok(config)
}
