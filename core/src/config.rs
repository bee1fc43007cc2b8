//! Bus configuration.
//!
//! Configuration comes from an optional TOML file merged with command-line
//! overrides; every field has a serde default so a minimal file (or none at
//! all) yields a runnable config. [`RootConfig`] also owns the on-disk
//! layout derived from a root: the state directory with the ledger, scratch
//! and trash trees, and the mapping from a source path to its output path.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Name of the per-root state directory holding ledger, scratch and trash.
pub const STATE_DIR_NAME: &str = ".upscalebus";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Directories scanned and watched for source archives.
    #[serde(default)]
    pub roots: Vec<RootConfig>,

    /// Size of the image worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries per image after the initial attempt.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Capacity of the bounded dispatch queue; producers block when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How many archives may occupy scratch space concurrently.
    #[serde(default = "default_max_active_archives")]
    pub max_active_archives: usize,

    /// Wall-clock bound for one processor invocation.
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,

    /// Quiet window before a watched path is considered settled.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// What a permanently failed image does to its archive.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Extensions (no dot) treated as source archives.
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,

    /// Extensions (no dot) dispatched to the processor; everything else in
    /// an archive passes through unmodified.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Extensions (no dot) ignored by discovery and swept by hygiene.
    #[serde(default = "default_temp_extensions")]
    pub temp_extensions: Vec<String>,

    /// Rename corrupt sources to `<name>.tdel` so rescans skip them.
    #[serde(default = "default_true")]
    pub quarantine_corrupt: bool,

    /// Whether disposal moves to trash (reversible) or deletes outright.
    #[serde(default)]
    pub disposal: DisposalMode,

    /// Trash entries older than this are purged during startup hygiene.
    #[serde(default = "default_trash_retention_days")]
    pub trash_retention_days: u64,

    #[serde(default)]
    pub processor: ProcessorConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            roots: Vec::new(),
            workers: default_workers(),
            retry_max: default_retry_max(),
            queue_capacity: default_queue_capacity(),
            max_active_archives: default_max_active_archives(),
            process_timeout_secs: default_process_timeout_secs(),
            debounce_ms: default_debounce_ms(),
            failure_policy: FailurePolicy::default(),
            archive_extensions: default_archive_extensions(),
            image_extensions: default_image_extensions(),
            temp_extensions: default_temp_extensions(),
            quarantine_corrupt: default_true(),
            disposal: DisposalMode::default(),
            trash_retention_days: default_trash_retention_days(),
            processor: ProcessorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RootConfig {
    pub path: PathBuf,
    /// Where repacked archives land; defaults to `<path>/upscaled`.
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any permanently failed image fails the whole archive; no repack.
    #[default]
    Strict,
    /// Repack anyway, carrying failed images over as their originals.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisposalMode {
    #[default]
    Trash,
    Delete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// External command invoked once per image.
    #[serde(default)]
    pub command: String,

    /// Argument template; `{input}` and `{output}` are substituted per
    /// invocation.
    #[serde(default = "default_processor_args")]
    pub args: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            command: String::new(),
            args: default_processor_args(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_retry_max() -> u32 {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_active_archives() -> usize {
    2
}

fn default_process_timeout_secs() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_archive_extensions() -> Vec<String> {
    vec!["zip".to_string(), "cbz".to_string()]
}

fn default_image_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "webp", "bmp", "gif", "avif"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_temp_extensions() -> Vec<String> {
    vec!["tdel".to_string(), "bak".to_string(), "tmp".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_trash_retention_days() -> u64 {
    30
}

fn default_processor_args() -> Vec<String> {
    vec!["{input}".to_string(), "{output}".to_string()]
}

impl BusConfig {
    /// Load from a TOML file. A `None` path yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<BusConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(BusConfig::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every run-mode invariant: at least one root, a configured
    /// processor command, and non-zero pool/queue sizes.
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        self.validate_common()?;
        if self.processor.command.is_empty() {
            return Err(ConfigError::Invalid(
                "processor.command must be configured".to_string(),
            ));
        }
        Ok(())
    }

    /// The monitor and recovery entry points need roots but no processor.
    pub fn validate_common(&self) -> Result<(), ConfigError> {
        if self.roots.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one root directory is required".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_active_archives == 0 {
            return Err(ConfigError::Invalid(
                "max_active_archives must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn trash_retention(&self) -> Duration {
        Duration::from_secs(self.trash_retention_days.saturating_mul(24 * 60 * 60))
    }

    /// Whether a discovered file looks like a processable source archive.
    pub fn is_archive_path(&self, path: &Path) -> bool {
        has_extension_in(path, &self.archive_extensions)
    }

    /// Whether an entry inside an archive goes to the processor.
    pub fn is_image_entry(&self, rel_path: &str) -> bool {
        has_extension_in(Path::new(rel_path), &self.image_extensions)
    }

    /// Whether a file carries a temp/quarantine suffix and must be ignored.
    pub fn is_temp_path(&self, path: &Path) -> bool {
        has_extension_in(path, &self.temp_extensions)
    }
}

fn has_extension_in(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions.iter().any(|e| ext.eq_ignore_ascii_case(e))
}

impl RootConfig {
    pub fn new(path: impl Into<PathBuf>) -> RootConfig {
        RootConfig {
            path: path.into(),
            output: None,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path.join(STATE_DIR_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("ledger.jsonl")
    }

    pub fn scratch_dir(&self, fingerprint: &str) -> PathBuf {
        self.state_dir().join("scratch").join(fingerprint)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.state_dir().join("trash")
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output {
            Some(dir) => dir.clone(),
            None => self.path.join("upscaled"),
        }
    }

    /// Output location for a source archive: the source's subpath relative
    /// to this root, re-rooted under the output directory. Sources outside
    /// the root (should not happen) fall back to a flat name.
    pub fn output_path_for(&self, source: &Path) -> PathBuf {
        match source.strip_prefix(&self.path) {
            Ok(rel) => self.output_dir().join(rel),
            Err(_) => match source.file_name() {
                Some(name) => self.output_dir().join(name),
                None => self.output_dir().join("archive.zip"),
            },
        }
    }

    /// True for paths the scanner and watcher must never treat as sources:
    /// anything under the state dir or under the output dir.
    pub fn is_internal_path(&self, path: &Path) -> bool {
        path.starts_with(self.state_dir()) || path.starts_with(self.output_dir())
    }
}
