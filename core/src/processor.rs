//! Image processing capability.
//!
//! The pipeline never touches pixels. It hands an input path and an output
//! path to an [`ImageProcessor`] and looks only at the result. The one real
//! implementation, [`CommandProcessor`], spawns an external upscaler per
//! image with piped I/O, kill-on-drop and a wall-clock timeout;
//! [`CopyProcessor`] is the no-op passthrough used to validate a pipeline
//! end to end without doing any work.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::debug;

use crate::config::ProcessorConfig;

#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Executable not in PATH or not executable.
    #[error("processor command not found: {0}")]
    CommandNotFound(String),

    /// Process exceeded the configured wall-clock bound and was killed.
    #[error("processor timed out after {0}s")]
    Timeout(u64),

    /// Process ran but reported failure; carries stderr for the log.
    #[error("processor exited with {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// Process claimed success but wrote no output file.
    #[error("processor exited successfully but produced no output")]
    MissingOutput,

    /// Spawning or talking to the process failed.
    #[error("processor I/O error")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Produce `output` from `input`. The output's parent directory exists
    /// before the call; on any error the caller discards whatever was
    /// partially written at `output`.
    async fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessorError>;
}

/// Shells out to the configured upscaler once per image.
pub struct CommandProcessor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(config: &ProcessorConfig, timeout: Duration) -> CommandProcessor {
        CommandProcessor {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout,
        }
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl ImageProcessor for CommandProcessor {
    async fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessorError> {
        let args = self.render_args(input, output);
        debug!(command = %self.command, ?args, "invoking processor");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProcessorError::CommandNotFound(self.command.clone())
                } else {
                    ProcessorError::Io(e)
                }
            })?;

        // Drain both pipes so a chatty upscaler cannot deadlock on a full
        // pipe buffer while we wait on it.
        let stdout_handle = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut text = String::new();
                let _ = reader.read_to_string(&mut text).await;
                text
            })
        });
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut text = String::new();
                let _ = reader.read_to_string(&mut text).await;
                text
            })
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ProcessorError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(ProcessorError::Timeout(self.timeout.as_secs()));
            }
        };

        if !status.success() {
            let stderr = match stderr_handle {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            return Err(ProcessorError::Failed {
                code: status.code().unwrap_or(-1),
                stderr: truncate_for_log(&stderr),
            });
        }
        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if !output.exists() {
            return Err(ProcessorError::MissingOutput);
        }
        Ok(())
    }
}

/// Copies input to output unchanged. Exists so a deployment (or a test) can
/// run the whole pipeline without an upscaler installed.
pub struct CopyProcessor;

#[async_trait]
impl ImageProcessor for CopyProcessor {
    async fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessorError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

fn truncate_for_log(text: &str) -> String {
    const MAX: usize = 2000;
    if text.len() <= MAX {
        return text.trim_end().to_string();
    }
    let mut cut = MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}
