//! Delivery side of the pipeline.
//!
//! [`ActionSink`] is the seam between the scheduler and whatever performs a
//! dispatch. [`PromptSink`] is the implementation the binary uses: it fills
//! the rule's prompt template, prints the result and optionally pipes it into
//! an external command.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{OutputFormat, TriggerConfig};
use crate::events::{FileEventKind, PendingAction};

/// Receives exactly one call per fired key.
///
/// Errors are reported by the scheduler and never re-arm the key.
#[async_trait]
pub trait ActionSink<P>: Send + Sync {
    async fn deliver(&self, key: &str, payload: &P) -> Result<()>;

    /// Pick up output settings from a new configuration.
    fn reconfigure(&self, _config: &TriggerConfig) {}
}

#[derive(Debug, Serialize)]
struct DispatchRecord<'a> {
    key: &'a str,
    event: FileEventKind,
    path: &'a Path,
    pattern: &'a str,
    prompt: &'a str,
    dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct OutputSettings {
    output: OutputFormat,
    notifications: bool,
    command: Option<Vec<String>>,
}

impl From<&TriggerConfig> for OutputSettings {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            output: config.output,
            notifications: config.notifications,
            command: config.dispatch_command.clone(),
        }
    }
}

pub struct PromptSink {
    root: PathBuf,
    color: bool,
    settings: RwLock<OutputSettings>,
    placeholder: Regex,
}

impl PromptSink {
    pub fn new<P: AsRef<Path>>(root: P, config: &TriggerConfig) -> Result<Self> {
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            color: true,
            settings: RwLock::new(OutputSettings::from(config)),
            placeholder: Regex::new(r"\{(\w+)\}").context("Failed to compile placeholder regex")?,
        })
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Fill `{path}`, `{relative_path}`, `{file_name}`, `{event}` and
    /// `{pattern}`. Unknown placeholders are kept verbatim.
    pub fn render(&self, action: &PendingAction) -> String {
        let relative = action.path.strip_prefix(&self.root).unwrap_or(&action.path);
        let values: HashMap<&str, String> = HashMap::from([
            ("path", action.path.display().to_string()),
            ("relative_path", relative.display().to_string()),
            (
                "file_name",
                action
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
            ("event", action.kind.to_string()),
            ("pattern", action.pattern.clone()),
        ]);

        self.placeholder
            .replace_all(&action.template, |caps: &Captures| {
                values
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn settings(&self) -> OutputSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn print<W: Write>(
        &self,
        out: &mut W,
        settings: &OutputSettings,
        key: &str,
        action: &PendingAction,
        prompt: &str,
    ) -> Result<()> {
        match settings.output {
            OutputFormat::Json => {
                let record = DispatchRecord {
                    key,
                    event: action.kind,
                    path: &action.path,
                    pattern: &action.pattern,
                    prompt,
                    dispatched_at: Utc::now(),
                };
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
            }
            OutputFormat::Text => {
                if settings.notifications {
                    let time_str = Utc::now().format("%H:%M:%S");
                    if self.color {
                        let color = match action.kind {
                            FileEventKind::Created => "\x1b[32m",  // Green
                            FileEventKind::Modified => "\x1b[33m", // Yellow
                            FileEventKind::Deleted => "\x1b[31m",  // Red
                        };
                        writeln!(
                            out,
                            "[{}] {}File {}\x1b[0m: {}",
                            time_str,
                            color,
                            action.kind,
                            action.path.display()
                        )?;
                    } else {
                        writeln!(
                            out,
                            "[{}] File {}: {}",
                            time_str,
                            action.kind,
                            action.path.display()
                        )?;
                    }
                }
                for line in prompt.lines() {
                    writeln!(out, "  {}", line)?;
                }
                writeln!(out)?;
            }
            OutputFormat::Compact => {
                let event_type = match action.kind {
                    FileEventKind::Created => "C",
                    FileEventKind::Modified => "M",
                    FileEventKind::Deleted => "D",
                };
                writeln!(out, "{} {} {}", event_type, key, prompt.replace('\n', " "))?;
            }
        }
        out.flush().context("Failed to write prompt to stdout")?;
        Ok(())
    }

    async fn dispatch(
        &self,
        command: &[String],
        action: &PendingAction,
        prompt: &str,
    ) -> Result<()> {
        let (program, args) = command.split_first().context("Dispatch command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .env("WATCHPROMPT_PATH", &action.path)
            .env("WATCHPROMPT_EVENT", action.kind.as_str())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{program}`"))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {}
                // The exit status decides for commands that ignore stdin
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!("`{}` closed stdin before reading the prompt", program);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to write prompt to `{program}`"));
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("`{program}` exited with {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl ActionSink<PendingAction> for PromptSink {
    async fn deliver(&self, key: &str, action: &PendingAction) -> Result<()> {
        let settings = self.settings();
        let prompt = self.render(action);
        self.print(&mut io::stdout().lock(), &settings, key, action, &prompt)?;

        if let Some(command) = &settings.command {
            self.dispatch(command, action, &prompt).await?;
            tracing::debug!("Dispatched prompt for {}", key);
        }
        Ok(())
    }

    fn reconfigure(&self, config: &TriggerConfig) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        *settings = OutputSettings::from(config);
    }
}
