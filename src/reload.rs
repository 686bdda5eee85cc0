//! Hot reload of the configuration file.
//!
//! Editors often save in several steps (truncate, write, rename), so the
//! reload itself goes through a [`DebounceScheduler`]: one reload per quiet
//! period, keyed by the config file path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use notify::RecursiveMode;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::config::TriggerConfig;
use crate::scheduler::DebounceScheduler;
use crate::sink::ActionSink;
use crate::trigger::Control;
use crate::watcher::FileWatcher;

/// Quiet period between the last write to the config file and the reload.
pub const RELOAD_DELAY: Duration = Duration::from_millis(300);

pub type ConfigOverrides = Box<dyn Fn(TriggerConfig) -> TriggerConfig + Send + Sync>;

pub struct ConfigReloader {
    path: PathBuf,
    overrides: ConfigOverrides,
    control: UnboundedSender<Control>,
}

impl ConfigReloader {
    /// `overrides` runs after file and environment values are applied, so
    /// command line flags keep winning across reloads.
    pub fn new<P: AsRef<Path>>(
        path: P,
        overrides: ConfigOverrides,
        control: UnboundedSender<Control>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            overrides,
            control,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and apply environment and command line overrides.
    pub fn load(&self) -> Result<TriggerConfig> {
        let config = TriggerConfig::load(&self.path)?.with_env_overrides();
        Ok((self.overrides)(config))
    }
}

#[async_trait]
impl ActionSink<()> for ConfigReloader {
    async fn deliver(&self, _key: &str, _payload: &()) -> Result<()> {
        let config = self.load().with_context(|| {
            format!("Keeping previous configuration, {} is invalid", self.path.display())
        })?;

        self.control
            .send(Control::Reconfigure(Box::new(config)))
            .map_err(|_| anyhow!("Trigger service is no longer running"))?;
        tracing::info!("Reloaded configuration from {}", self.path.display());
        Ok(())
    }
}

/// Watch the directory holding the config file and reload on every change to
/// the file itself. The returned task owns the subscription; abort it to stop.
pub fn spawn_config_watch(reloader: ConfigReloader, delay: Duration) -> Result<JoinHandle<()>> {
    let path = reloader
        .path()
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", reloader.path().display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .context("Config path has no file name")?;
    let directory = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let mut watcher = FileWatcher::new(&directory, RecursiveMode::NonRecursive)?;
    let scheduler: DebounceScheduler<()> = DebounceScheduler::new(Arc::new(reloader));
    let key = path.to_string_lossy().into_owned();

    Ok(tokio::spawn(async move {
        while let Some(event) = watcher.recv().await {
            if event.path.file_name() == Some(file_name.as_os_str()) {
                scheduler.notify(key.clone(), (), delay);
            }
        }
        scheduler.cancel_all();
    }))
}
