//! The service that owns the whole pipeline.
//!
//! `TriggerService` wires the raw event source through the classifier and
//! matcher into the scheduler. Its run loop is the only consumer of both raw
//! events and control messages, so a reconfiguration is never interleaved
//! with event processing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::classifier::PathClassifier;
use crate::config::TriggerConfig;
use crate::events::{FileEvent, PendingAction};
use crate::matcher::PatternMatcher;
use crate::scheduler::{DebounceScheduler, DeliveryFailure};
use crate::sink::ActionSink;
use crate::watcher::FileWatcher;

/// Messages accepted by [`TriggerService::run`].
#[derive(Debug, Clone)]
pub enum Control {
    Reconfigure(Box<TriggerConfig>),
    Shutdown,
}

/// What happened to a single raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Disabled,
    Ignored,
    Unmatched,
    Scheduled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub events: u64,
    pub ignored: u64,
    pub unmatched: u64,
    pub scheduled: u64,
    pub failed_deliveries: u64,
    pub reconfigurations: u64,
}

pub struct TriggerService {
    root: PathBuf,
    config: TriggerConfig,
    classifier: PathClassifier,
    matcher: PatternMatcher,
    sink: Arc<dyn ActionSink<PendingAction>>,
    scheduler: DebounceScheduler<PendingAction>,
    failures: UnboundedReceiver<DeliveryFailure>,
    watcher: Option<FileWatcher>,
    stats: ServiceStats,
}

impl TriggerService {
    /// Build the pipeline for `root`. Nothing is watched until
    /// [`TriggerService::start`].
    pub fn new<P: AsRef<Path>>(
        root: P,
        config: TriggerConfig,
        sink: Arc<dyn ActionSink<PendingAction>>,
    ) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.as_ref().display()))?;

        config.validate()?;
        let classifier = PathClassifier::from_config(&root, &config)?;
        let matcher = PatternMatcher::new(&root, config.rules.clone())?;

        let (failure_tx, failures) = mpsc::unbounded_channel();
        let scheduler = DebounceScheduler::with_failure_reporter(Arc::clone(&sink), failure_tx);

        Ok(Self {
            root,
            config,
            classifier,
            matcher,
            sink,
            scheduler,
            failures,
            watcher: None,
            stats: ServiceStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &DebounceScheduler<PendingAction> {
        &self.scheduler
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Subscribe to filesystem events if enabled.
    pub fn start(&mut self) -> Result<()> {
        self.watcher = None;
        self.watcher = self.open_watcher(&self.config)?;
        if self.watcher.is_some() {
            tracing::info!(
                "Watching {} with {} rules",
                self.root.display(),
                self.matcher.rules().count()
            );
        }
        Ok(())
    }

    fn open_watcher(&self, config: &TriggerConfig) -> Result<Option<FileWatcher>> {
        if !config.enabled {
            tracing::info!("Watching disabled by configuration");
            return Ok(None);
        }

        Ok(Some(FileWatcher::new(&self.root, RecursiveMode::Recursive)?))
    }

    /// Classify, match and schedule one raw event.
    pub fn handle_event(&mut self, event: &FileEvent) -> EventOutcome {
        self.stats.events += 1;

        if !self.config.enabled {
            return EventOutcome::Disabled;
        }

        if self.classifier.should_ignore_path(&event.path) {
            self.stats.ignored += 1;
            tracing::trace!("Ignoring {}", event.path.display());
            return EventOutcome::Ignored;
        }

        // The last matching rule decides the payload
        let Some(rule) = self.matcher.matches(&event.path).last().copied() else {
            self.stats.unmatched += 1;
            return EventOutcome::Unmatched;
        };

        let action = PendingAction {
            path: event.path.clone(),
            kind: event.kind,
            pattern: rule.pattern.clone(),
            template: rule.payload.clone(),
        };
        let key = event.path.to_string_lossy().into_owned();
        tracing::debug!("{} {} (rule {})", event.kind, key, rule.pattern);

        self.scheduler.notify(key, action, self.config.delay_duration());
        self.stats.scheduled += 1;
        EventOutcome::Scheduled
    }

    /// Replace the configuration: cancel everything pending, rebuild the
    /// classifier and matcher, then swap in a fresh filesystem subscription.
    ///
    /// Everything is built before anything is cancelled, so a configuration
    /// that fails to load or to watch leaves the previous one running.
    pub fn reconfigure(&mut self, config: TriggerConfig) -> Result<()> {
        config.validate()?;
        let classifier = PathClassifier::from_config(&self.root, &config)?;
        let matcher = PatternMatcher::new(&self.root, config.rules.clone())?;
        let watcher = self.open_watcher(&config)?;

        let cancelled = self.scheduler.cancel_all();
        self.watcher = watcher;
        self.classifier = classifier;
        self.matcher = matcher;
        self.sink.reconfigure(&config);
        self.config = config;
        self.stats.reconfigurations += 1;

        tracing::info!(
            "Configuration applied: {} rules, {} pending prompts dropped",
            self.matcher.rules().count(),
            cancelled
        );
        Ok(())
    }

    /// Stop watching and cancel all pending work.
    pub fn shutdown(&mut self) {
        self.watcher = None;
        let cancelled = self.scheduler.cancel_all();
        tracing::info!("Stopped watching ({} pending prompts dropped)", cancelled);
    }

    /// Drive the pipeline until `Control::Shutdown` arrives or every control
    /// sender is dropped.
    ///
    /// Call [`TriggerService::start`] first to receive filesystem events.
    pub async fn run(mut self, mut control: UnboundedReceiver<Control>) -> ServiceStats {
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Reconfigure(config)) => {
                        if let Err(err) = self.reconfigure(*config) {
                            tracing::error!("Failed to apply configuration: {:#}", err);
                        }
                    }
                    Some(Control::Shutdown) | None => break,
                },
                Some(failure) = self.failures.recv() => {
                    self.stats.failed_deliveries += 1;
                    tracing::warn!(
                        "Prompt for {} was not dispatched: {}",
                        failure.key,
                        failure.error
                    );
                }
                Some(event) = next_event(&mut self.watcher) => {
                    self.handle_event(&event);
                }
            }
        }

        self.shutdown();
        self.stats
    }
}

async fn next_event(watcher: &mut Option<FileWatcher>) -> Option<FileEvent> {
    match watcher {
        Some(watcher) => watcher.recv().await,
        None => std::future::pending().await,
    }
}
