pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod reload;
pub mod scheduler;
pub mod sink;
pub mod trigger;
pub mod watcher;

pub use classifier::PathClassifier;
pub use config::{OutputFormat, TriggerConfig};
pub use error::{Result, TriggerError};
pub use events::*;
pub use matcher::{PatternMatcher, WatchRule};
pub use scheduler::{CancellationToken, DebounceScheduler, DeliveryFailure};
pub use sink::{ActionSink, PromptSink};
pub use trigger::{Control, EventOutcome, ServiceStats, TriggerService};
pub use watcher::*;
