use clap::Parser;
use std::path::PathBuf;

use crate::config::{OutputFormat, TriggerConfig};
use crate::matcher::WatchRule;
use crate::matcher::DEFAULT_PROMPT;

#[derive(Parser, Debug, Clone)]
#[command(name = "watchprompt")]
#[command(version)]
#[command(about = "Dispatch one debounced analysis prompt per changed file")]
#[command(long_about = "WatchPrompt watches a workspace, waits until a file has been quiet for the configured delay, then renders the matching rule's prompt template and dispatches it once. Rapid successive saves of the same file produce a single prompt.")]
pub struct Cli {
    /// Directory to watch for changes
    #[arg(value_name = "PATH", help = "Path to watch (defaults to current directory)")]
    pub path: Option<PathBuf>,

    /// TOML configuration file; reloaded whenever it changes
    #[arg(short, long, value_name = "FILE", help = "Configuration file")]
    pub config: Option<PathBuf>,

    /// Quiet period before a prompt is dispatched
    #[arg(short, long, value_name = "MS", help = "Debounce delay in milliseconds")]
    pub delay_ms: Option<u64>,

    /// Start with scheduling switched off
    #[arg(long, help = "Start disabled")]
    pub disabled: bool,

    /// Do not print notification lines
    #[arg(long, help = "Disable notification lines")]
    pub no_notifications: bool,

    /// Output format for dispatched prompts
    #[arg(short, long, help = "Output format")]
    pub output: Option<OutputFormat>,

    /// Directory names to ignore beyond the built-in set
    #[arg(long, value_delimiter = ',', help = "Additional directory names to ignore")]
    pub ignore: Option<Vec<String>>,

    /// Glob patterns to watch; replaces configured rules
    #[arg(short, long = "pattern", value_name = "GLOB", help = "Watch pattern (repeatable)")]
    pub patterns: Vec<String>,

    /// Prompt template used with --pattern
    #[arg(long, value_name = "TEMPLATE", help = "Prompt template for --pattern rules")]
    pub prompt: Option<String>,

    /// Command receiving each prompt on stdin
    #[arg(
        long,
        value_name = "CMD",
        num_args = 1..,
        allow_hyphen_values = true,
        help = "Dispatch command and arguments"
    )]
    pub exec: Option<Vec<String>>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,
}

impl Cli {
    pub fn get_watch_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Apply command line flags on top of a file/environment configuration.
    pub fn apply_overrides(&self, mut config: TriggerConfig) -> TriggerConfig {
        if let Some(delay_ms) = self.delay_ms {
            config.delay_ms = delay_ms;
        }
        if self.disabled {
            config.enabled = false;
        }
        if self.no_notifications {
            config.notifications = false;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(ignore) = &self.ignore {
            config.ignore_dirs.extend(ignore.iter().cloned());
        }
        if !self.patterns.is_empty() {
            let prompt = self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
            config.rules = self
                .patterns
                .iter()
                .map(|pattern| WatchRule::new(pattern.clone(), prompt))
                .collect();
        }
        if let Some(exec) = &self.exec {
            config.dispatch_command = Some(exec.clone());
        }
        config
    }

    /// Configuration from file (or defaults), environment, then flags.
    pub fn load_config(&self) -> crate::error::Result<TriggerConfig> {
        let config = TriggerConfig::load_or_default(self.config.as_deref())?.with_env_overrides();
        let config = self.apply_overrides(config);
        config.validate()?;
        Ok(config)
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_ansi(!self.no_color)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        let path = self.get_watch_path();

        if !path.exists() {
            return Err(format!("Path does not exist: {}", path.display()));
        }

        if !path.is_dir() {
            return Err(format!("Path is not a directory: {}", path.display()));
        }

        if let Some(config) = &self.config {
            if !config.is_file() {
                return Err(format!("Config file does not exist: {}", config.display()));
            }
        }

        if self.prompt.is_some() && self.patterns.is_empty() {
            return Err("--prompt requires at least one --pattern".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from([
            "watchprompt",
            "/tmp",
            "--delay-ms",
            "150",
            "--pattern",
            "src/**/*.rs",
            "--pattern",
            "**/*.md",
            "--prompt",
            "Look at {path}",
            "--output",
            "json",
            "--ignore",
            "gen,tmp",
        ]);

        let config = cli.apply_overrides(TriggerConfig::default());
        assert_eq!(config.delay_ms, 150);
        assert_eq!(config.output, OutputFormat::Json);
        assert_eq!(config.ignore_dirs, vec!["gen".to_string(), "tmp".to_string()]);
        assert_eq!(
            config.rules,
            vec![
                WatchRule::new("src/**/*.rs", "Look at {path}"),
                WatchRule::new("**/*.md", "Look at {path}"),
            ]
        );
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::parse_from(["watchprompt"]);
        let config = TriggerConfig {
            delay_ms: 900,
            rules: vec![WatchRule::new("**/*.py", "x")],
            ..TriggerConfig::default()
        };

        assert_eq!(cli.apply_overrides(config.clone()), config);
    }

    #[test]
    fn test_exec_collects_arguments() {
        let cli = Cli::parse_from(["watchprompt", "--exec", "llm", "-m", "fast"]);
        let config = cli.apply_overrides(TriggerConfig::default());

        assert_eq!(
            config.dispatch_command,
            Some(vec!["llm".to_string(), "-m".to_string(), "fast".to_string()])
        );
    }

    #[test]
    fn test_validate_rejects_prompt_without_pattern() {
        let cli = Cli::parse_from(["watchprompt", ".", "--prompt", "x"]);
        assert!(cli.validate().is_err());
    }
}
