//! Maps changed paths to the watch rules that care about them.
//!
//! Patterns use literal separators: `*` stays inside one path segment and
//! `**/` spans any number of directories. Paths under the workspace root are
//! matched relative to it, so `src/**/*.ts` works regardless of where the
//! workspace lives on disk.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TriggerError};

/// Prompt used by the default rule set.
pub const DEFAULT_PROMPT: &str =
    "The file {relative_path} was {event}. Review the change for bugs, unclear code and missing tests.";

/// Extensions covered by the default rule set, one `**/*.<ext>` rule each.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "rs", "go", "java", "kt", "swift", "c", "h",
    "cpp", "hpp", "cs", "rb", "php", "vue", "svelte",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A glob pattern and the prompt template dispatched for files it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRule {
    pub pattern: String,
    #[serde(alias = "prompt")]
    pub payload: String,
}

impl WatchRule {
    pub fn new(pattern: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            payload: payload.into(),
        }
    }

    /// The rule set substituted when configuration provides no rules.
    pub fn defaults() -> Vec<Self> {
        DEFAULT_EXTENSIONS
            .iter()
            .map(|ext| Self::new(format!("**/*.{ext}"), DEFAULT_PROMPT))
            .collect()
    }

    pub(crate) fn compile(&self) -> Result<Pattern> {
        Pattern::new(&self.pattern).map_err(|source| TriggerError::InvalidPattern {
            pattern: self.pattern.clone(),
            source,
        })
    }
}

pub struct PatternMatcher {
    root: PathBuf,
    rules: Vec<(Pattern, WatchRule)>,
}

impl PatternMatcher {
    /// Compile `rules` in order. An empty list is replaced by
    /// [`WatchRule::defaults`].
    pub fn new<P: AsRef<Path>>(root: P, rules: Vec<WatchRule>) -> Result<Self> {
        let rules = if rules.is_empty() {
            WatchRule::defaults()
        } else {
            rules
        };

        let rules = rules
            .into_iter()
            .map(|rule| Ok((rule.compile()?, rule)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: root.as_ref().to_path_buf(),
            rules,
        })
    }

    /// Every rule whose pattern matches `path`, in configuration order.
    pub fn matches(&self, path: &Path) -> Vec<&WatchRule> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);

        self.rules
            .iter()
            .filter(|(pattern, _)| pattern.matches_path_with(relative, MATCH_OPTIONS))
            .map(|(_, rule)| rule)
            .collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &WatchRule> {
        self.rules.iter().map(|(_, rule)| rule)
    }
}
