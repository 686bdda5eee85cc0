use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::config::TriggerConfig;
use crate::error::Result;

/// Directory names whose contents never reach the scheduler.
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    // Version control
    ".git",
    ".svn",
    ".hg",
    // Dependencies
    "node_modules",
    ".venv",
    "venv",
    // Build output
    "target",
    "dist",
    "build",
    "out",
    ".next",
    ".nuxt",
    // Caches and tooling
    ".cache",
    "__pycache__",
    "coverage",
    ".idea",
    ".vscode",
];

/// Decides whether a path is noise that should be dropped before scheduling.
///
/// Classification is total: every string, including the empty one, yields a
/// boolean and nothing is read from disk at query time.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    root: PathBuf,
    ignored_dirs: HashSet<String>,
    gitignore: Option<Gitignore>,
}

impl PathClassifier {
    /// Classifier with the built-in directory set and no `.gitignore`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
            gitignore: None,
        }
    }

    pub fn from_config<P: AsRef<Path>>(root: P, config: &TriggerConfig) -> Result<Self> {
        let mut classifier = Self::new(root).with_ignored_dirs(config.ignore_dirs.iter());
        if config.use_gitignore {
            classifier.gitignore = load_gitignore(&classifier.root)?;
        }
        Ok(classifier)
    }

    pub fn with_ignored_dirs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignored_dirs
            .extend(names.into_iter().map(|name| name.as_ref().to_string()));
        self
    }

    /// Only segments below the workspace root are checked; a root that
    /// itself lives under e.g. `build/` does not make everything ignored.
    pub fn should_ignore(&self, path: &str) -> bool {
        let full = Path::new(path);
        let relative = full.strip_prefix(&self.root).unwrap_or(full).to_string_lossy();
        let segments: Vec<&str> = relative
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .collect();

        let Some(last) = segments.last() else {
            return false;
        };

        // Hidden files and directories
        if last.starts_with('.') {
            return true;
        }

        if segments.iter().any(|segment| self.ignored_dirs.contains(*segment)) {
            return true;
        }

        self.gitignored(full)
    }

    pub fn should_ignore_path(&self, path: &Path) -> bool {
        self.should_ignore(&path.to_string_lossy())
    }

    fn gitignored(&self, path: &Path) -> bool {
        let Some(gitignore) = &self.gitignore else {
            return false;
        };

        // The matcher only understands paths inside its root
        if path.is_absolute() && !path.starts_with(&self.root) {
            return false;
        }

        gitignore.matched_path_or_any_parents(path, false).is_ignore()
    }
}

fn load_gitignore(root: &Path) -> Result<Option<Gitignore>> {
    let path = root.join(".gitignore");
    if !path.is_file() {
        return Ok(None);
    }

    let mut builder = GitignoreBuilder::new(root);
    if let Some(err) = builder.add(&path) {
        return Err(err.into());
    }
    let gitignore = builder.build()?;
    tracing::debug!("Loaded {} gitignore rules from {}", gitignore.num_ignores(), path.display());
    Ok(Some(gitignore))
}
