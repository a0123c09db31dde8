//! Command source: one shell command per line, `#` comments and blank lines skipped.

use std::path::Path;
use std::time::SystemTime;

/// A command and the zero-based line it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine<'a> {
    pub line: usize,
    pub command: &'a str,
}

/// Parse command text into an ordered, restartable sequence.
///
/// Lines are taken verbatim apart from the line terminator; no shell escaping
/// happens here.
///
/// # Examples
///
/// ```
/// use cudaq::core::source::parse;
///
/// let text = "# warmup\npython a.py\n\n   # skipped\npython b.py --lr 0.1\n";
/// let commands: Vec<_> = parse(text).map(|l| (l.line, l.command)).collect();
/// assert_eq!(commands, vec![(1, "python a.py"), (4, "python b.py --lr 0.1")]);
/// ```
pub fn parse(text: &str) -> impl Iterator<Item = SourceLine<'_>> + '_ {
    text.lines().enumerate().filter_map(|(line, raw)| {
        let command = raw.strip_suffix('\r').unwrap_or(raw);
        let trimmed = command.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        Some(SourceLine { line, command })
    })
}

/// Tracks the commands file so it is only re-read after it changes
#[derive(Debug)]
pub struct CommandFile {
    path: std::path::PathBuf,
    last_modified: Option<SystemTime>,
    reported_missing: bool,
}

impl CommandFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        // Canonical form so origins stay comparable across working directories
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            path,
            last_modified: None,
            reported_missing: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the file contents if it changed since the last call.
    ///
    /// A missing file yields `None`; it is logged once.
    pub fn read_if_changed(&mut self) -> std::io::Result<Option<String>> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !self.reported_missing {
                    tracing::info!(
                        "Commands file {} not found, nothing to ingest",
                        self.path.display()
                    );
                    self.reported_missing = true;
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if self.reported_missing {
            self.reported_missing = false;
            if let Ok(canonical) = std::fs::canonicalize(&self.path) {
                self.path = canonical;
            }
        }

        if modified.is_some() && modified == self.last_modified {
            return Ok(None);
        }

        let text = std::fs::read_to_string(&self.path)?;
        self.last_modified = modified;
        Ok(Some(text))
    }
}
