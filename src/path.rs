// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local directory handling.
//!
//! Deployment runs from inside the local directory being uploaded, so entry
//! names come out relative to it. The switch is scoped: whatever the outcome of
//! a deployment, the previous working directory is restored afterwards.

use glob::{glob_with, MatchOptions};
use std::{
    env::{current_dir, set_current_dir},
    fs::{metadata, read_dir},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Working directory switch that is undone on drop.
#[derive(Debug)]
pub struct LocalDirGuard {
    previous: PathBuf,
    entered: PathBuf,
}

impl LocalDirGuard {
    /// Change working directory of current process to `path`.
    ///
    /// # Errors
    ///
    /// - Return [`LocalDirError::NotFound`] if `path` does not exist.
    /// - Return [`LocalDirError::NotADirectory`] if `path` is not a directory.
    /// - Return [`LocalDirError::Enter`] if the switch itself fails.
    pub fn enter(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = metadata(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => LocalDirError::NotFound {
                path: path.to_path_buf(),
            },
            _ => LocalDirError::Enter {
                source,
                path: path.to_path_buf(),
            },
        })?;

        if !meta.is_dir() {
            return Err(LocalDirError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        let enter_error = |source| LocalDirError::Enter {
            source,
            path: path.to_path_buf(),
        };
        let previous = current_dir().map_err(enter_error)?;
        set_current_dir(path).map_err(enter_error)?;
        debug!("entered local directory {:?}", path.display());

        Ok(Self {
            previous,
            entered: path.to_path_buf(),
        })
    }

    /// Directory that was entered.
    pub fn path(&self) -> &Path {
        self.entered.as_path()
    }
}

impl Drop for LocalDirGuard {
    fn drop(&mut self) {
        if let Err(error) = set_current_dir(&self.previous) {
            warn!(
                "cannot restore working directory {:?}: {error}",
                self.previous.display()
            );
        }
    }
}

/// List top-level entries of the current working directory.
///
/// Equivalent to a plain `*` wildcard: entries whose names start with a dot
/// are skipped, nothing below the top level is visited, and the result comes
/// back sorted by name.
///
/// # Errors
///
/// - Return [`LocalDirError::Scan`] if the directory cannot be listed.
/// - Return [`LocalDirError::Enumerate`] if an entry cannot be read.
/// - Return [`LocalDirError::NonUtf8Name`] if an entry name is not valid
///   UTF-8, since remote commands are built from text.
pub fn top_level_entries() -> Result<Vec<PathBuf>> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let mut entries = Vec::new();
    reject_non_utf8_names()?;
    for entry in glob_with("*", options)? {
        entries.push(entry?);
    }
    entries.sort();

    Ok(entries)
}

// INVARIANT: The wildcard never sees names that are not UTF-8, so look for
// them separately instead of letting them drop out of the upload.
fn reject_non_utf8_names() -> Result<()> {
    let scan_error = |source| LocalDirError::Scan { source };
    for entry in read_dir(".").map_err(scan_error)? {
        let name = entry.map_err(scan_error)?.file_name();
        if name.to_str().is_none() && !name.as_encoded_bytes().starts_with(b".") {
            return Err(LocalDirError::NonUtf8Name {
                path: PathBuf::from(name),
            });
        }
    }

    Ok(())
}

/// Local directory error types.
#[derive(Debug, thiserror::Error)]
pub enum LocalDirError {
    /// Local directory is missing.
    #[error("local directory {:?} does not exist", path.display())]
    NotFound { path: PathBuf },

    /// Local path exists, but is not a directory.
    #[error("local path {:?} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    /// Local directory cannot be entered.
    #[error("failed to enter local directory {:?}", path.display())]
    Enter {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Entry name cannot be passed on to the remote host unchanged.
    #[error("local entry {:?} does not have a UTF-8 name", path.display())]
    NonUtf8Name { path: PathBuf },

    /// Current directory cannot be listed.
    #[error("failed to list local directory")]
    Scan {
        #[source]
        source: std::io::Error,
    },

    /// Wildcard pattern is malformed.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Entry of local directory cannot be read.
    #[error(transparent)]
    Enumerate(#[from] glob::GlobError),
}

/// Friendly result alias :3
pub type Result<T, E = LocalDirError> = std::result::Result<T, E>;
