//! Validation gate for every path that reaches the filesystem.
//!
//! Normalization is purely lexical: nothing here touches disk, so a path is
//! judged the same way whether or not it exists yet.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

const DEFAULT_EXTENSIONS: &[&str] = &["json"];

/// A path that passed [`PathGuard::sanitize`]. Absolute, normalized,
/// allowlisted extension, not hidden.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for SafePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl serde::Serialize for SafePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    extensions: Vec<String>,
}

impl Default for PathGuard {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().copied())
    }
}

impl PathGuard {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Validate a file path, optionally confined to `base`.
    ///
    /// With a base, relative candidates are resolved against it and the result
    /// must be the base itself or lie inside it.
    pub fn sanitize(&self, path: impl AsRef<Path>, base: Option<&Path>) -> Option<SafePath> {
        let raw = path.as_ref();
        let resolved = match base {
            Some(base) => {
                let base = self.sanitize_dir(base)?;
                let candidate = match normalize(&base.join(raw)) {
                    Some(candidate) => candidate,
                    None => return reject(raw, "escapes the filesystem root"),
                };
                if !candidate.starts_with(&base) {
                    return reject(raw, "outside the base directory");
                }
                candidate
            }
            None => {
                if !raw.is_absolute() {
                    return reject(raw, "not an absolute path");
                }
                match normalize(raw) {
                    Some(candidate) => candidate,
                    None => return reject(raw, "escapes the filesystem root"),
                }
            }
        };

        if has_nul(raw) {
            return reject(raw, "contains a NUL byte");
        }

        let file_name = match resolved.file_name().and_then(OsStr::to_str) {
            Some(name) => name,
            None => return reject(raw, "no file name"),
        };
        if file_name.starts_with('.') {
            return reject(raw, "hidden file");
        }

        let allowed = resolved
            .extension()
            .and_then(OsStr::to_str)
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false);
        if !allowed {
            return reject(raw, "extension not allowed");
        }

        Some(SafePath(resolved))
    }

    /// Normalize a directory-bearing field such as a project root.
    pub fn sanitize_dir(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
        let raw = path.as_ref();
        if has_nul(raw) {
            return reject(raw, "contains a NUL byte");
        }
        if !raw.is_absolute() {
            return reject(raw, "not an absolute path");
        }
        match normalize(raw) {
            Some(dir) => Some(dir),
            None => reject(raw, "escapes the filesystem root"),
        }
    }
}

fn reject<T>(path: &Path, reason: &str) -> Option<T> {
    log::warn!("[path_guard] rejected {:?}: {}", path, reason);
    None
}

fn has_nul(path: &Path) -> bool {
    path.to_string_lossy().contains('\0')
}

/// Resolve `.` and `..` lexically. `None` when `..` climbs above the root or
/// the path has no root to climb from.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.parent()?;
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
