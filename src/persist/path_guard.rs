//! Confinement check for the state file path.
//!
//! A path is accepted only if it is absolute, lexically normalizes to a
//! location strictly inside the allowed base directory, and no existing
//! component between the base and the target is redirected (a symlink, or on
//! Windows a reparse point such as a junction).
//!
//! Containment is decided on path components, never on string prefixes, so
//! `/var/lib/adaptive-filter-evil` is not inside `/var/lib/adaptive-filter`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[cfg(target_os = "linux")]
const PLATFORM_BASE_DIR: &str = "/var/lib/adaptive-filter";
#[cfg(target_os = "macos")]
const PLATFORM_BASE_DIR: &str = "/Library/Application Support/adaptive-filter";
#[cfg(windows)]
const PLATFORM_BASE_DIR: &str = r"C:\ProgramData\adaptive-filter";
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const PLATFORM_BASE_DIR: &str = "/var/db/adaptive-filter";

/// Reasons a storage path is refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathGuardError {
    #[error("path must be absolute: {}", path.display())]
    NotAbsolute { path: PathBuf },

    #[error("{} is not inside allowed directory {}", path.display(), base.display())]
    OutsideBase { path: PathBuf, base: PathBuf },

    #[error("redirected path component (symlink or reparse point) at {}", path.display())]
    Redirected { path: PathBuf },

    #[error("cannot inspect {}: {reason}", path.display())]
    Inspect { path: PathBuf, reason: String },
}

/// Confines storage paths to one base directory
#[derive(Debug, Clone)]
pub struct PathGuard {
    base: PathBuf,
}

impl PathGuard {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: normalize(&base.into()),
        }
    }

    /// Guard rooted at this platform's fixed state directory
    pub fn platform_default() -> Self {
        Self::new(PLATFORM_BASE_DIR)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Validate `path`, returning its normalized form
    pub fn check(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        if !path.is_absolute() {
            return Err(PathGuardError::NotAbsolute {
                path: path.to_path_buf(),
            });
        }

        let normalized = normalize(path);
        if !self.base.is_absolute()
            || !normalized.starts_with(&self.base)
            || normalized.components().count() <= self.base.components().count()
        {
            return Err(PathGuardError::OutsideBase {
                path: normalized,
                base: self.base.clone(),
            });
        }

        self.check_components(&normalized)?;
        Ok(normalized)
    }

    /// Walk from the base down to the target, refusing redirected components.
    /// Components that do not exist yet end the walk; they will be created
    /// as plain directories.
    fn check_components(&self, target: &Path) -> Result<(), PathGuardError> {
        let Ok(relative) = target.strip_prefix(&self.base) else {
            return Err(PathGuardError::OutsideBase {
                path: target.to_path_buf(),
                base: self.base.clone(),
            });
        };

        let mut current = self.base.clone();
        for component in relative.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) => {
                    if is_redirected(&meta) {
                        return Err(PathGuardError::Redirected { path: current });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(PathGuardError::Inspect {
                        path: current,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether a path component points somewhere other than where it sits
#[cfg(not(windows))]
pub fn is_redirected(meta: &fs::Metadata) -> bool {
    meta.file_type().is_symlink()
}

/// Whether a path component points somewhere other than where it sits
#[cfg(windows)]
pub fn is_redirected(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;

    meta.file_type().is_symlink() || meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0
}
