pub mod path_guard;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tracker::TrackedEntity;

use self::path_guard::{PathGuard, PathGuardError};

pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk layout of the state file
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    entities: BTreeMap<String, TrackedEntity>,
}

/// Durable home of the tracked entity table.
///
/// A confinement violation at save time disables the store for the rest of
/// its life. After `close` every save is a no-op.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    guard: PathGuard,
    disabled: AtomicBool,
    closed: AtomicBool,
    // Background snapshots and the shutdown flush share one temp file
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn open(guard: PathGuard, path: &Path) -> Result<Self, PathGuardError> {
        let path = guard.check(path)?;
        Ok(Self {
            path,
            guard,
            disabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Read the saved table. A missing file is an empty table.
    pub fn load(&self) -> Result<HashMap<String, TrackedEntity>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file: {}", self.path.display()))
            }
        };

        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "Unsupported state file version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }

        Ok(snapshot.entities.into_iter().collect())
    }

    /// Write the table. Returns `Ok(false)` when the store is closed or
    /// disabled and nothing was written.
    pub fn save(&self, entities: &HashMap<String, TrackedEntity>) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.closed.load(Ordering::Acquire) || self.is_disabled() {
            return Ok(false);
        }

        self.confine()?;

        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }
        // Directories were just created; check again before writing through them
        self.confine()?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entities: entities.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot).context("Failed to serialize state")?;

        let tmp = self.path.with_extension("json.tmp");
        write_private_file(&tmp, &json)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), entities = entities.len(), "State saved");
        Ok(true)
    }

    fn confine(&self) -> Result<()> {
        if let Err(e) = self.guard.check(&self.path) {
            self.disabled.store(true, Ordering::Release);
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Storage path failed confinement check, persistence disabled"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_CLOEXEC)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
