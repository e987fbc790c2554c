//! Durable saved-network metadata.
//!
//! The store never holds a passphrase; secrets stay in the backend's own
//! storage. Every mutation rewrites the file through [`write_atomic`], so a
//! power cut leaves either the old or the new contents on disk.

use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WifiError};
use crate::models::{NetworkObservation, SavedNetwork};

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    networks: Vec<SavedNetwork>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    networks: RwLock<Vec<SavedNetwork>>,
}

impl CredentialStore {
    /// Opens the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let networks = read_store_file(&path)?;

        tracing::info!(path = %path.display(), count = networks.len(), "Loaded saved networks");

        Ok(Self {
            path,
            networks: RwLock::new(networks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<SavedNetwork> {
        self.networks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, ssid: &str) -> Option<SavedNetwork> {
        self.networks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.ssid == ssid)
            .cloned()
    }

    /// Inserts or overwrites the entry for `entry.ssid`, keeping a local label when the new entry has none.
    pub fn save(&self, mut entry: SavedNetwork) -> Result<()> {
        self.update(|networks| {
            match networks.iter_mut().find(|n| n.ssid == entry.ssid) {
                Some(existing) => {
                    if entry.label.is_none() {
                        entry.label = existing.label.take();
                    }
                    *existing = entry;
                }
                None => networks.push(entry),
            }
            true
        })
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, ssid: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|networks| {
            let before = networks.len();
            networks.retain(|n| n.ssid != ssid);
            removed = networks.len() != before;
            removed
        })?;
        Ok(removed)
    }

    /// Returns whether the entry exists.
    pub fn set_label(&self, ssid: &str, label: Option<String>) -> Result<bool> {
        let mut found = false;
        self.update(|networks| match networks.iter_mut().find(|n| n.ssid == ssid) {
            Some(entry) => {
                found = true;
                entry.label = label;
                true
            }
            None => false,
        })?;
        Ok(found)
    }

    /// Rebuilds the list from its current contents under the write lock.
    ///
    /// `merge` sees the latest entries, so a concurrent `save` is never lost
    /// between reading and writing. Writes only when the result differs.
    pub fn update_with<F>(&self, merge: F) -> Result<Vec<SavedNetwork>>
    where
        F: FnOnce(&[SavedNetwork]) -> Vec<SavedNetwork>,
    {
        let mut merged = Vec::new();
        self.update(|networks| {
            merged = merge(networks);
            if *networks == merged {
                return false;
            }
            networks.clone_from(&merged);
            true
        })?;
        Ok(merged)
    }

    /// Applies `mutate` to a copy; persists and publishes it only if `mutate` reports a change
    /// and the write succeeded.
    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<SavedNetwork>) -> bool,
    {
        let mut guard = self.networks.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        if !mutate(&mut next) {
            return Ok(());
        }

        let file = StoreFile {
            version: default_version(),
            networks: next,
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| WifiError::StorageWriteFailure {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            })?;
        write_atomic(&self.path, &content)?;

        tracing::debug!(path = %self.path.display(), count = file.networks.len(), "Saved networks written");
        *guard = file.networks;
        Ok(())
    }
}

fn read_store_file(path: &Path) -> Result<Vec<SavedNetwork>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No saved networks file");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(WifiError::StorageReadFailure {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    let file: StoreFile = toml::from_str(&content).map_err(|e| WifiError::StorageReadFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(file.networks)
}

/// Replaces `path` with `contents` via a synced temp file and a rename.
///
/// On failure the previous file is untouched and the temp file is removed.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let fail = |source: io::Error| WifiError::StorageWriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(fail)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let written = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        // Never widen access; the supplicant file holds passphrases.
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o777)
            .unwrap_or(0o600);
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(fail(e));
    }

    if let Some(parent) = parent {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            tracing::debug!(error = %e, "Could not sync parent directory");
        }
    }

    Ok(())
}

/// Merges the local store with the backend's saved list.
///
/// Entries the backend no longer has are dropped and backend-only entries are
/// added. On conflict the backend's security and secret flag win unless the
/// backend could not tell the security, in which case local metadata is kept.
/// Labels are always local.
pub fn reconcile(local: &[SavedNetwork], backend: &[SavedNetwork]) -> Vec<SavedNetwork> {
    let mut merged: Vec<SavedNetwork> = Vec::with_capacity(backend.len());

    for remote in backend {
        if merged.iter().any(|m| m.ssid == remote.ssid) {
            continue;
        }

        let entry = match local.iter().find(|l| l.ssid == remote.ssid) {
            None => remote.clone(),
            Some(known) => SavedNetwork {
                ssid: remote.ssid.clone(),
                security: if remote.security.is_known() {
                    remote.security
                } else {
                    known.security
                },
                has_stored_secret: remote.has_stored_secret,
                label: known.label.clone(),
            },
        };
        merged.push(entry);
    }

    merged
}

/// Rewrites saved security from a fresh scan; the scan wins when it reports a known, different mode.
pub fn refresh_security(saved: &[SavedNetwork], scan: &[NetworkObservation]) -> Vec<SavedNetwork> {
    saved
        .iter()
        .map(|entry| {
            let seen = scan
                .iter()
                .find(|obs| obs.ssid == entry.ssid && obs.security.is_known())
                .map(|obs| obs.security);

            match seen {
                Some(security) if security != entry.security => SavedNetwork {
                    security,
                    has_stored_secret: entry.has_stored_secret && !security.is_open(),
                    ..entry.clone()
                },
                _ => entry.clone(),
            }
        })
        .collect()
}
