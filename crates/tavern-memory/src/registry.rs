//! [`TenantRegistry`] – resolves tenants to their storage handles.
//!
//! The registry is the sole owner of every [`TenantStore`].  The first
//! [`resolve`][TenantRegistry::resolve] for a tenant creates (or reopens)
//! its storage unit; every later call returns the same `Arc`.
//!
//! # Creation gate
//!
//! The tenant map is locked only long enough to fetch or insert the
//! tenant's *slot*.  Opening the database happens under that slot's own
//! mutex, so concurrent first calls for one tenant serialise while other
//! tenants are never held up by a slow open.
//!
//! # Addressing
//!
//! Storage units live at `<data_dir>/<tenant_id>_<sanitized name>/`.  The
//! display name is only there to make directories recognisable; identity is
//! the tenant id alone.  If a directory for the id already exists under a
//! different (older) name it is reused.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tavern_types::{MemoryError, TenantId};
use thiserror::Error;
use tracing::{info, warn};

use crate::store::{StoreError, TenantStore};

/// Maximum length of the sanitized display-name part of a directory name.
pub const MAX_STORAGE_NAME_LEN: usize = 50;
const FALLBACK_STORAGE_NAME: &str = "tenant";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from tenant resolution.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The tenant's storage unit could not be created or opened.  Nothing is
    /// left behind: a directory created by the failed attempt is removed.
    #[error("Storage unavailable for tenant {tenant}: {source}")]
    StorageUnavailable {
        tenant: TenantId,
        #[source]
        source: StoreError,
    },
    #[error("I/O error on data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<RegistryError> for MemoryError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::StorageUnavailable { tenant, source } => MemoryError::StorageUnavailable {
                tenant: tenant.to_string(),
                details: source.to_string(),
            },
            RegistryError::DataDir { path, source } => MemoryError::StorageUnavailable {
                tenant: String::new(),
                details: format!("{}: {source}", path.display()),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Name sanitisation
// ─────────────────────────────────────────────────────────────────────────────

/// Make `display_name` safe to embed in a directory name.
///
/// Filesystem-reserved characters and control characters become `_`, the
/// result is capped at [`MAX_STORAGE_NAME_LEN`] characters, leading and
/// trailing dots/spaces are trimmed, and an empty result becomes `"tenant"`.
pub fn sanitize_name(display_name: &str) -> String {
    let replaced: String = display_name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_STORAGE_NAME_LEN)
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        FALLBACK_STORAGE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Directory name for a tenant: `<tenant_id>_<sanitized name>`.
pub fn storage_dir_name(tenant_id: &TenantId, display_name: &str) -> String {
    format!("{tenant_id}_{}", sanitize_name(display_name))
}

// ─────────────────────────────────────────────────────────────────────────────
// TenantRegistry
// ─────────────────────────────────────────────────────────────────────────────

type Slot = Arc<Mutex<Option<Arc<TenantStore>>>>;

/// Memoizing map from tenant id to its [`TenantStore`].
pub struct TenantRegistry {
    data_dir: PathBuf,
    slots: Mutex<HashMap<TenantId, Slot>>,
}

impl TenantRegistry {
    /// Create a registry rooted at `data_dir` (created if missing).
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|source| RegistryError::DataDir {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self {
            data_dir,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Return the tenant's storage handle, creating it on first use.
    pub fn resolve(
        &self,
        tenant_id: &TenantId,
        display_name: &str,
    ) -> Result<Arc<TenantStore>, RegistryError> {
        let slot = {
            let mut slots = self.slots();
            Arc::clone(slots.entry(tenant_id.clone()).or_default())
        };

        let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = guard.as_ref() {
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(self.open_store(tenant_id, display_name)?);
        *guard = Some(Arc::clone(&store));
        Ok(store)
    }

    /// The tenant's handle if it has already been resolved in this process.
    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<TenantStore>> {
        let slot = self.slots().get(tenant_id).cloned()?;
        let guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    /// Ids of every tenant resolved so far, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let slots: Vec<(TenantId, Slot)> = self
            .slots()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        let mut ids: Vec<TenantId> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .is_some()
            })
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    fn open_store(&self, tenant_id: &TenantId, display_name: &str) -> Result<TenantStore, RegistryError> {
        self.open_store_with(tenant_id, display_name, |dir| {
            TenantStore::open(tenant_id.clone(), display_name, dir)
        })
    }

    fn open_store_with<F>(
        &self,
        tenant_id: &TenantId,
        display_name: &str,
        open: F,
    ) -> Result<TenantStore, RegistryError>
    where
        F: FnOnce(&Path) -> Result<TenantStore, StoreError>,
    {
        let (dir, existed) = match self.find_existing_dir(tenant_id) {
            Some(dir) => (dir, true),
            None => (self.data_dir.join(storage_dir_name(tenant_id, display_name)), false),
        };

        match open(&dir) {
            Ok(store) => {
                info!(
                    tenant = %tenant_id,
                    name = display_name,
                    dir = %dir.display(),
                    reopened = existed,
                    "tenant store ready"
                );
                Ok(store)
            }
            Err(source) => {
                if !existed && let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(dir = %dir.display(), error = %e, "failed to clean up partial tenant store");
                    }
                }
                Err(RegistryError::StorageUnavailable {
                    tenant: tenant_id.clone(),
                    source,
                })
            }
        }
    }

    /// Look for a directory already named `<tenant_id>_*`.
    fn find_existing_dir(&self, tenant_id: &TenantId) -> Option<PathBuf> {
        let prefix = format!("{tenant_id}_");
        let mut matches: Vec<PathBuf> = fs::read_dir(&self.data_dir)
            .ok()?
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter(|e| e.file_name().to_str().is_some_and(|n| n.starts_with(&prefix)))
            .map(|e| e.path())
            .collect();
        matches.sort();
        if matches.len() > 1 {
            warn!(tenant = %tenant_id, count = matches.len(), "multiple storage directories for tenant; using the first");
        }
        matches.into_iter().next()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<TenantId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
