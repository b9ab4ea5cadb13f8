//! Session identity: the in-memory current value plus its durable mirror.
//!
//! The durable record is a small JSON document written atomically
//! (tmp + rename). It is shared with the restart receiver and watchdog,
//! which run as separate processes, so every read goes back to the file.

use chrono::{DateTime, SecondsFormat, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use crate::error::{Result, WatchError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    /// Written by the web session layer; read here only as a fallback identity source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_cookies: Option<String>,
    pub service_restart_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<String>,
}

enum Backend {
    File(PathBuf),
    Memory(Mutex<StoredRecord>),
}

pub struct PersistentIdentityStore {
    backend: Backend,
    write_lock: Mutex<()>,
}

impl PersistentIdentityStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::File(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(StoredRecord::default())),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File(path) => Some(path),
            Backend::Memory(_) => None,
        }
    }

    pub fn load(&self) -> Result<StoredRecord> {
        match &self.backend {
            Backend::File(path) => load_record(path),
            Backend::Memory(record) => Ok(record
                .lock()
                .map(|record| record.clone())
                .unwrap_or_default()),
        }
    }

    pub fn driver_id(&self) -> Result<Option<String>> {
        Ok(self.load()?.driver_id.and_then(normalize))
    }

    pub fn saved_cookies(&self) -> Result<Option<String>> {
        Ok(self.load()?.saved_cookies)
    }

    pub fn restart_count(&self) -> Result<u64> {
        Ok(self.load()?.service_restart_count)
    }

    pub fn last_poll_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .load()?
            .last_poll_at
            .as_deref()
            .and_then(parse_timestamp))
    }

    pub fn set_driver_id(&self, driver_id: &str) -> Result<()> {
        let value = normalize(driver_id.to_string());
        self.update(|record| record.driver_id = value)
    }

    pub fn set_saved_cookies(&self, cookies: &str) -> Result<()> {
        let value = cookies.to_string();
        self.update(|record| record.saved_cookies = Some(value))
    }

    /// Mirrors the identity used by a tick and stamps the poll time in one write.
    pub fn record_poll(&self, driver_id: &str, at: DateTime<Utc>) -> Result<()> {
        let value = normalize(driver_id.to_string());
        self.update(|record| {
            record.driver_id = value;
            record.last_poll_at = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        })
    }

    /// Bumps the teardown counter; it never resets.
    pub fn increment_restart_count(&self) -> Result<u64> {
        let mut count = 0;
        self.update(|record| {
            record.service_restart_count = record.service_restart_count.saturating_add(1);
            count = record.service_restart_count;
        })?;
        Ok(count)
    }

    fn update(&self, apply: impl FnOnce(&mut StoredRecord)) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &self.backend {
            Backend::File(path) => {
                let mut record = load_record(path).unwrap_or_else(|err| {
                    warn!(error = %err, path = %path.display(), "Discarding unreadable identity store");
                    StoredRecord::default()
                });
                apply(&mut record);
                save_record(path, &record)
            }
            Backend::Memory(record) => {
                let mut record = record
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                apply(&mut *record);
                Ok(())
            }
        }
    }
}

fn load_record(path: &Path) -> Result<StoredRecord> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StoredRecord::default())
        }
        Err(err) => return Err(WatchError::io("Failed to read identity store", err)),
    };

    serde_json::from_slice(&data).map_err(|source| WatchError::Json {
        context: format!("Failed to parse identity store {}", path.display()),
        source,
    })
}

fn save_record(path: &Path, record: &StoredRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| WatchError::io("Failed to create identity store dir", err))?;
    }

    let payload = serde_json::to_vec_pretty(record).map_err(|source| WatchError::Json {
        context: "Failed to serialize identity store".to_string(),
        source,
    })?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .map_err(|err| WatchError::io("Failed to write identity store", err))?;
    fs::rename(&tmp_path, path)
        .map_err(|err| WatchError::io("Failed to commit identity store", err))?;
    Ok(())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn normalize(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Process-wide current session identifier. Last writer wins.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    current: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.current
            .read()
            .map(|value| value.clone())
            .unwrap_or_default()
    }

    pub fn is_present(&self) -> bool {
        self.get().is_some()
    }

    /// Stores `value`; blank input clears the identity.
    pub fn set(&self, value: Option<&str>) {
        let normalized = value.and_then(|value| normalize(value.to_string()));
        match self.current.write() {
            Ok(mut current) => *current = normalized,
            Err(poisoned) => *poisoned.into_inner() = normalized,
        }
    }
}

/// Where a tick found its session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Memory,
    Durable,
    Cookie,
}

/// The web session's cookie jar, owned by the UI layer.
pub trait CookieSource: Send + Sync {
    fn cookies(&self) -> Result<Option<String>>;
}

/// Reads the cookie string the web layer mirrors into the durable store.
pub struct StoredCookies {
    store: Arc<PersistentIdentityStore>,
}

impl StoredCookies {
    pub fn new(store: Arc<PersistentIdentityStore>) -> Self {
        Self { store }
    }
}

impl CookieSource for StoredCookies {
    fn cookies(&self) -> Result<Option<String>> {
        self.store.saved_cookies()
    }
}

/// Extracts `driver_id` from a `name=value; name=value` cookie header.
pub fn driver_id_from_cookies(cookies: &str) -> Option<String> {
    cookies
        .split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix("driver_id="))
        .and_then(|value| normalize(value.to_string()))
}

/// Resolves the identity for a tick: memory, then durable store, then cookies.
///
/// A value found outside memory is cached back into `session`.
pub fn resolve_identity(
    session: &SessionIdentity,
    store: &PersistentIdentityStore,
    cookies: &dyn CookieSource,
) -> Option<(String, IdentitySource)> {
    if let Some(current) = session.get() {
        return Some((current, IdentitySource::Memory));
    }

    match store.driver_id() {
        Ok(Some(stored)) => {
            session.set(Some(&stored));
            return Some((stored, IdentitySource::Durable));
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "Failed to read durable session identifier"),
    }

    match cookies.cookies() {
        Ok(Some(raw)) => {
            let found = driver_id_from_cookies(&raw)?;
            session.set(Some(&found));
            Some((found, IdentitySource::Cookie))
        }
        Ok(None) => None,
        Err(err) => {
            warn!(error = %err, "Failed to read session cookies");
            None
        }
    }
}
