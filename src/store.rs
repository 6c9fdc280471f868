//! Durable single-slot storage for the session record.
//!
//! The session hook persists one named string slot. Two backends implement
//! the same contract:
//!
//! - Production: one OS keyring entry per key under the `keyper` service.
//! - Test mode: a file per key under the config directory.
//!
//! The backend is resolved once at startup from the runtime environment;
//! callers only see the [`SlotStore`] trait.
//!
//! # Graceful Degradation
//!
//! The OS keychain may block access when it is locked or when the binary
//! signature changes between builds. Reads retry transient failures and
//! errors are categorized so the session layer can log something useful
//! before degrading to a signed-out state.

use std::fmt;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use keyring::Entry;

use crate::config::Config;
use crate::constants::KEYRING_SERVICE;

/// Number of retry attempts for keyring reads.
const KEYRING_RETRY_ATTEMPTS: u32 = 2;
/// Delay between retry attempts in milliseconds.
const KEYRING_RETRY_DELAY_MS: u64 = 500;

/// Categorized storage errors for better log output.
///
/// A missing slot is not an error; `read` reports it as `Ok(None)`.
#[derive(Debug)]
pub enum StoreError {
    /// Backend cannot be reached or is locked awaiting user interaction.
    Unavailable(String),
    /// Access denied, on macOS typically a binary signature change.
    AccessDenied(String),
    /// Other/unknown error.
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
            Self::AccessDenied(msg) => write!(f, "storage access denied: {msg}"),
            Self::Other(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A durable store for named string slots.
///
/// `write(key, None)` deletes the slot. Writes are idempotent: storing the
/// same value twice, or deleting a slot twice, leaves identical state.
/// Values are stored verbatim; serialization is the caller's business.
pub trait SlotStore: Send + Sync {
    /// Returns the stored string for `key`, or `None` if never set.
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend itself is unavailable, never
    /// for a missing key.
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stores `value` verbatim under `key`, or deletes the slot for `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend rejects the write. Deleting a slot
    /// that does not exist is not an error.
    fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError>;

    /// Human-readable backend name for status output.
    fn name(&self) -> &'static str;
}

/// Categorize a keyring error so callers can log something actionable.
fn categorize_keyring_error(err: &keyring::Error) -> StoreError {
    let msg = format!("{err:?}");
    let msg_lower = msg.to_lowercase();

    if msg_lower.contains("user interaction")
        || msg_lower.contains("user canceled")
        || msg_lower.contains("platform failure")
    {
        return StoreError::Unavailable(msg);
    }

    if msg_lower.contains("denied")
        || msg_lower.contains("codesign")
        || msg_lower.contains("authorization")
        || msg_lower.contains("not allowed")
    {
        return StoreError::AccessDenied(msg);
    }

    StoreError::Other(msg)
}

/// OS keyring backend: one entry per key under the `keyper` service.
#[derive(Debug, Default)]
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<Entry, StoreError> {
        Entry::new(KEYRING_SERVICE, key)
            .map_err(|e| StoreError::Other(format!("failed to create keyring entry: {e:?}")))
    }

    /// Attempt a single read, reporting a missing entry as `Ok(None)`.
    fn try_read(key: &str) -> Result<Option<String>, StoreError> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(categorize_keyring_error(&e)),
        }
    }
}

impl SlotStore for KeyringStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut last_error = None;

        for attempt in 0..KEYRING_RETRY_ATTEMPTS {
            if attempt > 0 {
                log::debug!(
                    "Retrying keyring read for '{}' (attempt {}/{})",
                    key,
                    attempt + 1,
                    KEYRING_RETRY_ATTEMPTS
                );
                thread::sleep(Duration::from_millis(KEYRING_RETRY_DELAY_MS));
            }

            match Self::try_read(key) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    log::debug!("Keyring read attempt {} failed: {}", attempt + 1, err);

                    // Access denied won't fix itself between attempts
                    if matches!(err, StoreError::AccessDenied(_)) {
                        return Err(err);
                    }

                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Other("keyring read failed".to_string())))
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let entry = Self::entry(key)?;

        match value {
            Some(value) => {
                entry
                    .set_password(value)
                    .map_err(|e| categorize_keyring_error(&e))?;
                log::debug!("Stored '{}' in OS keyring", key);
                Ok(())
            }
            None => match entry.delete_credential() {
                // Deleting a slot that was never written is fine
                Ok(()) | Err(keyring::Error::NoEntry) => {
                    log::debug!("Deleted '{}' from OS keyring", key);
                    Ok(())
                }
                Err(e) => Err(categorize_keyring_error(&e)),
            },
        }
    }

    fn name(&self) -> &'static str {
        "os-keyring"
    }
}

/// File backend: one file per key under the given directory.
///
/// Used in test mode and wherever an OS keyring is unavailable.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SlotStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.slot_path(key);
        if !path.exists() {
            return Ok(None);
        }

        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| StoreError::Unavailable(format!("reading {}: {e}", path.display())))
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let path = self.slot_path(key);

        match value {
            Some(value) => {
                fs::create_dir_all(&self.dir).map_err(|e| {
                    StoreError::Unavailable(format!("creating {}: {e}", self.dir.display()))
                })?;
                fs::write(&path, value).map_err(|e| {
                    StoreError::Unavailable(format!("writing {}: {e}", path.display()))
                })?;

                #[cfg(unix)]
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                    StoreError::Other(format!("setting permissions on {}: {e}", path.display()))
                })?;

                log::debug!("Stored '{}' at {}", key, path.display());
                Ok(())
            }
            None => {
                if path.exists() {
                    fs::remove_file(&path).map_err(|e| {
                        StoreError::Unavailable(format!("removing {}: {e}", path.display()))
                    })?;
                }
                log::debug!("Deleted '{}' slot", key);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Check if the OS keyring should be bypassed in favor of file storage.
///
/// Uses two checks so the keyring is never touched during tests:
/// 1. `#[cfg(test)]` - always bypass during unit tests
/// 2. `KEYPER_ENV=test` - integration tests and CI
fn use_file_store() -> bool {
    #[cfg(test)]
    {
        true
    }

    #[cfg(not(test))]
    {
        crate::env::is_test_mode()
    }
}

/// Resolves the slot store backend for the current runtime environment.
///
/// Called once at startup; the choice does not change for the lifetime of
/// the process.
///
/// # Errors
///
/// Returns an error if the config directory for the file backend cannot be
/// created.
pub fn open_store() -> Result<Arc<dyn SlotStore>> {
    if use_file_store() {
        let dir = Config::config_dir()?;
        log::debug!("Using file slot store at {}", dir.display());
        Ok(Arc::new(FileStore::new(dir)))
    } else {
        log::debug!("Using OS keyring slot store");
        Ok(Arc::new(KeyringStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_read_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        assert_eq!(store.read("session_token").unwrap(), None);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", Some(r#"{"token":"abc"}"#)).unwrap();
        assert_eq!(
            store.read("session_token").unwrap(),
            Some(r#"{"token":"abc"}"#.to_string())
        );
    }

    #[test]
    fn test_file_store_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", Some("value")).unwrap();
        store.write("session_token", Some("value")).unwrap();
        assert_eq!(store.read("session_token").unwrap(), Some("value".to_string()));
    }

    #[test]
    fn test_file_store_write_none_deletes_slot() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", Some("value")).unwrap();
        store.write("session_token", None).unwrap();

        // Deleted, not a stored null literal
        assert_eq!(store.read("session_token").unwrap(), None);
        assert!(!dir.path().join("session_token.json").exists());
    }

    #[test]
    fn test_file_store_delete_missing_slot_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", None).unwrap();
        store.write("session_token", None).unwrap();
        assert_eq!(store.read("session_token").unwrap(), None);
    }

    #[test]
    fn test_file_store_keys_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", Some("a")).unwrap();
        store.write("other_key", Some("b")).unwrap();
        store.write("session_token", None).unwrap();

        assert_eq!(store.read("session_token").unwrap(), None);
        assert_eq!(store.read("other_key").unwrap(), Some("b".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_slot_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.write("session_token", Some("secret")).unwrap();
        let mode = fs::metadata(dir.path().join("session_token.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_open_store_uses_file_backend_in_tests() {
        let store = open_store().unwrap();
        assert_eq!(store.name(), "file");
    }

    #[test]
    fn test_store_error_display() {
        let unavailable = StoreError::Unavailable("locked".to_string());
        assert!(unavailable.to_string().contains("unavailable"));

        let denied = StoreError::AccessDenied("codesign".to_string());
        assert!(denied.to_string().contains("access denied"));
    }
}
