//! Persistent credential storage
//!
//! The credential record is spread over four string entries of a key-value [`Storage`], the same
//! way a browser client keeps it in the local storage. Values are opaque strings without any
//! versioning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use derivative::Derivative;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::{AuthUser, Credentials};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cannot access credential storage at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Credential storage at {path} is corrupted")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Cannot serialize credential record")]
    Serialize(#[from] serde_json::Error),
}

/// Cached user entry
pub const USER_KEY: &str = "rtg.auth.user";
/// Access token entry
pub const ACCESS_TOKEN_KEY: &str = "rtg.auth.access_token";
/// Refresh token entry
pub const REFRESH_TOKEN_KEY: &str = "rtg.auth.refresh_token";
/// Login time entry, milliseconds since the Unix epoch
pub const LOGIN_TIMESTAMP_KEY: &str = "rtg.auth.login_timestamp";

const KEYS: [&str; 4] = [
    USER_KEY,
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    LOGIN_TIMESTAMP_KEY,
];

/// Absolute session ceiling applied by default
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// String keyed persistent storage
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Process local storage
#[derive(Debug, Derivative)]
#[derivative(Default(new = "true"))]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Storage kept as a JSON object in a single file
///
/// The whole file is rewritten on every mutation. Nothing coordinates separate processes using
/// the same file.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Opens the storage, the file is created lazily on the first write
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| StorageError::Corrupted {
                    path: path.clone(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_owned(),
                source,
            })?;
        }

        fs::write(&self.path, content).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_owned(), value);
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

/// Durable copy of a login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub user: AuthUser,
    pub access_token: String,
    pub refresh_token: String,
    /// When the user signed in, stored with millisecond precision
    pub login_timestamp: DateTime<Utc>,
}

impl CredentialRecord {
    /// Record for credentials obtained right now
    pub fn new(credentials: Credentials) -> Self {
        Self::issued_at(credentials, Utc::now())
    }

    pub fn issued_at(credentials: Credentials, login_timestamp: DateTime<Utc>) -> Self {
        let Credentials {
            user,
            access_token,
            refresh_token,
        } = credentials;

        Self {
            user,
            access_token,
            refresh_token,
            login_timestamp,
        }
    }
}

/// Credential record storage enforcing the absolute session ceiling
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_ttl(storage, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    /// Writes all four entries of the record
    pub fn save(&self, record: &CredentialRecord) -> Result<(), StorageError> {
        let user = serde_json::to_string(&record.user)?;
        self.storage.set(USER_KEY, user)?;
        self.storage
            .set(ACCESS_TOKEN_KEY, record.access_token.clone())?;
        self.storage
            .set(REFRESH_TOKEN_KEY, record.refresh_token.clone())?;
        self.storage.set(
            LOGIN_TIMESTAMP_KEY,
            record.login_timestamp.timestamp_millis().to_string(),
        )?;

        debug!(user = %record.user.id, "Credential record saved");
        Ok(())
    }

    /// Reads the record back, `None` if any entry is missing or unreadable
    pub fn load(&self) -> Option<CredentialRecord> {
        let user = self.storage.get(USER_KEY)?;
        let access_token = self.storage.get(ACCESS_TOKEN_KEY)?;
        let refresh_token = self.storage.get(REFRESH_TOKEN_KEY)?;
        let login_timestamp = self.storage.get(LOGIN_TIMESTAMP_KEY)?;

        let user: AuthUser = match serde_json::from_str(&user) {
            Ok(user) => user,
            Err(err) => {
                warn!(%err, "Stored user entry is unreadable");
                return None;
            }
        };

        let login_timestamp = login_timestamp
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        let Some(login_timestamp) = login_timestamp else {
            warn!("Stored login timestamp is unreadable");
            return None;
        };

        Some(CredentialRecord {
            user,
            access_token,
            refresh_token,
            login_timestamp,
        })
    }

    /// Checks the record against the session ceiling using the current time
    pub fn is_expired(&self, record: &CredentialRecord) -> bool {
        self.is_expired_at(record, Utc::now())
    }

    /// Record is expired once strictly more than the ceiling passed since the login
    pub fn is_expired_at(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(record.login_timestamp);
        match age.to_std() {
            Ok(age) => age > self.ttl,
            // Login in the future, clock skew
            Err(_) => false,
        }
    }

    /// Removes all the entries
    ///
    /// Failures are logged, remaining entries are still removed.
    pub fn clear(&self) {
        for key in KEYS {
            if let Err(err) = self.storage.remove(key) {
                warn!(key, %err, "Cannot remove credential entry");
            }
        }
        debug!("Credential record cleared");
    }

    /// Session ceiling
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::identity::UserId;

    fn record(login_timestamp: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            user: AuthUser {
                id: UserId::random(),
                email: "crane.ops@example.com".to_owned(),
            },
            access_token: "access".to_owned(),
            refresh_token: "refresh".to_owned(),
            login_timestamp,
        }
    }

    /// Current time truncated to what the store can keep
    fn now_millis() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(Utc::now().timestamp_millis())
            .unwrap()
    }

    #[test]
    fn save_and_load() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone());
        assert_eq!(store.load(), None);

        let saved = record(now_millis());
        store.save(&saved).unwrap();
        assert_eq!(storage.len(), 4);
        assert_eq!(store.load(), Some(saved));
    }

    #[test]
    fn missing_entry_means_absent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone());
        store.save(&record(now_millis())).unwrap();

        storage.remove(REFRESH_TOKEN_KEY).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn unreadable_entries_mean_absent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone());
        store.save(&record(now_millis())).unwrap();

        storage
            .set(LOGIN_TIMESTAMP_KEY, "yesterday".to_owned())
            .unwrap();
        assert_eq!(store.load(), None);

        store.save(&record(now_millis())).unwrap();
        storage.set(USER_KEY, "{not json".to_owned()).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn clear_removes_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let store = TokenStore::new(storage.clone());
        store.save(&record(now_millis())).unwrap();

        store.clear();
        assert!(storage.is_empty());
        assert_eq!(store.load(), None);
    }

    #[test]
    fn expiry_is_absolute_age() {
        let store = TokenStore::new(Arc::new(MemoryStorage::new()));
        let now = Utc::now();

        assert!(!store.is_expired_at(&record(now), now));
        assert!(!store.is_expired_at(&record(now - ChronoDuration::hours(23)), now));
        // Exactly at the ceiling is still valid
        assert!(!store.is_expired_at(&record(now - ChronoDuration::hours(24)), now));
        assert!(store.is_expired_at(
            &record(now - ChronoDuration::hours(24) - ChronoDuration::milliseconds(1)),
            now
        ));
        assert!(store.is_expired_at(&record(now - ChronoDuration::hours(30)), now));
        assert!(!store.is_expired_at(&record(now + ChronoDuration::minutes(5)), now));
    }

    #[test]
    fn custom_ttl() {
        let store =
            TokenStore::with_ttl(Arc::new(MemoryStorage::new()), Duration::from_secs(60));
        let now = Utc::now();

        assert!(store.is_expired_at(&record(now - ChronoDuration::seconds(61)), now));
        assert!(!store.is_expired_at(&record(now - ChronoDuration::seconds(59)), now));
    }

    mod file_storage {
        use super::*;

        #[test]
        fn survives_reopening() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("credentials.json");

            let saved = record(now_millis());
            {
                let storage = Arc::new(FileStorage::open(&path).unwrap());
                TokenStore::new(storage).save(&saved).unwrap();
            }

            let storage = Arc::new(FileStorage::open(&path).unwrap());
            let store = TokenStore::new(storage);
            assert_eq!(store.load(), Some(saved));

            store.clear();
            let storage = Arc::new(FileStorage::open(&path).unwrap());
            assert_eq!(TokenStore::new(storage).load(), None);
        }

        #[test]
        fn corrupted_file_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("credentials.json");
            std::fs::write(&path, "[1, 2").unwrap();

            let err = FileStorage::open(&path).unwrap_err();
            assert!(matches!(err, StorageError::Corrupted { .. }));
        }

        #[test]
        fn empty_file_is_empty_storage() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("credentials.json");
            std::fs::write(&path, "").unwrap();

            let storage = FileStorage::open(&path).unwrap();
            assert_eq!(storage.get(USER_KEY), None);
        }
    }
}
