use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CredentialError;

/// Bearer credential issued by the REST backend at login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub user_id: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            user_id,
        }
    }
}

// The token never shows up in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Where the session token and user id live between runs. The sync core reads
/// it once to parametrize `connect`; login and logout write it.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new(credential: Option<Credential>) -> Self {
        Self {
            credential: Mutex::new(credential),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, credential: Credential) -> Result<(), CredentialError> {
        *self
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential);
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Credential persisted as a small JSON document.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<Credential>, CredentialError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<Credential> {
        match self.read() {
            Ok(credential) => credential,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "ignoring unreadable credential file");
                None
            }
        }
    }

    fn set(&self, credential: Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&credential)?)?;
        debug!(path = %self.path.display(), "credential stored");
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip_and_clear() {
        let store = MemoryCredentialStore::default();
        assert!(store.get().is_none());

        store
            .set(Credential::new("token-1", Some("u1".to_string())))
            .unwrap();
        assert_eq!(store.get().map(|c| c.token), Some("token-1".to_string()));

        store.clear().unwrap();
        assert!(store.get().is_none());
    }

    #[test]
    fn file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credential.json");

        FileCredentialStore::new(&path)
            .set(Credential::new("token-2", Some("u7".to_string())))
            .unwrap();

        let reopened = FileCredentialStore::new(&path);
        let credential = reopened.get().expect("credential should persist");
        assert_eq!(credential.token, "token-2");
        assert_eq!(credential.user_id.as_deref(), Some("u7"));

        reopened.clear().unwrap();
        assert!(reopened.get().is_none());
        reopened.clear().expect("clearing twice is fine");
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(FileCredentialStore::new(&path).get().is_none());
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", Credential::new("secret-token", None));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn mock_store_is_usable_as_trait_object() {
        let mut mock = MockCredentialStore::new();
        mock.expect_get()
            .times(1)
            .returning(|| Some(Credential::new("mocked", None)));

        let store: &dyn CredentialStore = &mock;
        assert_eq!(store.get().map(|c| c.token), Some("mocked".to_string()));
    }
}
