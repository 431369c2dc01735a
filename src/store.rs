//! Trusted-key and pending-request storage.
//!
//! Both are capabilities so the membership transitions can run against the
//! working tree (`fs`) or against plain maps in tests (`inmem`).

use crate::crypto;
use crate::models::JoinRequest;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid username {0:?}")] InvalidUsername(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Approved public keys, one per username.
pub trait KeyStore: Send + Sync {
    fn public_key(&self, username: &str) -> StoreResult<Option<String>>;
    fn put_key(&self, username: &str, public_key: &str) -> StoreResult<()>;

    fn has_key(&self, username: &str) -> StoreResult<bool> {
        Ok(self.public_key(username)?.is_some())
    }
}

/// Pending join requests, one per username.
pub trait JoinRequestStore: Send + Sync {
    /// Every stored request, sorted by username.
    fn list(&self) -> StoreResult<Vec<JoinRequest>>;
    fn get(&self, username: &str) -> StoreResult<Option<JoinRequest>>;
    fn put(&self, request: &JoinRequest) -> StoreResult<()>;
    /// True if a request was removed.
    fn remove(&self, username: &str) -> StoreResult<bool>;
}

fn checked(username: &str) -> StoreResult<&str> {
    crypto::validate_username(username)
        .map(|_| username)
        .map_err(|_| StoreError::InvalidUsername(username.to_string()))
}

pub mod fs {
    //! `<dir>/<username>.pub` files holding a base64 key and a newline.

    use std::io::ErrorKind;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::models::KEY_EXTENSION;

    #[derive(Debug, Clone)]
    struct KeyDir {
        dir: PathBuf,
    }

    impl KeyDir {
        fn path_for(&self, username: &str) -> StoreResult<PathBuf> {
            Ok(self.dir.join(format!("{}{KEY_EXTENSION}", checked(username)?)))
        }

        fn read(&self, username: &str) -> StoreResult<Option<String>> {
            match std::fs::read_to_string(self.path_for(username)?) {
                Ok(raw) => Ok(Some(raw.trim().to_string())),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        }

        fn write(&self, username: &str, key: &str) -> StoreResult<()> {
            let path = self.path_for(username)?;
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(path, format!("{}\n", key.trim()))?;
            Ok(())
        }

        fn delete(&self, username: &str) -> StoreResult<bool> {
            match std::fs::remove_file(self.path_for(username)?) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }

        fn entries(&self) -> StoreResult<Vec<(String, String)>> {
            let rd = match std::fs::read_dir(&self.dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut out = Vec::new();
            for entry in rd {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(username) = name.strip_suffix(KEY_EXTENSION) else { continue };
                if crypto::validate_username(username).is_err() {
                    continue;
                }
                let key = std::fs::read_to_string(entry.path())?;
                out.push((username.to_string(), key.trim().to_string()));
            }
            out.sort();
            Ok(out)
        }
    }

    /// The `keys/` directory of a working tree.
    #[derive(Debug, Clone)]
    pub struct FsKeyStore(KeyDir);

    impl FsKeyStore {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self(KeyDir { dir: dir.into() })
        }

        pub fn dir(&self) -> &Path {
            &self.0.dir
        }
    }

    impl KeyStore for FsKeyStore {
        fn public_key(&self, username: &str) -> StoreResult<Option<String>> {
            self.0.read(username)
        }
        fn put_key(&self, username: &str, public_key: &str) -> StoreResult<()> {
            self.0.write(username, public_key)
        }
    }

    /// The `requests/` directory of a working tree.
    #[derive(Debug, Clone)]
    pub struct FsRequestStore(KeyDir);

    impl FsRequestStore {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self(KeyDir { dir: dir.into() })
        }
    }

    impl JoinRequestStore for FsRequestStore {
        fn list(&self) -> StoreResult<Vec<JoinRequest>> {
            Ok(self
                .0
                .entries()?
                .into_iter()
                .map(|(username, public_key)| JoinRequest { username, public_key })
                .collect())
        }
        fn get(&self, username: &str) -> StoreResult<Option<JoinRequest>> {
            Ok(self.0.read(username)?.map(|public_key| JoinRequest {
                username: username.to_string(),
                public_key,
            }))
        }
        fn put(&self, request: &JoinRequest) -> StoreResult<()> {
            self.0.write(&request.username, &request.public_key)
        }
        fn remove(&self, username: &str) -> StoreResult<bool> {
            self.0.delete(username)
        }
    }
}

pub mod inmem {
    use std::collections::BTreeMap;
    use std::sync::{Arc, PoisonError, RwLock};

    use super::*;

    #[derive(Clone, Default)]
    pub struct InMemKeyStore {
        keys: Arc<RwLock<BTreeMap<String, String>>>,
    }

    impl InMemKeyStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_key(self, username: &str, public_key: &str) -> Self {
            self.keys
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(username.to_string(), public_key.to_string());
            self
        }
    }

    impl KeyStore for InMemKeyStore {
        fn public_key(&self, username: &str) -> StoreResult<Option<String>> {
            let s = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            Ok(s.get(username).cloned())
        }
        fn put_key(&self, username: &str, public_key: &str) -> StoreResult<()> {
            let mut s = self.keys.write().unwrap_or_else(PoisonError::into_inner);
            s.insert(checked(username)?.to_string(), public_key.to_string());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    pub struct InMemRequestStore {
        requests: Arc<RwLock<BTreeMap<String, String>>>,
    }

    impl InMemRequestStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl JoinRequestStore for InMemRequestStore {
        fn list(&self) -> StoreResult<Vec<JoinRequest>> {
            let s = self.requests.read().unwrap_or_else(PoisonError::into_inner);
            Ok(s.iter()
                .map(|(u, k)| JoinRequest { username: u.clone(), public_key: k.clone() })
                .collect())
        }
        fn get(&self, username: &str) -> StoreResult<Option<JoinRequest>> {
            let s = self.requests.read().unwrap_or_else(PoisonError::into_inner);
            Ok(s.get(username).map(|k| JoinRequest { username: username.to_string(), public_key: k.clone() }))
        }
        fn put(&self, request: &JoinRequest) -> StoreResult<()> {
            let mut s = self.requests.write().unwrap_or_else(PoisonError::into_inner);
            s.insert(checked(&request.username)?.to_string(), request.public_key.clone());
            Ok(())
        }
        fn remove(&self, username: &str) -> StoreResult<bool> {
            let mut s = self.requests.write().unwrap_or_else(PoisonError::into_inner);
            Ok(s.remove(username).is_some())
        }
    }
}
