//! Local directory object store.
//!
//! Objects are plain files under a root directory. Writes go to a temporary
//! file next to the target and are renamed into place, so readers never see
//! a partial object. URLs are signed with HMAC-SHA256 and carry their own
//! expiry:
//!
//! ```text
//! {public_base_url}/{key}?expires={unix_secs}&signature={base64url(hmac(key "\n" expires))}
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;

use super::{ObjectStore, StorageError};
use crate::config::FilesystemStoreConfig;

type HmacSha256 = Hmac<Sha256>;

/// Object store backed by a local directory
pub struct FilesystemStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
    quota_bytes: Option<u64>,
    /// Bytes currently stored; only tracked when a quota is configured.
    /// Held across each write so the replaced object's size is read and
    /// accounted under the same lock.
    used_bytes: Mutex<u64>,
}

impl FilesystemStore {
    /// Open (and create if needed) the root directory
    pub async fn open(config: &FilesystemStoreConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|e| unavailable(&config.root, e))?;

        let used_bytes = match config.quota_bytes {
            Some(_) => {
                let root = config.root.clone();
                tokio::task::spawn_blocking(move || directory_size(&root))
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?
                    .map_err(|e| unavailable(&config.root, e))?
            }
            None => 0,
        };

        tracing::info!(
            root = %config.root.display(),
            quota_bytes = ?config.quota_bytes,
            used_bytes,
            "Opened filesystem object store"
        );

        Ok(Self {
            root: config.root.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            signing_key: config.signing_key.as_bytes().to_vec(),
            quota_bytes: config.quota_bytes,
            used_bytes: Mutex::new(used_bytes),
        })
    }

    /// Bytes currently accounted against the quota
    pub async fn used_bytes(&self) -> u64 {
        *self.used_bytes.lock().await
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).expect("HMAC can take key of any size");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Check a signature produced by [`ObjectStore::url_for`]
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).expect("HMAC can take key of any size");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    /// Validate a full URL and return the object key it grants access to
    pub fn verify_url(&self, url: &str) -> Option<String> {
        let rest = url.strip_prefix(&self.public_base_url)?.strip_prefix('/')?;
        let (path, query) = rest.split_once('?')?;

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = value.parse::<i64>().ok(),
                Some(("signature", value)) => signature = Some(value),
                _ => {}
            }
        }

        let key = path
            .split('/')
            .map(|segment| urlencoding::decode(segment).map(|s| s.into_owned()))
            .collect::<Result<Vec<_>, _>>()
            .ok()?
            .join("/");
        validate_key(&key).ok()?;

        if self.verify_signature(&key, expires?, signature?) {
            Some(key)
        } else {
            None
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        let incoming = data.len() as u64;

        match self.quota_bytes {
            Some(quota) => {
                let mut used = self.used_bytes.lock().await;
                let existing = file_size(&path).await;
                let projected = used.saturating_sub(existing).saturating_add(incoming);
                if projected > quota {
                    return Err(StorageError::QuotaExceeded(format!(
                        "writing {} ({} bytes) would use {} of {} bytes",
                        key, incoming, projected, quota
                    )));
                }
                // On failure the previous object (if any) is untouched
                write_atomically(&path, &data)
                    .await
                    .map_err(|e| unavailable(&path, e))?;
                *used = projected;
            }
            None => write_atomically(&path, &data)
                .await
                .map_err(|e| unavailable(&path, e))?,
        }

        tracing::debug!(key = %key, bytes = incoming, "Stored object on filesystem");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    async fn url_for(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.public_base_url,
            encoded_key,
            expires,
            self.sign(key, expires)
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let mut used = match self.quota_bytes {
            Some(_) => Some(self.used_bytes.lock().await),
            None => None,
        };
        let size = if used.is_some() {
            file_size(&path).await
        } else {
            0
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                if let Some(used) = used.as_mut() {
                    **used = used.saturating_sub(size);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Reject keys that could escape the root directory
fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.contains('\0')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

async fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    let tmp_path = PathBuf::from(tmp_name);

    if let Err(e) = tokio::fs::write(&tmp_path, data).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

fn directory_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

fn unavailable(path: &Path, err: io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {}", path.display(), err))
}
