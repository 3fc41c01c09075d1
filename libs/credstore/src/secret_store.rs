//! Encrypted at-rest storage for provider profiles.
//!
//! One JSON record per profile: `{salt, iv, cipher}`, all hex. The cipher
//! is AES-256-CBC over the profile's JSON; the key is scrypt-derived from
//! the store passphrase and the record's 16-byte salt (`N=2^14, r=8, p=1`).
//! An optional key file (created `0600`, owner-only) caches derived keys by
//! salt so re-opening the store does not pay the scrypt cost again. A
//! record that fails to decrypt is reported unreadable, never dropped.

use std::collections::HashMap;
use std::sync::RwLock;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use camino::Utf8PathBuf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ProviderProfile;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("profile '{id}' not found")]
    NotFound { id: String },
    /// Wrong passphrase or a tampered record.
    #[error("profile '{id}' is unreadable; wrong passphrase or corrupted record")]
    Unreadable { id: String },
    #[error("secret store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret store internal failure: {0}")]
    Internal(String),
}

/// On-disk shape of one record.
#[derive(Serialize, Deserialize)]
struct EncryptedRecord {
    salt: String,
    iv: String,
    cipher: String,
}

/// Result of reading one record during a listing: unreadable records are
/// surfaced to the caller instead of silently vanishing.
pub enum ProfileRecord {
    Readable(ProviderProfile),
    Unreadable { id: String },
}

pub struct SecretStore {
    dir: Utf8PathBuf,
    passphrase: String,
    key_file: Option<Utf8PathBuf>,
    /// salt hex → derived key; mirrors the key file. Read-heavy: every
    /// record access consults it, only a cache miss writes.
    key_cache: RwLock<HashMap<String, [u8; KEY_LEN]>>,
}

impl SecretStore {
    pub fn new(dir: Utf8PathBuf, passphrase: String, key_file: Option<Utf8PathBuf>) -> Self {
        let key_cache = key_file
            .as_deref()
            .and_then(|path| read_key_file(path).ok())
            .unwrap_or_default();
        Self {
            dir,
            passphrase,
            key_file,
            key_cache: RwLock::new(key_cache),
        }
    }

    fn record_path(&self, id: &str) -> Utf8PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], SecretStoreError> {
        let salt_hex = hex::encode(salt);
        if let Some(key) = self.key_cache.read().unwrap().get(&salt_hex) {
            return Ok(*key);
        }

        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| SecretStoreError::Internal(format!("scrypt params: {e}")))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(self.passphrase.as_bytes(), salt, &params, &mut key)
            .map_err(|e| SecretStoreError::Internal(format!("scrypt: {e}")))?;

        self.key_cache
            .write()
            .unwrap()
            .insert(salt_hex.clone(), key);
        if let Some(path) = &self.key_file {
            if let Err(e) = append_key_file(path, &salt_hex, &key) {
                debug!("could not update key file {path}: {e}");
            }
        }
        Ok(key)
    }

    pub async fn save_profile(&self, profile: &ProviderProfile) -> Result<(), SecretStoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);
        let key = self.derive_key(&salt)?;

        let plaintext = serde_json::to_vec(profile)
            .map_err(|e| SecretStoreError::Internal(format!("profile serialization: {e}")))?;
        let cipher = Aes256CbcEnc::new(&key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let record = EncryptedRecord {
            salt: hex::encode(salt),
            iv: hex::encode(iv),
            cipher: hex::encode(cipher),
        };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| SecretStoreError::Internal(format!("record serialization: {e}")))?;
        utils::crashsafe::overwrite(&self.record_path(&profile.id), &body)
            .await
            .map_err(|e| SecretStoreError::Internal(format!("record write: {e}")))?;
        Ok(())
    }

    pub async fn load_profile(&self, id: &str) -> Result<ProviderProfile, SecretStoreError> {
        let path = self.record_path(id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretStoreError::NotFound { id: id.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        self.decrypt_record(id, &body)
    }

    fn decrypt_record(&self, id: &str, body: &[u8]) -> Result<ProviderProfile, SecretStoreError> {
        let unreadable = || SecretStoreError::Unreadable { id: id.to_string() };

        let record: EncryptedRecord = serde_json::from_slice(body).map_err(|_| unreadable())?;
        let salt = hex::decode(&record.salt).map_err(|_| unreadable())?;
        let iv: [u8; IV_LEN] = hex::decode(&record.iv)
            .ok()
            .and_then(|iv| iv.try_into().ok())
            .ok_or_else(unreadable)?;
        let cipher = hex::decode(&record.cipher).map_err(|_| unreadable())?;

        let key = self.derive_key(&salt)?;
        let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher)
            .map_err(|_| unreadable())?;
        serde_json::from_slice(&plaintext).map_err(|_| unreadable())
    }

    /// Lists every record in the store. Unreadable records are returned as
    /// such so callers can report them.
    pub async fn list_profiles(&self) -> Result<Vec<ProfileRecord>, SecretStoreError> {
        let mut records = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.load_profile(id).await {
                Ok(profile) => records.push(ProfileRecord::Readable(profile)),
                Err(SecretStoreError::Unreadable { id }) => {
                    records.push(ProfileRecord::Unreadable { id })
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| {
            let id = |r: &ProfileRecord| match r {
                ProfileRecord::Readable(p) => p.id.clone(),
                ProfileRecord::Unreadable { id } => id.clone(),
            };
            id(a).cmp(&id(b))
        });
        Ok(records)
    }

    /// Removes the record and its cached key binding.
    pub async fn delete_profile(&self, id: &str) -> Result<(), SecretStoreError> {
        let path = self.record_path(id);

        // Drop the cached key derived for this record's salt.
        if let Ok(body) = tokio::fs::read(&path).await {
            if let Ok(record) = serde_json::from_slice::<EncryptedRecord>(&body) {
                self.key_cache.write().unwrap().remove(&record.salt);
                if let Some(key_file) = &self.key_file {
                    let cache = self.key_cache.read().unwrap().clone();
                    if let Err(e) = write_key_file(key_file, &cache) {
                        debug!("could not rewrite key file {key_file}: {e}");
                    }
                }
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretStoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn read_key_file(path: &camino::Utf8Path) -> std::io::Result<HashMap<String, [u8; KEY_LEN]>> {
    let body = std::fs::read(path)?;
    let raw: HashMap<String, String> = serde_json::from_slice(&body).unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(salt, key_hex)| {
            let key: [u8; KEY_LEN] = hex::decode(key_hex).ok()?.try_into().ok()?;
            Some((salt, key))
        })
        .collect())
}

fn write_key_file(
    path: &camino::Utf8Path,
    cache: &HashMap<String, [u8; KEY_LEN]>,
) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let raw: HashMap<&String, String> =
        cache.iter().map(|(salt, key)| (salt, hex::encode(key))).collect();
    let body = serde_json::to_vec_pretty(&raw).expect("string map is valid json");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Owner-only from the first byte on.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&body)?;
    file.sync_all()
}

fn append_key_file(
    path: &camino::Utf8Path,
    salt_hex: &str,
    key: &[u8; KEY_LEN],
) -> std::io::Result<()> {
    let mut cache = read_key_file(path).unwrap_or_default();
    cache.insert(salt_hex.to_string(), *key);
    write_key_file(path, &cache)
}

#[cfg(test)]
mod tests {
    use object_storage::Scheme;

    use super::*;
    use crate::{Credential, PROFILE_VERSION};

    fn profile(id: &str) -> ProviderProfile {
        ProviderProfile {
            id: id.to_string(),
            scheme: Scheme::S3,
            display_name: "test profile".to_string(),
            enabled: true,
            cred: Credential::S3 {
                access_key: "AKIATEST".into(),
                secret: "super-secret".into(),
                session_token: None,
                region: "us-east-1".into(),
            },
            settings: Default::default(),
            version: PROFILE_VERSION,
        }
    }

    #[tokio::test]
    async fn roundtrip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path().to_owned(), "hunter2".into(), None);

        store.save_profile(&profile("p1")).await.unwrap();
        let loaded = store.load_profile("p1").await.unwrap();
        assert_eq!(loaded, profile("p1"));
    }

    #[tokio::test]
    async fn ciphertext_hides_plaintext_and_layout_is_hex() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path().to_owned(), "hunter2".into(), None);
        store.save_profile(&profile("p1")).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("p1.json"))
            .await
            .unwrap();
        assert!(!raw.contains("super-secret"));
        assert!(!raw.contains("AKIATEST"));

        let record: EncryptedRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(hex::decode(&record.salt).unwrap().len(), SALT_LEN);
        assert_eq!(hex::decode(&record.iv).unwrap().len(), IV_LEN);
        assert!(!record.cipher.is_empty());
    }

    #[tokio::test]
    async fn wrong_passphrase_reports_unreadable() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path().to_owned(), "hunter2".into(), None);
        store.save_profile(&profile("p1")).await.unwrap();

        let wrong = SecretStore::new(dir.path().to_owned(), "not-hunter2".into(), None);
        assert!(matches!(
            wrong.load_profile("p1").await,
            Err(SecretStoreError::Unreadable { .. })
        ));

        // Unreadable records still show up in listings.
        let records = wrong.list_profiles().await.unwrap();
        assert!(matches!(
            records.as_slice(),
            [ProfileRecord::Unreadable { id }] if id == "p1"
        ));
    }

    #[tokio::test]
    async fn tampered_record_reports_unreadable() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path().to_owned(), "hunter2".into(), None);
        store.save_profile(&profile("p1")).await.unwrap();

        let path = dir.path().join("p1.json");
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let mut record: EncryptedRecord = serde_json::from_str(&raw).unwrap();
        let mut cipher = hex::decode(&record.cipher).unwrap();
        let last = cipher.len() - 1;
        cipher[last] ^= 0xff;
        record.cipher = hex::encode(cipher);
        tokio::fs::write(&path, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            store.load_profile("p1").await,
            Err(SecretStoreError::Unreadable { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_record_and_key_binding() {
        let dir = camino_tempfile::tempdir().unwrap();
        let key_file = dir.path().join("keys.json");
        let store =
            SecretStore::new(dir.path().join("records"), "hunter2".into(), Some(key_file.clone()));

        store.save_profile(&profile("p1")).await.unwrap();
        assert!(key_file.exists());
        store.delete_profile("p1").await.unwrap();

        assert!(matches!(
            store.load_profile("p1").await,
            Err(SecretStoreError::NotFound { .. })
        ));
        let keys = read_key_file(&key_file).unwrap();
        assert!(keys.is_empty());

        // Key file stays owner-only.
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn key_file_survives_reopen() {
        let dir = camino_tempfile::tempdir().unwrap();
        let key_file = dir.path().join("keys.json");
        let records = dir.path().join("records");

        let store = SecretStore::new(records.clone(), "hunter2".into(), Some(key_file.clone()));
        store.save_profile(&profile("p1")).await.unwrap();

        // A fresh store instance picks the derived key up from the key file.
        let reopened = SecretStore::new(records, "hunter2".into(), Some(key_file));
        assert_eq!(reopened.load_profile("p1").await.unwrap(), profile("p1"));
    }
}
