//! Opaque persistence for shell state.
//!
//! The shells persist a small document here: per-pane current uri,
//! selected index, divider position, last active provider. Its schema
//! belongs to the shell; the core moves bytes and guarantees the file is
//! replaced atomically.

use camino::Utf8PathBuf;

pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, body: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        utils::crashsafe::overwrite(&self.path, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_and_absence() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state/ui.json"));

        assert!(store.load().await.unwrap().is_none());

        store.save(b"{\"left\":\"s3://b/\"}").await.unwrap();
        assert_eq!(
            store.load().await.unwrap().as_deref(),
            Some(b"{\"left\":\"s3://b/\"}".as_slice())
        );

        // Overwrites are complete replacements.
        store.save(b"v2").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some(b"v2".as_slice()));
    }
}
