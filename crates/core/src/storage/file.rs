use crate::storage::DurableKeyValueStore;
use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One file per key. Writes land in a sibling temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create storage dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                && !key.starts_with('.'),
            "invalid storage key: {key:?}"
        );
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait::async_trait]
impl DurableKeyValueStore for FileKvStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(value)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        // The rename must not become visible before the data is on disk.
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();
        assert_eq!(store.read("report_store").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).await.unwrap();
            store.write("generation_queue", b"[\"AAPL\"]").await.unwrap();
            store.write("generation_queue", b"[\"MSFT\"]").await.unwrap();
        }
        let store = FileKvStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.read("generation_queue").await.unwrap().as_deref(),
            Some(&b"[\"MSFT\"]"[..])
        );
        assert!(!dir.path().join(".generation_queue.json.tmp").exists());
    }

    #[tokio::test]
    async fn leftover_temp_file_from_a_crash_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();
        store.write("report_store", b"{\"reports\":{}}").await.unwrap();
        let tmp = dir.path().join(".report_store.json.tmp");
        std::fs::write(&tmp, b"{\"repo").unwrap();

        assert_eq!(
            store.read("report_store").await.unwrap().as_deref(),
            Some(&b"{\"reports\":{}}"[..])
        );

        let blob = vec![b'x'; 256 * 1024];
        store.write("report_store", &blob).await.unwrap();
        assert_eq!(store.read("report_store").await.unwrap(), Some(blob));
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();
        assert!(store.write("../escape", b"x").await.is_err());
        assert!(store.read("").await.is_err());
    }
}
