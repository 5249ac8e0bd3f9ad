//! [`FileStore`] writing uploads into a local directory.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::storage::{ByteStream, FileDescriptor};
use crate::traits::FileStore;

const METADATA_SUFFIX: &str = ".meta.json";

/// Stores each upload as `<container>/<data source>/<uuid>-<file name>` under
/// `root`, next to a JSON copy of its [`FileDescriptor`].
///
/// The returned stored name is that path relative to `root`.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a stored file lives on disk.
    #[must_use]
    pub fn path_of(&self, stored_name: &str) -> PathBuf {
        self.root.join(stored_name)
    }

    /// Reads back the descriptor a file was stored with.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata file is missing or unreadable.
    pub async fn metadata(&self, stored_name: &str) -> anyhow::Result<FileDescriptor> {
        let path = self.root.join(format!("{stored_name}{METADATA_SUFFIX}"));
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Keeps only the final path component and replaces anything unusual.
fn sanitize(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn store_file(
        &self,
        descriptor: FileDescriptor,
        mut body: ByteStream,
    ) -> anyhow::Result<String> {
        let dir = format!("{}/{}", descriptor.container_id, descriptor.data_source_id);
        tokio::fs::create_dir_all(self.root.join(&dir))
            .await
            .with_context(|| format!("creating upload directory {dir}"))?;

        let stored_name = format!(
            "{dir}/{}-{}",
            Uuid::new_v4(),
            sanitize(&descriptor.file_name)
        );
        let path = self.root.join(&stored_name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;

        let mut size = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let metadata = serde_json::to_vec_pretty(&descriptor)?;
        tokio::fs::write(self.root.join(format!("{stored_name}{METADATA_SUFFIX}")), metadata)
            .await
            .with_context(|| format!("writing metadata for {stored_name}"))?;

        tracing::info!(
            container_id = %descriptor.container_id,
            data_source_id = %descriptor.data_source_id,
            owner = %descriptor.owner_id,
            file = %descriptor.file_name,
            stored = %stored_name,
            size,
            "stored uploaded file"
        );
        Ok(stored_name)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use deep_lynx_core::{ContainerId, DataSourceId};
    use futures_util::stream;

    use super::*;

    fn descriptor(container_id: ContainerId, data_source_id: DataSourceId) -> FileDescriptor {
        FileDescriptor {
            container_id,
            data_source_id,
            owner_id: "user-7".into(),
            field_name: "file".into(),
            file_name: "table.csv".into(),
            encoding: Some("7bit".into()),
            content_type: Some("text/csv".into()),
        }
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize("../../etc/passwd"), "passwd");
        assert_eq!(sanitize("C:\\data\\report final.csv"), "report_final.csv");
        assert_eq!(sanitize(".."), "upload");
    }

    #[tokio::test]
    async fn writes_body_under_container_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("uploads"));
        let (container_id, data_source_id) = (ContainerId::new(), DataSourceId::new());
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"a,b\n")),
            Ok(Bytes::from_static(b"1,2\n")),
        ])
        .boxed();

        let stored = store
            .store_file(descriptor(container_id, data_source_id), body)
            .await
            .unwrap();

        assert!(stored.starts_with(&format!("{container_id}/{data_source_id}/")));
        assert!(stored.ends_with("-table.csv"));
        let path = store.path_of(&stored);
        assert!(path.starts_with(store.root().join(container_id.to_string())));
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, b"a,b\n1,2\n");

        let meta = store.metadata(&stored).await.unwrap();
        assert_eq!(meta, descriptor(container_id, data_source_id));
        assert_eq!(meta.owner_id, "user-7");
        assert_eq!(meta.encoding.as_deref(), Some("7bit"));
    }

    #[tokio::test]
    async fn hostile_names_stay_inside_the_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let (container_id, data_source_id) = (ContainerId::new(), DataSourceId::new());
        let mut d = descriptor(container_id, data_source_id);
        d.file_name = "../../../escape.txt".into();

        let stored = store
            .store_file(d, stream::iter(vec![Ok(Bytes::from_static(b"x"))]).boxed())
            .await
            .unwrap();
        assert!(stored.ends_with("-escape.txt"));
        assert!(store
            .path_of(&stored)
            .starts_with(dir.path().join(container_id.to_string()).join(data_source_id.to_string())));
    }
}
