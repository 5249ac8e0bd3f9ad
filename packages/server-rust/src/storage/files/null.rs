//! No-op [`FileStore`] implementation.
//!
//! [`NullFileStore`] drains and discards every body. Useful for tests and
//! deployments that stage upload fields without keeping the files.

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::storage::{ByteStream, FileDescriptor};
use crate::traits::FileStore;

/// Discards file bodies and reports the client-supplied name.
pub struct NullFileStore;

#[async_trait]
impl FileStore for NullFileStore {
    async fn store_file(
        &self,
        descriptor: FileDescriptor,
        mut body: ByteStream,
    ) -> anyhow::Result<String> {
        let mut size = 0usize;
        while let Some(chunk) = body.next().await {
            size += chunk?.len();
        }
        tracing::debug!(file = %descriptor.file_name, size, "discarded uploaded file");
        Ok(descriptor.file_name)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use deep_lynx_core::{ContainerId, DataSourceId};
    use futures_util::stream;

    use super::*;

    fn descriptor(file_name: &str) -> FileDescriptor {
        FileDescriptor {
            container_id: ContainerId::new(),
            data_source_id: DataSourceId::new(),
            owner_id: "user-1".into(),
            field_name: "file".into(),
            file_name: file_name.into(),
            encoding: None,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn drains_and_returns_name() {
        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        let name = NullFileStore
            .store_file(
                descriptor("notes.txt"),
                body,
            )
            .await
            .unwrap();
        assert_eq!(name, "notes.txt");
    }

    #[tokio::test]
    async fn body_errors_propagate() {
        let body: ByteStream = stream::iter(vec![Err(std::io::Error::other("reset"))]).boxed();
        let result = NullFileStore
            .store_file(
                descriptor("broken.bin"),
                body,
            )
            .await;
        assert!(result.is_err());
    }
}
