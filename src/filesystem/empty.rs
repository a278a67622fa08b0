use crate::{
    errors::VFSError,
    filesystem::{Driver, VPath},
    protocol::WriteMode,
    stream::{self, ByteReader, ByteWriter, EntryStream},
};
use async_trait::async_trait;

/// Read-only driver holding a single empty directory
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFS;

fn missing_or(path: &VPath, at_root: VFSError) -> VFSError {
    if path.is_root() {
        at_root
    } else {
        VFSError::NotFound
    }
}

#[async_trait]
impl Driver for EmptyFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        Err(missing_or(path, VFSError::IsADirectory))
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        Ok(path.is_root())
    }

    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError> {
        if path.is_root() {
            Ok(stream::entries(Vec::new()))
        } else {
            Err(VFSError::NotFound)
        }
    }

    async fn read_file(
        &self,
        path: &VPath,
        _offset: u64,
        _length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        Err(missing_or(path, VFSError::IsADirectory))
    }

    async fn write_file(
        &self,
        path: &VPath,
        _mode: WriteMode,
        _create: bool,
    ) -> Result<ByteWriter, VFSError> {
        if path.is_root() {
            Err(VFSError::IsADirectory)
        } else {
            Err(VFSError::AccessDenied)
        }
    }

    async fn delete_node(&self, path: &VPath, _recursive: bool) -> Result<(), VFSError> {
        Err(missing_or(path, VFSError::Busy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::runtime::Runtime;

    #[test]
    fn only_an_empty_root() {
        Runtime::new().unwrap().block_on(async {
            let file = VPath::parse("/file");
            assert_eq!(EmptyFS.access(&VPath::root()).await, Ok(true));
            assert_eq!(EmptyFS.access(&file).await, Ok(false));
            let listing = EmptyFS.read_dir(&VPath::root()).await.unwrap();
            assert_eq!(listing.count().await, 0);
            assert_eq!(EmptyFS.read_dir(&file).await.err(), Some(VFSError::NotFound));
            assert_eq!(
                EmptyFS.read_file(&VPath::root(), 0, None).await.err(),
                Some(VFSError::IsADirectory)
            );
            assert_eq!(
                EmptyFS.write_file(&file, WriteMode::Override, true).await.err(),
                Some(VFSError::AccessDenied)
            );
            assert_eq!(EmptyFS.delete_node(&VPath::root(), true).await, Err(VFSError::Busy));
            assert_eq!(EmptyFS.delete_node(&file, true).await, Err(VFSError::NotFound));
        });
    }
}
