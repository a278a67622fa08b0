use crate::{
    errors::VFSError,
    filesystem::{Driver, VPath},
    protocol::WriteMode,
    stream::{ByteReader, ByteWriter, EntryStream},
};
use async_trait::async_trait;

/// Driver that denies everything
///
/// Access checks report that nothing exists. Useful as a placeholder mount
/// for device-like paths that have no implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFS;

#[async_trait]
impl Driver for NullFS {
    async fn resolve_uri(&self, _path: &VPath) -> Result<String, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn access(&self, _path: &VPath) -> Result<bool, VFSError> {
        Ok(false)
    }

    async fn read_dir(&self, _path: &VPath) -> Result<EntryStream, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn read_file(
        &self,
        _path: &VPath,
        _offset: u64,
        _length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn write_file(
        &self,
        _path: &VPath,
        _mode: WriteMode,
        _create: bool,
    ) -> Result<ByteWriter, VFSError> {
        Err(VFSError::AccessDenied)
    }

    async fn delete_node(&self, _path: &VPath, _recursive: bool) -> Result<(), VFSError> {
        Err(VFSError::AccessDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    #[test]
    fn denies_everything() {
        Runtime::new().unwrap().block_on(async {
            let path = VPath::parse("/anything");
            assert_eq!(NullFS.access(&path).await, Ok(false));
            assert_eq!(NullFS.access(&VPath::root()).await, Ok(false));
            assert_eq!(NullFS.resolve_uri(&path).await, Err(VFSError::AccessDenied));
            assert_eq!(NullFS.read_dir(&path).await.err(), Some(VFSError::AccessDenied));
            assert_eq!(
                NullFS.read_file(&path, 0, None).await.err(),
                Some(VFSError::AccessDenied)
            );
            assert_eq!(
                NullFS.write_file(&path, WriteMode::After, true).await.err(),
                Some(VFSError::AccessDenied)
            );
            assert_eq!(
                NullFS.delete_node(&path, true).await,
                Err(VFSError::AccessDenied)
            );
        });
    }
}
