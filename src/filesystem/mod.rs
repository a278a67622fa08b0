//! Virtual filesystem: one capability contract, several drivers, and an
//! overlay that mounts them into a single tree

mod empty;
mod http;
mod memory;
mod native;
mod null;
mod overlay;
mod path;
mod queue;

pub use self::{
    empty::EmptyFS,
    http::{HttpFS, HttpFSBuilder},
    memory::MemoryFS,
    native::{HostPermissions, NativeFS},
    null::NullFS,
    overlay::OverlayFS,
    path::VPath,
};

use crate::{
    errors::VFSError,
    protocol::WriteMode,
    stream::{ByteReader, ByteWriter, EntryStream},
};
use async_trait::async_trait;

/// Everything a filesystem driver must support
///
/// Paths given to a driver are relative to the driver's own root; the
/// overlay strips the mount point before forwarding.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Locator string for a file, suitable for showing to users or loading
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError>;

    /// Does a node exist here, and may it be read
    async fn access(&self, path: &VPath) -> Result<bool, VFSError>;

    /// Lazily list a directory
    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError>;

    /// Stream a file's content starting at `offset`, up to `length` bytes if given
    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError>;

    /// Open a stream whose bytes are placed relative to the existing content
    /// according to `mode` once it closes
    async fn write_file(
        &self,
        path: &VPath,
        mode: WriteMode,
        create: bool,
    ) -> Result<ByteWriter, VFSError>;

    /// Remove a file or directory; removing something that doesn't exist succeeds
    async fn delete_node(&self, path: &VPath, recursive: bool) -> Result<(), VFSError>;
}
