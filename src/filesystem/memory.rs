use crate::{
    errors::VFSError,
    filesystem::{queue::OpQueue, Driver, VPath},
    protocol::{DirEntry, WriteMode},
    stream::{self, ByteReader, ByteWriter, EntryStream, DEFAULT_HIGH_WATER_MARK},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

/// In-process tree of directories and byte blobs
///
/// Operations on one file run one at a time in the order they were
/// submitted. Operations on different files are not ordered.
pub struct MemoryFS {
    root: Mutex<Node>,
    high_water_mark: usize,
}

enum Node {
    File(Arc<MemFile>),
    Directory(BTreeMap<String, Node>),
}

struct MemFile {
    content: Mutex<Bytes>,
    queue: OpQueue,
}

impl MemFile {
    fn new(content: Bytes) -> Arc<Self> {
        Arc::new(MemFile {
            content: Mutex::new(content),
            queue: OpQueue::default(),
        })
    }

    fn content(&self) -> Bytes {
        lock(&self.content).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn splice(existing: &Bytes, incoming: Bytes, mode: WriteMode) -> Bytes {
    match mode {
        WriteMode::Override => incoming,
        WriteMode::Before | WriteMode::After => {
            let mut buf = BytesMut::with_capacity(existing.len() + incoming.len());
            if mode == WriteMode::Before {
                buf.extend_from_slice(&incoming);
                buf.extend_from_slice(existing);
            } else {
                buf.extend_from_slice(existing);
                buf.extend_from_slice(&incoming);
            }
            buf.freeze()
        }
    }
}

impl Node {
    fn empty_directory() -> Self {
        Node::Directory(BTreeMap::new())
    }

    fn lookup(&self, path: &VPath) -> Result<&Node, VFSError> {
        let mut node = self;
        for segment in path.segments() {
            node = match node {
                Node::Directory(children) => children.get(segment).ok_or(VFSError::NotFound)?,
                Node::File(_) => return Err(VFSError::NotADirectory),
            };
        }
        Ok(node)
    }

    fn file(&self, path: &VPath) -> Result<Arc<MemFile>, VFSError> {
        match self.lookup(path)? {
            Node::File(file) => Ok(file.clone()),
            Node::Directory(_) => Err(VFSError::IsADirectory),
        }
    }

    /// Directory that contains `path`, optionally creating missing ancestors
    fn parent_mut(&mut self, path: &VPath, create: bool) -> Result<&mut BTreeMap<String, Node>, VFSError> {
        let parent = path.parent().ok_or(VFSError::IsADirectory)?;
        let mut node = self;
        for segment in parent.segments() {
            node = match node {
                Node::Directory(children) => {
                    if create {
                        children
                            .entry(segment.clone())
                            .or_insert_with(Node::empty_directory)
                    } else {
                        children.get_mut(segment).ok_or(VFSError::NotFound)?
                    }
                }
                Node::File(_) => return Err(VFSError::NotADirectory),
            };
        }
        match node {
            Node::Directory(children) => Ok(children),
            Node::File(_) => Err(VFSError::NotADirectory),
        }
    }
}

impl MemoryFS {
    pub fn new() -> Self {
        MemoryFS::with_high_water_mark(DEFAULT_HIGH_WATER_MARK)
    }

    /// Memory filesystem whose read and write streams buffer up to this many bytes
    pub fn with_high_water_mark(high_water_mark: usize) -> Self {
        MemoryFS {
            root: Mutex::new(Node::empty_directory()),
            high_water_mark,
        }
    }

    /// Replace a file's content immediately, creating it and its parents if needed
    ///
    /// Unlike [Driver::write_file] this does not wait behind queued operations.
    pub fn put_file<B: Into<Bytes>>(&self, path: &VPath, content: B) -> Result<(), VFSError> {
        let content = content.into();
        let mut root = lock(&self.root);
        let name = path.file_name().ok_or(VFSError::IsADirectory)?.to_string();
        let parent = root.parent_mut(path, true)?;
        match parent.get(&name) {
            Some(Node::Directory(_)) => Err(VFSError::IsADirectory),
            Some(Node::File(file)) => {
                *lock(&file.content) = content;
                Ok(())
            }
            None => {
                parent.insert(name, Node::File(MemFile::new(content)));
                Ok(())
            }
        }
    }

    /// Create a directory and any missing parents
    pub fn create_dir_all(&self, path: &VPath) -> Result<(), VFSError> {
        let mut root = lock(&self.root);
        let mut node = &mut *root;
        for segment in path.segments() {
            node = match node {
                Node::Directory(children) => children
                    .entry(segment.clone())
                    .or_insert_with(Node::empty_directory),
                Node::File(_) => return Err(VFSError::NotADirectory),
            };
        }
        match node {
            Node::Directory(_) => Ok(()),
            Node::File(_) => Err(VFSError::NotADirectory),
        }
    }
}

impl Default for MemoryFS {
    fn default() -> Self {
        MemoryFS::new()
    }
}

#[async_trait]
impl Driver for MemoryFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        lock(&self.root).file(path)?;
        Ok(format!("memory://{}", path))
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        match lock(&self.root).lookup(path) {
            Ok(_) => Ok(true),
            Err(VFSError::NotFound) | Err(VFSError::NotADirectory) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError> {
        let root = lock(&self.root);
        match root.lookup(path)? {
            Node::File(_) => Err(VFSError::NotADirectory),
            Node::Directory(children) => {
                let listing: Vec<DirEntry> = children
                    .iter()
                    .map(|(name, node)| match node {
                        Node::File(_) => DirEntry::file(name.as_str()),
                        Node::Directory(_) => DirEntry::directory(name.as_str()),
                    })
                    .collect();
                Ok(stream::entries(listing))
            }
        }
    }

    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        let file = lock(&self.root).file(path)?;
        let mut turn = file.queue.enqueue();
        let (mut writer, reader) = stream::pipe(self.high_water_mark);
        tokio::spawn(async move {
            turn.wait().await;
            let content = file.content();
            drop(turn);
            let start = (offset as usize).min(content.len());
            let end = match length {
                Some(length) => start.saturating_add(length as usize).min(content.len()),
                None => content.len(),
            };
            if let Err(err) = writer.write_all(&content[start..end]).await {
                log::trace!("memory read abandoned, {}", err);
            }
        });
        Ok(reader)
    }

    async fn write_file(
        &self,
        path: &VPath,
        mode: WriteMode,
        create: bool,
    ) -> Result<ByteWriter, VFSError> {
        let file = {
            let mut root = lock(&self.root);
            let name = path.file_name().ok_or(VFSError::IsADirectory)?.to_string();
            let parent = root.parent_mut(path, create)?;
            match parent.get(&name) {
                Some(Node::Directory(_)) => return Err(VFSError::IsADirectory),
                Some(Node::File(file)) => file.clone(),
                None if create => {
                    let file = MemFile::new(Bytes::new());
                    parent.insert(name, Node::File(file.clone()));
                    file
                }
                None => return Err(VFSError::NotFound),
            }
        };
        let mut turn = file.queue.enqueue();
        let (writer, mut reader) = stream::pipe(self.high_water_mark);
        tokio::spawn(async move {
            let (_, incoming) = tokio::join!(turn.wait(), reader.read_to_end());
            match incoming {
                Ok(incoming) => {
                    let mut content = lock(&file.content);
                    *content = splice(&content, incoming, mode);
                }
                Err(err) => log::debug!("memory write discarded, {}", err),
            }
            drop(turn);
        });
        Ok(writer)
    }

    async fn delete_node(&self, path: &VPath, recursive: bool) -> Result<(), VFSError> {
        if path.is_root() {
            return Err(VFSError::Busy);
        }
        let mut root = lock(&self.root);
        let parent = match root.parent_mut(path, false) {
            Ok(parent) => parent,
            Err(VFSError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let name = path.file_name().unwrap_or_default();
        if let Some(Node::Directory(children)) = parent.get(name) {
            if !recursive && !children.is_empty() {
                return Err(VFSError::NotEmpty);
            }
        }
        parent.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tokio::runtime::Runtime;

    async fn read_all(fs: &MemoryFS, path: &str) -> Bytes {
        fs.read_file(&path.into(), 0, None)
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap()
    }

    async fn write(fs: &MemoryFS, path: &str, mode: WriteMode, data: &'static [u8]) {
        let mut writer = fs.write_file(&path.into(), mode, true).await.unwrap();
        writer.write(data).await.unwrap();
        writer.close();
    }

    #[test]
    fn write_modes() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            write(&fs, "/greeting", WriteMode::Override, b"hello").await;
            assert_eq!(read_all(&fs, "/greeting").await, &b"hello"[..]);
            write(&fs, "/greeting", WriteMode::After, b"world").await;
            assert_eq!(read_all(&fs, "/greeting").await, &b"helloworld"[..]);
            write(&fs, "/greeting", WriteMode::Before, b">> ").await;
            assert_eq!(read_all(&fs, "/greeting").await, &b">> helloworld"[..]);
            write(&fs, "/greeting", WriteMode::Override, b"bye").await;
            assert_eq!(read_all(&fs, "/greeting").await, &b"bye"[..]);
        });
    }

    #[test]
    fn ranged_read() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            fs.put_file(&"/f".into(), "0123456789").unwrap();
            let mut reader = fs.read_file(&"/f".into(), 3, Some(4)).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"3456"[..]);
            let mut reader = fs.read_file(&"/f".into(), 8, Some(100)).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"89"[..]);
            let mut reader = fs.read_file(&"/f".into(), 20, None).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b""[..]);
        });
    }

    #[test]
    fn writes_commit_in_submission_order() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            let mut first = fs
                .write_file(&"/log".into(), WriteMode::After, true)
                .await
                .unwrap();
            let mut second = fs
                .write_file(&"/log".into(), WriteMode::After, true)
                .await
                .unwrap();
            let pending_read = fs.read_file(&"/log".into(), 0, None).await.unwrap();

            // finish the later write first
            second.write(&b"second;"[..]).await.unwrap();
            second.close();
            first.write(&b"first;"[..]).await.unwrap();
            first.close();

            let mut pending_read = pending_read;
            assert_eq!(
                pending_read.read_to_end().await.unwrap(),
                &b"first;second;"[..]
            );
        });
    }

    #[test]
    fn aborted_write_keeps_content() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            fs.put_file(&"/keep".into(), "original").unwrap();
            let mut writer = fs
                .write_file(&"/keep".into(), WriteMode::Override, false)
                .await
                .unwrap();
            writer.write(&b"partial"[..]).await.unwrap();
            writer.abort("interrupted");
            assert_eq!(read_all(&fs, "/keep").await, &b"original"[..]);
        });
    }

    #[test]
    fn errors() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            fs.put_file(&"/dir/file".into(), "x").unwrap();
            assert_eq!(
                fs.read_file(&"/nope".into(), 0, None).await.err(),
                Some(VFSError::NotFound)
            );
            assert_eq!(
                fs.read_file(&"/dir".into(), 0, None).await.err(),
                Some(VFSError::IsADirectory)
            );
            assert_eq!(
                fs.read_dir(&"/dir/file".into()).await.err(),
                Some(VFSError::NotADirectory)
            );
            assert_eq!(
                fs.write_file(&"/missing".into(), WriteMode::After, false)
                    .await
                    .err(),
                Some(VFSError::NotFound)
            );
            assert_eq!(
                fs.write_file(&"/dir/file/under".into(), WriteMode::After, true)
                    .await
                    .err(),
                Some(VFSError::NotADirectory)
            );
            assert!(fs.access(&"/dir/file".into()).await.unwrap());
            assert!(!fs.access(&"/dir/other".into()).await.unwrap());
        });
    }

    #[test]
    fn delete() {
        Runtime::new().unwrap().block_on(async {
            let fs = MemoryFS::new();
            fs.put_file(&"/a/b/c".into(), "x").unwrap();
            assert_eq!(fs.delete_node(&VPath::root(), true).await, Err(VFSError::Busy));
            assert_eq!(fs.delete_node(&"/a".into(), false).await, Err(VFSError::NotEmpty));
            assert_eq!(fs.delete_node(&"/missing/deeper".into(), false).await, Ok(()));
            fs.delete_node(&"/a".into(), true).await.unwrap();
            let listing: Vec<DirEntry> = fs
                .read_dir(&VPath::root())
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            assert!(listing.is_empty());
        });
    }
}
