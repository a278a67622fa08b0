use crate::{
    errors::VFSError,
    filesystem::{queue::OpQueue, Driver, VPath},
    protocol::{DirEntry, WriteMode},
    stream::{self, ByteReader, ByteWriter, EntryStream, DEFAULT_HIGH_WATER_MARK},
};
use async_trait::async_trait;
use futures_util::stream::{unfold, StreamExt};
use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

/// What the host allows a [NativeFS] to do
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HostPermissions {
    pub read: bool,
    pub write: bool,
}

impl HostPermissions {
    pub fn read_write() -> Self {
        HostPermissions {
            read: true,
            write: true,
        }
    }

    pub fn read_only() -> Self {
        HostPermissions {
            read: true,
            write: false,
        }
    }
}

impl Default for HostPermissions {
    fn default() -> Self {
        HostPermissions::read_write()
    }
}

/// Driver backed by a directory on the host
pub struct NativeFS {
    root: PathBuf,
    permissions: HostPermissions,
    high_water_mark: usize,
    queues: Mutex<HashMap<PathBuf, Arc<OpQueue>>>,
}

impl NativeFS {
    pub fn new<P: AsRef<Path>>(root: P, permissions: HostPermissions) -> Self {
        NativeFS {
            root: root.as_ref().to_path_buf(),
            permissions,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn permissions(&self) -> HostPermissions {
        self.permissions
    }

    fn host_path(&self, path: &VPath) -> PathBuf {
        let mut result = self.root.clone();
        for segment in path.segments() {
            result.push(segment);
        }
        result
    }

    fn check_read(&self) -> Result<(), VFSError> {
        if self.permissions.read {
            Ok(())
        } else {
            Err(VFSError::AccessDenied)
        }
    }

    fn check_write(&self) -> Result<(), VFSError> {
        if self.permissions.write {
            Ok(())
        } else {
            Err(VFSError::AccessDenied)
        }
    }

    // reads and writes through this driver are ordered per host path
    fn queue(&self, host: &Path) -> Arc<OpQueue> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // queues nobody is using or waiting on start over empty anyway
        queues.retain(|_, queue| Arc::strong_count(queue) > 1 || !queue.is_idle());
        queues.entry(host.to_path_buf()).or_default().clone()
    }

    async fn expect_file(&self, host: &Path) -> Result<(), VFSError> {
        let metadata = fs::metadata(host)
            .await
            .map_err(|err| VFSError::from_host(&err, false))?;
        if metadata.is_dir() {
            Err(VFSError::IsADirectory)
        } else {
            Ok(())
        }
    }
}

async fn commit(host: &Path, mode: WriteMode, incoming: &[u8]) -> std::io::Result<()> {
    match mode {
        WriteMode::Override => fs::write(host, incoming).await,
        WriteMode::After => {
            let mut file = fs::OpenOptions::new().append(true).open(host).await?;
            file.write_all(incoming).await?;
            file.flush().await
        }
        WriteMode::Before => {
            let existing = fs::read(host).await?;
            let mut combined = Vec::with_capacity(incoming.len() + existing.len());
            combined.extend_from_slice(incoming);
            combined.extend_from_slice(&existing);
            fs::write(host, combined).await
        }
    }
}

#[async_trait]
impl Driver for NativeFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        self.check_read()?;
        if path.is_root() {
            return Err(VFSError::IsADirectory);
        }
        let host = self.host_path(path);
        self.expect_file(&host).await?;
        let url = url::Url::from_file_path(&host)
            .map_err(|()| VFSError::Transport(format!("no file URL for {:?}", host)))?;
        Ok(url.to_string())
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        match fs::metadata(self.host_path(path)).await {
            Ok(_) => Ok(self.permissions.read),
            Err(err) => match VFSError::from_host(&err, true) {
                VFSError::NotFound | VFSError::NotADirectory => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError> {
        self.check_read()?;
        let dir = fs::read_dir(self.host_path(path))
            .await
            .map_err(|err| VFSError::from_host(&err, true))?;
        Ok(unfold(dir, |mut dir| async move {
            match dir.next_entry().await {
                Ok(None) => None,
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let item = match entry.file_type().await {
                        Ok(kind) if kind.is_dir() => Ok(DirEntry::directory(name)),
                        Ok(_) => Ok(DirEntry::file(name)),
                        Err(err) => Err(VFSError::from_host(&err, false)),
                    };
                    Some((item, dir))
                }
                Err(err) => Some((Err(VFSError::from_host(&err, true)), dir)),
            }
        })
        .boxed())
    }

    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        self.check_read()?;
        if path.is_root() {
            return Err(VFSError::IsADirectory);
        }
        let host = self.host_path(path);
        self.expect_file(&host).await?;
        let mut file = fs::File::open(&host)
            .await
            .map_err(|err| VFSError::from_host(&err, false))?;
        let mut turn = self.queue(&host).enqueue();
        let (mut writer, reader) = stream::pipe(self.high_water_mark);
        let chunk_size = self.high_water_mark.max(1);
        tokio::spawn(async move {
            turn.wait().await;
            if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
                writer.abort(err.to_string());
                return;
            }
            let mut remaining = length.unwrap_or(u64::MAX);
            let mut buf = vec![0u8; chunk_size];
            while remaining > 0 {
                let want = (buf.len() as u64).min(remaining) as usize;
                match file.read(&mut buf[..want]).await {
                    Ok(0) => break,
                    Ok(len) => {
                        remaining -= len as u64;
                        if let Err(err) = writer.write(buf[..len].to_vec()).await {
                            log::trace!("native read abandoned, {}", err);
                            return;
                        }
                    }
                    Err(err) => {
                        writer.abort(err.to_string());
                        return;
                    }
                }
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
        self.check_write()?;
        if path.is_root() {
            return Err(VFSError::IsADirectory);
        }
        let host = self.host_path(path);
        if create {
            if let Some(parent) = host.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| VFSError::from_host(&err, true))?;
            }
        }
        fs::OpenOptions::new()
            .write(true)
            .create(create)
            .open(&host)
            .await
            .map_err(|err| VFSError::from_host(&err, false))?;
        let mut turn = self.queue(&host).enqueue();
        let (writer, mut reader) = stream::pipe(self.high_water_mark);
        tokio::spawn(async move {
            let (_, incoming) = tokio::join!(turn.wait(), reader.read_to_end());
            match incoming {
                Ok(incoming) => {
                    if let Err(err) = commit(&host, mode, &incoming).await {
                        log::warn!("failed to write {:?}, {}", host, err);
                    }
                }
                Err(err) => log::debug!("native write discarded, {}", err),
            }
            drop(turn);
        });
        Ok(writer)
    }

    async fn delete_node(&self, path: &VPath, recursive: bool) -> Result<(), VFSError> {
        self.check_write()?;
        if path.is_root() {
            return Err(VFSError::Busy);
        }
        let host = self.host_path(path);
        let metadata = match fs::symlink_metadata(&host).await {
            Ok(metadata) => metadata,
            Err(err) => {
                return match VFSError::from_host(&err, true) {
                    VFSError::NotFound => Ok(()),
                    other => Err(other),
                }
            }
        };
        let result = if !metadata.is_dir() {
            fs::remove_file(&host).await
        } else if recursive {
            fs::remove_dir_all(&host).await
        } else {
            fs::remove_dir(&host).await
        };
        match result.map_err(|err| VFSError::from_host(&err, false)) {
            Ok(()) | Err(VFSError::NotFound) => Ok(()),
            // some hosts report a non-empty directory as EEXIST
            Err(VFSError::Transport(_)) if metadata.is_dir() && !recursive => Err(VFSError::NotEmpty),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tokio::runtime::Runtime;

    #[test]
    fn host_round_trip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        Runtime::new().unwrap().block_on(async {
            let fs = NativeFS::new(dir.path(), HostPermissions::read_write());
            let path = VPath::parse("/notes/today.txt");

            let mut writer = fs.write_file(&path, WriteMode::Override, true).await.unwrap();
            writer.write(&b"hello"[..]).await.unwrap();
            writer.close();
            let mut writer = fs.write_file(&path, WriteMode::After, false).await.unwrap();
            writer.write(&b" world"[..]).await.unwrap();
            writer.close();

            let mut reader = fs.read_file(&path, 0, None).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"hello world"[..]);
            let mut reader = fs.read_file(&path, 6, Some(3)).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"wor"[..]);

            assert!(fs.access(&path).await.unwrap());
            assert!(!fs.access(&"/notes/missing".into()).await.unwrap());
            assert!(fs
                .resolve_uri(&path)
                .await
                .unwrap()
                .starts_with("file:///"));

            let listing: Vec<DirEntry> = fs
                .read_dir(&VPath::root())
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            assert_eq!(listing, vec![DirEntry::directory("notes")]);
        });
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes/today.txt")).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn idle_queues_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        Runtime::new().unwrap().block_on(async {
            let fs = NativeFS::new(dir.path(), HostPermissions::read_write());
            for n in 0..20 {
                let path = VPath::parse(&format!("/file{}", n));
                let mut writer = fs.write_file(&path, WriteMode::Override, true).await.unwrap();
                writer.write(&b"x"[..]).await.unwrap();
                writer.close();
                let mut reader = fs.read_file(&path, 0, None).await.unwrap();
                assert_eq!(reader.read_to_end().await.unwrap(), &b"x"[..]);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(fs.queue(&dir.path().join("other")));
            assert_eq!(fs.queues.lock().unwrap().len(), 1);
        });
    }

    #[test]
    fn host_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full/file"), "x").unwrap();
        Runtime::new().unwrap().block_on(async {
            let fs = NativeFS::new(dir.path(), HostPermissions::read_write());
            assert_eq!(
                fs.read_file(&"/missing".into(), 0, None).await.err(),
                Some(VFSError::NotFound)
            );
            assert_eq!(
                fs.read_file(&"/full".into(), 0, None).await.err(),
                Some(VFSError::IsADirectory)
            );
            assert_eq!(
                fs.read_dir(&"/full/file".into()).await.err(),
                Some(VFSError::NotADirectory)
            );
            assert_eq!(
                fs.write_file(&"/absent".into(), WriteMode::After, false)
                    .await
                    .err(),
                Some(VFSError::NotFound)
            );
            assert_eq!(
                fs.delete_node(&"/full".into(), false).await,
                Err(VFSError::NotEmpty)
            );
            assert_eq!(fs.delete_node(&VPath::root(), true).await, Err(VFSError::Busy));
            assert_eq!(fs.delete_node(&"/nothing/here".into(), false).await, Ok(()));
            fs.delete_node(&"/full".into(), true).await.unwrap();
        });
        assert!(!dir.path().join("full").exists());
    }

    #[test]
    fn read_only_host() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "data").unwrap();
        Runtime::new().unwrap().block_on(async {
            let fs = NativeFS::new(dir.path(), HostPermissions::read_only());
            let mut reader = fs.read_file(&"/file".into(), 0, None).await.unwrap();
            assert_eq!(reader.read_to_end().await.unwrap(), &b"data"[..]);
            assert_eq!(
                fs.write_file(&"/file".into(), WriteMode::Override, false)
                    .await
                    .err(),
                Some(VFSError::AccessDenied)
            );
            assert_eq!(
                fs.delete_node(&"/file".into(), false).await,
                Err(VFSError::AccessDenied)
            );
        });
    }
}
