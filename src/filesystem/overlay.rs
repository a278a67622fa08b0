use crate::{
    errors::VFSError,
    filesystem::{Driver, VPath},
    protocol::{DirEntry, WriteMode},
    stream::{ByteReader, ByteWriter, EntryStream},
};
use async_trait::async_trait;
use futures_util::{
    future,
    stream::{self, StreamExt},
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, RwLock},
};

/// Composite filesystem that routes each path to the driver mounted at its
/// deepest matching prefix
#[derive(Default)]
pub struct OverlayFS {
    root: RwLock<MountNode>,
}

#[derive(Default)]
struct MountNode {
    driver: Option<Arc<dyn Driver>>,
    children: BTreeMap<String, MountNode>,
}

/// Outcome of routing one path through the mount table
pub struct Resolved {
    pub driver: Arc<dyn Driver>,
    /// Where the winning driver is mounted
    pub mount_point: VPath,
    /// Path to forward to the driver, relative to its mount point
    pub remainder: VPath,
    /// Mount points directly below the requested path, if any
    pub mounted_children: Vec<String>,
}

impl OverlayFS {
    pub fn new() -> Self {
        OverlayFS::default()
    }

    /// Attach a driver at `path`
    ///
    /// Fails if another driver is already mounted at exactly the same path.
    pub fn mount(&self, path: &VPath, driver: Arc<dyn Driver>) -> Result<(), VFSError> {
        let mut root = self.root.write().unwrap_or_else(|p| p.into_inner());
        let mut node = &mut *root;
        for segment in path.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        if node.driver.is_some() {
            return Err(VFSError::AlreadyMounted(path.to_string()));
        }
        log::debug!("mount {}", path);
        node.driver = Some(driver);
        Ok(())
    }

    /// Detach and return the driver mounted at exactly `path`
    pub fn unmount(&self, path: &VPath) -> Result<Arc<dyn Driver>, VFSError> {
        let mut root = self.root.write().unwrap_or_else(|p| p.into_inner());
        let driver = take_driver(&mut root, path.segments()).ok_or(VFSError::NotFound)?;
        log::debug!("unmount {}", path);
        Ok(driver)
    }

    /// Every path that currently has a driver attached, in tree order
    pub fn mounts(&self) -> Vec<VPath> {
        fn walk(node: &MountNode, path: &VPath, out: &mut Vec<VPath>) {
            if node.driver.is_some() {
                out.push(path.clone());
            }
            for (name, child) in &node.children {
                walk(child, &path.join(name), out);
            }
        }
        let root = self.root.read().unwrap_or_else(|p| p.into_inner());
        let mut result = Vec::new();
        walk(&root, &VPath::root(), &mut result);
        result
    }

    /// Find the driver responsible for `path`
    pub fn resolve(&self, path: &VPath) -> Result<Resolved, VFSError> {
        let root = self.root.read().unwrap_or_else(|p| p.into_inner());
        let mut found = root.driver.clone().map(|driver| (driver, 0));
        let mut node = Some(&*root);
        for (depth, segment) in path.segments().iter().enumerate() {
            node = node.and_then(|node| node.children.get(segment));
            match node {
                None => break,
                Some(node) => {
                    if let Some(driver) = &node.driver {
                        found = Some((driver.clone(), depth + 1));
                    }
                }
            }
        }
        let (driver, depth) = found.ok_or(VFSError::NotFound)?;
        Ok(Resolved {
            driver,
            mount_point: VPath::from_segments(&path.segments()[..depth]),
            remainder: path.skip(depth),
            mounted_children: node
                .map(|node| node.children.keys().cloned().collect())
                .unwrap_or_default(),
        })
    }
}

fn take_driver(node: &mut MountNode, segments: &[String]) -> Option<Arc<dyn Driver>> {
    match segments.split_first() {
        None => node.driver.take(),
        Some((first, rest)) => {
            let child = node.children.get_mut(first)?;
            let driver = take_driver(child, rest);
            if child.driver.is_none() && child.children.is_empty() {
                node.children.remove(first);
            }
            driver
        }
    }
}

#[async_trait]
impl Driver for OverlayFS {
    async fn resolve_uri(&self, path: &VPath) -> Result<String, VFSError> {
        let resolved = self.resolve(path)?;
        resolved.driver.resolve_uri(&resolved.remainder).await
    }

    async fn access(&self, path: &VPath) -> Result<bool, VFSError> {
        let resolved = self.resolve(path)?;
        resolved.driver.access(&resolved.remainder).await
    }

    async fn read_dir(&self, path: &VPath) -> Result<EntryStream, VFSError> {
        let resolved = self.resolve(path)?;
        let mut synthesized = vec![DirEntry::directory("."), DirEntry::directory("..")];
        synthesized.extend(
            resolved
                .mounted_children
                .iter()
                .map(|name| DirEntry::directory(name.as_str())),
        );
        let listed = match resolved.driver.read_dir(&resolved.remainder).await {
            Ok(listed) => listed,
            Err(VFSError::NotFound) if !resolved.mounted_children.is_empty() => {
                stream::empty().boxed()
            }
            Err(err) => return Err(err),
        };
        let hidden: HashSet<String> = synthesized.iter().map(|e| e.name.clone()).collect();
        let listed = listed.filter(move |entry| {
            future::ready(match entry {
                Ok(entry) => !hidden.contains(&entry.name),
                Err(_) => true,
            })
        });
        Ok(stream::iter(synthesized.into_iter().map(Ok))
            .chain(listed)
            .boxed())
    }

    async fn read_file(
        &self,
        path: &VPath,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteReader, VFSError> {
        let resolved = self.resolve(path)?;
        resolved
            .driver
            .read_file(&resolved.remainder, offset, length)
            .await
    }

    async fn write_file(
        &self,
        path: &VPath,
        mode: WriteMode,
        create: bool,
    ) -> Result<ByteWriter, VFSError> {
        let resolved = self.resolve(path)?;
        resolved
            .driver
            .write_file(&resolved.remainder, mode, create)
            .await
    }

    async fn delete_node(&self, path: &VPath, recursive: bool) -> Result<(), VFSError> {
        let resolved = self.resolve(path)?;
        if resolved.remainder.is_root() && !resolved.mount_point.is_root() {
            return Err(VFSError::Busy);
        }
        resolved
            .driver
            .delete_node(&resolved.remainder, recursive)
            .await
    }
}
