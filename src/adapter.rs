//! `Filesystem` facade: the POSIX-shaped surface a kernel adapter (FUSE or otherwise) calls into.
//!
//! Grounded in `original_source/src/filesystem/fuse_binding.py`'s `FuseOps` — same operation set,
//! same file-handle indirection (`fh`/`hf`/`itable`), rebuilt from scratch at mount time rather
//! than persisted, since handles are only meaningful for the lifetime of one mount.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::dag::DagError;
use crate::inode::InodeStore;
use crate::ktree::{KTree, KTreeError, ROOT_ID};

#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("no such entry")]
    NotFound,
    #[error("rename would create a cycle")]
    WouldCycle,
    #[error("directory is not empty")]
    NotEmpty,
    #[error(transparent)]
    Dag(#[from] DagError),
}

impl From<KTreeError> for FilesystemError {
    fn from(err: KTreeError) -> Self {
        match err {
            KTreeError::NoSuchParent(_) => FilesystemError::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub inode: i64,
    pub is_file: bool,
    pub mode: u32,
    pub size: u64,
    pub mtime_nanos: u128,
}

/// Translates between a kernel's handle numbering and the K-Tree's 64-bit inode ids, and
/// dispatches POSIX-shaped calls to the K-Tree (namespace) and Inode Store (content).
pub struct Filesystem {
    ktree: Arc<Mutex<KTree>>,
    inode_store: Arc<Mutex<InodeStore>>,
    started_at_nanos: u128,
    handle_of_inode: StdMutex<HashMap<i64, u64>>,
    inode_of_handle: StdMutex<HashMap<u64, i64>>,
    next_handle: AtomicU64,
}

impl Filesystem {
    pub fn new(ktree: Arc<Mutex<KTree>>, inode_store: Arc<Mutex<InodeStore>>) -> Self {
        let fs = Filesystem {
            ktree,
            inode_store,
            started_at_nanos: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before unix epoch")
                .as_nanos(),
            handle_of_inode: StdMutex::new(HashMap::new()),
            inode_of_handle: StdMutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        };
        fs.fh(ROOT_ID);
        fs
    }

    fn fh(&self, inode: i64) -> u64 {
        let mut handle_of_inode = self.handle_of_inode.lock().expect("fh table poisoned");
        if let Some(handle) = handle_of_inode.get(&inode) {
            return *handle;
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        handle_of_inode.insert(inode, handle);
        self.inode_of_handle
            .lock()
            .expect("fh table poisoned")
            .insert(handle, inode);
        handle
    }

    fn hf(&self, handle: u64) -> Option<i64> {
        self.inode_of_handle
            .lock()
            .expect("fh table poisoned")
            .get(&handle)
            .copied()
    }

    pub async fn lookup(&self, parent: i64, name: &str) -> Result<Attr, FilesystemError> {
        let child = {
            let tree = self.ktree.lock().await;
            tree.lookup(parent, name).ok_or(FilesystemError::NotFound)?
        };
        self.getattr(child).await
    }

    pub async fn getattr(&self, inode: i64) -> Result<Attr, FilesystemError> {
        self.fh(inode);
        let is_file = (inode as u64) & (1 << 63) != 0;
        let size = if is_file {
            let mut store = self.inode_store.lock().await;
            store.size(inode).await? as u64
        } else {
            0
        };
        let mtime_nanos = {
            let store = self.inode_store.lock().await;
            store.modified_at(inode).unwrap_or(self.started_at_nanos)
        };
        Ok(Attr {
            inode,
            is_file,
            mode: 0o777,
            size,
            mtime_nanos,
        })
    }

    pub async fn open(&self, inode: i64) -> Result<u64, FilesystemError> {
        Ok(self.fh(inode))
    }

    pub async fn opendir(&self, inode: i64) -> Result<u64, FilesystemError> {
        Ok(self.fh(inode))
    }

    pub async fn create(&self, parent: i64, name: &str) -> Result<(u64, Attr), FilesystemError> {
        let inode = {
            let mut tree = self.ktree.lock().await;
            tree.mkf(parent, name.to_string())?
        };
        let attr = self.getattr(inode).await?;
        Ok((self.fh(inode), attr))
    }

    pub async fn mkdir(&self, parent: i64, name: &str) -> Result<Attr, FilesystemError> {
        let inode = {
            let mut tree = self.ktree.lock().await;
            tree.mkdir(parent, name.to_string())?
        };
        self.getattr(inode).await
    }

    pub async fn read(&self, handle: u64, offset: usize, size: usize) -> Result<Vec<u8>, FilesystemError> {
        let inode = self.hf(handle).ok_or(FilesystemError::NotFound)?;
        let mut store = self.inode_store.lock().await;
        Ok(store.read(inode, offset, size).await?)
    }

    pub async fn write(&self, handle: u64, offset: usize, buf: &[u8]) -> Result<usize, FilesystemError> {
        let inode = self.hf(handle).ok_or(FilesystemError::NotFound)?;
        let mut store = self.inode_store.lock().await;
        Ok(store.write(inode, offset, buf).await?)
    }

    pub async fn readdir(&self, handle: u64) -> Result<Vec<(String, Attr)>, FilesystemError> {
        let inode = self.hf(handle).ok_or(FilesystemError::NotFound)?;
        let entries = {
            let tree = self.ktree.lock().await;
            tree.list(inode)
        };
        let mut result = Vec::with_capacity(entries.len());
        for (name, child) in entries {
            result.push((name, self.getattr(child).await?));
        }
        Ok(result)
    }

    pub async fn rmdir(&self, parent: i64, name: &str) -> Result<(), FilesystemError> {
        let mut tree = self.ktree.lock().await;
        let id = tree.lookup(parent, name).ok_or(FilesystemError::NotFound)?;
        if !tree.list(id).is_empty() {
            return Err(FilesystemError::NotEmpty);
        }
        tree.remove(id)?;
        Ok(())
    }

    pub async fn unlink(&self, parent: i64, name: &str) -> Result<(), FilesystemError> {
        self.rmdir(parent, name).await
    }

    pub async fn rename(
        &self,
        old_parent: i64,
        old_name: &str,
        new_parent: i64,
        new_name: &str,
    ) -> Result<(), FilesystemError> {
        let mut tree = self.ktree.lock().await;
        let id = tree
            .lookup(old_parent, old_name)
            .ok_or(FilesystemError::NotFound)?;
        if tree.would_create_cycle(id, new_parent) {
            return Err(FilesystemError::WouldCycle);
        }
        tree.rename(id, new_parent, new_name.to_string())?;
        Ok(())
    }

    pub async fn fsync(&self) -> Result<(), FilesystemError> {
        {
            let tree = self.ktree.lock().await;
            tree.fsync().await?;
        }
        let mut store = self.inode_store.lock().await;
        store.fsync().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktree::KTree;

    fn fixture(replica: i64) -> Filesystem {
        let ktree = KTree::new_tree(
            std::path::PathBuf::from(format!("/tmp/adapter-test-ktree-{replica}.json")),
            replica,
        );
        let inode_store = InodeStore::new(
            std::path::PathBuf::from(format!("/tmp/adapter-test-inodes-{replica}")),
            replica,
        );
        Filesystem::new(Arc::new(Mutex::new(ktree)), Arc::new(Mutex::new(inode_store)))
    }

    #[tokio::test]
    async fn rmdir_on_nonempty_directory_is_rejected() {
        let fs = fixture(1);
        let dir = fs.mkdir(ROOT_ID, "docs").await.unwrap();
        fs.create(dir.inode, "notes.txt").await.unwrap();
        let err = fs.rmdir(ROOT_ID, "docs").await.unwrap_err();
        assert!(matches!(err, FilesystemError::NotEmpty));
    }

    #[tokio::test]
    async fn rmdir_on_empty_directory_succeeds() {
        let fs = fixture(2);
        fs.mkdir(ROOT_ID, "empty").await.unwrap();
        fs.rmdir(ROOT_ID, "empty").await.unwrap();
        assert!(fs.lookup(ROOT_ID, "empty").await.is_err());
    }
}
