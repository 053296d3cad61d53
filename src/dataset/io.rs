use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use error_stack::ResultExt;

use super::{Dataset, DatasetError};

/// Storage backend for [`Dataset`]s.
///
/// Implementors must be shareable across threads, since the per-variable
/// loop may hand the same backend to worker threads.
pub trait DatasetIo: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> error_stack::Result<Dataset, DatasetError>;

    /// Persist `dataset` to `path`, replacing anything already there.
    fn write(&self, path: &Path, dataset: &Dataset) -> error_stack::Result<(), DatasetError>;

    /// Remove the dataset at `path`. Removing a path that does not exist is not an error.
    fn remove(&self, path: &Path) -> error_stack::Result<(), DatasetError>;
}

/// A [`DatasetIo`] that never touches the filesystem.
#[derive(Debug, Default)]
pub struct MemoryIo {
    files: Mutex<HashMap<PathBuf, Dataset>>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a dataset directly, e.g. to set up an input granule.
    pub fn insert<P: Into<PathBuf>>(&self, path: P, dataset: Dataset) {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.insert(path.into(), dataset);
    }

    /// All paths currently stored, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<PathBuf> = files.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl DatasetIo for MemoryIo {
    fn exists(&self, path: &Path) -> bool {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.contains_key(path)
    }

    fn read(&self, path: &Path) -> error_stack::Result<Dataset, DatasetError> {
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .get(path)
            .cloned()
            .ok_or_else(|| DatasetError::CouldNotOpen(path.display().to_string()))
            .attach_printable("no such in-memory dataset")
    }

    fn write(&self, path: &Path, dataset: &Dataset) -> error_stack::Result<(), DatasetError> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.insert(path.to_path_buf(), dataset.clone());
        Ok(())
    }

    fn remove(&self, path: &Path) -> error_stack::Result<(), DatasetError> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.remove(path);
        Ok(())
    }
}
