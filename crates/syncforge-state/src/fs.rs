//! Local file-tree destination.
//!
//! A key `a/b/c` maps to `<root>/a/b/c.json`. Documents are written to a
//! sibling temp file and renamed into place, so readers never observe a
//! half-written document. Batches are not atomic: a failure mid-batch leaves
//! the earlier writes of that batch applied.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use syncforge_types::write::{DestinationKey, StoredDocument, WriteKind, WriteOperation};

use crate::backend::{BucketReader, Destination, DEFAULT_MAX_BATCH_SIZE};
use crate::error::{self, StateError};

const DOCUMENT_EXT: &str = "json";
const TEMP_EXT: &str = "json.tmp";

/// Stores each document as a pretty-printed JSON file under a root directory.
pub struct FileTreeStore {
    name: String,
    max_batch_size: usize,
    root: PathBuf,
}

impl FileTreeStore {
    /// Create a store rooted at `root`. The directory is created on first
    /// write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "files".to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            root: root.into(),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory cannot be created.
    pub fn ensure_root(&self) -> error::Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Map a key to its directory path (no extension). Rejects segments that
    /// would escape the root or collapse.
    fn key_path(&self, key: &DestinationKey) -> error::Result<PathBuf> {
        let mut path = self.root.clone();
        let mut segments = 0usize;
        for segment in key.as_str().split('/') {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('\\')
                || segment.contains('\0')
            {
                return Err(StateError::InvalidKey(key.to_string()));
            }
            path.push(segment);
            segments += 1;
        }
        if segments == 0 {
            return Err(StateError::InvalidKey(key.to_string()));
        }
        Ok(path)
    }

    fn document_path(&self, key: &DestinationKey) -> error::Result<PathBuf> {
        let mut path = self.key_path(key)?.into_os_string();
        path.push(".");
        path.push(DOCUMENT_EXT);
        Ok(PathBuf::from(path))
    }

    fn write_document(&self, key: &DestinationKey, payload: &serde_json::Value) -> error::Result<()> {
        let target = self.document_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = target.with_extension(TEMP_EXT);
        let bytes = serde_json::to_vec_pretty(payload)?;
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn remove_document(&self, key: &DestinationKey) -> error::Result<()> {
        let target = self.document_path(key)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Key for a document file relative to the root, or `None` for files
    /// that are not documents.
    fn key_for_file(&self, path: &Path) -> Option<DestinationKey> {
        if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXT) {
            return None;
        }
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let segments = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(DestinationKey::from_segments(segments))
    }

    fn collect_documents(&self, dir: &Path, out: &mut Vec<StoredDocument>) -> error::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_documents(&path, out)?;
            } else if let Some(key) = self.key_for_file(&path) {
                out.push(self.read_document(key, &path)?);
            }
        }
        Ok(())
    }

    fn read_document(&self, key: DestinationKey, path: &Path) -> error::Result<StoredDocument> {
        let bytes = fs::read(path)?;
        let payload = serde_json::from_slice(&bytes)?;
        Ok(StoredDocument { key, payload })
    }
}

impl Destination for FileTreeStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn commit_batch(&self, ops: &[WriteOperation]) -> error::Result<()> {
        for op in ops {
            match op.kind {
                WriteKind::Set => self.write_document(&op.key, &op.payload)?,
                WriteKind::Delete => self.remove_document(&op.key)?,
            }
        }
        Ok(())
    }
}

impl BucketReader for FileTreeStore {
    fn read_prefix(&self, prefix: &DestinationKey) -> error::Result<Vec<StoredDocument>> {
        let mut documents = Vec::new();
        if prefix.as_str().is_empty() {
            self.collect_documents(&self.root, &mut documents)?;
        } else {
            let base = self.key_path(prefix)?;
            let exact = self.document_path(prefix)?;
            if exact.is_file() {
                documents.push(self.read_document(prefix.clone(), &exact)?);
            }
            self.collect_documents(&base, &mut documents)?;
        }
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        tracing::debug!(
            destination = self.name.as_str(),
            prefix = prefix.as_str(),
            documents = documents.len(),
            "Read documents from file tree"
        );
        Ok(documents)
    }
}
