//! CRDT document wrapper: project state plus the anti-entropy sync surface.
//!
//! The document holds three root maps:
//! - `files`: path → { content: Text, language, version, created_at, modified_at }
//! - `folders`: path → { name, children: [child paths] }
//! - `metadata`: { name, created_at, modified_at, schema_version }
//!
//! The folder tree is an arena keyed by path; children are stored as path
//! lists, never as back-references, so concurrent moves cannot form cycles.
//!
//! The room treats this type as a black box with four operations: `load`,
//! `save`, `apply_remote`, `generate_for`. Sync is the engine's own
//! bidirectional handshake: each side's [`PeerSyncState`] tracks what the
//! other is known to have, and a payload referencing unknown changes makes
//! the next `generate_for` request backfill instead of advancing.
//!
//! Peers bootstrap from a snapshot of this replica (`ProjectJoined`
//! document_state), so the root maps share identity across replicas.

use automerge::sync::{self, SyncDoc};
use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};

use crate::clock::unix_secs;

/// Errors from document operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document engine error: {0}")]
    Engine(#[from] automerge::AutomergeError),

    #[error("malformed sync payload: {0}")]
    BadSyncPayload(String),

    #[error("malformed sync state: {0}")]
    BadSyncState(String),

    #[error("corrupt document snapshot: {0}")]
    BadSnapshot(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("folder not found: {0}")]
    FolderNotFound(String),

    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("document corruption: {0}")]
    Corruption(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

mod keys {
    pub const FILES: &str = "files";
    pub const FOLDERS: &str = "folders";
    pub const METADATA: &str = "metadata";

    pub const CONTENT: &str = "content";
    pub const LANGUAGE: &str = "language";
    pub const VERSION: &str = "version";
    pub const NAME: &str = "name";
    pub const CHILDREN: &str = "children";
    pub const CREATED_AT: &str = "created_at";
    pub const MODIFIED_AT: &str = "modified_at";
    pub const SCHEMA_VERSION: &str = "schema_version";
}

const SCHEMA_VERSION: u64 = 1;

/// A file as read out of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct FileData {
    pub path: String,
    pub content: String,
    pub language: String,
    pub version: u64,
}

/// Opaque per-peer sync state. The engine owns its meaning; the server only
/// checkpoints and restores it.
#[derive(Debug)]
pub struct PeerSyncState {
    inner: sync::State,
}

impl Default for PeerSyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSyncState {
    pub fn new() -> Self {
        Self {
            inner: sync::State::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.inner.encode()
    }

    pub fn decode(bytes: &[u8]) -> DocumentResult<Self> {
        let inner = sync::State::decode(bytes)
            .map_err(|e| DocumentError::BadSyncState(e.to_string()))?;
        Ok(Self { inner })
    }
}

/// Collaborative project document.
pub struct Document {
    doc: AutoCommit,
}

impl Document {
    /// Create a fresh document with the root structure in place.
    pub fn new(project_name: &str) -> DocumentResult<Self> {
        let mut doc = AutoCommit::new();
        let now = unix_secs();

        doc.put_object(ROOT, keys::FILES, ObjType::Map)?;
        doc.put_object(ROOT, keys::FOLDERS, ObjType::Map)?;
        let metadata = doc.put_object(ROOT, keys::METADATA, ObjType::Map)?;
        doc.put(&metadata, keys::NAME, project_name)?;
        doc.put(&metadata, keys::CREATED_AT, now)?;
        doc.put(&metadata, keys::MODIFIED_AT, now)?;
        doc.put(&metadata, keys::SCHEMA_VERSION, SCHEMA_VERSION)?;

        Ok(Self { doc })
    }

    /// Restore from a snapshot; empty bytes yield a fresh document.
    pub fn load(project_name: &str, bytes: &[u8]) -> DocumentResult<Self> {
        if bytes.is_empty() {
            return Self::new(project_name);
        }
        let doc = AutoCommit::load(bytes)
            .map_err(|e| DocumentError::BadSnapshot(e.to_string()))?;
        Ok(Self { doc })
    }

    /// Produce a full snapshot.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Apply a persisted change batch (crash-recovery replay). Replaying a
    /// batch the snapshot already contains is a no-op: the engine
    /// deduplicates changes by hash.
    pub fn apply_change_batch(&mut self, batch: &[u8]) -> DocumentResult<()> {
        self.doc.load_incremental(batch)?;
        Ok(())
    }

    /// Drain the change bytes produced since the last save/drain.
    pub fn take_change_batch(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Integrate a remote sync payload for one peer.
    ///
    /// Returns the new change bytes to persist, or `None` if the payload
    /// carried nothing the document did not already have.
    pub fn apply_remote(
        &mut self,
        state: &mut PeerSyncState,
        payload: &[u8],
    ) -> DocumentResult<Option<Vec<u8>>> {
        let message = sync::Message::decode(payload)
            .map_err(|e| DocumentError::BadSyncPayload(e.to_string()))?;
        self.doc.sync().receive_sync_message(&mut state.inner, message)?;
        let delta = self.doc.save_incremental();
        Ok((!delta.is_empty()).then_some(delta))
    }

    /// Produce the next payload needed to bring a peer up to date.
    /// `None` means the peer is synchronized.
    pub fn generate_for(&mut self, state: &mut PeerSyncState) -> Option<Vec<u8>> {
        self.doc
            .sync()
            .generate_sync_message(&mut state.inner)
            .map(|m| m.encode())
    }

    // ─── File operations ──────────────────────────────────────────────

    /// Create a file at `path` with empty content.
    pub fn create_file(&mut self, path: &str, language: Option<&str>) -> DocumentResult<()> {
        let files = self.files_id()?;
        if self.doc.get(&files, path)?.is_some() {
            return Err(DocumentError::PathExists(path.to_string()));
        }

        let language = language
            .map(str::to_string)
            .unwrap_or_else(|| language_for_path(path).to_string());
        let now = unix_secs();

        let entry = self.doc.put_object(&files, path, ObjType::Map)?;
        self.doc.put_object(&entry, keys::CONTENT, ObjType::Text)?;
        self.doc.put(&entry, keys::LANGUAGE, language.as_str())?;
        self.doc.put(&entry, keys::VERSION, 1u64)?;
        self.doc.put(&entry, keys::CREATED_AT, now)?;
        self.doc.put(&entry, keys::MODIFIED_AT, now)?;

        self.attach_to_parent(path)?;
        self.touch_metadata()?;
        Ok(())
    }

    /// Create a folder at `path`.
    pub fn create_folder(&mut self, path: &str) -> DocumentResult<()> {
        let folders = self.folders_id()?;
        if self.doc.get(&folders, path)?.is_some() {
            return Err(DocumentError::PathExists(path.to_string()));
        }

        let name = leaf_name(path).to_string();
        let entry = self.doc.put_object(&folders, path, ObjType::Map)?;
        self.doc.put(&entry, keys::NAME, name.as_str())?;
        self.doc.put_object(&entry, keys::CHILDREN, ObjType::List)?;

        self.attach_to_parent(path)?;
        self.touch_metadata()?;
        Ok(())
    }

    /// Replace a file's entire content.
    pub fn set_file_content(&mut self, path: &str, content: &str) -> DocumentResult<()> {
        let text = self.file_text_id(path)?;
        let current_len = self.doc.text(&text)?.chars().count();
        self.doc.splice_text(&text, 0, current_len as isize, content)?;
        self.bump_file(path)?;
        Ok(())
    }

    /// Splice a file's content: delete `delete_count` characters at
    /// `position`, then insert `insert_text` there.
    pub fn splice_file(
        &mut self,
        path: &str,
        position: usize,
        delete_count: usize,
        insert_text: &str,
    ) -> DocumentResult<()> {
        let text = self.file_text_id(path)?;
        self.doc
            .splice_text(&text, position, delete_count as isize, insert_text)?;
        self.bump_file(path)?;
        Ok(())
    }

    /// Read a file.
    pub fn file(&self, path: &str) -> DocumentResult<Option<FileData>> {
        let files = self.files_id()?;
        let Some((Value::Object(ObjType::Map), entry)) = self.doc.get(&files, path)? else {
            return Ok(None);
        };

        let content = match self.doc.get(&entry, keys::CONTENT)? {
            Some((Value::Object(ObjType::Text), text)) => self.doc.text(&text)?,
            _ => String::new(),
        };
        let language = self
            .string_prop(&entry, keys::LANGUAGE)?
            .unwrap_or_else(|| "plaintext".to_string());
        let version = self.uint_prop(&entry, keys::VERSION)?.unwrap_or(1);

        Ok(Some(FileData {
            path: path.to_string(),
            content,
            language,
            version,
        }))
    }

    /// Rename (or move) a file or folder. Folder renames re-key every
    /// descendant path in the same change.
    pub fn rename_path(&mut self, from: &str, to: &str) -> DocumentResult<()> {
        let files = self.files_id()?;
        let folders = self.folders_id()?;

        if self.doc.get(&files, to)?.is_some() || self.doc.get(&folders, to)?.is_some() {
            return Err(DocumentError::PathExists(to.to_string()));
        }

        if self.doc.get(&files, from)?.is_some() {
            self.move_file_entry(from, to)?;
        } else if self.doc.get(&folders, from)?.is_some() {
            let children = self.folder_children(from)?;
            let entry = self.doc.put_object(&folders, to, ObjType::Map)?;
            self.doc.put(&entry, keys::NAME, leaf_name(to))?;
            let list = self.doc.put_object(&entry, keys::CHILDREN, ObjType::List)?;
            for (i, child) in children.iter().enumerate() {
                let new_child = format!("{}{}", to, &child[from.len()..]);
                self.doc.insert(&list, i, new_child.as_str())?;
                if self.folder_exists(child)? {
                    self.rename_path(child, &new_child)?;
                } else {
                    self.move_file_entry(child, &new_child)?;
                }
            }
            self.doc.delete(&folders, from)?;
        } else {
            return Err(DocumentError::FileNotFound(from.to_string()));
        }

        self.detach_from_parent(from)?;
        self.attach_to_parent(to)?;
        self.touch_metadata()?;
        Ok(())
    }

    /// Delete a file, or a folder and all its descendants, in one change.
    pub fn delete_path(&mut self, path: &str) -> DocumentResult<()> {
        let files = self.files_id()?;
        let folders = self.folders_id()?;

        if self.doc.get(&files, path)?.is_some() {
            self.doc.delete(&files, path)?;
        } else if self.doc.get(&folders, path)?.is_some() {
            for child in self.folder_children(path)? {
                self.delete_subtree(&child)?;
            }
            self.doc.delete(&folders, path)?;
        } else {
            return Err(DocumentError::FileNotFound(path.to_string()));
        }

        self.detach_from_parent(path)?;
        self.touch_metadata()?;
        Ok(())
    }

    /// All file paths.
    pub fn file_paths(&self) -> DocumentResult<Vec<String>> {
        let files = self.files_id()?;
        Ok(self.doc.keys(&files).collect())
    }

    pub fn file_count(&self) -> usize {
        self.files_id()
            .map(|id| self.doc.keys(&id).count())
            .unwrap_or(0)
    }

    pub fn folder_count(&self) -> usize {
        self.folders_id()
            .map(|id| self.doc.keys(&id).count())
            .unwrap_or(0)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn files_id(&self) -> DocumentResult<ObjId> {
        self.root_map(keys::FILES)
    }

    fn folders_id(&self) -> DocumentResult<ObjId> {
        self.root_map(keys::FOLDERS)
    }

    fn metadata_id(&self) -> DocumentResult<ObjId> {
        self.root_map(keys::METADATA)
    }

    fn root_map(&self, key: &str) -> DocumentResult<ObjId> {
        self.doc
            .get(ROOT, key)?
            .and_then(|(v, id)| matches!(v, Value::Object(ObjType::Map)).then_some(id))
            .ok_or_else(|| DocumentError::Corruption(format!("missing root map {key}")))
    }

    fn file_text_id(&self, path: &str) -> DocumentResult<ObjId> {
        let files = self.files_id()?;
        let Some((Value::Object(ObjType::Map), entry)) = self.doc.get(&files, path)? else {
            return Err(DocumentError::FileNotFound(path.to_string()));
        };
        match self.doc.get(&entry, keys::CONTENT)? {
            Some((Value::Object(ObjType::Text), text)) => Ok(text),
            _ => Err(DocumentError::Corruption(format!(
                "file {path} has no content text"
            ))),
        }
    }

    fn bump_file(&mut self, path: &str) -> DocumentResult<()> {
        let files = self.files_id()?;
        let Some((_, entry)) = self.doc.get(&files, path)? else {
            return Err(DocumentError::FileNotFound(path.to_string()));
        };
        let version = self.uint_prop(&entry, keys::VERSION)?.unwrap_or(0);
        self.doc.put(&entry, keys::VERSION, version + 1)?;
        self.doc.put(&entry, keys::MODIFIED_AT, unix_secs())?;
        self.touch_metadata()
    }

    fn touch_metadata(&mut self) -> DocumentResult<()> {
        let metadata = self.metadata_id()?;
        let prev = self.int_prop(&metadata, keys::MODIFIED_AT)?.unwrap_or(0);
        // modified_at is monotonically non-decreasing.
        self.doc
            .put(&metadata, keys::MODIFIED_AT, unix_secs().max(prev))?;
        Ok(())
    }

    fn folder_exists(&self, path: &str) -> DocumentResult<bool> {
        let folders = self.folders_id()?;
        Ok(self.doc.get(&folders, path)?.is_some())
    }

    fn folder_children(&self, path: &str) -> DocumentResult<Vec<String>> {
        let folders = self.folders_id()?;
        let Some((Value::Object(ObjType::Map), entry)) = self.doc.get(&folders, path)? else {
            return Err(DocumentError::FolderNotFound(path.to_string()));
        };
        let Some((Value::Object(ObjType::List), list)) = self.doc.get(&entry, keys::CHILDREN)?
        else {
            return Ok(Vec::new());
        };
        let len = self.doc.length(&list);
        let mut children = Vec::with_capacity(len);
        for i in 0..len {
            if let Some((Value::Scalar(s), _)) = self.doc.get(&list, i)? {
                if let ScalarValue::Str(child) = s.as_ref() {
                    children.push(child.to_string());
                }
            }
        }
        Ok(children)
    }

    fn delete_subtree(&mut self, path: &str) -> DocumentResult<()> {
        let files = self.files_id()?;
        if self.doc.get(&files, path)?.is_some() {
            self.doc.delete(&files, path)?;
            return Ok(());
        }
        if self.folder_exists(path)? {
            for child in self.folder_children(path)? {
                self.delete_subtree(&child)?;
            }
            let folders = self.folders_id()?;
            self.doc.delete(&folders, path)?;
        }
        Ok(())
    }

    fn move_file_entry(&mut self, from: &str, to: &str) -> DocumentResult<()> {
        let data = self
            .file(from)?
            .ok_or_else(|| DocumentError::FileNotFound(from.to_string()))?;
        let files = self.files_id()?;
        self.doc.delete(&files, from)?;

        let entry = self.doc.put_object(&files, to, ObjType::Map)?;
        let text = self.doc.put_object(&entry, keys::CONTENT, ObjType::Text)?;
        self.doc.splice_text(&text, 0, 0, &data.content)?;
        self.doc.put(&entry, keys::LANGUAGE, data.language.as_str())?;
        self.doc.put(&entry, keys::VERSION, data.version + 1)?;
        self.doc.put(&entry, keys::CREATED_AT, unix_secs())?;
        self.doc.put(&entry, keys::MODIFIED_AT, unix_secs())?;
        Ok(())
    }

    fn attach_to_parent(&mut self, path: &str) -> DocumentResult<()> {
        let Some(parent) = parent_path(path) else {
            return Ok(());
        };
        if !self.folder_exists(parent)? {
            return Ok(());
        }
        let children = self.folder_children(parent)?;
        if children.iter().any(|c| c == path) {
            return Ok(());
        }
        let folders = self.folders_id()?;
        let Some((_, entry)) = self.doc.get(&folders, parent)? else {
            return Ok(());
        };
        if let Some((Value::Object(ObjType::List), list)) =
            self.doc.get(&entry, keys::CHILDREN)?
        {
            let len = self.doc.length(&list);
            self.doc.insert(&list, len, path)?;
        }
        Ok(())
    }

    fn detach_from_parent(&mut self, path: &str) -> DocumentResult<()> {
        let Some(parent) = parent_path(path) else {
            return Ok(());
        };
        if !self.folder_exists(parent)? {
            return Ok(());
        }
        let folders = self.folders_id()?;
        let Some((_, entry)) = self.doc.get(&folders, parent)? else {
            return Ok(());
        };
        if let Some((Value::Object(ObjType::List), list)) =
            self.doc.get(&entry, keys::CHILDREN)?
        {
            let len = self.doc.length(&list);
            for i in 0..len {
                if let Some((Value::Scalar(s), _)) = self.doc.get(&list, i)? {
                    if let ScalarValue::Str(child) = s.as_ref() {
                        if child.as_str() == path {
                            self.doc.delete(&list, i)?;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn string_prop(&self, obj: &ObjId, prop: &str) -> DocumentResult<Option<String>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(obj, prop)? {
            if let ScalarValue::Str(text) = s.as_ref() {
                return Ok(Some(text.to_string()));
            }
        }
        Ok(None)
    }

    fn int_prop(&self, obj: &ObjId, prop: &str) -> DocumentResult<Option<i64>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(obj, prop)? {
            if let ScalarValue::Int(n) = s.as_ref() {
                return Ok(Some(*n));
            }
        }
        Ok(None)
    }

    fn uint_prop(&self, obj: &ObjId, prop: &str) -> DocumentResult<Option<u64>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(obj, prop)? {
            if let ScalarValue::Uint(n) = s.as_ref() {
                return Ok(Some(*n));
            }
        }
        Ok(None)
    }
}

/// Infer a language tag from a file extension.
pub fn language_for_path(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "md" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" => "html",
        "css" => "css",
        "sh" => "shell",
        "go" => "go",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        _ => "plaintext",
    }
}

fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(idx) if idx > 0 => Some(&path[..idx]),
        _ => None,
    }
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
