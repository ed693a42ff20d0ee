//! In-memory metadata tree collaborator.
//!
//! The tree's full semantic surface (path lookup, permissions, leases)
//! belongs to the request layer; what recovery needs is the mutation
//! surface behind the record vocabulary plus a canonical serializer, so a
//! restored-and-replayed tree can be compared byte-for-byte and written
//! back out as the next checkpoint.

use crate::record::LogRecord;
use cfs_error::{CfsError, Result};
use cfs_types::{ChunkId, ChunkVersion, FileId, NodeKind, SeqNo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Root directory id. Fixed for the life of the filesystem.
pub const ROOT_ID: FileId = FileId(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub kind: NodeKind,
    pub chunk_count: u64,
    pub file_size: u64,
    pub num_replicas: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub offset: u64,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
}

/// Aggregate shape of the tree, for operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    pub nodes: u64,
    pub dentries: u64,
    pub chunks: u64,
    pub applied_seq: u64,
    pub chunk_version_inc: u64,
}

#[derive(Debug)]
pub struct MetaTree {
    attrs: BTreeMap<FileId, FileAttr>,
    /// (parent dir, entry name) -> node id.
    dentries: BTreeMap<(FileId, String), FileId>,
    /// Per-file chunk list keyed by chunk start offset.
    chunks: BTreeMap<FileId, BTreeMap<u64, ChunkInfo>>,
    chunk_version_inc: u64,
    applied: SeqNo,
}

impl Default for MetaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaTree {
    /// An empty tree holding only the root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            ROOT_ID,
            FileAttr {
                kind: NodeKind::Dir,
                chunk_count: 0,
                file_size: 0,
                num_replicas: 0,
            },
        );
        Self {
            attrs,
            dentries: BTreeMap::new(),
            chunks: BTreeMap::new(),
            chunk_version_inc: 0,
            applied: SeqNo::ZERO,
        }
    }

    /// Highest mutation sequence number reflected in this tree.
    #[must_use]
    pub fn applied(&self) -> SeqNo {
        self.applied
    }

    pub fn set_applied(&mut self, seq: SeqNo) {
        self.applied = seq;
    }

    #[must_use]
    pub fn chunk_version_inc(&self) -> u64 {
        self.chunk_version_inc
    }

    #[must_use]
    pub fn lookup(&self, dir: FileId, name: &str) -> Option<FileId> {
        self.dentries.get(&(dir, name.to_owned())).copied()
    }

    #[must_use]
    pub fn attr(&self, id: FileId) -> Option<&FileAttr> {
        self.attrs.get(&id)
    }

    #[must_use]
    pub fn chunks_of(&self, id: FileId) -> Vec<ChunkInfo> {
        self.chunks
            .get(&id)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn summary(&self) -> TreeSummary {
        TreeSummary {
            nodes: self.attrs.len() as u64,
            dentries: self.dentries.len() as u64,
            chunks: self.chunks.values().map(|m| m.len() as u64).sum(),
            applied_seq: self.applied.0,
            chunk_version_inc: self.chunk_version_inc,
        }
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains('\n') {
            return Err(CfsError::Format(format!(
                "invalid entry name: {name:?} (must be nonempty, no `/` or newline)"
            )));
        }
        Ok(())
    }

    fn require_dir(&self, dir: FileId) -> Result<()> {
        match self.attrs.get(&dir) {
            Some(attr) if attr.kind == NodeKind::Dir => Ok(()),
            Some(_) => Err(CfsError::Format(format!("node {dir} is not a directory"))),
            None => Err(CfsError::NotFound(format!("directory {dir}"))),
        }
    }

    pub fn create(&mut self, dir: FileId, name: &str, id: FileId, num_replicas: u16) -> Result<()> {
        Self::check_name(name)?;
        self.require_dir(dir)?;
        self.dentries.insert((dir, name.to_owned()), id);
        self.attrs.insert(
            id,
            FileAttr {
                kind: NodeKind::File,
                chunk_count: 0,
                file_size: 0,
                num_replicas,
            },
        );
        Ok(())
    }

    pub fn mkdir(&mut self, dir: FileId, name: &str, id: FileId) -> Result<()> {
        Self::check_name(name)?;
        self.require_dir(dir)?;
        self.dentries.insert((dir, name.to_owned()), id);
        self.attrs.insert(
            id,
            FileAttr {
                kind: NodeKind::Dir,
                chunk_count: 0,
                file_size: 0,
                num_replicas: 0,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, dir: FileId, name: &str) -> Result<()> {
        let id = self
            .dentries
            .remove(&(dir, name.to_owned()))
            .ok_or_else(|| CfsError::NotFound(format!("{dir}/{name}")))?;
        self.attrs.remove(&id);
        self.chunks.remove(&id);
        Ok(())
    }

    pub fn rmdir(&mut self, dir: FileId, name: &str) -> Result<()> {
        self.remove(dir, name)
    }

    pub fn rename(&mut self, dir: FileId, old: &str, new: &str) -> Result<()> {
        Self::check_name(new)?;
        let id = self
            .dentries
            .remove(&(dir, old.to_owned()))
            .ok_or_else(|| CfsError::NotFound(format!("{dir}/{old}")))?;
        self.dentries.insert((dir, new.to_owned()), id);
        Ok(())
    }

    pub fn allocate(
        &mut self,
        file: FileId,
        offset: u64,
        chunk_id: ChunkId,
        version: ChunkVersion,
    ) -> Result<()> {
        let attr = self
            .attrs
            .get_mut(&file)
            .ok_or_else(|| CfsError::NotFound(format!("file {file}")))?;
        let per_file = self.chunks.entry(file).or_default();
        let replaced = per_file.insert(
            offset,
            ChunkInfo {
                offset,
                chunk_id,
                version,
            },
        );
        if replaced.is_none() {
            attr.chunk_count = attr.chunk_count.saturating_add(1);
        }
        Ok(())
    }

    pub fn truncate(&mut self, file: FileId, offset: u64) -> Result<()> {
        let attr = self
            .attrs
            .get_mut(&file)
            .ok_or_else(|| CfsError::NotFound(format!("file {file}")))?;
        attr.file_size = offset;
        if let Some(per_file) = self.chunks.get_mut(&file) {
            per_file.retain(|chunk_offset, _| *chunk_offset < offset);
            attr.chunk_count = per_file.len() as u64;
        }
        Ok(())
    }

    pub fn set_chunk_version_inc(&mut self, value: u64) {
        self.chunk_version_inc = value;
    }

    /// Restore-side insert of a bare attribute record.
    pub(crate) fn insert_attr(&mut self, id: FileId, attr: FileAttr) {
        self.attrs.insert(id, attr);
    }

    /// Restore-side insert of a bare dentry record.
    pub(crate) fn insert_dentry(&mut self, parent: FileId, name: String, id: FileId) {
        self.dentries.insert((parent, name), id);
    }

    /// Restore-side insert of a bare chunk record.
    pub(crate) fn insert_chunk(&mut self, file: FileId, info: ChunkInfo) {
        self.chunks.entry(file).or_default().insert(info.offset, info);
    }

    /// Apply one logged mutation (sequence accounting is the replayer's
    /// concern, not the tree's).
    pub fn apply(&mut self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Create {
                dir,
                name,
                id,
                num_replicas,
            } => self.create(*dir, name, *id, *num_replicas),
            LogRecord::Mkdir { dir, name, id } => self.mkdir(*dir, name, *id),
            LogRecord::Remove { dir, name } => self.remove(*dir, name),
            LogRecord::Rmdir { dir, name } => self.rmdir(*dir, name),
            LogRecord::Rename { dir, old, new } => self.rename(*dir, old, new),
            LogRecord::Allocate {
                file,
                offset,
                chunk_id,
                version,
            } => self.allocate(*file, *offset, *chunk_id, *version),
            LogRecord::Truncate { file, offset } => self.truncate(*file, *offset),
            LogRecord::ChunkVersionInc { value } => {
                self.set_chunk_version_inc(*value);
                Ok(())
            }
        }
    }

    /// Canonical checkpoint-body serialization.
    ///
    /// Deterministic by construction (all maps iterate in key order), so
    /// identical trees serialize to identical bytes.
    #[must_use]
    pub fn serialize_body(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "version/1");
        let _ = writeln!(out, "checkpoint/{}", self.applied);
        let _ = writeln!(out, "chunkVersionInc/{}", self.chunk_version_inc);
        for (id, attr) in &self.attrs {
            let _ = writeln!(
                out,
                "fattr/{}/id/{}/chunkcount/{}/filesize/{}/numReplicas/{}",
                attr.kind.as_str(),
                id,
                attr.chunk_count,
                attr.file_size,
                attr.num_replicas
            );
        }
        for ((parent, name), id) in &self.dentries {
            let _ = writeln!(out, "dentry/name/{name}/id/{id}/parent/{parent}");
        }
        for (file, per_file) in &self.chunks {
            for info in per_file.values() {
                let _ = writeln!(
                    out,
                    "chunkinfo/fid/{}/chunkid/{}/offset/{}/chunkVersion/{}",
                    file, info.chunk_id, info.offset, info.version
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> MetaTree {
        let mut tree = MetaTree::new();
        tree.mkdir(ROOT_ID, "home", FileId(3)).expect("mkdir");
        tree.create(FileId(3), "a.dat", FileId(10), 3).expect("create");
        tree.allocate(FileId(10), 0, ChunkId(500), ChunkVersion(1))
            .expect("allocate");
        tree.allocate(FileId(10), cfs_types::CHUNK_SIZE, ChunkId(501), ChunkVersion(1))
            .expect("allocate second");
        tree.set_chunk_version_inc(4);
        tree.set_applied(SeqNo(12));
        tree
    }

    #[test]
    fn create_then_lookup() {
        let tree = populated();
        assert_eq!(tree.lookup(ROOT_ID, "home"), Some(FileId(3)));
        assert_eq!(tree.lookup(FileId(3), "a.dat"), Some(FileId(10)));
        let attr = tree.attr(FileId(10)).expect("file attr");
        assert_eq!(attr.kind, NodeKind::File);
        assert_eq!(attr.chunk_count, 2);
    }

    #[test]
    fn remove_drops_attr_and_chunks() {
        let mut tree = populated();
        tree.remove(FileId(3), "a.dat").expect("remove");
        assert_eq!(tree.lookup(FileId(3), "a.dat"), None);
        assert!(tree.attr(FileId(10)).is_none());
        assert!(tree.chunks_of(FileId(10)).is_empty());
    }

    #[test]
    fn rename_moves_the_entry() {
        let mut tree = populated();
        tree.rename(FileId(3), "a.dat", "b.dat").expect("rename");
        assert_eq!(tree.lookup(FileId(3), "a.dat"), None);
        assert_eq!(tree.lookup(FileId(3), "b.dat"), Some(FileId(10)));
    }

    #[test]
    fn truncate_drops_chunks_past_the_cut() {
        let mut tree = populated();
        tree.truncate(FileId(10), cfs_types::CHUNK_SIZE).expect("truncate");
        let chunks = tree.chunks_of(FileId(10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, ChunkId(500));
        assert_eq!(tree.attr(FileId(10)).expect("attr").chunk_count, 1);
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let mut tree = MetaTree::new();
        assert!(tree.mkdir(ROOT_ID, "a/b", FileId(3)).is_err());
        assert!(tree.mkdir(ROOT_ID, "", FileId(3)).is_err());
    }

    #[test]
    fn mutations_on_missing_nodes_fail() {
        let mut tree = MetaTree::new();
        assert!(tree.create(FileId(99), "x", FileId(5), 1).is_err());
        assert!(tree.remove(ROOT_ID, "ghost").is_err());
        assert!(
            tree.allocate(FileId(42), 0, ChunkId(1), ChunkVersion(1))
                .is_err()
        );
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = populated();
        let b = populated();
        assert_eq!(a.serialize_body(), b.serialize_body());

        // Insertion order must not matter.
        let mut c = MetaTree::new();
        c.mkdir(ROOT_ID, "home", FileId(3)).expect("mkdir");
        c.create(FileId(3), "a.dat", FileId(10), 3).expect("create");
        c.allocate(FileId(10), cfs_types::CHUNK_SIZE, ChunkId(501), ChunkVersion(1))
            .expect("allocate");
        c.allocate(FileId(10), 0, ChunkId(500), ChunkVersion(1))
            .expect("allocate");
        c.set_chunk_version_inc(4);
        c.set_applied(SeqNo(12));
        assert_eq!(a.serialize_body(), c.serialize_body());
    }
}
