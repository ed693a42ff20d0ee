//! Line-oriented record codec for checkpoints and operation logs.
//!
//! One record per line; fields are `/`-separated with `key/value`
//! alternation after the leading keyword, e.g.
//! `create/dir/2/name/a.txt/id/17/numReplicas/3/seq/42`. Names therefore
//! must not contain `/` or newlines; the tree mutators enforce that.

use cfs_error::{CfsError, Result};
use cfs_types::{ChunkId, ChunkVersion, FileId, SeqNo};
use std::fmt::Write as _;

/// Cursor over the `/`-separated fields of one record line.
pub(crate) struct FieldCursor<'a> {
    parts: std::str::Split<'a, char>,
    line: u64,
}

impl<'a> FieldCursor<'a> {
    pub(crate) fn new(text: &'a str, line: u64) -> Self {
        Self {
            parts: text.split('/'),
            line,
        }
    }

    pub(crate) fn malformed(&self, detail: impl Into<String>) -> CfsError {
        CfsError::MalformedRecord {
            line: self.line,
            detail: detail.into(),
        }
    }

    pub(crate) fn next_raw(&mut self, what: &str) -> Result<&'a str> {
        self.parts
            .next()
            .ok_or_else(|| self.malformed(format!("missing {what}")))
    }

    /// Consume `key/<value>` and return the raw value.
    pub(crate) fn kv_raw(&mut self, key: &str) -> Result<&'a str> {
        let found = self.next_raw(key)?;
        if found != key {
            return Err(self.malformed(format!("expected field `{key}`, found `{found}`")));
        }
        self.next_raw(key)
    }

    pub(crate) fn kv_u64(&mut self, key: &str) -> Result<u64> {
        let raw = self.kv_raw(key)?;
        raw.parse::<u64>()
            .map_err(|_| self.malformed(format!("field `{key}` is not a number: `{raw}`")))
    }

    pub(crate) fn kv_u16(&mut self, key: &str) -> Result<u16> {
        let raw = self.kv_raw(key)?;
        raw.parse::<u16>()
            .map_err(|_| self.malformed(format!("field `{key}` is not a number: `{raw}`")))
    }

    /// A bare positional value (no key), parsed as u64.
    pub(crate) fn bare_u64(&mut self, what: &str) -> Result<u64> {
        let raw = self.next_raw(what)?;
        raw.parse::<u64>()
            .map_err(|_| self.malformed(format!("{what} is not a number: `{raw}`")))
    }

    /// Fail unless every field has been consumed.
    pub(crate) fn finish(mut self) -> Result<()> {
        if let Some(extra) = self.parts.next() {
            return Err(self.malformed(format!("trailing field `{extra}`")));
        }
        Ok(())
    }
}

/// One logged metadata mutation, without its sequence tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Create {
        dir: FileId,
        name: String,
        id: FileId,
        num_replicas: u16,
    },
    Mkdir {
        dir: FileId,
        name: String,
        id: FileId,
    },
    Remove {
        dir: FileId,
        name: String,
    },
    Rmdir {
        dir: FileId,
        name: String,
    },
    Rename {
        dir: FileId,
        old: String,
        new: String,
    },
    Allocate {
        file: FileId,
        offset: u64,
        chunk_id: ChunkId,
        version: ChunkVersion,
    },
    Truncate {
        file: FileId,
        offset: u64,
    },
    ChunkVersionInc {
        value: u64,
    },
}

impl LogRecord {
    /// Render the record as a log line carrying its sequence tag.
    #[must_use]
    pub fn to_line(&self, seq: SeqNo) -> String {
        let mut out = String::new();
        match self {
            Self::Create {
                dir,
                name,
                id,
                num_replicas,
            } => {
                let _ = write!(
                    out,
                    "create/dir/{dir}/name/{name}/id/{id}/numReplicas/{num_replicas}"
                );
            }
            Self::Mkdir { dir, name, id } => {
                let _ = write!(out, "mkdir/dir/{dir}/name/{name}/id/{id}");
            }
            Self::Remove { dir, name } => {
                let _ = write!(out, "remove/dir/{dir}/name/{name}");
            }
            Self::Rmdir { dir, name } => {
                let _ = write!(out, "rmdir/dir/{dir}/name/{name}");
            }
            Self::Rename { dir, old, new } => {
                let _ = write!(out, "rename/dir/{dir}/old/{old}/new/{new}");
            }
            Self::Allocate {
                file,
                offset,
                chunk_id,
                version,
            } => {
                let _ = write!(
                    out,
                    "allocate/file/{file}/offset/{offset}/chunkId/{chunk_id}/chunkVersion/{version}"
                );
            }
            Self::Truncate { file, offset } => {
                let _ = write!(out, "truncate/file/{file}/offset/{offset}");
            }
            Self::ChunkVersionInc { value } => {
                let _ = write!(out, "chunkVersionInc/{value}");
            }
        }
        let _ = write!(out, "/seq/{seq}");
        out
    }

    /// Parse a log line. Header lines (`version/…`, `time/…`) yield `None`;
    /// mutation lines yield the record and its sequence tag. Unknown
    /// keywords and malformed fields are fatal.
    pub fn parse(text: &str, line: u64) -> Result<Option<(SeqNo, Self)>> {
        let mut cur = FieldCursor::new(text, line);
        let keyword = cur.next_raw("keyword")?;
        let record = match keyword {
            "version" | "time" => {
                // Header records carry no sequence tag.
                return Ok(None);
            }
            "create" => Self::Create {
                dir: FileId(cur.kv_u64("dir")?),
                name: cur.kv_raw("name")?.to_owned(),
                id: FileId(cur.kv_u64("id")?),
                num_replicas: cur.kv_u16("numReplicas")?,
            },
            "mkdir" => Self::Mkdir {
                dir: FileId(cur.kv_u64("dir")?),
                name: cur.kv_raw("name")?.to_owned(),
                id: FileId(cur.kv_u64("id")?),
            },
            "remove" => Self::Remove {
                dir: FileId(cur.kv_u64("dir")?),
                name: cur.kv_raw("name")?.to_owned(),
            },
            "rmdir" => Self::Rmdir {
                dir: FileId(cur.kv_u64("dir")?),
                name: cur.kv_raw("name")?.to_owned(),
            },
            "rename" => Self::Rename {
                dir: FileId(cur.kv_u64("dir")?),
                old: cur.kv_raw("old")?.to_owned(),
                new: cur.kv_raw("new")?.to_owned(),
            },
            "allocate" => Self::Allocate {
                file: FileId(cur.kv_u64("file")?),
                offset: cur.kv_u64("offset")?,
                chunk_id: ChunkId(cur.kv_u64("chunkId")?),
                version: ChunkVersion(cur.kv_u64("chunkVersion")?),
            },
            "truncate" => Self::Truncate {
                file: FileId(cur.kv_u64("file")?),
                offset: cur.kv_u64("offset")?,
            },
            "chunkVersionInc" => Self::ChunkVersionInc {
                value: cur.bare_u64("chunkVersionInc value")?,
            },
            other => {
                return Err(cur.malformed(format!("unknown log keyword `{other}`")));
            }
        };
        let seq = SeqNo(cur.kv_u64("seq")?);
        cur.finish()?;
        Ok(Some((seq, record)))
    }
}
