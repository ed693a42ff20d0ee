//! Rebuild the metadata tree from a checkpoint file.
//!
//! A checkpoint is text, one record per line, `version`/`checkpoint`
//! header first and a `cksum` trailer last. Every line must parse and
//! every keyword must be recognized; on failure the caller discards the
//! partially built tree and aborts startup; nothing is rolled back.

use crate::record::FieldCursor;
use crate::tree::{ChunkInfo, FileAttr, MetaTree};
use cfs_error::{CfsError, Result};
use cfs_types::{ChunkId, ChunkVersion, FileId, NodeKind, SeqNo};
use std::path::Path;
use tracing::info;

const CHECKPOINT_VERSION: u64 = 1;

pub struct Restorer;

impl Restorer {
    /// Process a checkpoint file into a fresh tree.
    pub fn rebuild(path: &Path) -> Result<MetaTree> {
        let contents = std::fs::read_to_string(path)?;
        let mut tree = MetaTree::new();
        let mut crc = 0_u32;
        let mut saw_version = false;
        let mut saw_cksum = false;
        let mut records = 0_u64;

        for (idx, line) in contents.lines().enumerate() {
            let line_no = idx as u64 + 1;
            if line.is_empty() {
                continue;
            }
            if saw_cksum {
                return Err(CfsError::MalformedRecord {
                    line: line_no,
                    detail: "record after cksum trailer".to_owned(),
                });
            }

            let mut cur = FieldCursor::new(line, line_no);
            let keyword = cur.next_raw("keyword")?;
            match keyword {
                "version" => {
                    let version = cur.bare_u64("version")?;
                    cur.finish()?;
                    if version != CHECKPOINT_VERSION {
                        return Err(CfsError::MalformedRecord {
                            line: line_no,
                            detail: format!("unsupported checkpoint version {version}"),
                        });
                    }
                    saw_version = true;
                }
                "checkpoint" => {
                    let seq = cur.bare_u64("checkpoint seq")?;
                    cur.finish()?;
                    tree.set_applied(SeqNo(seq));
                }
                "chunkVersionInc" => {
                    let value = cur.bare_u64("chunkVersionInc value")?;
                    cur.finish()?;
                    tree.set_chunk_version_inc(value);
                }
                "fattr" => restore_fattr(&mut tree, cur)?,
                "dentry" => restore_dentry(&mut tree, cur)?,
                "chunkinfo" => restore_chunkinfo(&mut tree, cur)?,
                "cksum" => {
                    let raw = cur.next_raw("cksum value")?;
                    cur.finish()?;
                    let expected = u32::from_str_radix(raw, 16).map_err(|_| {
                        CfsError::MalformedRecord {
                            line: line_no,
                            detail: format!("cksum is not hex: `{raw}`"),
                        }
                    })?;
                    if expected != crc {
                        return Err(CfsError::MalformedRecord {
                            line: line_no,
                            detail: format!(
                                "checkpoint cksum mismatch: recorded {expected:08x}, computed {crc:08x}"
                            ),
                        });
                    }
                    saw_cksum = true;
                    continue;
                }
                other => {
                    return Err(CfsError::MalformedRecord {
                        line: line_no,
                        detail: format!("unknown checkpoint keyword `{other}`"),
                    });
                }
            }
            // The trailer covers every preceding line, terminators included.
            crc = crc32c::crc32c_append(crc, line.as_bytes());
            crc = crc32c::crc32c_append(crc, b"\n");
            records += 1;
        }

        if !saw_version {
            return Err(CfsError::MalformedRecord {
                line: 0,
                detail: "checkpoint missing version header".to_owned(),
            });
        }
        if !saw_cksum {
            return Err(CfsError::MalformedRecord {
                line: 0,
                detail: "checkpoint missing cksum trailer".to_owned(),
            });
        }

        info!(
            target: "cfs::meta",
            event = "checkpoint_restored",
            path = %path.display(),
            records,
            seq = tree.applied().0
        );
        Ok(tree)
    }
}

fn restore_fattr(tree: &mut MetaTree, mut cur: FieldCursor<'_>) -> Result<()> {
    let kind_raw = cur.next_raw("fattr kind")?;
    let kind: NodeKind = kind_raw
        .parse()
        .map_err(|_| cur.malformed(format!("bad fattr kind `{kind_raw}`")))?;
    let id = FileId(cur.kv_u64("id")?);
    let chunk_count = cur.kv_u64("chunkcount")?;
    let file_size = cur.kv_u64("filesize")?;
    let num_replicas = cur.kv_u16("numReplicas")?;
    cur.finish()?;
    tree.insert_attr(
        id,
        FileAttr {
            kind,
            chunk_count,
            file_size,
            num_replicas,
        },
    );
    Ok(())
}

fn restore_dentry(tree: &mut MetaTree, mut cur: FieldCursor<'_>) -> Result<()> {
    let name = cur.kv_raw("name")?.to_owned();
    let id = FileId(cur.kv_u64("id")?);
    let parent = FileId(cur.kv_u64("parent")?);
    cur.finish()?;
    tree.insert_dentry(parent, name, id);
    Ok(())
}

fn restore_chunkinfo(tree: &mut MetaTree, mut cur: FieldCursor<'_>) -> Result<()> {
    let fid = FileId(cur.kv_u64("fid")?);
    let chunk_id = ChunkId(cur.kv_u64("chunkid")?);
    let offset = cur.kv_u64("offset")?;
    let version = ChunkVersion(cur.kv_u64("chunkVersion")?);
    cur.finish()?;
    tree.insert_chunk(
        fid,
        ChunkInfo {
            offset,
            chunk_id,
            version,
        },
    );
    Ok(())
}
