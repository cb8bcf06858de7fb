//! Snapshot persistence for [`AotCache`].
//!
//! File layout (little-endian):
//!
//! ```text
//! magic:[u8;8] | version:u32 | header_len:u32 | header | body
//!
//! header := server_uid:u64 | name
//!         | (count:u32 next_id:u64) x 7    -- one per record kind, fixed order
//!         | artifact_count:u32 | body_len:u64 | body_xxh3:u64
//!         | header_xxh3:u64                -- over everything before it
//!
//! body   := records of each kind in kind order, ids ascending
//!         | artifacts in storage order
//! ```
//!
//! Loading renumbers every id densely in file order and rejects the whole
//! file on the first inconsistency. A partially loaded cache is dropped,
//! which returns its budget charge.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use aotc_error::{AotError, Result};
use aotc_types::encoding::{ByteReader, append_len_prefixed, append_u32_le, append_u64_le};
use aotc_types::{CompiledArtifact, RecordId, RecordKind, RecordRef, SerializationRecord};

use crate::budget::MemoryBudget;
use crate::cache::AotCache;
use crate::stats::CacheStatistics;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"AOTCSNAP";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
/// File extension of snapshot files.
pub const SNAPSHOT_EXTENSION: &str = "aotcache";

const PREAMBLE_SIZE: usize = 8 + 4 + 4;
const MAX_HEADER_LEN: usize = 1 << 20;

/// Per-kind summary in a snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSummary {
    pub count: u32,
    pub next_id: u64,
}

/// Decoded snapshot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub server_uid: u64,
    pub name: String,
    pub kinds: [KindSummary; RecordKind::COUNT],
    pub artifact_count: u32,
    pub body_len: u64,
    pub body_checksum: u64,
}

impl SnapshotHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        append_u64_le(&mut buf, self.server_uid);
        append_len_prefixed(&mut buf, self.name.as_bytes());
        for summary in &self.kinds {
            append_u32_le(&mut buf, summary.count);
            append_u64_le(&mut buf, summary.next_id);
        }
        append_u32_le(&mut buf, self.artifact_count);
        append_u64_le(&mut buf, self.body_len);
        append_u64_le(&mut buf, self.body_checksum);
        let checksum = xxh3_64(&buf);
        append_u64_le(&mut buf, checksum);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let Some(split) = bytes.len().checked_sub(8) else {
            return Err(AotError::corrupt("snapshot header is truncated"));
        };
        let (content, stored) = bytes.split_at(split);
        let stored = u64::from_le_bytes(stored.try_into().expect("fixed 8-byte field"));
        if xxh3_64(content) != stored {
            return Err(AotError::corrupt("snapshot header checksum mismatch"));
        }
        let mut r = ByteReader::new(content, "snapshot header");
        let server_uid = r.read_u64().map_err(corrupt)?;
        let name = r.read_string().map_err(corrupt)?;
        let mut kinds = [KindSummary::default(); RecordKind::COUNT];
        for summary in &mut kinds {
            summary.count = r.read_u32().map_err(corrupt)?;
            summary.next_id = r.read_u64().map_err(corrupt)?;
            if summary.next_id == 0 || u64::from(summary.count) >= summary.next_id {
                return Err(AotError::corrupt(format!(
                    "kind summary {} records with next id {} is inconsistent",
                    summary.count, summary.next_id
                )));
            }
        }
        let header = Self {
            server_uid,
            name,
            kinds,
            artifact_count: r.read_u32().map_err(corrupt)?,
            body_len: r.read_u64().map_err(corrupt)?,
            body_checksum: r.read_u64().map_err(corrupt)?,
        };
        r.finish().map_err(corrupt)?;
        Ok(header)
    }

    /// Total records across every kind.
    pub fn record_count(&self) -> u64 {
        self.kinds.iter().map(|k| u64::from(k.count)).sum()
    }
}

fn corrupt(err: AotError) -> AotError {
    match err {
        AotError::SnapshotCorrupt { .. } => err,
        other => AotError::corrupt(other.to_string()),
    }
}

fn count_u32(what: &str, n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| AotError::OutOfRange {
        what: what.to_owned(),
        value: n.to_string(),
    })
}

fn check_preamble(preamble: &[u8]) -> Result<usize> {
    if preamble[..8] != SNAPSHOT_MAGIC {
        return Err(AotError::corrupt("bad snapshot magic"));
    }
    let version = u32::from_le_bytes(preamble[8..12].try_into().expect("fixed 4-byte field"));
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(AotError::SnapshotVersion {
            found: version,
            expected: SNAPSHOT_FORMAT_VERSION,
        });
    }
    let header_len =
        u32::from_le_bytes(preamble[12..16].try_into().expect("fixed 4-byte field")) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(AotError::corrupt(format!(
            "snapshot header length {header_len} is implausible"
        )));
    }
    Ok(header_len)
}

fn open_snapshot(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            AotError::SnapshotNotFound {
                path: path.to_path_buf(),
            }
        } else {
            AotError::Io(e)
        }
    })
}

/// Read only the header of the snapshot at `path`.
pub fn read_snapshot_header(path: &Path) -> Result<SnapshotHeader> {
    let mut file = open_snapshot(path)?;
    let mut preamble = [0_u8; PREAMBLE_SIZE];
    file.read_exact(&mut preamble)
        .map_err(|_| AotError::corrupt("snapshot preamble is truncated"))?;
    let header_len = check_preamble(&preamble)?;
    let mut header = vec![0_u8; header_len];
    file.read_exact(&mut header)
        .map_err(|_| AotError::corrupt("snapshot header is truncated"))?;
    SnapshotHeader::decode(&header)
}

/// Result of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { artifacts: usize, bytes: usize },
    /// Another save of this cache was already running.
    Coalesced,
    /// A snapshot with more artifacts appeared on disk meanwhile; it was
    /// left in place.
    Superseded { existing_artifacts: u32 },
}

/// Clears the save-in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Removes a temporary snapshot file unless it was published.
struct PendingTemp<'a> {
    path: &'a Path,
    published: bool,
}

impl Drop for PendingTemp<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        if let Err(err) = fs::remove_file(self.path) {
            debug!(path = %self.path.display(), error = %err, "temporary snapshot not removed");
        }
    }
}

impl AotCache {
    /// Serialize the whole cache.
    ///
    /// Artifacts are collected before records, and record kinds from the
    /// most dependent to the least, one table lock at a time. Anything a
    /// collected entry refers to was therefore present when its own table
    /// was read.
    pub fn encode_snapshot(&self) -> Result<(Vec<u8>, usize)> {
        let artifacts = self.artifacts();
        let mut per_kind: Vec<Vec<Arc<SerializationRecord>>> =
            vec![Vec::new(); RecordKind::COUNT];
        for kind in RecordKind::ALL.iter().rev() {
            per_kind[kind.index()] = self.records(*kind);
        }

        let mut body = Vec::new();
        let mut kinds = [KindSummary::default(); RecordKind::COUNT];
        for kind in RecordKind::ALL {
            let records = &per_kind[kind.index()];
            for record in records {
                record.append_to(&mut body);
            }
            let count = count_u32("snapshot record count", records.len())?;
            kinds[kind.index()] = KindSummary {
                count,
                next_id: u64::from(count) + 1,
            };
        }
        for artifact in &artifacts {
            artifact.append_to(&mut body);
        }

        let header = SnapshotHeader {
            server_uid: self.server_uid(),
            name: self.name().to_owned(),
            kinds,
            artifact_count: count_u32("snapshot artifact count", artifacts.len())?,
            body_len: body.len() as u64,
            body_checksum: xxh3_64(&body),
        }
        .encode();

        let mut out = Vec::with_capacity(PREAMBLE_SIZE + header.len() + body.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        append_u32_le(&mut out, SNAPSHOT_FORMAT_VERSION);
        append_u32_le(&mut out, count_u32("snapshot header length", header.len())?);
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok((out, artifacts.len()))
    }

    /// Write the cache to `path` atomically.
    ///
    /// Only one save per cache runs at a time; a concurrent request returns
    /// [`SaveOutcome::Coalesced`]. No table lock is held during I/O.
    pub fn save_snapshot(&self, path: &Path) -> Result<SaveOutcome> {
        if self.persist.save_in_flight.swap(true, Ordering::AcqRel) {
            debug!(cache = %self.name(), "snapshot save already in flight");
            return Ok(SaveOutcome::Coalesced);
        }
        let _in_flight = InFlight(&self.persist.save_in_flight);
        let started = Instant::now();
        let (bytes, artifacts) = self.encode_snapshot()?;

        let Some(parent) = path.parent() else {
            return Err(AotError::internal(format!(
                "snapshot path has no parent directory: {}",
                path.display()
            )));
        };
        fs::create_dir_all(parent)?;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0_u128, |d| d.as_nanos());
        let pid = std::process::id();
        let tmp_path = parent.join(format!(".aotcache.tmp.{pid}.{nanos}"));

        let mut temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        let mut pending = PendingTemp {
            path: &tmp_path,
            published: false,
        };
        temp.write_all(&bytes)?;
        temp.sync_all()?;
        drop(temp);

        // A sibling process may have written a fuller snapshot meanwhile.
        match read_snapshot_header(path) {
            Ok(existing) if existing.artifact_count as usize > artifacts => {
                info!(
                    cache = %self.name(),
                    path = %path.display(),
                    ours = artifacts,
                    existing = existing.artifact_count,
                    "kept larger snapshot written by another process"
                );
                return Ok(SaveOutcome::Superseded {
                    existing_artifacts: existing.artifact_count,
                });
            }
            Ok(_) | Err(AotError::SnapshotNotFound { .. }) => {}
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "replacing unreadable snapshot"
                );
            }
        }

        fs::rename(&tmp_path, path)?;
        pending.published = true;
        File::open(parent)?.sync_all()?;

        self.persist.mark_saved(artifacts, started);
        CacheStatistics::bump(&self.statistics().snapshots_saved);
        info!(
            cache = %self.name(),
            path = %path.display(),
            artifacts,
            bytes = bytes.len(),
            "wrote AOT cache snapshot atomically"
        );
        Ok(SaveOutcome::Saved {
            artifacts,
            bytes: bytes.len(),
        })
    }

    /// Rebuild a cache from snapshot bytes.
    ///
    /// Ids are renumbered in file order, and the cache takes `server_uid`
    /// rather than the one stored in the file: clients holding ids from the
    /// writer must treat this as a new server instance.
    pub fn decode_snapshot(
        bytes: &[u8],
        name: &str,
        server_uid: u64,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        if bytes.len() < PREAMBLE_SIZE {
            return Err(AotError::corrupt("snapshot preamble is truncated"));
        }
        let header_len = check_preamble(&bytes[..PREAMBLE_SIZE])?;
        let header_end = PREAMBLE_SIZE
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| AotError::corrupt("snapshot header is truncated"))?;
        let header = SnapshotHeader::decode(&bytes[PREAMBLE_SIZE..header_end])?;
        let body = &bytes[header_end..];
        if body.len() as u64 != header.body_len {
            return Err(AotError::corrupt(format!(
                "snapshot body is {} bytes, header says {}",
                body.len(),
                header.body_len
            )));
        }
        if xxh3_64(body) != header.body_checksum {
            return Err(AotError::corrupt("snapshot body checksum mismatch"));
        }

        let cache = Self::new(name, server_uid, budget);
        let mut renumber: [HashMap<RecordId, RecordId>; RecordKind::COUNT] =
            std::array::from_fn(|_| HashMap::new());
        let mut offset = 0;

        for kind in RecordKind::ALL {
            let summary = header.kinds[kind.index()];
            let mut previous: Option<RecordId> = None;
            for _ in 0..summary.count {
                let (record, used) =
                    SerializationRecord::decode_prefix(&body[offset..]).map_err(corrupt)?;
                offset += used;
                if record.kind() != kind {
                    return Err(AotError::corrupt(format!(
                        "found {} among {kind} records",
                        record.record_ref()
                    )));
                }
                let old = record.id();
                if previous.is_some_and(|p| old <= p) || old.get() >= summary.next_id {
                    return Err(AotError::corrupt(format!(
                        "{} is out of order or beyond next id {}",
                        record.record_ref(),
                        summary.next_id
                    )));
                }
                previous = Some(old);
                let remapped = record.body().remap(|dep| map_id(&renumber, dep))?;
                let loaded = cache.insert_loaded_record(remapped)?;
                renumber[kind.index()].insert(old, loaded.id());
            }
        }

        for _ in 0..header.artifact_count {
            let (artifact, used) =
                CompiledArtifact::decode_prefix(&body[offset..]).map_err(corrupt)?;
            offset += used;
            let artifact = artifact.remap(|dep| map_id(&renumber, dep))?;
            cache.insert_loaded_artifact(artifact)?;
        }
        if offset != body.len() {
            return Err(AotError::corrupt(format!(
                "{} unread bytes after the last artifact",
                body.len() - offset
            )));
        }

        cache.persist.mark_saved(cache.artifact_count(), Instant::now());
        debug!(
            cache = name,
            writer_uid = header.server_uid,
            records = header.record_count(),
            "snapshot decoded"
        );
        Ok(cache)
    }

    /// Load the snapshot at `path`. Any problem rejects the file as a whole.
    pub fn load_snapshot(
        path: &Path,
        name: &str,
        server_uid: u64,
        budget: Arc<MemoryBudget>,
    ) -> Result<Self> {
        let loaded = match fs::read(path) {
            Ok(bytes) => Self::decode_snapshot(&bytes, name, server_uid, budget),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(AotError::SnapshotNotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(AotError::Io(e)),
        };
        match &loaded {
            Ok(cache) => info!(
                cache = name,
                path = %path.display(),
                records = cache.total_record_count(),
                artifacts = cache.artifact_count(),
                "loaded AOT cache snapshot"
            ),
            Err(AotError::SnapshotNotFound { .. }) => {
                debug!(cache = name, path = %path.display(), "no snapshot to load");
            }
            Err(err) => warn!(
                cache = name,
                path = %path.display(),
                error = %err,
                "rejected AOT cache snapshot"
            ),
        }
        loaded
    }
}

fn map_id(renumber: &[HashMap<RecordId, RecordId>], dep: RecordRef) -> Result<RecordId> {
    renumber[dep.kind.index()]
        .get(&dep.id)
        .copied()
        .ok_or_else(|| AotError::corrupt(format!("reference to unknown {dep}")))
}
