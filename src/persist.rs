//! Multi-copy metadata persistence.
//!
//! The reserved anchor sectors each hold one complete serialized record.
//! Writes go to every anchor and succeed if at least one anchor is durable;
//! reads validate every anchor and vote: highest sequence wins, then newest
//! modification timestamp, then lexicographically greatest serialized body.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::RemapError;
use crate::metadata::{
    validate, MetadataRecord, ValidationContext, ValidationLevel, MAX_RECORD_BYTES,
};

/// Conflicting anchor copies whose timestamps cluster inside this window
/// point at a concurrent writer rather than an interrupted flush.
const CONCURRENT_WRITER_WINDOW_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSeverity {
    Low,
    Critical,
}

/// Result of scanning every anchor at attach.
#[derive(Debug)]
pub struct LoadedMetadata {
    /// The winning record, or `None` when no anchor validated.
    pub record: Option<MetadataRecord>,
    pub chosen_anchor_index: Option<usize>,
    /// Whether any anchor carried the record magic at all; distinguishes a
    /// blank spare from a corrupted one.
    pub any_magic: bool,
    pub conflict: Option<ConflictSeverity>,
    /// Human-readable anomalies, surfaced through the attach report.
    pub warnings: Vec<String>,
}

fn sectors_for(len: usize) -> u64 {
    ((len + SECTOR_SIZE - 1) / SECTOR_SIZE) as u64
}

fn read_anchor(spare: &dyn BlockDevice, anchor: u64) -> Option<Vec<u8>> {
    let dev_sectors = spare.sector_count();
    if anchor >= dev_sectors {
        return None;
    }
    let mut first = vec![0u8; SECTOR_SIZE];
    spare.read_sectors(anchor, &mut first).ok()?;
    let declared = MetadataRecord::peek_record_len(&first)?;
    let declared = declared.min(MAX_RECORD_BYTES);
    let n_sectors = sectors_for(declared).min(dev_sectors - anchor);
    if n_sectors <= 1 {
        return Some(first);
    }
    let mut full = vec![0u8; (n_sectors as usize) * SECTOR_SIZE];
    spare.read_sectors(anchor, &mut full).ok()?;
    Some(full)
}

/// Reads every anchor, validates at Standard level, and resolves conflicts.
pub fn load_metadata(spare: &dyn BlockDevice, anchors: &[u64]) -> LoadedMetadata {
    struct Survivor {
        index: usize,
        bytes: Vec<u8>,
        record: MetadataRecord,
    }

    let mut survivors: Vec<Survivor> = Vec::new();
    let mut failed: Vec<(usize, String)> = Vec::new();
    let mut any_magic = false;

    for (index, &anchor) in anchors.iter().enumerate() {
        let Some(bytes) = read_anchor(spare, anchor) else {
            failed.push((index, "unreadable or no record magic".to_string()));
            continue;
        };
        any_magic = true;
        let report = validate(&bytes, ValidationLevel::Standard, ValidationContext::default());
        if !report.is_valid() {
            failed.push((index, format!("{:?}", report.issues)));
            continue;
        }
        match MetadataRecord::decode(&bytes) {
            Ok(record) => survivors.push(Survivor { index, bytes, record }),
            Err(e) => failed.push((index, e.to_string())),
        }
    }

    // Voting: sequence, then modified_ts, then serialized body.
    survivors.sort_by(|a, b| {
        (a.record.sequence, a.record.modified_ts, &a.bytes)
            .cmp(&(b.record.sequence, b.record.modified_ts, &b.bytes))
    });
    let winner = survivors.pop();

    let mut conflict = None;
    if let Some(w) = &winner {
        for other in &survivors {
            if other.bytes == w.bytes {
                continue;
            }
            let gap = w.record.modified_ts.abs_diff(other.record.modified_ts);
            let severity = if gap <= CONCURRENT_WRITER_WINDOW_SECS {
                ConflictSeverity::Critical
            } else {
                ConflictSeverity::Low
            };
            if severity == ConflictSeverity::Critical || conflict.is_none() {
                conflict = Some(severity);
            }
            if severity == ConflictSeverity::Critical {
                warn!(
                    winner = w.index,
                    loser = other.index,
                    "metadata anchors disagree within {CONCURRENT_WRITER_WINDOW_SECS}s; \
                     possible concurrent writer"
                );
            }
        }
    }

    let mut warnings = Vec::new();
    if any_magic {
        for (index, reason) in &failed {
            let hint = match &winner {
                Some(w) => format!("restore from anchor {}", w.index),
                None => "no surviving copy".to_string(),
            };
            warnings.push(format!(
                "metadata anchor {index} failed validation ({reason}); {hint}"
            ));
        }
        if let Some(severity) = conflict {
            warnings.push(format!(
                "metadata anchors held conflicting records (severity {severity:?}); \
                 resolved by sequence counter"
            ));
        }
    }

    LoadedMetadata {
        chosen_anchor_index: winner.as_ref().map(|w| w.index),
        record: winner.map(|w| w.record),
        any_magic,
        conflict,
        warnings,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlushStats {
    pub sequence: u64,
    pub anchors_written: usize,
    pub anchors_failed: usize,
}

struct DirtyState {
    edits: u32,
    last_flush: Instant,
    sequence: u64,
}

/// Owns the dirty/flush schedule and the multi-copy write protocol. The
/// engine holds one per attach; the table notifies it of structural edits
/// through [`MetaStore::note_edit`].
pub struct MetaStore {
    spare: Arc<dyn BlockDevice>,
    anchors: Vec<u64>,
    enabled: bool,
    edit_limit: u32,
    flush_interval: Duration,
    state: Mutex<DirtyState>,
}

impl MetaStore {
    pub fn new(
        spare: Arc<dyn BlockDevice>,
        anchors: Vec<u64>,
        enabled: bool,
        edit_limit: u32,
        flush_interval: Duration,
        initial_sequence: u64,
    ) -> Self {
        Self {
            spare,
            anchors,
            enabled,
            edit_limit,
            flush_interval,
            state: Mutex::new(DirtyState {
                edits: 0,
                last_flush: Instant::now(),
                sequence: initial_sequence,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn anchors(&self) -> &[u64] {
        &self.anchors
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().unwrap().sequence
    }

    /// Records one structural edit of the remap table.
    pub fn note_edit(&self) {
        self.state.lock().unwrap().edits += 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().edits > 0
    }

    /// Dirty-scheduling predicate: N edits or T seconds with anything dirty.
    pub fn wants_flush(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.edits >= self.edit_limit
            || (state.edits > 0 && state.last_flush.elapsed() >= self.flush_interval)
    }

    /// Writes one record to every anchor, ascending. Individual anchor
    /// failures are tolerated; the flush fails only when no anchor accepted
    /// the record. The caller-supplied closure receives the next sequence
    /// number and the previous one and builds the record to persist.
    pub fn flush_with<F>(&self, build: F) -> Result<FlushStats, RemapError>
    where
        F: FnOnce(u64, u64) -> MetadataRecord,
    {
        if !self.enabled {
            let mut state = self.state.lock().unwrap();
            state.edits = 0;
            state.last_flush = Instant::now();
            return Ok(FlushStats {
                sequence: state.sequence,
                anchors_written: 0,
                anchors_failed: 0,
            });
        }

        // Exclusive for the duration of anchor I/O: the sequence counter
        // must be strictly monotonic across concurrent flush attempts.
        let mut state = self.state.lock().unwrap();
        let parent = state.sequence;
        let sequence = parent + 1;
        let record = build(sequence, parent);
        let bytes = record.encode()?;

        let mut padded = bytes;
        let n_sectors = sectors_for(padded.len());
        padded.resize((n_sectors as usize) * SECTOR_SIZE, 0);

        let dev_sectors = self.spare.sector_count();
        let mut written = 0usize;
        let mut failed = 0usize;
        let mut last_err: Option<RemapError> = None;
        for &anchor in &self.anchors {
            if anchor + n_sectors > dev_sectors {
                failed += 1;
                last_err = Some(RemapError::InvalidArgument(format!(
                    "record of {n_sectors} sectors does not fit at anchor {anchor}"
                )));
                continue;
            }
            match self.spare.write_sectors(anchor, &padded) {
                Ok(()) => written += 1,
                Err(e) => {
                    failed += 1;
                    warn!(anchor, error = %e, "metadata anchor write failed");
                    last_err = Some(RemapError::PermanentIo {
                        role: "spare",
                        sector: anchor,
                        detail: e.to_string(),
                    });
                }
            }
        }
        if written == 0 {
            return Err(last_err.unwrap_or(RemapError::NoValidMetadata));
        }
        if let Err(e) = self.spare.flush() {
            return Err(RemapError::PermanentIo {
                role: "spare",
                sector: 0,
                detail: format!("metadata flush failed: {e}"),
            });
        }

        state.sequence = sequence;
        state.edits = 0;
        state.last_flush = Instant::now();
        debug!(sequence, written, failed, "metadata flushed");
        Ok(FlushStats {
            sequence,
            anchors_written: written,
            anchors_failed: failed,
        })
    }
}
