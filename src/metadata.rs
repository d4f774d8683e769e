//! Versioned, CRC-protected on-disk metadata record and its graduated
//! validator.
//!
//! One record is written to every anchor sector of the spare device. The
//! layout is little-endian and packed: a header (magic, version-control
//! sub-header, fingerprints, allocator config, target params), three CRCs,
//! then the remap-table body.

use bitflags::bitflags;

use crate::allocator::{SpareAllocator, Strategy};
use crate::codec::{Decoder, Encoder};
use crate::crc::{crc32, crc32_parts};
use crate::device::BlockDevice;
use crate::error::RemapError;
use crate::fingerprint::DeviceFingerprint;
use crate::table::{EntryStatus, RemapEntry};

/// "REM4"
pub const METADATA_MAGIC: u32 = 0x5245_4D34;
/// "VCRT" — version-control sub-header magic.
pub const VCRT_MAGIC: u32 = 0x5643_5254;

pub const FORMAT_MAJOR: u16 = 4;
pub const FORMAT_MINOR: u16 = 0;

/// Hard cap on one serialized record, remap-table body included.
pub const MAX_RECORD_BYTES: usize = 512 * 1024;

/// Bytes per serialized remap entry: logical + spare + status.
const ENTRY_BYTES: usize = 17;

/// Allocator configuration as persisted. The reserved set is a closed
/// contract: once written it is reloaded verbatim, never recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub strategy: Strategy,
    pub reserved: Vec<u64>,
    pub next_free_hint: u64,
    pub total_free: u64,
    pub total_allocated: u64,
}

impl AllocatorConfig {
    pub fn from_allocator(alloc: &SpareAllocator) -> Self {
        Self {
            strategy: alloc.strategy(),
            reserved: alloc.reserved().to_vec(),
            next_free_hint: alloc.next_free_hint(),
            total_free: alloc.total_free(),
            total_allocated: alloc.total_allocated(),
        }
    }
}

/// Tunables stamped into the record so a re-attach restores the same
/// behavior the table was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetParams {
    pub transient_threshold: u32,
    pub max_retries: u32,
    pub flush_edit_limit: u32,
    pub flush_interval_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub version_major: u16,
    pub version_minor: u16,
    /// Strictly monotonic across flushes; the voter picks the maximum.
    pub sequence: u64,
    pub parent_sequence: u64,
    pub created_ts: u64,
    pub modified_ts: u64,
    pub main_fingerprint: DeviceFingerprint,
    pub spare_fingerprints: Vec<DeviceFingerprint>,
    pub allocator: AllocatorConfig,
    pub params: TargetParams,
    pub entries: Vec<RemapEntry>,
}

struct Offsets {
    /// End of the CRC-covered header region (start is 0).
    header_end: usize,
    header_crc: u32,
    body_crc: u32,
    overall_crc: u32,
    body_start: usize,
}

impl MetadataRecord {
    pub fn encode(&self) -> Result<Vec<u8>, RemapError> {
        let mut body = Encoder::new();
        for e in &self.entries {
            body.u64(e.logical);
            body.u64(e.spare);
            body.u8(e.status as u8);
        }
        let body = body.finish();

        let mut h = Encoder::new();
        h.u32(METADATA_MAGIC);
        h.u32(0); // record_len, patched below
        h.u32(VCRT_MAGIC);
        h.u16(self.version_major);
        h.u16(self.version_minor);
        h.u64(self.sequence);
        h.u64(self.parent_sequence);
        h.u64(self.created_ts);
        h.u64(self.modified_ts);
        h.raw(&self.main_fingerprint.encode());
        h.u8(self.spare_fingerprints.len() as u8);
        for fp in &self.spare_fingerprints {
            h.raw(&fp.encode());
        }
        h.u8(self.allocator.strategy as u8);
        h.u16(self.allocator.reserved.len() as u16);
        for &s in &self.allocator.reserved {
            h.u64(s);
        }
        h.u64(self.allocator.next_free_hint);
        h.u64(self.allocator.total_free);
        h.u64(self.allocator.total_allocated);
        h.u32(self.params.transient_threshold);
        h.u32(self.params.max_retries);
        h.u32(self.params.flush_edit_limit);
        h.u32(self.params.flush_interval_secs);
        h.u32(self.entries.len() as u32);
        let mut header = h.finish();

        let record_len = header.len() + 12 + body.len();
        if record_len > MAX_RECORD_BYTES {
            return Err(RemapError::InvalidArgument(format!(
                "metadata record of {record_len} bytes exceeds the {MAX_RECORD_BYTES}-byte cap"
            )));
        }
        header[4..8].copy_from_slice(&(record_len as u32).to_le_bytes());

        let header_crc = crc32(&header);
        let body_crc = crc32(&body);
        let overall_crc = crc32_parts(&[
            &header,
            &header_crc.to_le_bytes(),
            &body_crc.to_le_bytes(),
            &body,
        ]);

        let mut out = Vec::with_capacity(record_len);
        out.extend_from_slice(&header);
        out.extend_from_slice(&header_crc.to_le_bytes());
        out.extend_from_slice(&body_crc.to_le_bytes());
        out.extend_from_slice(&overall_crc.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn parse(bytes: &[u8]) -> Result<(Self, Offsets), RemapError> {
        let mut d = Decoder::new(bytes);
        let magic = d.u32()?;
        if magic != METADATA_MAGIC {
            return Err(RemapError::Decode("bad metadata magic"));
        }
        let record_len = d.u32()? as usize;
        let vcrt = d.u32()?;
        if vcrt != VCRT_MAGIC {
            return Err(RemapError::Decode("bad version-control magic"));
        }
        let version_major = d.u16()?;
        let version_minor = d.u16()?;
        let sequence = d.u64()?;
        let parent_sequence = d.u64()?;
        let created_ts = d.u64()?;
        let modified_ts = d.u64()?;
        let main_fingerprint = DeviceFingerprint::decode(&mut d)?;
        let spare_count = d.u8()? as usize;
        let mut spare_fingerprints = Vec::new();
        for _ in 0..spare_count {
            spare_fingerprints.push(DeviceFingerprint::decode(&mut d)?);
        }
        let strategy = Strategy::from_raw(d.u8()?)?;
        let reserved_count = d.u16()? as usize;
        let mut reserved = Vec::new();
        for _ in 0..reserved_count {
            reserved.push(d.u64()?);
        }
        let next_free_hint = d.u64()?;
        let total_free = d.u64()?;
        let total_allocated = d.u64()?;
        let params = TargetParams {
            transient_threshold: d.u32()?,
            max_retries: d.u32()?,
            flush_edit_limit: d.u32()?,
            flush_interval_secs: d.u32()?,
        };
        let entry_count = d.u32()? as usize;
        let header_end = d.position();
        let header_crc = d.u32()?;
        let body_crc = d.u32()?;
        let overall_crc = d.u32()?;
        let body_start = d.position();

        if entry_count > MAX_RECORD_BYTES / ENTRY_BYTES {
            return Err(RemapError::Decode("entry count exceeds record cap"));
        }
        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let logical = d.u64()?;
            let spare = d.u64()?;
            let status = EntryStatus::from_raw(d.u8()?)?;
            entries.push(RemapEntry {
                logical,
                spare,
                status,
            });
        }
        if d.position() != record_len {
            return Err(RemapError::Decode("record length field disagrees with content"));
        }

        Ok((
            Self {
                version_major,
                version_minor,
                sequence,
                parent_sequence,
                created_ts,
                modified_ts,
                main_fingerprint,
                spare_fingerprints,
                allocator: AllocatorConfig {
                    strategy,
                    reserved,
                    next_free_hint,
                    total_free,
                    total_allocated,
                },
                params,
                entries,
            },
            Offsets {
                header_end,
                header_crc,
                body_crc,
                overall_crc,
                body_start,
            },
        ))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RemapError> {
        Ok(Self::parse(bytes)?.0)
    }

    /// Reads just the declared record length out of a header prefix, so the
    /// loader can size the full read from one sector.
    pub fn peek_record_len(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < 8 {
            return None;
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != METADATA_MAGIC {
            return None;
        }
        Some(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize)
    }

    /// True when the buffer starts with the record magic at all — used to
    /// tell a blank device from a corrupted one.
    pub fn has_magic(bytes: &[u8]) -> bool {
        bytes.len() >= 4
            && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == METADATA_MAGIC
    }
}

bitflags! {
    /// Error set produced by [`validate`]; each class maps to a recovery
    /// suggestion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValidationIssues: u32 {
        const BAD_MAGIC           = 1 << 0;
        const VERSION_UNSUPPORTED = 1 << 1;
        const ABSURD_SIZE         = 1 << 2;
        const TRUNCATED           = 1 << 3;
        const HEADER_CRC_MISMATCH = 1 << 4;
        const BODY_CRC_MISMATCH   = 1 << 5;
        const OVERALL_CRC_MISMATCH = 1 << 6;
        const MAIN_DEVICE_MISMATCH = 1 << 7;
        const SPARE_DEVICE_MISMATCH = 1 << 8;
        const SPARE_OUT_OF_RANGE  = 1 << 9;
        const SPARE_IN_RESERVED   = 1 << 10;
        const DUPLICATE_LOGICAL   = 1 << 11;
        const COUNT_MISMATCH      = 1 << 12;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Magic, version compatibility, declared size.
    Minimal,
    /// Minimal + CRC integrity.
    Standard,
    /// Standard + fingerprint match against the live devices.
    Strict,
    /// Strict + internal consistency of allocator and table.
    Paranoid,
}

/// Fixed catalog of recovery suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Magic/size damage at this anchor: try the backup anchors.
    TryBackupAnchors,
    /// Checksum damage: load a backup copy or rewrite this anchor.
    LoadBackupOrRepair,
    /// Stored fingerprints do not match: reconnect the original device or
    /// re-run the fuzzy match.
    ReconnectOrFuzzyMatch,
    /// Internally inconsistent: only a forced clean-slate re-init is safe.
    ForceCleanSlate,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub issues: ValidationIssues,
    pub suggestions: Vec<RecoverySuggestion>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

fn suggestion_for(issue: ValidationIssues) -> Option<RecoverySuggestion> {
    if issue.intersects(
        ValidationIssues::BAD_MAGIC
            | ValidationIssues::VERSION_UNSUPPORTED
            | ValidationIssues::ABSURD_SIZE
            | ValidationIssues::TRUNCATED,
    ) {
        Some(RecoverySuggestion::TryBackupAnchors)
    } else if issue.intersects(
        ValidationIssues::HEADER_CRC_MISMATCH
            | ValidationIssues::BODY_CRC_MISMATCH
            | ValidationIssues::OVERALL_CRC_MISMATCH,
    ) {
        Some(RecoverySuggestion::LoadBackupOrRepair)
    } else if issue.intersects(
        ValidationIssues::MAIN_DEVICE_MISMATCH | ValidationIssues::SPARE_DEVICE_MISMATCH,
    ) {
        Some(RecoverySuggestion::ReconnectOrFuzzyMatch)
    } else if !issue.is_empty() {
        Some(RecoverySuggestion::ForceCleanSlate)
    } else {
        None
    }
}

/// Devices the strict levels verify fingerprints against.
#[derive(Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    pub main: Option<&'a dyn BlockDevice>,
    pub spare: Option<&'a dyn BlockDevice>,
}

/// Graduated validator. Every level includes the checks of the levels below
/// it; the report carries the full issue set plus one suggestion per issue
/// class, in severity order.
pub fn validate(bytes: &[u8], level: ValidationLevel, ctx: ValidationContext<'_>) -> ValidationReport {
    let mut issues = ValidationIssues::empty();

    // Minimal: magic, version, declared size.
    if !MetadataRecord::has_magic(bytes) {
        issues |= ValidationIssues::BAD_MAGIC;
        return finish(issues);
    }
    let declared = match MetadataRecord::peek_record_len(bytes) {
        Some(len) => len,
        None => {
            issues |= ValidationIssues::TRUNCATED;
            return finish(issues);
        }
    };
    if declared < 8 || declared > MAX_RECORD_BYTES {
        issues |= ValidationIssues::ABSURD_SIZE;
        return finish(issues);
    }
    if declared > bytes.len() {
        issues |= ValidationIssues::TRUNCATED;
        return finish(issues);
    }
    let bytes = &bytes[..declared];

    let (record, offsets) = match MetadataRecord::parse(bytes) {
        Ok(parsed) => parsed,
        Err(_) => {
            issues |= ValidationIssues::TRUNCATED;
            return finish(issues);
        }
    };
    if record.version_major != FORMAT_MAJOR {
        issues |= ValidationIssues::VERSION_UNSUPPORTED;
    }
    if level == ValidationLevel::Minimal {
        return finish(issues);
    }

    // Standard: the three CRCs. Individual mismatches let an operator tell
    // header damage from body damage.
    let header = &bytes[..offsets.header_end];
    let body = &bytes[offsets.body_start..];
    if crc32(header) != offsets.header_crc {
        issues |= ValidationIssues::HEADER_CRC_MISMATCH;
    }
    if crc32(body) != offsets.body_crc {
        issues |= ValidationIssues::BODY_CRC_MISMATCH;
    }
    let overall = crc32_parts(&[
        header,
        &offsets.header_crc.to_le_bytes(),
        &offsets.body_crc.to_le_bytes(),
        body,
    ]);
    if overall != offsets.overall_crc {
        issues |= ValidationIssues::OVERALL_CRC_MISMATCH;
    }
    if level == ValidationLevel::Standard {
        return finish(issues);
    }

    // Strict: the stored fingerprints must recognize the live devices.
    if let Some(main) = ctx.main {
        let score = record
            .main_fingerprint
            .similarity(&main.identity(), main.sector_count());
        if score < 60 {
            issues |= ValidationIssues::MAIN_DEVICE_MISMATCH;
        }
    }
    if let Some(spare) = ctx.spare {
        let recognized = record.spare_fingerprints.iter().any(|fp| {
            fp.similarity(&spare.identity(), spare.sector_count()) >= 60
        });
        if !record.spare_fingerprints.is_empty() && !recognized {
            issues |= ValidationIssues::SPARE_DEVICE_MISMATCH;
        }
    }
    if level == ValidationLevel::Strict {
        return finish(issues);
    }

    // Paranoid: internal consistency of allocator and table.
    match SpareAllocator::from_parts(
        record.allocator.strategy,
        record.allocator.reserved.clone(),
        record.allocator.next_free_hint,
        record.allocator.total_free,
        record.allocator.total_allocated,
        u64::MAX,
    ) {
        Ok(alloc) => {
            let mut logicals: Vec<u64> = Vec::with_capacity(record.entries.len());
            let mut active = 0u64;
            for e in &record.entries {
                if alloc.is_reserved(e.spare) {
                    issues |= ValidationIssues::SPARE_IN_RESERVED;
                }
                if e.spare >= record.allocator.next_free_hint {
                    issues |= ValidationIssues::SPARE_OUT_OF_RANGE;
                }
                if e.status == EntryStatus::Active {
                    active += 1;
                }
                logicals.push(e.logical);
            }
            logicals.sort_unstable();
            if logicals.windows(2).any(|w| w[0] == w[1]) {
                issues |= ValidationIssues::DUPLICATE_LOGICAL;
            }
            if active > record.allocator.total_allocated {
                issues |= ValidationIssues::COUNT_MISMATCH;
            }
        }
        Err(_) => {
            issues |= ValidationIssues::COUNT_MISMATCH;
        }
    }

    finish(issues)
}

fn finish(issues: ValidationIssues) -> ValidationReport {
    let mut suggestions = Vec::new();
    for issue in issues.iter() {
        if let Some(s) = suggestion_for(issue) {
            if !suggestions.contains(&s) {
                suggestions.push(s);
            }
        }
    }
    ValidationReport { issues, suggestions }
}
