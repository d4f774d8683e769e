//! The remap engine: owns both devices, the table, the allocator and the
//! persistence layer; routes every upstream request and installs new
//! mappings when the main device reports hard errors.
//!
//! Lock order is table → allocator → persistence dirty state. The table's
//! install-serializing section takes the allocator lock inside the table
//! lock; a metadata flush holds the persistence lock and re-acquires only
//! read snapshots of the other two.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::allocator::{reserved_for, SpareAllocator, Strategy};
use crate::device::{BlockDevice, DeviceError, ErrorClass, SECTOR_SIZE};
use crate::error::{worst, RemapError, Result};
use crate::fingerprint::{unix_now, DeviceFingerprint};
use crate::metadata::{AllocatorConfig, MetadataRecord, TargetParams, FORMAT_MAJOR, FORMAT_MINOR};
use crate::persist::{load_metadata, FlushStats, MetaStore};
use crate::request::{Completion, CompletionHandle, IoKind, IoRequest};
use crate::routing::{plan, Segment, SegmentTarget};
use crate::table::{EntryStatus, RemapOutcome, RemapTable};

/// 8 MiB: spares below this are refused unless `allow_small_spare` is set.
const MIN_SPARE_SECTORS: u64 = 16384;
/// 64 KiB: absolute floor, room for anchor 0 plus one record.
const MIN_SPARE_SECTORS_ABSOLUTE: u64 = 128;

#[derive(Debug, Clone)]
pub struct RemapConfig {
    /// Transient errors on a range beyond this count escalate to a remap.
    pub transient_threshold: u32,
    /// Internal retries for transient errors, exponential backoff.
    pub max_retries: u32,
    /// Base delay for the first retry; doubles per attempt.
    pub retry_backoff: Duration,
    /// Worker threads servicing submitted requests.
    pub workers: usize,
    pub metadata_enabled: bool,
    /// Background dirty-driven flushing.
    pub autosave: bool,
    pub flush_edit_limit: u32,
    pub flush_interval: Duration,
    /// Copy the old main-sector contents to the spare when a write triggers
    /// a remap. Read-triggered remaps never copy: the data is already gone.
    pub copy_on_remap: bool,
    /// Accept spares below the 8 MiB minimum (small-device mode).
    pub allow_small_spare: bool,
    /// Initialize fresh metadata when no anchor carries a record magic.
    pub create_if_unformatted: bool,
    /// Discard whatever is on the spare and start over. Dangerous.
    pub force_clean_slate: bool,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            transient_threshold: 3,
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
            workers: 2,
            metadata_enabled: true,
            autosave: true,
            flush_edit_limit: 16,
            flush_interval: Duration::from_secs(5),
            copy_on_remap: true,
            allow_small_spare: false,
            create_if_unformatted: true,
            force_clean_slate: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct EngineMetrics {
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    auto_remaps: AtomicU64,
    manual_remaps: AtomicU64,
    transient_retries: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of the per-engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub read_errors: u64,
    pub write_errors: u64,
    pub auto_remaps: u64,
    pub manual_remaps: u64,
    pub transient_retries: u64,
    pub flushes: u64,
}

impl EngineMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            auto_remaps: self.auto_remaps.load(Ordering::Relaxed),
            manual_remaps: self.manual_remaps.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    main: Arc<dyn BlockDevice>,
    spare: Arc<dyn BlockDevice>,
    config: RemapConfig,
    table: RemapTable,
    allocator: Mutex<SpareAllocator>,
    store: MetaStore,
    metrics: EngineMetrics,
    main_fp: DeviceFingerprint,
    spare_fp: DeviceFingerprint,
    created_ts: u64,
    attach_warnings: Vec<String>,

    fatal: AtomicBool,
    write_degraded: AtomicBool,
    scan_progress: AtomicU8,
    shutdown: AtomicBool,

    queue: Mutex<VecDeque<(IoRequest, CompletionHandle)>>,
    queue_cv: Condvar,
    flusher_lock: Mutex<()>,
    flusher_cv: Condvar,
    transients: Mutex<HashMap<u64, u32>>,
}

/// Handle to one attached remap engine.
pub struct RemapEngine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

impl std::fmt::Debug for RemapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapEngine")
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

impl RemapEngine {
    /// Attaches to a main/spare pair: loads and votes metadata copies,
    /// verifies fingerprints, reconstructs allocator and table, then starts
    /// the worker pool and (optionally) the autosave flusher.
    pub fn attach(
        main: Arc<dyn BlockDevice>,
        spare: Arc<dyn BlockDevice>,
        config: RemapConfig,
    ) -> Result<Self> {
        let main_sectors = main.sector_count();
        let spare_sectors = spare.sector_count();
        if main_sectors == 0 {
            return Err(RemapError::InvalidArgument(
                "main device has no sectors".to_string(),
            ));
        }
        if spare_sectors < MIN_SPARE_SECTORS_ABSOLUTE {
            return Err(RemapError::InvalidArgument(format!(
                "spare device of {spare_sectors} sectors cannot hold metadata"
            )));
        }
        if spare_sectors < MIN_SPARE_SECTORS && !config.allow_small_spare {
            return Err(RemapError::InvalidArgument(format!(
                "spare device of {spare_sectors} sectors is below the 8 MiB minimum \
                 (set allow_small_spare for small-device mode)"
            )));
        }

        // Anchor locations follow from the size-derived strategy; once a
        // record is loaded its stored reserved set becomes the contract.
        let anchors = reserved_for(Strategy::select(spare_sectors), spare_sectors);
        let loaded = if config.force_clean_slate {
            None
        } else {
            Some(load_metadata(&*spare, &anchors))
        };

        let mut warnings = Vec::new();
        let mut initial_stamp = false;
        let (allocator, table, store_seq, main_fp, spare_fp, created_ts) = match loaded {
            Some(found) if found.record.is_some() => {
                warnings.extend(found.warnings.iter().cloned());
                let record = match found.record {
                    Some(record) => record,
                    None => return Err(RemapError::NoValidMetadata),
                };

                let main_score = record
                    .main_fingerprint
                    .similarity(&main.identity(), main_sectors);
                if main_score < 40 {
                    return Err(RemapError::DeviceMismatch {
                        role: "main",
                        score: main_score,
                    });
                }
                if main_score < 60 {
                    warn!(score = main_score, "main device matched with low confidence");
                    warnings.push(format!(
                        "main device matched stored fingerprint with low confidence ({main_score})"
                    ));
                }
                let spare_score = record
                    .spare_fingerprints
                    .iter()
                    .map(|fp| fp.similarity(&spare.identity(), spare_sectors))
                    .max()
                    .unwrap_or(100);
                if spare_score < 40 {
                    return Err(RemapError::DeviceMismatch {
                        role: "spare",
                        score: spare_score,
                    });
                }
                if spare_score < 60 {
                    warn!(score = spare_score, "spare device matched with low confidence");
                    warnings.push(format!(
                        "spare device matched stored fingerprint with low confidence ({spare_score})"
                    ));
                }

                let allocator = SpareAllocator::from_parts(
                    record.allocator.strategy,
                    record.allocator.reserved.clone(),
                    record.allocator.next_free_hint,
                    record.allocator.total_free,
                    record.allocator.total_allocated,
                    spare_sectors,
                )?;
                let table = RemapTable::new();
                for e in &record.entries {
                    if e.status != EntryStatus::Active {
                        continue;
                    }
                    if let Err(err) = table.install(e.logical, e.spare) {
                        warn!(logical = e.logical, error = %err, "dropping inconsistent metadata entry");
                        warnings.push(format!(
                            "dropped inconsistent metadata entry for logical sector {}",
                            e.logical
                        ));
                    }
                }
                let mut main_fp = record.main_fingerprint.clone();
                main_fp.touch();
                let mut spare_fp = record
                    .spare_fingerprints
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DeviceFingerprint::capture(&*spare));
                spare_fp.touch();
                (
                    allocator,
                    table,
                    record.sequence,
                    main_fp,
                    spare_fp,
                    record.created_ts,
                )
            }
            Some(found) if found.any_magic && !config.force_clean_slate => {
                // Records exist but none validated.
                return Err(RemapError::NoValidMetadata);
            }
            _ => {
                // Blank spare (or forced re-init): clean-slate construction.
                if !config.create_if_unformatted && !config.force_clean_slate {
                    return Err(RemapError::NoValidMetadata);
                }
                initial_stamp = config.metadata_enabled;
                (
                    SpareAllocator::new(spare_sectors),
                    RemapTable::new(),
                    0,
                    DeviceFingerprint::capture(&*main),
                    DeviceFingerprint::capture(&*spare),
                    unix_now(),
                )
            }
        };

        let store = MetaStore::new(
            Arc::clone(&spare),
            allocator.reserved().to_vec(),
            config.metadata_enabled,
            config.flush_edit_limit,
            config.flush_interval,
            store_seq,
        );

        let shared = Arc::new(Shared {
            main,
            spare,
            table,
            allocator: Mutex::new(allocator),
            store,
            metrics: EngineMetrics::default(),
            main_fp,
            spare_fp,
            created_ts,
            attach_warnings: warnings,
            fatal: AtomicBool::new(false),
            write_degraded: AtomicBool::new(false),
            scan_progress: AtomicU8::new(0),
            shutdown: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            flusher_lock: Mutex::new(()),
            flusher_cv: Condvar::new(),
            transients: Mutex::new(HashMap::new()),
            config,
        });

        if initial_stamp {
            shared.flush_metadata(true)?;
        }

        let worker_count = shared.config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let s = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || worker_loop(s)));
        }
        let flusher = if shared.config.autosave && shared.config.metadata_enabled {
            let s = Arc::clone(&shared);
            Some(std::thread::spawn(move || flusher_loop(s)))
        } else {
            None
        };

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            flusher: Mutex::new(flusher),
            detached: AtomicBool::new(false),
        })
    }

    /// Queues one request. The returned completion resolves with the read
    /// data (reads) or empty payload (everything else).
    pub fn submit(&self, request: IoRequest) -> Completion {
        let (completion, handle) = Completion::new();
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            handle.complete(Err(RemapError::Detached));
            return completion;
        }
        if let Err(e) = shared.validate_request(&request) {
            handle.complete(Err(e));
            return completion;
        }
        if request.n_sectors == 0 && request.kind != IoKind::Flush {
            handle.complete(Ok(Vec::new()));
            return completion;
        }
        let mut queue = shared.queue.lock().unwrap();
        queue.push_back((request, handle));
        shared.queue_cv.notify_one();
        drop(queue);
        completion
    }

    /// Free-form administrative channel. Verbs: `status`, `remap <logical>`,
    /// `verify <logical>`, `save`, `sync`, `clear`.
    pub fn message(&self, msg: &str) -> Result<String> {
        let mut parts = msg.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| RemapError::InvalidArgument("empty message".to_string()))?;
        match verb {
            "status" => Ok(self.status()),
            "remap" => {
                let sector = parse_sector(parts.next())?;
                let spare = self.shared.manual_remap(sector)?;
                Ok(format!("logical sector {sector} mapped to spare sector {spare}"))
            }
            "verify" => {
                let sector = parse_sector(parts.next())?;
                match self.shared.table.peek(sector) {
                    Some(e) => Ok(format!(
                        "logical sector {} -> spare sector {} ({:?})",
                        e.logical, e.spare, e.status
                    )),
                    None => Ok(format!("logical sector {sector} is not remapped")),
                }
            }
            "save" => {
                self.shared.flush_metadata(false)?;
                Ok("metadata saved".to_string())
            }
            "sync" => {
                self.shared.sync_all()?;
                Ok("synced".to_string())
            }
            "clear" => {
                warn!("remap table cleared by operator");
                self.shared.table.clear();
                self.shared.store.note_edit();
                Ok("remap table cleared".to_string())
            }
            other => Err(RemapError::UnknownVerb(other.to_string())),
        }
    }

    /// The administrative status line.
    pub fn status(&self) -> String {
        let s = &self.shared;
        let (cap, used, allocated) = {
            let alloc = s.allocator.lock().unwrap();
            (
                alloc.spare_sectors(),
                alloc.total_allocated() + alloc.reserved().len() as u64,
                alloc.total_allocated(),
            )
        };
        let remapped = s.table.active_len() as u64;
        let m = s.metrics.snapshot();
        let metadata = if s.store.enabled() { "enabled" } else { "disabled" };
        let autosave = if s.config.autosave
            && s.config.metadata_enabled
            && !s.shutdown.load(Ordering::Acquire)
        {
            "active"
        } else {
            "idle"
        };
        format!(
            "v{}.{} {used}/{cap} {remapped}/{cap} {allocated}/{cap} health={} \
             errors=W{}:R{} auto_remaps={} manual_remaps={} scan={}% metadata={metadata} autosave={autosave}",
            FORMAT_MAJOR,
            FORMAT_MINOR,
            self.health(),
            m.write_errors,
            m.read_errors,
            m.auto_remaps,
            m.manual_remaps,
            s.scan_progress.load(Ordering::Relaxed),
        )
    }

    /// 0 healthy, 1 degraded (errors observed), 2 failing (allocator
    /// exhausted / writes degraded), 3 fatal (structural failure).
    pub fn health(&self) -> u8 {
        let s = &self.shared;
        if s.fatal.load(Ordering::Acquire) {
            return 3;
        }
        if s.write_degraded.load(Ordering::Acquire) {
            return 2;
        }
        let m = s.metrics.snapshot();
        if m.read_errors + m.write_errors > 0 {
            return 1;
        }
        0
    }

    /// Integration point for the external health-scan scrubber.
    pub fn set_scan_progress(&self, percent: u8) {
        self.shared
            .scan_progress
            .store(percent.min(100), Ordering::Relaxed);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn lookup(&self, logical: u64) -> Option<(u64, EntryStatus)> {
        self.shared.table.lookup(logical)
    }

    pub fn remapped_count(&self) -> usize {
        self.shared.table.active_len()
    }

    pub fn strategy(&self) -> Strategy {
        self.shared.allocator.lock().unwrap().strategy()
    }

    /// The metadata anchor set, ascending.
    pub fn reserved_sectors(&self) -> Vec<u64> {
        self.shared.allocator.lock().unwrap().reserved().to_vec()
    }

    /// Sequence counter of the newest persisted record.
    pub fn metadata_sequence(&self) -> u64 {
        self.shared.store.sequence()
    }

    /// Anomalies observed while loading metadata at attach.
    pub fn attach_warnings(&self) -> Vec<String> {
        self.shared.attach_warnings.clone()
    }

    /// Drains in-flight requests, performs a final synchronous flush and
    /// releases the devices.
    pub fn detach(self) -> Result<()> {
        self.shutdown_and_join();
        self.detached.store(true, Ordering::Release);
        let _ = self.shared.main.flush();
        if self.shared.store.is_dirty() {
            self.shared.flush_metadata(false)?;
        }
        Ok(())
    }

    fn shutdown_and_join(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.queue_cv.notify_all();
        }
        {
            let _guard = self.shared.flusher_lock.lock().unwrap();
            self.shared.flusher_cv.notify_all();
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RemapEngine {
    fn drop(&mut self) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        self.shutdown_and_join();
        if self.shared.store.is_dirty() {
            if let Err(e) = self.shared.flush_metadata(false) {
                warn!(error = %e, "final metadata flush failed during drop");
            }
        }
    }
}

fn parse_sector(arg: Option<&str>) -> Result<u64> {
    let raw = arg.ok_or_else(|| {
        RemapError::InvalidArgument("expected a logical sector argument".to_string())
    })?;
    raw.parse::<u64>()
        .map_err(|_| RemapError::InvalidArgument(format!("bad sector number: {raw}")))
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(item) = queue.pop_front() {
                    break Some(item);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared.queue_cv.wait(queue).unwrap();
            }
        };
        let Some((request, handle)) = item else { return };
        let result = shared.execute(&request);
        handle.complete(result);
    }
}

fn flusher_loop(shared: Arc<Shared>) {
    // Poll interval well under the flush watermark.
    let tick = Duration::from_millis(250);
    loop {
        {
            let guard = shared.flusher_lock.lock().unwrap();
            let _ = shared.flusher_cv.wait_timeout(guard, tick).unwrap();
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if shared.store.wants_flush() {
            if let Err(e) = shared.flush_metadata(false) {
                warn!(error = %e, "autosave flush failed");
            }
        }
    }
}

impl Shared {
    fn validate_request(&self, request: &IoRequest) -> Result<()> {
        let capacity = self.main.sector_count();
        match request.kind {
            IoKind::Flush => Ok(()),
            IoKind::Read | IoKind::Discard => {
                let end = request
                    .sector
                    .checked_add(request.n_sectors)
                    .ok_or(RemapError::OutOfBounds {
                        sector: request.sector,
                        n_sectors: request.n_sectors,
                        capacity,
                    })?;
                if end > capacity {
                    return Err(RemapError::OutOfBounds {
                        sector: request.sector,
                        n_sectors: request.n_sectors,
                        capacity,
                    });
                }
                Ok(())
            }
            IoKind::Write => {
                if request.payload.len() != (request.n_sectors as usize) * SECTOR_SIZE {
                    return Err(RemapError::InvalidArgument(format!(
                        "write payload of {} bytes does not cover {} sectors",
                        request.payload.len(),
                        request.n_sectors
                    )));
                }
                let end = request
                    .sector
                    .checked_add(request.n_sectors)
                    .ok_or(RemapError::OutOfBounds {
                        sector: request.sector,
                        n_sectors: request.n_sectors,
                        capacity,
                    })?;
                if end > capacity {
                    return Err(RemapError::OutOfBounds {
                        sector: request.sector,
                        n_sectors: request.n_sectors,
                        capacity,
                    });
                }
                Ok(())
            }
        }
    }

    fn execute(&self, request: &IoRequest) -> Result<Vec<u8>> {
        match request.kind {
            IoKind::Flush => self.execute_flush(),
            IoKind::Discard => {
                // Neither device exposes discard; accepted as a no-op.
                debug!(sector = request.sector, n = request.n_sectors, "discard ignored");
                Ok(Vec::new())
            }
            IoKind::Read => self.execute_read(request),
            IoKind::Write => self.execute_write(request),
        }
    }

    fn execute_flush(&self) -> Result<Vec<u8>> {
        let mut err = None;
        if let Err(e) = self.main.flush() {
            err = worst(err, Some(self.map_device_error("main", &e)));
        }
        if let Err(e) = self.spare.flush() {
            err = worst(err, Some(self.map_device_error("spare", &e)));
        }
        if err.is_none() {
            if let Err(e) = self.flush_metadata(false) {
                err = Some(e);
            }
        }
        match err {
            None => Ok(Vec::new()),
            Some(e) => Err(e),
        }
    }

    fn execute_read(&self, request: &IoRequest) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (request.n_sectors as usize) * SECTOR_SIZE];
        let mut err = None;
        for seg in plan(&self.table, request.sector, request.n_sectors) {
            let off = ((seg.logical_start - request.sector) as usize) * SECTOR_SIZE;
            let len = (seg.n_sectors as usize) * SECTOR_SIZE;
            let slice = &mut buf[off..off + len];
            let seg_err = match seg.target {
                SegmentTarget::Main => self.read_main_segment(&seg, slice),
                SegmentTarget::Spare => self.read_spare_segment(&seg, slice),
            };
            err = worst(err, seg_err);
        }
        match err {
            None => Ok(buf),
            Some(e) => Err(e),
        }
    }

    fn execute_write(&self, request: &IoRequest) -> Result<Vec<u8>> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(RemapError::StructuralIo {
                role: "main",
                detail: "engine is read-only after a structural failure".to_string(),
            });
        }
        let mut err = None;
        for seg in plan(&self.table, request.sector, request.n_sectors) {
            let off = ((seg.logical_start - request.sector) as usize) * SECTOR_SIZE;
            let len = (seg.n_sectors as usize) * SECTOR_SIZE;
            let slice = &request.payload[off..off + len];
            let seg_err = match seg.target {
                SegmentTarget::Main => self.write_main_segment(&seg, slice),
                SegmentTarget::Spare => self.write_spare_segment(&seg, slice),
            };
            err = worst(err, seg_err);
        }
        match err {
            None => Ok(Vec::new()),
            Some(e) => Err(e),
        }
    }

    fn read_main_segment(&self, seg: &Segment, buf: &mut [u8]) -> Option<RemapError> {
        let e = match self.with_retries(|| self.main.read_sectors(seg.dev_sector, buf)) {
            Ok(()) => return None,
            Err(e) => e,
        };
        self.metrics.read_errors.fetch_add(1, Ordering::Relaxed);
        match e.class() {
            ErrorClass::Structural => Some(self.mark_fatal("main", &e)),
            ErrorClass::Transient => {
                if self.note_transient(seg.logical_start) > self.config.transient_threshold {
                    self.read_main_degraded(seg, buf, &e)
                } else {
                    Some(RemapError::TransientIo {
                        role: "main",
                        sector: e.sector().unwrap_or(seg.dev_sector),
                        detail: e.to_string(),
                    })
                }
            }
            ErrorClass::Permanent => self.read_main_degraded(seg, buf, &e),
        }
    }

    /// A multi-sector segment failed with a hard error: narrow the failure
    /// per sector so healthy neighbours are neither lost nor remapped.
    fn read_main_degraded(
        &self,
        seg: &Segment,
        buf: &mut [u8],
        original: &DeviceError,
    ) -> Option<RemapError> {
        if seg.n_sectors == 1 {
            return Some(self.remap_after_read_failure(seg, original));
        }
        let mut err = None;
        for i in 0..seg.n_sectors {
            let logical = seg.logical_start + i;
            let chunk = &mut buf[(i as usize) * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            let sub = Segment {
                target: SegmentTarget::Main,
                dev_sector: logical,
                logical_start: logical,
                n_sectors: 1,
            };
            match self.with_retries(|| self.main.read_sectors(logical, chunk)) {
                Ok(()) => {}
                Err(e) if e.class() == ErrorClass::Structural => {
                    err = worst(err, Some(self.mark_fatal("main", &e)));
                    break;
                }
                Err(e) => {
                    err = worst(err, Some(self.remap_after_read_failure(&sub, &e)));
                }
            }
        }
        err
    }

    fn read_spare_segment(&self, seg: &Segment, buf: &mut [u8]) -> Option<RemapError> {
        match self.with_retries(|| self.spare.read_sectors(seg.dev_sector, buf)) {
            Ok(()) => None,
            Err(e) => {
                self.metrics.read_errors.fetch_add(1, Ordering::Relaxed);
                Some(self.map_device_error("spare", &e))
            }
        }
    }

    fn write_main_segment(&self, seg: &Segment, payload: &[u8]) -> Option<RemapError> {
        let e = match self.with_retries(|| self.main.write_sectors(seg.dev_sector, payload)) {
            Ok(()) => return None,
            Err(e) => e,
        };
        self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
        match e.class() {
            ErrorClass::Structural => Some(self.mark_fatal("main", &e)),
            ErrorClass::Transient => {
                if self.note_transient(seg.logical_start) > self.config.transient_threshold {
                    self.write_main_degraded(seg, payload, &e)
                } else {
                    Some(RemapError::TransientIo {
                        role: "main",
                        sector: e.sector().unwrap_or(seg.dev_sector),
                        detail: e.to_string(),
                    })
                }
            }
            ErrorClass::Permanent => self.write_main_degraded(seg, payload, &e),
        }
    }

    /// Per-sector narrowing of a failed multi-sector write: only sectors
    /// that individually fail get remapped; the rest land on the main
    /// device as usual.
    fn write_main_degraded(
        &self,
        seg: &Segment,
        payload: &[u8],
        original: &DeviceError,
    ) -> Option<RemapError> {
        if seg.n_sectors == 1 {
            return self.remap_and_reissue_write(seg, payload, original);
        }
        let mut err = None;
        for i in 0..seg.n_sectors {
            let logical = seg.logical_start + i;
            let chunk = &payload[(i as usize) * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            let sub = Segment {
                target: SegmentTarget::Main,
                dev_sector: logical,
                logical_start: logical,
                n_sectors: 1,
            };
            match self.with_retries(|| self.main.write_sectors(logical, chunk)) {
                Ok(()) => {}
                Err(e) if e.class() == ErrorClass::Structural => {
                    err = worst(err, Some(self.mark_fatal("main", &e)));
                    break;
                }
                Err(e) => {
                    err = worst(err, self.remap_and_reissue_write(&sub, chunk, &e));
                }
            }
        }
        err
    }

    fn write_spare_segment(&self, seg: &Segment, payload: &[u8]) -> Option<RemapError> {
        match self.with_retries(|| self.spare.write_sectors(seg.dev_sector, payload)) {
            Ok(()) => None,
            Err(e) => {
                self.metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                Some(self.map_device_error("spare", &e))
            }
        }
    }

    /// Write path of the auto-remap controller: remap each failed sector and
    /// re-issue its slice of the payload against the spare. The parent
    /// request succeeds if every re-issue does.
    fn remap_and_reissue_write(
        &self,
        seg: &Segment,
        payload: &[u8],
        original: &DeviceError,
    ) -> Option<RemapError> {
        let mut err = None;
        for i in 0..seg.n_sectors {
            let logical = seg.logical_start + i;
            let chunk = &payload[(i as usize) * SECTOR_SIZE..(i as usize + 1) * SECTOR_SIZE];
            match self.remap_sector(logical, self.config.copy_on_remap, false) {
                Ok(spare_sector) => {
                    if let Err(e) = self.with_retries(|| self.spare.write_sectors(spare_sector, chunk)) {
                        err = worst(err, Some(self.map_device_error("spare", &e)));
                    }
                }
                Err(RemapError::AllocatorExhausted) => {
                    self.degrade_writes();
                    err = worst(
                        err,
                        Some(RemapError::PermanentIo {
                            role: "main",
                            sector: logical,
                            detail: original.to_string(),
                        }),
                    );
                }
                Err(e) => err = worst(err, Some(e)),
            }
        }
        err
    }

    /// Read path of the auto-remap controller: the sector's data is lost, so
    /// mappings are installed for future I/O and the original error is
    /// surfaced unchanged.
    fn remap_after_read_failure(&self, seg: &Segment, original: &DeviceError) -> RemapError {
        for i in 0..seg.n_sectors {
            let logical = seg.logical_start + i;
            match self.remap_sector(logical, false, false) {
                Ok(_) => {}
                Err(RemapError::AllocatorExhausted) => {
                    self.degrade_writes();
                    break;
                }
                Err(e) => {
                    debug!(sector = logical, error = %e, "auto-remap after read failure incomplete");
                }
            }
        }
        RemapError::PermanentIo {
            role: "main",
            sector: original.sector().unwrap_or(seg.dev_sector),
            detail: original.to_string(),
        }
    }

    /// Remap procedure for a single logical sector. Entries are installed
    /// independently, so a remapped range is generally not contiguous on the
    /// spare device.
    fn remap_sector(&self, logical: u64, copy_previous: bool, manual: bool) -> Result<u64> {
        loop {
            let outcome = self
                .table
                .begin_remap(logical, || self.allocator.lock().unwrap().allocate())?;
            match outcome {
                RemapOutcome::Existing(spare) => return Ok(spare),
                RemapOutcome::InProgress => {
                    // Another request is mid-remap; wait for it to resolve.
                    match self.table.lookup(logical) {
                        Some((spare, EntryStatus::Active)) => return Ok(spare),
                        _ => continue,
                    }
                }
                RemapOutcome::Started(spare) => {
                    if copy_previous {
                        // Best-effort preservation of the old contents; a
                        // failed read means the data is already lost.
                        let mut old = vec![0u8; SECTOR_SIZE];
                        if self.main.read_sectors(logical, &mut old).is_ok() {
                            if let Err(e) = self.spare.write_sectors(spare, &old) {
                                warn!(logical, spare, error = %e, "copy-forward to spare failed");
                                self.table.fail_pending(logical);
                                return Err(self.map_device_error("spare", &e));
                            }
                        }
                    }
                    self.table.promote(logical);
                    self.store.note_edit();
                    self.transients.lock().unwrap().remove(&logical);
                    if manual {
                        self.metrics.manual_remaps.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.metrics.auto_remaps.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(logical, spare, manual, "sector remapped");
                    return Ok(spare);
                }
            }
        }
    }

    fn manual_remap(&self, logical: u64) -> Result<u64> {
        if logical >= self.main.sector_count() {
            return Err(RemapError::OutOfBounds {
                sector: logical,
                n_sectors: 1,
                capacity: self.main.sector_count(),
            });
        }
        match self.remap_sector(logical, self.config.copy_on_remap, true) {
            Err(RemapError::AllocatorExhausted) => {
                self.degrade_writes();
                Err(RemapError::AllocatorExhausted)
            }
            other => other,
        }
    }

    fn with_retries<F>(&self, mut op: F) -> crate::device::DeviceResult<()>
    where
        F: FnMut() -> crate::device::DeviceResult<()>,
    {
        let mut result = op();
        let mut attempt = 0u32;
        while let Err(e) = &result {
            if e.class() != ErrorClass::Transient || attempt >= self.config.max_retries {
                break;
            }
            std::thread::sleep(self.config.retry_backoff * (1u32 << attempt));
            self.metrics.transient_retries.fetch_add(1, Ordering::Relaxed);
            attempt += 1;
            result = op();
        }
        result
    }

    fn note_transient(&self, range_start: u64) -> u32 {
        let mut transients = self.transients.lock().unwrap();
        let count = transients.entry(range_start).or_insert(0);
        *count += 1;
        *count
    }

    fn degrade_writes(&self) {
        if !self.write_degraded.swap(true, Ordering::AcqRel) {
            error!("spare allocator exhausted; new remaps impossible, writes degraded");
        }
    }

    fn mark_fatal(&self, role: &'static str, e: &DeviceError) -> RemapError {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            error!(role, error = %e, "structural device failure; engine is now read-only");
        }
        RemapError::StructuralIo {
            role,
            detail: e.to_string(),
        }
    }

    fn map_device_error(&self, role: &'static str, e: &DeviceError) -> RemapError {
        match e.class() {
            ErrorClass::Structural => self.mark_fatal(role, e),
            ErrorClass::Transient => RemapError::TransientIo {
                role,
                sector: e.sector().unwrap_or(0),
                detail: e.to_string(),
            },
            ErrorClass::Permanent => RemapError::PermanentIo {
                role,
                sector: e.sector().unwrap_or(0),
                detail: e.to_string(),
            },
        }
    }

    fn sync_all(&self) -> Result<FlushStats> {
        if let Err(e) = self.main.flush() {
            return Err(self.map_device_error("main", &e));
        }
        if let Err(e) = self.spare.flush() {
            return Err(self.map_device_error("spare", &e));
        }
        self.flush_metadata(false)
    }

    fn flush_metadata(&self, force: bool) -> Result<FlushStats> {
        if !force && !self.store.is_dirty() {
            return Ok(FlushStats {
                sequence: self.store.sequence(),
                anchors_written: 0,
                anchors_failed: 0,
            });
        }
        let stats = self.store.flush_with(|sequence, parent| {
            self.build_record(sequence, parent)
        })?;
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(stats)
    }

    fn build_record(&self, sequence: u64, parent_sequence: u64) -> MetadataRecord {
        let entries = self
            .table
            .snapshot()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Active)
            .collect();
        let allocator = AllocatorConfig::from_allocator(&self.allocator.lock().unwrap());
        let mut main_fingerprint = self.main_fp.clone();
        main_fingerprint.touch();
        let mut spare_fp = self.spare_fp.clone();
        spare_fp.touch();
        MetadataRecord {
            version_major: FORMAT_MAJOR,
            version_minor: FORMAT_MINOR,
            sequence,
            parent_sequence,
            created_ts: self.created_ts,
            modified_ts: unix_now(),
            main_fingerprint,
            spare_fingerprints: vec![spare_fp],
            allocator,
            params: TargetParams {
                transient_threshold: self.config.transient_threshold,
                max_retries: self.config.max_retries,
                flush_edit_limit: self.config.flush_edit_limit,
                flush_interval_secs: self.config.flush_interval.as_secs() as u32,
            },
            entries,
        }
    }
}
