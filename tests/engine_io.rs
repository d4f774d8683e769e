use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use remapdisk::{
    BlockDevice, DeviceError, DeviceIdentity, DeviceKind, DeviceResult, EntryStatus, IoRequest,
    MemDevice, RemapConfig, RemapEngine, RemapError, SECTOR_SIZE,
};

/// Main-device stand-in with per-sector fault injection.
struct FlakyDevice {
    inner: MemDevice,
    media_bad_writes: Mutex<HashSet<u64>>,
    media_bad_reads: Mutex<HashSet<u64>>,
    /// Sector → remaining transient failures before the op succeeds.
    transient_writes: Mutex<HashMap<u64, u32>>,
    gone: AtomicBool,
}

impl FlakyDevice {
    fn new(sector_count: u64) -> Self {
        Self {
            inner: MemDevice::new(sector_count),
            media_bad_writes: Mutex::new(HashSet::new()),
            media_bad_reads: Mutex::new(HashSet::new()),
            transient_writes: Mutex::new(HashMap::new()),
            gone: AtomicBool::new(false),
        }
    }

    fn fail_writes_at(&self, sector: u64) {
        self.media_bad_writes.lock().unwrap().insert(sector);
    }

    fn fail_reads_at(&self, sector: u64) {
        self.media_bad_reads.lock().unwrap().insert(sector);
    }

    fn fail_writes_transiently(&self, sector: u64, times: u32) {
        self.transient_writes.lock().unwrap().insert(sector, times);
    }

    fn unplug(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }
}

impl BlockDevice for FlakyDevice {
    fn sector_count(&self) -> u64 {
        self.inner.sector_count()
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> DeviceResult<()> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(DeviceError::Gone("test device unplugged".into()));
        }
        let bad = self.media_bad_reads.lock().unwrap();
        for s in sector..sector + (buf.len() / SECTOR_SIZE) as u64 {
            if bad.contains(&s) {
                return Err(DeviceError::Media { sector: s });
            }
        }
        drop(bad);
        self.inner.read_sectors(sector, buf)
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> DeviceResult<()> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(DeviceError::Gone("test device unplugged".into()));
        }
        let n = (buf.len() / SECTOR_SIZE) as u64;
        {
            let mut transient = self.transient_writes.lock().unwrap();
            for s in sector..sector + n {
                if let Some(remaining) = transient.get_mut(&s) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(DeviceError::Transient {
                            sector: s,
                            detail: "injected busy".into(),
                        });
                    }
                }
            }
        }
        let bad = self.media_bad_writes.lock().unwrap();
        for s in sector..sector + n {
            if bad.contains(&s) {
                return Err(DeviceError::Media { sector: s });
            }
        }
        drop(bad);
        self.inner.write_sectors(sector, buf)
    }

    fn flush(&self) -> DeviceResult<()> {
        self.inner.flush()
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            path: "flaky-main".into(),
            serial: Some("FLAKY-1".into()),
            model: None,
            uuid: None,
            kind: DeviceKind::Memory,
        }
    }
}

fn sector_of(byte: u8) -> Vec<u8> {
    vec![byte; SECTOR_SIZE]
}

fn fast_config() -> RemapConfig {
    RemapConfig {
        autosave: false,
        retry_backoff: std::time::Duration::from_millis(1),
        ..RemapConfig::default()
    }
}

fn attach_flaky(main_sectors: u64) -> (Arc<FlakyDevice>, Arc<MemDevice>, RemapEngine) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let main = Arc::new(FlakyDevice::new(main_sectors));
    let spare = Arc::new(MemDevice::new(16384)); // 8 MiB
    let engine = RemapEngine::attach(
        Arc::clone(&main) as Arc<dyn BlockDevice>,
        Arc::clone(&spare) as Arc<dyn BlockDevice>,
        fast_config(),
    )
    .unwrap();
    (main, spare, engine)
}

#[test]
fn clean_write_and_read_round_trip() {
    let (_main, _spare, engine) = attach_flaky(4096);

    let mut payload = sector_of(0);
    payload[..5].copy_from_slice(b"HELLO");
    engine
        .submit(IoRequest::write(42, payload.clone()))
        .wait()
        .unwrap();

    let back = engine.submit(IoRequest::read(42, 1)).wait().unwrap();
    assert_eq!(back, payload);
    assert_eq!(engine.remapped_count(), 0);
    engine.detach().unwrap();
}

#[test]
fn zero_length_write_completes_immediately() {
    let (_main, _spare, engine) = attach_flaky(4096);
    let out = engine.submit(IoRequest::write(0, Vec::new())).wait().unwrap();
    assert!(out.is_empty());
    engine.detach().unwrap();
}

#[test]
fn out_of_bounds_request_is_rejected() {
    let (_main, _spare, engine) = attach_flaky(100);
    let err = engine.submit(IoRequest::read(90, 20)).wait().unwrap_err();
    assert!(matches!(err, RemapError::OutOfBounds { .. }));
    engine.detach().unwrap();
}

#[test]
fn permanent_write_failure_remaps_and_succeeds() {
    // Scenario: write to a logical sector whose main copy fails permanently.
    let (main, spare, engine) = attach_flaky(4096);
    main.fail_writes_at(1000);

    let mut payload = sector_of(0);
    payload[..5].copy_from_slice(b"HELLO");
    engine
        .submit(IoRequest::write(1000, payload.clone()))
        .wait()
        .unwrap();

    let (spare_sector, status) = engine.lookup(1000).expect("sector 1000 must be remapped");
    assert_eq!(status, EntryStatus::Active);
    assert!(!engine.reserved_sectors().contains(&spare_sector));

    // The payload landed on the spare device, not the main one.
    let spare_bytes = spare.snapshot();
    let off = (spare_sector as usize) * SECTOR_SIZE;
    assert_eq!(&spare_bytes[off..off + 5], b"HELLO");

    // Subsequent reads go through the mapping.
    let back = engine.submit(IoRequest::read(1000, 1)).wait().unwrap();
    assert_eq!(back, payload);

    assert_eq!(engine.metrics().auto_remaps, 1);
    engine.detach().unwrap();
}

#[test]
fn write_spanning_good_and_bad_sectors_splits() {
    let (main, _spare, engine) = attach_flaky(4096);
    main.fail_writes_at(11);

    let mut payload = sector_of(0xAA);
    payload.extend_from_slice(&sector_of(0xBB));
    payload.extend_from_slice(&sector_of(0xCC));
    engine
        .submit(IoRequest::write(10, payload.clone()))
        .wait()
        .unwrap();

    // Only the failing sector was remapped.
    assert_eq!(engine.lookup(10), None);
    assert!(engine.lookup(11).is_some());
    assert_eq!(engine.lookup(12), None);

    // The healthy neighbours live on the main device.
    let main_bytes = main.inner.snapshot();
    assert_eq!(main_bytes[10 * SECTOR_SIZE], 0xAA);
    assert_eq!(main_bytes[12 * SECTOR_SIZE], 0xCC);

    // The whole range reads back through the split.
    let back = engine.submit(IoRequest::read(10, 3)).wait().unwrap();
    assert_eq!(back, payload);
    engine.detach().unwrap();
}

#[test]
fn remapped_and_unmapped_sectors_read_as_two_sub_requests() {
    let (_main, _spare, engine) = attach_flaky(4096);

    engine.message("remap 21").unwrap();
    engine
        .submit(IoRequest::write(20, [sector_of(1), sector_of(2)].concat()))
        .wait()
        .unwrap();

    let back = engine.submit(IoRequest::read(20, 2)).wait().unwrap();
    assert_eq!(&back[..SECTOR_SIZE], sector_of(1).as_slice());
    assert_eq!(&back[SECTOR_SIZE..], sector_of(2).as_slice());
    engine.detach().unwrap();
}

#[test]
fn transient_failures_are_retried_not_remapped() {
    let (main, _spare, engine) = attach_flaky(4096);
    // Two transient failures, then success: below max_retries.
    main.fail_writes_transiently(50, 2);

    engine
        .submit(IoRequest::write(50, sector_of(0x42)))
        .wait()
        .unwrap();

    assert_eq!(engine.lookup(50), None, "transient error must not remap");
    assert!(engine.metrics().transient_retries >= 2);
    engine.detach().unwrap();
}

#[test]
fn permanent_read_failure_surfaces_error_but_installs_remap() {
    let (main, _spare, engine) = attach_flaky(4096);
    main.fail_reads_at(77);

    let err = engine.submit(IoRequest::read(77, 1)).wait().unwrap_err();
    assert!(matches!(err, RemapError::PermanentIo { .. }));

    // The remap is effective for the next I/O to that logical sector.
    let (_, status) = engine.lookup(77).expect("read failure must install a remap");
    assert_eq!(status, EntryStatus::Active);

    engine
        .submit(IoRequest::write(77, sector_of(0x99)))
        .wait()
        .unwrap();
    let back = engine.submit(IoRequest::read(77, 1)).wait().unwrap();
    assert_eq!(back, sector_of(0x99));
    engine.detach().unwrap();
}

#[test]
fn structural_failure_is_fatal_and_blocks_writes() {
    let (main, _spare, engine) = attach_flaky(4096);
    main.unplug();

    let err = engine
        .submit(IoRequest::write(5, sector_of(1)))
        .wait()
        .unwrap_err();
    assert!(matches!(err, RemapError::StructuralIo { .. }));
    assert_eq!(engine.lookup(5), None, "structural failures never remap");
    assert_eq!(engine.health(), 3);

    // Writes are now refused outright.
    let err = engine
        .submit(IoRequest::write(6, sector_of(2)))
        .wait()
        .unwrap_err();
    assert!(matches!(err, RemapError::StructuralIo { .. }));
    engine.detach().unwrap();
}

#[test]
fn exhausted_allocator_degrades_writes_but_spares_healthy_sectors() {
    let main = Arc::new(FlakyDevice::new(4096));
    // Minimal-strategy spare: 300 sectors, 299 allocatable.
    let spare = Arc::new(MemDevice::new(300));
    let config = RemapConfig {
        allow_small_spare: true,
        autosave: false,
        metadata_enabled: false,
        retry_backoff: std::time::Duration::from_millis(1),
        ..RemapConfig::default()
    };
    let engine = RemapEngine::attach(
        Arc::clone(&main) as Arc<dyn BlockDevice>,
        spare,
        config,
    )
    .unwrap();

    let free = 299u64;
    for s in 0..free {
        main.fail_writes_at(s);
        engine
            .submit(IoRequest::write(s, sector_of(1)))
            .wait()
            .unwrap();
    }
    assert_eq!(engine.remapped_count() as u64, free);

    // The next failing sector cannot be remapped.
    main.fail_writes_at(2000);
    let err = engine
        .submit(IoRequest::write(2000, sector_of(2)))
        .wait()
        .unwrap_err();
    assert!(matches!(err, RemapError::PermanentIo { .. }));
    assert_eq!(engine.health(), 2);

    // Writes to healthy, unmapped sectors still pass through.
    engine
        .submit(IoRequest::write(3000, sector_of(3)))
        .wait()
        .unwrap();
    let back = engine.submit(IoRequest::read(3000, 1)).wait().unwrap();
    assert_eq!(back, sector_of(3));
    engine.detach().unwrap();
}

#[test]
fn concurrent_writers_hitting_the_same_bad_sector_install_one_mapping() {
    let (main, _spare, engine) = attach_flaky(4096);
    main.fail_writes_at(500);
    let engine = Arc::new(engine);

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine
                    .submit(IoRequest::write(500, sector_of(i as u8)))
                    .wait()
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap().unwrap();
    }

    assert_eq!(engine.remapped_count(), 1);
    let (spare_sector, status) = engine.lookup(500).unwrap();
    assert_eq!(status, EntryStatus::Active);
    assert!(spare_sector > 0);
}
