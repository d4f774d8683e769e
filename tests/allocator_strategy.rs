use std::sync::Arc;

use remapdisk::{MemDevice, RemapConfig, RemapEngine, RemapError, SpareAllocator, Strategy};

const MIB: u64 = 1024 * 1024 / 512;

fn attach(main_sectors: u64, spare_sectors: u64, allow_small: bool) -> RemapEngine {
    let main = Arc::new(MemDevice::new(main_sectors));
    let spare = Arc::new(MemDevice::new(spare_sectors));
    let config = RemapConfig {
        allow_small_spare: allow_small,
        autosave: false,
        ..RemapConfig::default()
    };
    RemapEngine::attach(main, spare, config).unwrap()
}

#[test]
fn eight_mib_spare_selects_geometric_reservations() {
    let engine = attach(64 * MIB, 8 * MIB, false);
    assert_eq!(engine.strategy(), Strategy::Geometric);
    assert_eq!(engine.reserved_sectors(), vec![0, 1024, 2048, 4096, 8192]);
    engine.detach().unwrap();
}

#[test]
fn two_mib_spare_selects_linear_thirds() {
    let n = 2 * MIB; // 4096 sectors
    let engine = attach(64 * MIB, n, true);
    assert_eq!(engine.strategy(), Strategy::Linear);
    assert_eq!(engine.reserved_sectors(), vec![0, n / 3, 2 * n / 3]);
    engine.detach().unwrap();
}

#[test]
fn tiny_spare_selects_minimal() {
    let engine = attach(MIB, 256, true); // 128 KiB
    assert_eq!(engine.strategy(), Strategy::Minimal);
    assert_eq!(engine.reserved_sectors(), vec![0]);
    engine.detach().unwrap();
}

#[test]
fn spare_below_minimum_is_refused_without_small_device_mode() {
    let main = Arc::new(MemDevice::new(64 * MIB));
    let spare = Arc::new(MemDevice::new(2 * MIB));
    let err = RemapEngine::attach(main, spare, RemapConfig::default()).unwrap_err();
    assert!(matches!(err, RemapError::InvalidArgument(_)));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn spare_too_small_for_metadata_is_always_refused() {
    let main = Arc::new(MemDevice::new(64 * MIB));
    let spare = Arc::new(MemDevice::new(64));
    let config = RemapConfig {
        allow_small_spare: true,
        ..RemapConfig::default()
    };
    let err = RemapEngine::attach(main, spare, config).unwrap_err();
    assert!(matches!(err, RemapError::InvalidArgument(_)));
}

#[test]
fn five_hundred_allocations_avoid_every_reservation() {
    // Geometric, 8 MiB spare.
    let mut alloc = SpareAllocator::new(8 * MIB);
    let reserved = alloc.reserved().to_vec();
    assert_eq!(reserved, vec![0, 1024, 2048, 4096, 8192]);

    let mut handed_out = std::collections::HashSet::new();
    for _ in 0..500 {
        let s = alloc.allocate().unwrap();
        assert!(s < 8 * MIB);
        assert!(!reserved.contains(&s), "reserved sector {s} handed out");
        assert!(handed_out.insert(s), "sector {s} handed out twice");
    }
    assert_eq!(handed_out.len(), 500);
}

#[test]
fn exhaustion_boundary_is_exact() {
    // Minimal strategy: one reserved sector, the rest allocatable.
    let spare_sectors = 300u64;
    let mut alloc = SpareAllocator::new(spare_sectors);
    let free = spare_sectors - alloc.reserved().len() as u64;
    for _ in 0..free {
        alloc.allocate().unwrap();
    }
    assert!(matches!(alloc.allocate(), Err(RemapError::AllocatorExhausted)));
}
