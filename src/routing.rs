//! Request splitting: turns one logical range into maximal sub-ranges that
//! are either entirely unmapped (main device) or mapped to a contiguous run
//! of spare sectors (spare device).

use crate::table::{EntryStatus, RemapTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentTarget {
    Main,
    Spare,
}

/// One dispatchable sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub target: SegmentTarget,
    /// Sector on the target device where this segment starts.
    pub dev_sector: u64,
    /// Logical sector the segment covers, for error attribution.
    pub logical_start: u64,
    pub n_sectors: u64,
}

/// Splits `[sector, sector + n_sectors)` against the table. The common case
/// of an empty table short-circuits to a single main-device segment without
/// per-sector lookups; a populated table costs one (cache-assisted) lookup
/// per sector and never the write lock.
pub fn plan(table: &RemapTable, sector: u64, n_sectors: u64) -> Vec<Segment> {
    if n_sectors == 0 {
        return Vec::new();
    }
    if table.is_empty() {
        return vec![Segment {
            target: SegmentTarget::Main,
            dev_sector: sector,
            logical_start: sector,
            n_sectors,
        }];
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut current: Option<Segment> = None;
    for logical in sector..sector + n_sectors {
        // Only Active entries reroute; Failed leftovers fall through to the
        // main device, Pending entries block inside lookup until resolved.
        let mapped = table
            .lookup(logical)
            .filter(|&(_, status)| status == EntryStatus::Active)
            .map(|(spare, _)| spare);

        let extended = match (current.as_mut(), mapped) {
            (Some(seg), None) if seg.target == SegmentTarget::Main => {
                seg.n_sectors += 1;
                true
            }
            (Some(seg), Some(spare))
                if seg.target == SegmentTarget::Spare
                    && seg.dev_sector + seg.n_sectors == spare =>
            {
                // Contiguous spare run; keep one sub-request.
                seg.n_sectors += 1;
                true
            }
            _ => false,
        };
        if !extended {
            if let Some(seg) = current.take() {
                segments.push(seg);
            }
            current = Some(match mapped {
                Some(spare) => Segment {
                    target: SegmentTarget::Spare,
                    dev_sector: spare,
                    logical_start: logical,
                    n_sectors: 1,
                },
                None => Segment {
                    target: SegmentTarget::Main,
                    dev_sector: logical,
                    logical_start: logical,
                    n_sectors: 1,
                },
            });
        }
    }
    if let Some(seg) = current.take() {
        segments.push(seg);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::RemapTable;

    fn main_seg(dev_sector: u64, n: u64) -> Segment {
        Segment {
            target: SegmentTarget::Main,
            dev_sector,
            logical_start: dev_sector,
            n_sectors: n,
        }
    }

    #[test]
    fn empty_table_is_one_main_segment() {
        let table = RemapTable::new();
        assert_eq!(plan(&table, 100, 8), vec![main_seg(100, 8)]);
    }

    #[test]
    fn zero_length_request_has_no_segments() {
        let table = RemapTable::new();
        assert!(plan(&table, 5, 0).is_empty());
    }

    #[test]
    fn fully_unmapped_range_stays_whole() {
        let table = RemapTable::new();
        table.install(1000, 7).unwrap();
        assert_eq!(plan(&table, 0, 16), vec![main_seg(0, 16)]);
    }

    #[test]
    fn boundary_between_mapped_and_unmapped_splits_in_two() {
        let table = RemapTable::new();
        table.install(11, 500).unwrap();
        let segs = plan(&table, 10, 2);
        assert_eq!(
            segs,
            vec![
                main_seg(10, 1),
                Segment {
                    target: SegmentTarget::Spare,
                    dev_sector: 500,
                    logical_start: 11,
                    n_sectors: 1,
                },
            ]
        );
    }

    #[test]
    fn contiguous_spare_run_is_merged() {
        let table = RemapTable::new();
        table.install(20, 300).unwrap();
        table.install(21, 301).unwrap();
        table.install(22, 302).unwrap();
        let segs = plan(&table, 20, 3);
        assert_eq!(
            segs,
            vec![Segment {
                target: SegmentTarget::Spare,
                dev_sector: 300,
                logical_start: 20,
                n_sectors: 3,
            }]
        );
    }

    #[test]
    fn non_contiguous_spare_run_splits_again() {
        let table = RemapTable::new();
        table.install(20, 300).unwrap();
        table.install(21, 310).unwrap();
        let segs = plan(&table, 20, 2);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].dev_sector, 300);
        assert_eq!(segs[1].dev_sector, 310);
    }

    #[test]
    fn failed_entries_route_to_main() {
        let table = RemapTable::new();
        let _ = table.begin_remap(30, || Ok(900)).unwrap();
        table.fail_pending(30);
        assert_eq!(plan(&table, 30, 1), vec![main_seg(30, 1)]);
    }
}
