//! Sector remapping layer.
//!
//! `remapdisk` interposes between a consumer and two block devices: a *main*
//! device that may develop failing sectors and a *spare* device that supplies
//! replacements. I/O is forwarded to the main device until a sector reports a
//! hard error; the engine then allocates a spare sector, installs a mapping
//! and routes all future I/O for that logical sector to the spare. Mappings
//! are persisted in versioned, CRC-protected metadata written to several
//! anchor sectors of the spare device, so a re-attach restores the same
//! logical view.
//!
//! ```no_run
//! use std::sync::Arc;
//! use remapdisk::{IoRequest, MemDevice, RemapConfig, RemapEngine};
//!
//! let main = Arc::new(MemDevice::new(1 << 16));
//! let spare = Arc::new(MemDevice::new(1 << 14));
//! let engine = RemapEngine::attach(main, spare, RemapConfig::default())?;
//! let _data = engine.submit(IoRequest::read(0, 8)).wait()?;
//! engine.detach()?;
//! # Ok::<(), remapdisk::RemapError>(())
//! ```

pub mod allocator;
pub mod codec;
pub mod crc;
pub mod device;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod metadata;
pub mod persist;
pub mod request;
pub mod routing;
pub mod table;

pub use crate::allocator::{reserved_for, SpareAllocator, Strategy};
pub use crate::device::{
    BlockDevice, DeviceError, DeviceIdentity, DeviceKind, DeviceResult, ErrorClass, FileDevice,
    MemDevice, SECTOR_SIZE,
};
pub use crate::engine::{MetricsSnapshot, RemapConfig, RemapEngine};
pub use crate::error::{RemapError, Result};
pub use crate::fingerprint::{DeviceFingerprint, MatchConfidence};
pub use crate::metadata::{
    validate, MetadataRecord, RecoverySuggestion, ValidationContext, ValidationIssues,
    ValidationLevel,
};
pub use crate::persist::{load_metadata, ConflictSeverity, MetaStore};
pub use crate::request::{Completion, IoKind, IoRequest};
pub use crate::table::{EntryStatus, RemapEntry, RemapTable};
