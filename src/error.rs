use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RemapError>;

/// Errors surfaced by the remap engine and its admin channel.
///
/// The taxonomy mirrors how failures propagate: `Transient` errors are
/// retried internally and rarely escape, `Permanent` errors are surfaced
/// together with a freshly installed remap, `Structural` errors mark the
/// engine fatal.
#[derive(Debug, Clone, Error)]
pub enum RemapError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The fingerprint stored in metadata does not match the device that was
    /// handed to `attach` (similarity score below 40).
    #[error("{role} device mismatch: fingerprint similarity {score} below acceptance threshold")]
    DeviceMismatch { role: &'static str, score: u32 },

    /// Every metadata anchor failed validation and at least one of them
    /// carries a record magic, so this is not a blank device.
    #[error("no valid metadata found on spare device")]
    NoValidMetadata,

    /// Some anchors failed validation but a usable copy survived.
    #[error("metadata corrupted: {0}")]
    CorruptedMetadata(String),

    /// The spare device has no free sector left to hand out.
    #[error("spare allocator exhausted")]
    AllocatorExhausted,

    #[error("transient I/O error on {role} device at sector {sector}: {detail}")]
    TransientIo {
        role: &'static str,
        sector: u64,
        detail: String,
    },

    #[error("permanent I/O error on {role} device at sector {sector}: {detail}")]
    PermanentIo {
        role: &'static str,
        sector: u64,
        detail: String,
    },

    /// The device disappeared or stopped answering entirely.
    #[error("structural failure on {role} device: {detail}")]
    StructuralIo { role: &'static str, detail: String },

    #[error("request out of bounds: sector {sector} + {n_sectors} exceeds capacity {capacity}")]
    OutOfBounds {
        sector: u64,
        n_sectors: u64,
        capacity: u64,
    },

    /// An `Active` mapping already exists for the logical sector.
    #[error("duplicate mapping for logical sector {0}")]
    DuplicateMapping(u64),

    #[error("metadata decode failed: {0}")]
    Decode(&'static str),

    #[error("unknown admin verb: {0}")]
    UnknownVerb(String),

    #[error("engine is shut down")]
    Detached,
}

impl RemapError {
    /// Exit-code mapping used by administrative callers. `0` is reserved for
    /// success.
    pub fn exit_code(&self) -> i32 {
        match self {
            RemapError::InvalidArgument(_) => 1,
            RemapError::DeviceMismatch { .. } => 2,
            RemapError::NoValidMetadata => 3,
            RemapError::CorruptedMetadata(_) => 4,
            RemapError::AllocatorExhausted => 5,
            RemapError::TransientIo { .. } => 6,
            RemapError::PermanentIo { .. } => 7,
            RemapError::StructuralIo { .. } => 8,
            RemapError::OutOfBounds { .. } => 9,
            RemapError::DuplicateMapping(_) => 10,
            RemapError::Decode(_) => 11,
            RemapError::UnknownVerb(_) => 12,
            RemapError::Detached => 13,
        }
    }

    /// Ranking used when a split request completes with several child
    /// errors: the parent fails with the worst of the children.
    pub(crate) fn severity(&self) -> u8 {
        match self {
            RemapError::StructuralIo { .. } => 5,
            RemapError::PermanentIo { .. } => 4,
            RemapError::AllocatorExhausted => 3,
            RemapError::TransientIo { .. } => 2,
            _ => 1,
        }
    }
}

/// Picks the worse of two optional failures.
pub(crate) fn worst(a: Option<RemapError>, b: Option<RemapError>) -> Option<RemapError> {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(a), Some(b)) => {
            if b.severity() > a.severity() {
                Some(b)
            } else {
                Some(a)
            }
        }
    }
}
