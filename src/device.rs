//! Downstream block-device abstraction.
//!
//! The engine owns its devices as `Arc<dyn BlockDevice>`; implementations
//! synchronize internally so submissions may arrive from any thread.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

/// Fixed addressable unit. Both devices expose a contiguous range of
/// 512-byte sectors.
pub const SECTOR_SIZE: usize = 512;

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Error status reported by a device, classified by [`DeviceError::class`]
/// into the transient / permanent / structural buckets the auto-remap
/// controller acts on.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("device busy at sector {sector}: {detail}")]
    Transient { sector: u64, detail: String },

    #[error("unrecoverable media error at sector {sector}")]
    Media { sector: u64 },

    #[error("device gone: {0}")]
    Gone(String),

    #[error("I/O out of device bounds: sector {sector} + {n_sectors} exceeds {capacity}")]
    OutOfBounds {
        sector: u64,
        n_sectors: u64,
        capacity: u64,
    },

    #[error("buffer of {len} bytes is not a whole number of sectors")]
    UnalignedBuffer { len: usize },

    #[error("I/O error at sector {sector}: {detail}")]
    Io { sector: u64, detail: String },
}

/// Classification consumed by the auto-remap controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Structural,
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceError::Transient { .. } => ErrorClass::Transient,
            DeviceError::Gone(_) => ErrorClass::Structural,
            DeviceError::Media { .. }
            | DeviceError::OutOfBounds { .. }
            | DeviceError::UnalignedBuffer { .. }
            | DeviceError::Io { .. } => ErrorClass::Permanent,
        }
    }

    /// First sector implicated in the failure, where one is known.
    pub fn sector(&self) -> Option<u64> {
        match self {
            DeviceError::Transient { sector, .. }
            | DeviceError::Media { sector }
            | DeviceError::OutOfBounds { sector, .. }
            | DeviceError::Io { sector, .. } => Some(*sector),
            _ => None,
        }
    }
}

/// What kind of thing backs the device. Persisted inside fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceKind {
    Unknown = 0,
    Memory = 1,
    File = 2,
    Physical = 3,
}

impl DeviceKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => DeviceKind::Memory,
            2 => DeviceKind::File,
            3 => DeviceKind::Physical,
            _ => DeviceKind::Unknown,
        }
    }
}

/// Locally knowable identity of a device, used to build fingerprints.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub path: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    /// Stable UUID if the device supplies one; otherwise the fingerprint
    /// layer generates and remembers one.
    pub uuid: Option<[u8; 16]>,
    pub kind: DeviceKind,
}

impl DeviceIdentity {
    pub fn anonymous(kind: DeviceKind) -> Self {
        Self {
            path: String::new(),
            serial: None,
            model: None,
            uuid: None,
            kind,
        }
    }
}

/// A 512-byte-granular block device with asynchronous-completion semantics
/// flattened to blocking calls: submissions may block, implementations must
/// be callable from many threads at once.
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;

    /// `buf.len()` must be a whole multiple of [`SECTOR_SIZE`].
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> DeviceResult<()>;

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> DeviceResult<()>;

    fn flush(&self) -> DeviceResult<()>;

    fn identity(&self) -> DeviceIdentity;
}

/// Shared range/alignment validation for implementations.
pub(crate) fn check_range(sector: u64, buf_len: usize, capacity: u64) -> DeviceResult<u64> {
    if buf_len % SECTOR_SIZE != 0 {
        return Err(DeviceError::UnalignedBuffer { len: buf_len });
    }
    let n_sectors = (buf_len / SECTOR_SIZE) as u64;
    let end = sector
        .checked_add(n_sectors)
        .ok_or(DeviceError::OutOfBounds {
            sector,
            n_sectors,
            capacity,
        })?;
    if end > capacity {
        return Err(DeviceError::OutOfBounds {
            sector,
            n_sectors,
            capacity,
        });
    }
    Ok(n_sectors)
}

/// In-memory device. Used by tests and bring-up; contents are shared through
/// the `Arc` the caller keeps, so a re-attach sees earlier writes.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    identity: DeviceIdentity,
}

impl MemDevice {
    pub fn new(sector_count: u64) -> Self {
        Self::with_identity(
            sector_count,
            DeviceIdentity::anonymous(DeviceKind::Memory),
        )
    }

    pub fn with_identity(sector_count: u64, identity: DeviceIdentity) -> Self {
        let bytes = (sector_count as usize) * SECTOR_SIZE;
        Self {
            data: Mutex::new(vec![0u8; bytes]),
            identity,
        }
    }

    /// Copies out the full contents. Test helper.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDevice {
    fn sector_count(&self) -> u64 {
        (self.data.lock().unwrap().len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> DeviceResult<()> {
        let data = self.data.lock().unwrap();
        check_range(sector, buf.len(), (data.len() / SECTOR_SIZE) as u64)?;
        let off = (sector as usize) * SECTOR_SIZE;
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> DeviceResult<()> {
        let mut data = self.data.lock().unwrap();
        let capacity = (data.len() / SECTOR_SIZE) as u64;
        check_range(sector, buf.len(), capacity)?;
        let off = (sector as usize) * SECTOR_SIZE;
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }
}

/// File-backed device: one flat image file, one sector per 512 bytes.
pub struct FileDevice {
    file: Mutex<File>,
    sector_count: u64,
    path: String,
}

impl FileDevice {
    /// Creates (or truncates) an image of `sector_count` sectors.
    pub fn create(path: &Path, sector_count: u64) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| map_io_error(0, &e))?;
        file.set_len(sector_count * SECTOR_SIZE as u64)
            .map_err(|e| map_io_error(0, &e))?;
        Ok(Self {
            file: Mutex::new(file),
            sector_count,
            path: path.display().to_string(),
        })
    }

    /// Opens an existing image; the sector count is derived from its length,
    /// truncated to whole sectors.
    pub fn open(path: &Path) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| map_io_error(0, &e))?;
        let len = file.metadata().map_err(|e| map_io_error(0, &e))?.len();
        Ok(Self {
            file: Mutex::new(file),
            sector_count: len / SECTOR_SIZE as u64,
            path: path.display().to_string(),
        })
    }
}

fn map_io_error(sector: u64, err: &std::io::Error) -> DeviceError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            DeviceError::Transient {
                sector,
                detail: err.to_string(),
            }
        }
        ErrorKind::NotFound | ErrorKind::BrokenPipe => DeviceError::Gone(err.to_string()),
        _ => DeviceError::Io {
            sector,
            detail: err.to_string(),
        },
    }
}

impl BlockDevice for FileDevice {
    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> DeviceResult<()> {
        check_range(sector, buf.len(), self.sector_count)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map_err(|e| map_io_error(sector, &e))?;
        file.read_exact(buf).map_err(|e| map_io_error(sector, &e))
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> DeviceResult<()> {
        check_range(sector, buf.len(), self.sector_count)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .map_err(|e| map_io_error(sector, &e))?;
        file.write_all(buf).map_err(|e| map_io_error(sector, &e))
    }

    fn flush(&self) -> DeviceResult<()> {
        self.file
            .lock()
            .unwrap()
            .sync_all()
            .map_err(|e| map_io_error(0, &e))
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            path: self.path.clone(),
            serial: None,
            model: None,
            uuid: None,
            kind: DeviceKind::File,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trip() {
        let dev = MemDevice::new(8);
        let payload = vec![0x5Au8; SECTOR_SIZE * 2];
        dev.write_sectors(3, &payload).unwrap();

        let mut back = vec![0u8; SECTOR_SIZE * 2];
        dev.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemDevice::new(4);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let err = dev.read_sectors(4, &mut buf).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { .. }));
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn mem_device_rejects_unaligned_buffer() {
        let dev = MemDevice::new(4);
        let mut buf = vec![0u8; 100];
        let err = dev.read_sectors(0, &mut buf).unwrap_err();
        assert!(matches!(err, DeviceError::UnalignedBuffer { len: 100 }));
    }

    #[test]
    fn error_classification() {
        let t = DeviceError::Transient {
            sector: 1,
            detail: "busy".into(),
        };
        assert_eq!(t.class(), ErrorClass::Transient);
        assert_eq!(DeviceError::Media { sector: 9 }.class(), ErrorClass::Permanent);
        assert_eq!(
            DeviceError::Gone("unplugged".into()).class(),
            ErrorClass::Structural
        );
    }
}
