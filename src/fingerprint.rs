//! Device fingerprints: a compact identity token stored in metadata and used
//! to recognize a device across restarts and path renames.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{Decoder, Encoder};
use crate::crc::crc32;
use crate::device::{BlockDevice, DeviceIdentity, DeviceKind};
use crate::error::RemapError;

/// "DFNT"
pub const FINGERPRINT_MAGIC: u32 = 0x4446_4E54;

/// Fuzzy-match weights. A criterion that matches contributes its weight;
/// criteria that cannot be determined on either side are excluded and the
/// score is renormalized over what is knowable.
const WEIGHT_UUID: u32 = 40;
const WEIGHT_SIZE: u32 = 25;
const WEIGHT_SERIAL: u32 = 10;
const WEIGHT_PATH: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchConfidence {
    NoMatch,
    Low,
    Medium,
    High,
    Perfect,
}

impl MatchConfidence {
    pub fn from_score(score: u32) -> Self {
        match score {
            95.. => MatchConfidence::Perfect,
            80..=94 => MatchConfidence::High,
            60..=79 => MatchConfidence::Medium,
            40..=59 => MatchConfidence::Low,
            _ => MatchConfidence::NoMatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub path: String,
    pub size_sectors: u64,
    pub sector_size: u32,
    pub uuid: [u8; 16],
    pub serial: String,
    pub model: String,
    pub device_type: DeviceKind,
    pub creation_ts: u64,
    pub last_seen_ts: u64,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DeviceFingerprint {
    /// Captures what is knowable locally. If the device does not supply a
    /// UUID one is generated here and preserved through metadata.
    pub fn capture(device: &dyn BlockDevice) -> Self {
        let identity = device.identity();
        let now = unix_now();
        let uuid = identity
            .uuid
            .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
        Self {
            path: identity.path,
            size_sectors: device.sector_count(),
            sector_size: crate::device::SECTOR_SIZE as u32,
            uuid,
            serial: identity.serial.unwrap_or_default(),
            model: identity.model.unwrap_or_default(),
            device_type: identity.kind,
            creation_ts: now,
            last_seen_ts: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_ts = unix_now();
    }

    /// Similarity score in `[0, 100]` against a live device.
    ///
    /// UUID 40, size 25, serial 10, path 25 — renormalized over the criteria
    /// determinable on both sides, so a device that exposes no identity
    /// beyond its size is still recognizable by size alone.
    pub fn similarity(&self, identity: &DeviceIdentity, size_sectors: u64) -> u32 {
        let mut available = 0u32;
        let mut matched = 0u32;

        if self.uuid != [0u8; 16] {
            if let Some(uuid) = identity.uuid {
                available += WEIGHT_UUID;
                if uuid == self.uuid {
                    matched += WEIGHT_UUID;
                }
            }
        }

        available += WEIGHT_SIZE;
        if size_sectors == self.size_sectors {
            matched += WEIGHT_SIZE;
        }

        if !self.serial.is_empty() {
            if let Some(serial) = identity.serial.as_deref() {
                if !serial.is_empty() {
                    available += WEIGHT_SERIAL;
                    if serial == self.serial {
                        matched += WEIGHT_SERIAL;
                    }
                }
            }
        }

        if !self.path.is_empty() && !identity.path.is_empty() {
            available += WEIGHT_PATH;
            if identity.path == self.path {
                matched += WEIGHT_PATH;
            }
        }

        if available == 0 {
            return 0;
        }
        matched * 100 / available
    }

    pub fn confidence(&self, identity: &DeviceIdentity, size_sectors: u64) -> MatchConfidence {
        MatchConfidence::from_score(self.similarity(identity, size_sectors))
    }

    /// Serialized layout, little-endian, CRC over everything before the CRC
    /// field itself.
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.u32(FINGERPRINT_MAGIC);
        e.str16(&self.path);
        e.u64(self.size_sectors);
        e.u32(self.sector_size);
        e.raw(&self.uuid);
        e.str16(&self.serial);
        e.str16(&self.model);
        e.u8(self.device_type as u8);
        e.u64(self.creation_ts);
        e.u64(self.last_seen_ts);
        let mut bytes = e.finish();
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Self, RemapError> {
        let start = d.position();
        let magic = d.u32()?;
        if magic != FINGERPRINT_MAGIC {
            return Err(RemapError::Decode("bad fingerprint magic"));
        }
        let path = d.str16()?;
        let size_sectors = d.u64()?;
        let sector_size = d.u32()?;
        let uuid = d.array16()?;
        let serial = d.str16()?;
        let model = d.str16()?;
        let device_type = DeviceKind::from_raw(d.u8()?);
        let creation_ts = d.u64()?;
        let last_seen_ts = d.u64()?;
        let end = d.position();
        let crc = d.u32()?;
        if crc != crc32(d.window(start, end)) {
            return Err(RemapError::Decode("fingerprint CRC mismatch"));
        }
        Ok(Self {
            path,
            size_sectors,
            sector_size,
            uuid,
            serial,
            model,
            device_type,
            creation_ts,
            last_seen_ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn identity(path: &str, serial: Option<&str>, uuid: Option<[u8; 16]>) -> DeviceIdentity {
        DeviceIdentity {
            path: path.to_string(),
            serial: serial.map(str::to_string),
            model: None,
            uuid,
            kind: DeviceKind::Memory,
        }
    }

    #[test]
    fn capture_generates_uuid_when_device_has_none() {
        let dev = MemDevice::new(64);
        let fp = DeviceFingerprint::capture(&dev);
        assert_ne!(fp.uuid, [0u8; 16]);
        assert_eq!(fp.size_sectors, 64);
    }

    #[test]
    fn encode_decode_round_trip() {
        let dev = MemDevice::with_identity(32, identity("/dev/mapper/x", Some("SER-9"), None));
        let fp = DeviceFingerprint::capture(&dev);
        let bytes = fp.encode();
        let mut d = Decoder::new(&bytes);
        let back = DeviceFingerprint::decode(&mut d).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn corrupted_fingerprint_fails_crc() {
        let dev = MemDevice::new(32);
        let fp = DeviceFingerprint::capture(&dev);
        let mut bytes = fp.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        let mut d = Decoder::new(&bytes);
        assert!(DeviceFingerprint::decode(&mut d).is_err());
    }

    #[test]
    fn full_identity_match_is_perfect() {
        let uuid = [7u8; 16];
        let ident = identity("/dev/sdb", Some("WD-123"), Some(uuid));
        let dev = MemDevice::with_identity(128, ident.clone());
        let fp = DeviceFingerprint::capture(&dev);
        assert_eq!(fp.similarity(&ident, 128), 100);
        assert_eq!(fp.confidence(&ident, 128), MatchConfidence::Perfect);
    }

    #[test]
    fn uuid_mismatch_drags_score_down() {
        let ident = identity("/dev/sdb", Some("WD-123"), Some([7u8; 16]));
        let dev = MemDevice::with_identity(128, ident.clone());
        let fp = DeviceFingerprint::capture(&dev);

        let other = identity("/dev/sdb", Some("WD-123"), Some([9u8; 16]));
        // size + serial + path match, uuid does not: 60/100.
        assert_eq!(fp.similarity(&other, 128), 60);
        assert_eq!(fp.confidence(&other, 128), MatchConfidence::Medium);
    }

    #[test]
    fn size_only_device_is_recognized_by_size() {
        let dev = MemDevice::new(256);
        let fp = DeviceFingerprint::capture(&dev);
        let anon = DeviceIdentity::anonymous(DeviceKind::Memory);
        assert_eq!(fp.similarity(&anon, 256), 100);
        assert_eq!(fp.similarity(&anon, 512), 0);
    }

    #[test]
    fn wrong_everything_is_no_match() {
        let ident = identity("/dev/sdb", Some("WD-123"), None);
        let dev = MemDevice::with_identity(128, ident);
        let fp = DeviceFingerprint::capture(&dev);

        let other = identity("/dev/sdz", Some("ST-999"), None);
        assert_eq!(
            fp.confidence(&other, 4096),
            MatchConfidence::NoMatch
        );
    }
}
