//! Single home for every CRC32 computed by the on-disk layouts.
//!
//! IEEE 802.3 polynomial, reflected, init `0xFFFFFFFF`, final XOR
//! `0xFFFFFFFF` — the parameters `crc32fast` implements.

/// CRC32 over one contiguous region.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// CRC32 over several discontiguous regions, in order. Record layouts use
/// this to checksum "everything except the checksum field itself" without
/// copying the record.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
