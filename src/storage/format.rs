use crate::core::features::{Feature, FEATURE_COUNT, PADDED_LEN};
use bytemuck::{Pod, Zeroable};

pub const MAGIC: [u8; 8] = *b"CPUMASK1";
pub const FORMAT_VERSION: u32 = 1;

/// Mask file header. The padded mask bytes follow immediately.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct MaskHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flag_count: u32,
    pub padded_len: u32,
    pub layout_crc: u32,
    pub padding: [u32; 2], // Reserved
}

// Ensure MaskHeader is 32 bytes
const _: () = assert!(std::mem::size_of::<MaskHeader>() == 32);

impl MaskHeader {
    pub fn current() -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flag_count: FEATURE_COUNT as u32,
            padded_len: PADDED_LEN as u32,
            layout_crc: layout_fingerprint(),
            padding: [0; 2],
        }
    }
}

/// CRC32 over the ordered flag names and padded size.
///
/// Producer and consumer agree on the layout iff their fingerprints match.
pub fn layout_fingerprint() -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for f in Feature::ALL {
        hasher.update(f.name().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(&(PADDED_LEN as u32).to_le_bytes());
    hasher.finalize()
}
