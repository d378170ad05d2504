use crate::core::gate::AssumedFeatures;
use crate::storage::format::{layout_fingerprint, MaskHeader, FORMAT_VERSION, MAGIC};
use crate::core::features::PADDED_LEN;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaskFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported mask format version {0}")]
    UnsupportedVersion(u32),
    #[error("File too small")]
    FileTooSmall,
    #[error("Mask holds {found} bytes, this build expects {expected}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("Feature layout checksum mismatch (file {found:#010x}, this build {expected:#010x})")]
    LayoutMismatch { expected: u32, found: u32 },
}

pub fn save(path: &Path, mask: &AssumedFeatures) -> Result<(), MaskFileError> {
    let header = MaskHeader::current();
    let mut buf = Vec::with_capacity(std::mem::size_of::<MaskHeader>() + PADDED_LEN);
    buf.extend_from_slice(bytemuck::bytes_of(&header));
    buf.extend_from_slice(mask.as_bytes());
    fs::write(path, buf)?;
    Ok(())
}

pub fn load(path: &Path) -> Result<AssumedFeatures, MaskFileError> {
    let data = fs::read(path)?;
    parse(&data)
}

pub fn parse(data: &[u8]) -> Result<AssumedFeatures, MaskFileError> {
    let header_len = std::mem::size_of::<MaskHeader>();
    if data.len() < header_len {
        return Err(MaskFileError::FileTooSmall);
    }

    let header: MaskHeader = bytemuck::pod_read_unaligned(&data[..header_len]);
    if header.magic != MAGIC {
        return Err(MaskFileError::InvalidMagic);
    }
    if header.version != FORMAT_VERSION {
        return Err(MaskFileError::UnsupportedVersion(header.version));
    }
    if header.padded_len as usize != PADDED_LEN {
        return Err(MaskFileError::SizeMismatch { expected: PADDED_LEN, found: header.padded_len as usize });
    }
    let expected_crc = layout_fingerprint();
    if header.layout_crc != expected_crc {
        return Err(MaskFileError::LayoutMismatch { expected: expected_crc, found: header.layout_crc });
    }

    let body = &data[header_len..];
    if body.len() < PADDED_LEN {
        return Err(MaskFileError::FileTooSmall);
    }
    if body.len() != PADDED_LEN {
        return Err(MaskFileError::SizeMismatch { expected: PADDED_LEN, found: body.len() });
    }
    Ok(bytemuck::pod_read_unaligned(body))
}
