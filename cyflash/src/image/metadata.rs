//! Application metadata block.
//!
//! The bootloadable application keeps a small descriptor near the top of its
//! flash region. The same 32-byte layout appears in two places: as the first
//! bytes of the image's metadata row, and as the prefix of a `GetMetadata`
//! response. Both forms decode to equal values.
//!
//! ```text
//! offset  size  field
//! 0       4     application image checksum
//! 4       4     bootloadable length
//! 8       4     last row occupied by the bootloader
//! 12      2     application version (major/minor bytes)
//! 14      2     application id
//! 16      4     custom id
//! 20      12    reserved
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Size of the metadata block in bytes.
pub const METADATA_LEN: usize = 32;

/// Decoded application metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMetadata {
    /// Checksum over the application image.
    pub image_checksum: u32,
    /// Length of the bootloadable portion in bytes.
    pub bootloadable_length: u32,
    /// Last flash row occupied by the bootloader itself.
    pub bootloader_end: u32,
    /// Application version, major byte then minor byte.
    pub app_version: u16,
    /// Application id.
    pub app_id: u16,
    /// Application-defined custom id.
    pub custom_id: u32,
}

impl AppMetadata {
    /// Decode a metadata block from a row slice or response prefix.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_LEN {
            return Err(Error::Framing(format!(
                "metadata block of {} bytes, expected at least {METADATA_LEN}",
                data.len()
            )));
        }
        Ok(Self {
            image_checksum: LittleEndian::read_u32(&data[0..4]),
            bootloadable_length: LittleEndian::read_u32(&data[4..8]),
            bootloader_end: LittleEndian::read_u32(&data[8..12]),
            app_version: LittleEndian::read_u16(&data[12..14]),
            app_id: LittleEndian::read_u16(&data[14..16]),
            custom_id: LittleEndian::read_u32(&data[16..20]),
        })
    }

    /// Major component of the application version.
    #[allow(clippy::cast_possible_truncation)]
    pub fn version_major(&self) -> u8 {
        (self.app_version >> 8) as u8
    }

    /// Minor component of the application version.
    #[allow(clippy::cast_possible_truncation)]
    pub fn version_minor(&self) -> u8 {
        self.app_version as u8
    }
}
