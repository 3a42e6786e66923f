//! Error types for cyflash.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::protocol::packet::Status;

/// Result type for cyflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cyflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, CAN socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Invalid transport or session configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No complete response within the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed frame: bad delimiters or inconsistent length.
    #[error("Malformed packet: {0}")]
    Framing(String),

    /// Frame checksum mismatch.
    #[error("Packet checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    FrameChecksum {
        /// Checksum carried by the frame.
        expected: u16,
        /// Checksum computed over the received bytes.
        actual: u16,
    },

    /// Programmed row read back with a different checksum.
    #[error(
        "Row checksum mismatch in array {array_id} row {row_number}: \
         expected {expected:#04x}, got {actual:#04x}"
    )]
    RowChecksum {
        /// Flash array id.
        array_id: u8,
        /// Row number within the array.
        row_number: u16,
        /// Checksum computed from the image row.
        expected: u8,
        /// Checksum reported by the device.
        actual: u8,
    },

    /// The device reported a failed application checksum after programming.
    #[error("Application checksum verification failed")]
    AppChecksum,

    /// The bootloader answered with a non-success status code.
    #[error("Bootloader error: {0}")]
    Bootloader(Status),

    /// The bootloader never produced a well-formed identity response.
    #[error("Bootloader not responding or security key mismatch")]
    SessionRefused,

    /// Device silicon does not match the image header.
    #[error(
        "Device silicon {actual_id:#010x} rev {actual_rev} does not match \
         image silicon {expected_id:#010x} rev {expected_rev}"
    )]
    InvalidSilicon {
        /// Silicon id declared by the image.
        expected_id: u32,
        /// Silicon revision declared by the image.
        expected_rev: u8,
        /// Silicon id reported by the device.
        actual_id: u32,
        /// Silicon revision reported by the device.
        actual_rev: u8,
    },

    /// An image row falls outside the device's reported flash range.
    #[error("Row {row_number} in array {array_id} outside device range {first_row}..={last_row}")]
    RowRange {
        /// Flash array id.
        array_id: u8,
        /// Offending row number.
        row_number: u16,
        /// First valid row reported by the device.
        first_row: u16,
        /// Last valid row reported by the device.
        last_row: u16,
    },

    /// Downgrade or application-id mismatch declined by policy or user.
    #[error("Refused to flash: {0}")]
    MetadataConflict(MetadataConflict),

    /// Syntactic or semantic failure in a `.cyacd` image file.
    #[error("Invalid image file (line {line}): {reason}")]
    ImageParse {
        /// 1-based line number in the image file.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// The embedding application requested cancellation.
    #[error("Operation canceled")]
    Canceled,
}

/// Why the metadata comparison refused to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataConflict {
    /// The device carries a newer application version than the image.
    Downgrade {
        /// Application version resident on the device (major byte, minor byte).
        device: u16,
        /// Application version carried by the image.
        image: u16,
    },
    /// The device carries a different application id than the image.
    DifferentApp {
        /// Application id resident on the device.
        device: u16,
        /// Application id carried by the image.
        image: u16,
    },
}

impl fmt::Display for MetadataConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downgrade { device, image } => write!(
                f,
                "device application v{}.{} is newer than image application v{}.{}",
                device >> 8,
                device & 0xFF,
                image >> 8,
                image & 0xFF
            ),
            Self::DifferentApp { device, image } => write!(
                f,
                "device application id {device} differs from image application id {image}"
            ),
        }
    }
}
