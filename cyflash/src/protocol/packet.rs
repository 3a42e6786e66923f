//! Bootloader command and response packets.
//!
//! ## Frame Format
//!
//! Every packet in either direction uses the same frame:
//!
//! ```text
//! +-----+-------------+--------+---------------+--------+-----+
//! | SOP | Cmd/Status  | Length |     Data      | Cksum  | EOP |
//! +-----+-------------+--------+---------------+--------+-----+
//! | 1   | 1           | 2 (LE) |   variable    | 2 (LE) | 1   |
//! +-----+-------------+--------+---------------+--------+-----+
//! | 01  | cmd or stat | N      |   payload     | cksum  | 17  |
//! +-----+-------------+--------+---------------+--------+-----+
//! ```
//!
//! The checksum covers everything from SOP through the last payload byte,
//! with the algorithm selected by the image header. The second byte carries
//! the command code in requests and the status code in responses.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::trace;

use crate::error::{Error, Result};
use crate::protocol::checksum::ChecksumKind;

/// Start-of-packet delimiter.
pub const SOP: u8 = 0x01;

/// End-of-packet delimiter.
pub const EOP: u8 = 0x17;

/// Fixed bytes around the payload: SOP, code, length, checksum, EOP.
pub const FRAME_OVERHEAD: usize = 7;

/// Largest payload the host will accept in a response frame.
///
/// The biggest legitimate payload is a `GetMetadata` response (56 bytes);
/// a generous cap keeps a corrupted length field from stalling the framer.
pub const MAX_PAYLOAD: usize = 0x200;

/// One bootloader request, borrowing any row data for the call's duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Start a bootload session and read the device identity (0x38).
    EnterBootloader,
    /// End the session; the device reboots into the application (0x3B).
    ExitBootloader,
    /// Program one flash row from buffered data plus this payload (0x39).
    ProgramRow {
        /// Flash array id.
        array_id: u8,
        /// Row number within the array.
        row_number: u16,
        /// Final slice of row data, following any buffered `SendData` bytes.
        data: &'a [u8],
    },
    /// Erase one flash row (0x34).
    EraseRow {
        /// Flash array id.
        array_id: u8,
        /// Row number within the array.
        row_number: u16,
    },
    /// Read back the checksum of one flash row (0x3A).
    VerifyRow {
        /// Flash array id.
        array_id: u8,
        /// Row number within the array.
        row_number: u16,
    },
    /// Check the application checksum over all programmed flash (0x31).
    VerifyChecksum,
    /// Query the row range of a flash array (0x32).
    GetFlashSize {
        /// Flash array id.
        array_id: u8,
    },
    /// Read the application metadata block (0x3C).
    GetMetadata {
        /// Application index (0 for single-application bootloaders).
        app_index: u8,
    },
    /// Buffer a slice of row data in the device ahead of `ProgramRow` (0x37).
    SendData {
        /// Data to append to the device's row buffer.
        data: &'a [u8],
    },
    /// No-op used to resynchronize a confused bootloader (0x35).
    SyncBootloader,
}

impl Command<'_> {
    /// The command code transmitted in the frame's second byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::VerifyChecksum => 0x31,
            Self::GetFlashSize { .. } => 0x32,
            Self::EraseRow { .. } => 0x34,
            Self::SyncBootloader => 0x35,
            Self::SendData { .. } => 0x37,
            Self::EnterBootloader => 0x38,
            Self::ProgramRow { .. } => 0x39,
            Self::VerifyRow { .. } => 0x3A,
            Self::ExitBootloader => 0x3B,
            Self::GetMetadata { .. } => 0x3C,
        }
    }

    /// Append the request payload bytes to `buf`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn write_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::EnterBootloader
            | Self::ExitBootloader
            | Self::VerifyChecksum
            | Self::SyncBootloader => {},
            Self::ProgramRow {
                array_id,
                row_number,
                data,
            } => {
                buf.push(*array_id);
                buf.write_u16::<LittleEndian>(*row_number).unwrap();
                buf.extend_from_slice(data);
            },
            Self::EraseRow {
                array_id,
                row_number,
            }
            | Self::VerifyRow {
                array_id,
                row_number,
            } => {
                buf.push(*array_id);
                buf.write_u16::<LittleEndian>(*row_number).unwrap();
            },
            Self::GetFlashSize { array_id } => buf.push(*array_id),
            Self::GetMetadata { app_index } => buf.push(*app_index),
            Self::SendData { data } => buf.extend_from_slice(data),
        }
    }

    /// Build the complete request frame.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self, kind: ChecksumKind) -> Vec<u8> {
        let mut payload = Vec::new();
        self.write_payload(&mut payload);

        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        frame.push(SOP);
        frame.push(self.code());
        // Safe cast: payloads are bounded by the row size plus its header
        frame.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
        frame.extend_from_slice(&payload);

        let cksum = kind.compute(&frame);
        frame.write_u16::<LittleEndian>(cksum).unwrap();
        frame.push(EOP);

        trace!("encoded command {:#04x}, {} byte frame", self.code(), frame.len());
        frame
    }
}

/// Status codes a bootloader response can carry in its second byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed successfully.
    Success,
    /// The provided security key was incorrect.
    BadKey,
    /// Flash verification failed.
    VerifyFailed,
    /// The amount of data is outside the expected range.
    BadLength,
    /// The data is not of the proper form.
    BadData,
    /// The command is unsupported on the target device.
    BadCommand,
    /// The device is not the expected one.
    BadDevice,
    /// The bootloader version is unsupported.
    BadVersion,
    /// The packet checksum did not match.
    BadChecksum,
    /// The flash array id is invalid.
    BadArray,
    /// The flash row number is invalid.
    BadRow,
    /// The flash row is protected.
    FlashProtected,
    /// The application is not valid.
    BadApp,
    /// The target application is currently active.
    InvalidApp,
    /// The callback response was invalid.
    BadCallback,
    /// An unknown error occurred.
    Unknown,
    /// A status code outside the documented set.
    Other(u8),
}

impl Status {
    /// Map a raw status byte to its code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::BadKey,
            0x02 => Self::VerifyFailed,
            0x03 => Self::BadLength,
            0x04 => Self::BadData,
            0x05 => Self::BadCommand,
            0x06 => Self::BadDevice,
            0x07 => Self::BadVersion,
            0x08 => Self::BadChecksum,
            0x09 => Self::BadArray,
            0x0A => Self::BadRow,
            0x0B => Self::FlashProtected,
            0x0C => Self::BadApp,
            0x0D => Self::InvalidApp,
            0x0E => Self::BadCallback,
            0x0F => Self::Unknown,
            other => Self::Other(other),
        }
    }

    /// The raw status byte.
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::BadKey => 0x01,
            Self::VerifyFailed => 0x02,
            Self::BadLength => 0x03,
            Self::BadData => 0x04,
            Self::BadCommand => 0x05,
            Self::BadDevice => 0x06,
            Self::BadVersion => 0x07,
            Self::BadChecksum => 0x08,
            Self::BadArray => 0x09,
            Self::BadRow => 0x0A,
            Self::FlashProtected => 0x0B,
            Self::BadApp => 0x0C,
            Self::InvalidApp => 0x0D,
            Self::BadCallback => 0x0E,
            Self::Unknown => 0x0F,
            Self::Other(code) => code,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::BadKey => "the provided security key was incorrect",
            Self::VerifyFailed => "flash verification failed",
            Self::BadLength => "the amount of data is outside the expected range",
            Self::BadData => "the data is not of the proper form",
            Self::BadCommand => "command unsupported on target device",
            Self::BadDevice => "unexpected device",
            Self::BadVersion => "unsupported bootloader version",
            Self::BadChecksum => "invalid packet checksum",
            Self::BadArray => "invalid flash array id",
            Self::BadRow => "invalid flash row number",
            Self::FlashProtected => "flash row is protected",
            Self::BadApp => "invalid application",
            Self::InvalidApp => "target application is currently active",
            Self::BadCallback => "invalid callback response",
            Self::Unknown | Self::Other(_) => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.description(), self.code())
    }
}

/// Validate a response frame and return its payload.
///
/// Checks the SOP/EOP delimiters, the declared length, and the frame
/// checksum, then raises any non-success status as
/// [`Error::Bootloader`](crate::error::Error::Bootloader).
pub fn decode_response(frame: &[u8], kind: ChecksumKind) -> Result<&[u8]> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(Error::Framing(format!(
            "response of {} bytes is shorter than the {FRAME_OVERHEAD} byte minimum",
            frame.len()
        )));
    }
    if frame[0] != SOP {
        return Err(Error::Framing(format!(
            "expected start of packet {SOP:#04x}, found {:#04x}",
            frame[0]
        )));
    }

    let length = usize::from(LittleEndian::read_u16(&frame[2..4]));
    if frame.len() != length + FRAME_OVERHEAD {
        return Err(Error::Framing(format!(
            "length field declares {length} payload bytes but frame has {}",
            frame.len().saturating_sub(FRAME_OVERHEAD)
        )));
    }
    if frame[frame.len() - 1] != EOP {
        return Err(Error::Framing(format!(
            "expected end of packet {EOP:#04x}, found {:#04x}",
            frame[frame.len() - 1]
        )));
    }

    let expected = LittleEndian::read_u16(&frame[frame.len() - 3..frame.len() - 1]);
    let actual = kind.compute(&frame[..4 + length]);
    if expected != actual {
        return Err(Error::FrameChecksum { expected, actual });
    }

    match Status::from_code(frame[1]) {
        Status::Success => Ok(&frame[4..4 + length]),
        status => Err(Error::Bootloader(status)),
    }
}

/// Build a response frame, used by tests and mock devices.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_response(status: Status, payload: &[u8], kind: ChecksumKind) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(SOP);
    frame.push(status.code());
    frame.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
    frame.extend_from_slice(payload);
    let cksum = kind.compute(&frame);
    frame.write_u16::<LittleEndian>(cksum).unwrap();
    frame.push(EOP);
    frame
}

/// Device identity reported by `EnterBootloader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderIdentity {
    /// 32-bit silicon id.
    pub silicon_id: u32,
    /// Silicon revision.
    pub silicon_rev: u8,
    /// 24-bit bootloader version, nibble-encoded major.minor.patch.
    pub bootloader_version: u32,
}

impl BootloaderIdentity {
    /// Expected payload length of an `EnterBootloader` response.
    pub const PAYLOAD_LEN: usize = 8;

    /// Decode from an `EnterBootloader` response payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::PAYLOAD_LEN {
            return Err(Error::Framing(format!(
                "identity payload of {} bytes, expected {}",
                payload.len(),
                Self::PAYLOAD_LEN
            )));
        }
        Ok(Self {
            silicon_id: LittleEndian::read_u32(&payload[0..4]),
            silicon_rev: payload[4],
            bootloader_version: u32::from(payload[5])
                | u32::from(payload[6]) << 8
                | u32::from(payload[7]) << 16,
        })
    }
}

impl fmt::Display for BootloaderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "silicon {:#010x} rev {}, bootloader v{}.{}.{}",
            self.silicon_id,
            self.silicon_rev,
            (self.bootloader_version >> 16) & 0xFF,
            (self.bootloader_version >> 8) & 0xFF,
            self.bootloader_version & 0xFF
        )
    }
}

/// Row range of one flash array, reported by `GetFlashSize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashArrayInfo {
    /// Flash array id the range belongs to.
    pub array_id: u8,
    /// First programmable row.
    pub first_row: u16,
    /// Last programmable row.
    pub last_row: u16,
}

impl FlashArrayInfo {
    /// Decode from a `GetFlashSize` response payload.
    pub fn from_payload(array_id: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::Framing(format!(
                "flash size payload of {} bytes, expected 4",
                payload.len()
            )));
        }
        Ok(Self {
            array_id,
            first_row: LittleEndian::read_u16(&payload[0..2]),
            last_row: LittleEndian::read_u16(&payload[2..4]),
        })
    }

    /// Whether `row_number` lies inside this array's range.
    pub fn contains(&self, row_number: u16) -> bool {
        (self.first_row..=self.last_row).contains(&row_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM: ChecksumKind = ChecksumKind::Sum2Complement;

    #[test]
    fn test_enter_bootloader_frame_bytes() {
        let frame = Command::EnterBootloader.encode(SUM);
        // SOP, code, len lo, len hi, cksum lo, cksum hi, EOP
        assert_eq!(frame.len(), 7);
        assert_eq!(frame[0], SOP);
        assert_eq!(frame[1], 0x38);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        // sum = 0x01 + 0x38 = 0x39 -> two's complement 0xFFC7
        assert_eq!(&frame[4..6], &[0xC7, 0xFF]);
        assert_eq!(frame[6], EOP);
    }

    #[test]
    fn test_erase_row_frame_layout() {
        let frame = Command::EraseRow {
            array_id: 2,
            row_number: 0x0105,
        }
        .encode(SUM);
        assert_eq!(frame[1], 0x34);
        assert_eq!(&frame[2..4], &[0x03, 0x00]);
        // Row number is little-endian on the wire.
        assert_eq!(&frame[4..7], &[0x02, 0x05, 0x01]);
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_program_row_carries_data() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let frame = Command::ProgramRow {
            array_id: 0,
            row_number: 22,
            data: &data,
        }
        .encode(SUM);
        assert_eq!(frame[1], 0x39);
        assert_eq!(&frame[2..4], &[0x07, 0x00]);
        assert_eq!(&frame[7..11], &data);
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::VerifyChecksum.code(), 0x31);
        assert_eq!(Command::GetFlashSize { array_id: 0 }.code(), 0x32);
        assert_eq!(Command::EraseRow { array_id: 0, row_number: 0 }.code(), 0x34);
        assert_eq!(Command::SyncBootloader.code(), 0x35);
        assert_eq!(Command::SendData { data: &[] }.code(), 0x37);
        assert_eq!(Command::EnterBootloader.code(), 0x38);
        assert_eq!(
            Command::ProgramRow { array_id: 0, row_number: 0, data: &[] }.code(),
            0x39
        );
        assert_eq!(Command::VerifyRow { array_id: 0, row_number: 0 }.code(), 0x3A);
        assert_eq!(Command::ExitBootloader.code(), 0x3B);
        assert_eq!(Command::GetMetadata { app_index: 0 }.code(), 0x3C);
    }

    #[test]
    fn test_every_request_frame_is_self_consistent() {
        let data = [0x11, 0x22, 0x33];
        let commands = [
            Command::EnterBootloader,
            Command::ExitBootloader,
            Command::ProgramRow { array_id: 1, row_number: 513, data: &data },
            Command::EraseRow { array_id: 1, row_number: 513 },
            Command::VerifyRow { array_id: 1, row_number: 513 },
            Command::VerifyChecksum,
            Command::GetFlashSize { array_id: 3 },
            Command::GetMetadata { app_index: 1 },
            Command::SendData { data: &data },
            Command::SyncBootloader,
        ];
        for kind in [ChecksumKind::Sum2Complement, ChecksumKind::Crc16] {
            for command in &commands {
                let frame = command.encode(kind);
                assert_eq!(frame[0], SOP);
                assert_eq!(frame[1], command.code());
                assert_eq!(*frame.last().unwrap(), EOP);
                let length = usize::from(LittleEndian::read_u16(&frame[2..4]));
                assert_eq!(frame.len(), length + FRAME_OVERHEAD);
                let cksum = LittleEndian::read_u16(&frame[frame.len() - 3..frame.len() - 1]);
                assert!(kind.verify(&frame[..4 + length], cksum));
            }
        }
    }

    #[test]
    fn test_decode_success_response() {
        let frame = encode_response(Status::Success, &[0xAA, 0xBB], SUM);
        let payload = decode_response(&frame, SUM).unwrap();
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_error_status() {
        let frame = encode_response(Status::BadChecksum, &[], SUM);
        match decode_response(&frame, SUM) {
            Err(Error::Bootloader(Status::BadChecksum)) => {},
            other => panic!("expected BadChecksum, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_sop() {
        let mut frame = encode_response(Status::Success, &[], SUM);
        frame[0] = 0x02;
        assert!(matches!(decode_response(&frame, SUM), Err(Error::Framing(_))));
    }

    #[test]
    fn test_decode_rejects_bad_eop() {
        let mut frame = encode_response(Status::Success, &[], SUM);
        let end = frame.len() - 1;
        frame[end] = 0x18;
        assert!(matches!(decode_response(&frame, SUM), Err(Error::Framing(_))));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut frame = encode_response(Status::Success, &[0x01, 0x02], SUM);
        frame[2] = 5;
        assert!(matches!(decode_response(&frame, SUM), Err(Error::Framing(_))));
    }

    #[test]
    fn test_decode_rejects_corrupted_checksum() {
        let mut frame = encode_response(Status::Success, &[0x01, 0x02], SUM);
        frame[4] ^= 0xFF;
        assert!(matches!(
            decode_response(&frame, SUM),
            Err(Error::FrameChecksum { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let frame = encode_response(Status::Success, &[0x01, 0x02], SUM);
        assert!(matches!(
            decode_response(&frame[..frame.len() - 1], SUM),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_status_round_trip() {
        for code in 0u8..=0x10 {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::from_code(0x42), Status::Other(0x42));
    }

    #[test]
    fn test_identity_from_payload() {
        // silicon 0x04A61193 rev 17, bootloader 1.2.3
        let payload = [0x93, 0x11, 0xA6, 0x04, 17, 0x03, 0x02, 0x01];
        let identity = BootloaderIdentity::from_payload(&payload).unwrap();
        assert_eq!(identity.silicon_id, 0x04A6_1193);
        assert_eq!(identity.silicon_rev, 17);
        assert_eq!(identity.bootloader_version, 0x0001_0203);
        assert_eq!(
            identity.to_string(),
            "silicon 0x04a61193 rev 17, bootloader v1.2.3"
        );
    }

    #[test]
    fn test_identity_rejects_short_payload() {
        assert!(BootloaderIdentity::from_payload(&[0; 7]).is_err());
    }

    #[test]
    fn test_flash_array_info_from_payload() {
        let info = FlashArrayInfo::from_payload(0, &[0x16, 0x00, 0xFF, 0x00]).unwrap();
        assert_eq!(info.first_row, 22);
        assert_eq!(info.last_row, 255);
        assert!(info.contains(22));
        assert!(info.contains(255));
        assert!(!info.contains(21));
        assert!(!info.contains(256));
    }
}
