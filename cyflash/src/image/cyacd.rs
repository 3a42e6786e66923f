//! `.cyacd` firmware image format.
//!
//! A `.cyacd` file is ASCII hex, one record per line, case-insensitive:
//!
//! ```text
//! +-------------+------------+--------------+
//! | Silicon ID  | Silicon Rev| Checksum Type|   header line
//! +-------------+------------+--------------+
//! |   4 bytes   |   1 byte   |    1 byte    |
//! +-------------+------------+--------------+
//!
//! :<array id><row number><length><data ...><row checksum>   row lines
//!    1 byte    2 bytes BE  2 bytes BE         1 byte
//! ```
//!
//! Row numbers and lengths are big-endian in the file and byte-swapped on
//! parse; everything on the bootloader wire is little-endian. The trailing
//! byte of each row line is the two's complement (mod 256) of the sum of
//! all preceding record bytes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};
use crate::image::metadata::AppMetadata;
use crate::protocol::checksum::ChecksumKind;

/// Length of the decoded header record.
const HEADER_LEN: usize = 6;

/// Array id, row number, length, plus the trailing checksum byte.
const ROW_OVERHEAD: usize = 6;

/// One flash row of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Flash array id.
    pub array_id: u8,
    /// Row number within the array.
    pub row_number: u16,
    /// Row data; its length is the device's flash row size.
    pub data: Vec<u8>,
}

/// A parsed `.cyacd` firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Frame checksum algorithm the target bootloader expects.
    pub checksum_kind: ChecksumKind,
    /// Silicon id the image was built for.
    pub silicon_id: u32,
    /// Silicon revision the image was built for.
    pub silicon_rev: u8,
    rows: Vec<Row>,
}

impl Image {
    /// Build an image from already-decoded rows, checking the structural
    /// invariants the parser enforces: at least one row, and a uniform row
    /// size within each array.
    pub fn new(
        checksum_kind: ChecksumKind,
        silicon_id: u32,
        silicon_rev: u8,
        rows: Vec<Row>,
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::ImageParse {
                line: 0,
                reason: "no data rows".into(),
            });
        }
        let mut row_sizes: BTreeMap<u8, usize> = BTreeMap::new();
        for row in &rows {
            let size = row_sizes.entry(row.array_id).or_insert(row.data.len());
            if *size != row.data.len() {
                return Err(Error::ImageParse {
                    line: 0,
                    reason: format!(
                        "row of {} bytes in array {} whose rows are {size} bytes",
                        row.data.len(),
                        row.array_id
                    ),
                });
            }
        }
        Ok(Self {
            checksum_kind,
            silicon_id,
            silicon_rev,
            rows,
        })
    }

    /// Parse an image from a file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::parse(BufReader::new(file))
    }

    /// Parse an image from any buffered reader.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines().enumerate();

        let (header, header_line) = loop {
            match lines.next() {
                Some((index, line)) => {
                    let line = line?;
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        break (decode_hex(trimmed, index + 1)?, index + 1);
                    }
                },
                None => {
                    return Err(Error::ImageParse {
                        line: 1,
                        reason: "file is empty".into(),
                    })
                },
            }
        };
        if header.len() != HEADER_LEN {
            return Err(Error::ImageParse {
                line: header_line,
                reason: format!(
                    "header record has {} bytes, expected {HEADER_LEN}",
                    header.len()
                ),
            });
        }

        let silicon_id = BigEndian::read_u32(&header[0..4]);
        let silicon_rev = header[4];
        let checksum_kind = ChecksumKind::from_code(header[5]).ok_or(Error::ImageParse {
            line: header_line,
            reason: format!("unknown checksum type {:#04x}", header[5]),
        })?;

        let mut rows = Vec::new();
        let mut row_sizes: BTreeMap<u8, usize> = BTreeMap::new();
        let mut last_line = header_line;
        for (index, line) in lines {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            last_line = index + 1;
            let row = parse_row(trimmed, last_line)?;
            match row_sizes.get(&row.array_id) {
                Some(&size) if size != row.data.len() => {
                    return Err(Error::ImageParse {
                        line: last_line,
                        reason: format!(
                            "row of {} bytes in array {} whose rows are {size} bytes",
                            row.data.len(),
                            row.array_id
                        ),
                    });
                },
                Some(_) => {},
                None => {
                    row_sizes.insert(row.array_id, row.data.len());
                },
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(Error::ImageParse {
                line: last_line,
                reason: "no data rows".into(),
            });
        }

        debug!(
            "parsed image: silicon {silicon_id:#010x} rev {silicon_rev}, {} arrays, {} rows",
            row_sizes.len(),
            rows.len()
        );

        Ok(Self {
            checksum_kind,
            silicon_id,
            silicon_rev,
            rows,
        })
    }

    /// The image's rows in file order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Unique array ids in order of first appearance.
    pub fn arrays(&self) -> Vec<u8> {
        let mut ids = Vec::new();
        for row in &self.rows {
            if !ids.contains(&row.array_id) {
                ids.push(row.array_id);
            }
        }
        ids
    }

    /// Decode the application metadata carried by the image.
    ///
    /// The metadata block occupies the start of the highest-numbered row of
    /// the highest array.
    pub fn metadata(&self) -> Result<AppMetadata> {
        let row = self
            .rows
            .iter()
            .max_by_key(|row| (row.array_id, row.row_number))
            .ok_or(Error::Framing("image has no rows".into()))?;
        AppMetadata::from_bytes(&row.data)
    }
}

/// Parse one `:`-prefixed row record.
fn parse_row(line: &str, line_number: usize) -> Result<Row> {
    let record = line.strip_prefix(':').ok_or(Error::ImageParse {
        line: line_number,
        reason: "row records must start with a colon".into(),
    })?;
    let record = decode_hex(record, line_number)?;
    if record.len() < ROW_OVERHEAD {
        return Err(Error::ImageParse {
            line: line_number,
            reason: format!("row record has {} bytes, minimum is {ROW_OVERHEAD}", record.len()),
        });
    }

    let array_id = record[0];
    let row_number = BigEndian::read_u16(&record[1..3]);
    let length = usize::from(BigEndian::read_u16(&record[3..5]));
    let data = &record[5..record.len() - 1];
    if data.len() != length {
        return Err(Error::ImageParse {
            line: line_number,
            reason: format!("row declares {length} data bytes but carries {}", data.len()),
        });
    }

    let sum = record[..record.len() - 1]
        .iter()
        .fold(0u8, |sum, &b| sum.wrapping_add(b));
    let expected = sum.wrapping_neg();
    let checksum = record[record.len() - 1];
    if checksum != expected {
        return Err(Error::ImageParse {
            line: line_number,
            reason: format!("row checksum {checksum:#04x}, computed {expected:#04x}"),
        });
    }

    Ok(Row {
        array_id,
        row_number,
        data: data.to_vec(),
    })
}

fn decode_hex(record: &str, line_number: usize) -> Result<Vec<u8>> {
    hex::decode(record).map_err(|e| Error::ImageParse {
        line: line_number,
        reason: format!("invalid hex record: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encode a row line the way PSoC Creator emits them.
    pub(crate) fn encode_row_line(array_id: u8, row_number: u16, data: &[u8]) -> String {
        let mut record = Vec::with_capacity(data.len() + ROW_OVERHEAD - 1);
        record.push(array_id);
        record.extend_from_slice(&row_number.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        record.extend_from_slice(&(data.len() as u16).to_be_bytes());
        record.extend_from_slice(data);
        let sum = record.iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        record.push(sum.wrapping_neg());
        format!(":{}", hex::encode(record))
    }

    fn sample_image() -> String {
        let mut text = String::from("04a611931100\n");
        text.push_str(&encode_row_line(0, 22, &[0xAA; 64]));
        text.push('\n');
        text.push_str(&encode_row_line(0, 23, &[0xBB; 64]));
        text.push('\n');
        text
    }

    #[test]
    fn test_parse_header() {
        let image = Image::parse(sample_image().as_bytes()).unwrap();
        assert_eq!(image.silicon_id, 0x04A6_1193);
        assert_eq!(image.silicon_rev, 0x11);
        assert_eq!(image.checksum_kind, ChecksumKind::Sum2Complement);
        assert_eq!(image.rows().len(), 2);
        assert_eq!(image.arrays(), vec![0]);
    }

    #[test]
    fn test_parse_rows() {
        let image = Image::parse(sample_image().as_bytes()).unwrap();
        let row = &image.rows()[0];
        assert_eq!(row.array_id, 0);
        assert_eq!(row.row_number, 22);
        assert_eq!(row.data, vec![0xAA; 64]);
    }

    #[test]
    fn test_parse_crc_checksum_type() {
        let mut text = String::from("04a611931101\n");
        text.push_str(&encode_row_line(0, 0, &[0x00; 16]));
        let image = Image::parse(text.as_bytes()).unwrap();
        assert_eq!(image.checksum_kind, ChecksumKind::Crc16);
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let text = sample_image().to_uppercase();
        let image = Image::parse(text.as_bytes()).unwrap();
        assert_eq!(image.silicon_id, 0x04A6_1193);
    }

    #[test]
    fn test_reject_unknown_checksum_type() {
        let text = "04a611931105\n";
        match Image::parse(text.as_bytes()) {
            Err(Error::ImageParse { line: 1, reason }) => {
                assert!(reason.contains("checksum type"), "{reason}");
            },
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_short_header() {
        assert!(Image::parse("04a61193\n".as_bytes()).is_err());
    }

    #[test]
    fn test_reject_empty_file() {
        assert!(matches!(
            Image::parse("".as_bytes()),
            Err(Error::ImageParse { .. })
        ));
    }

    #[test]
    fn test_reject_image_without_rows() {
        assert!(matches!(
            Image::parse("04a611931100\n".as_bytes()),
            Err(Error::ImageParse { .. })
        ));
    }

    #[test]
    fn test_reject_row_without_colon() {
        let mut text = String::from("04a611931100\n");
        text.push_str(&encode_row_line(0, 22, &[0xAA; 16])[1..]);
        assert!(matches!(
            Image::parse(text.as_bytes()),
            Err(Error::ImageParse { line: 2, .. })
        ));
    }

    #[test]
    fn test_reject_corrupted_row_checksum() {
        let mut line = encode_row_line(0, 22, &[0xAA; 16]);
        // Flip the final checksum nibble.
        let last = line.pop().unwrap();
        line.push(if last == '0' { '1' } else { '0' });
        let text = format!("04a611931100\n{line}\n");
        match Image::parse(text.as_bytes()) {
            Err(Error::ImageParse { line: 2, reason }) => {
                assert!(reason.contains("checksum"), "{reason}");
            },
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_length_mismatch() {
        // Declare 4 data bytes but carry 3: rebuild the record by hand.
        let mut record: Vec<u8> = vec![0x00, 0x00, 0x16, 0x00, 0x04, 0x01, 0x02, 0x03];
        let sum = record.iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        record.push(sum.wrapping_neg());
        let text = format!("04a611931100\n:{}\n", hex::encode(record));
        match Image::parse(text.as_bytes()) {
            Err(Error::ImageParse { line: 2, reason }) => {
                assert!(reason.contains("4 data bytes"), "{reason}");
            },
            other => panic!("expected length error, got {other:?}"),
        }
    }

    #[test]
    fn test_reject_uneven_row_sizes_in_one_array() {
        let mut text = String::from("04a611931100\n");
        text.push_str(&encode_row_line(0, 22, &[0xAA; 64]));
        text.push('\n');
        text.push_str(&encode_row_line(0, 23, &[0xBB; 128]));
        text.push('\n');
        assert!(matches!(
            Image::parse(text.as_bytes()),
            Err(Error::ImageParse { line: 3, .. })
        ));
    }

    #[test]
    fn test_different_arrays_may_differ_in_row_size() {
        let mut text = String::from("04a611931100\n");
        text.push_str(&encode_row_line(0, 22, &[0xAA; 64]));
        text.push('\n');
        text.push_str(&encode_row_line(1, 0, &[0xBB; 128]));
        text.push('\n');
        let image = Image::parse(text.as_bytes()).unwrap();
        assert_eq!(image.arrays(), vec![0, 1]);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let text = format!("\n04a611931100\n\n{}\n\n", encode_row_line(0, 5, &[0x01; 16]));
        let image = Image::parse(text.as_bytes()).unwrap();
        assert_eq!(image.rows().len(), 1);
    }

    #[test]
    fn test_metadata_from_highest_row() {
        let mut metadata_row = vec![0u8; 64];
        metadata_row[12..14].copy_from_slice(&0x0203u16.to_le_bytes());
        metadata_row[14..16].copy_from_slice(&9u16.to_le_bytes());

        let mut text = String::from("04a611931100\n");
        text.push_str(&encode_row_line(0, 100, &metadata_row));
        text.push('\n');
        text.push_str(&encode_row_line(0, 22, &[0xAA; 64]));
        text.push('\n');
        let image = Image::parse(text.as_bytes()).unwrap();

        let meta = image.metadata().unwrap();
        assert_eq!(meta.app_version, 0x0203);
        assert_eq!(meta.app_id, 9);
    }
}
