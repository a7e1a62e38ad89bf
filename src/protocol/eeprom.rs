//! Calibration EEPROM image decoding.
//!
//! The sensor carries a 512-byte calibration image. Multi-byte values are
//! big-endian. Offsets:
//!
//! | offset          | content                                        |
//! |-----------------|------------------------------------------------|
//! | `0x002..0x006`  | serial number (rendered as uppercase hex)      |
//! | `0x008..0x018`  | product name, ASCII, NUL/space padded          |
//! | `0x048`         | unit code                                      |
//! | `0x050`/`0x051` | polynomial orders `nx` / `ny`                  |
//! | `0x080`/`0x084` | `x_ref` / `y_ref` as f32                       |
//! | `0x100..`       | `(nx+1)*(ny+1)` f32 coefficients, row-major    |
//! | `0x1FE..0x200`  | checksum word                                  |
//!
//! The image is accepted when the byte sum of `0x000..0x1FE` plus the checksum word,
//! truncated to 16 bits, equals [`EEPROM_CHECKSUM`].
//!
//! The device exposes the image through the `EEPROM.DUMP <offset> <length>` command;
//! [`parse_dump_reply`] turns the reply lines into the raw blob.

use crate::coeff::{CoefficientError, CoefficientSet, Provenance};
use std::collections::BTreeMap;
use thiserror::Error;

/// Size of the calibration image.
pub const EEPROM_SIZE: usize = 0x200;

/// Value the image checksum must produce.
pub const EEPROM_CHECKSUM: u16 = 0x1234;

/// Command that reads the whole image.
pub const EEPROM_DUMP_COMMAND: &str = "EEPROM.DUMP 0 512";

const SERIAL_RANGE: std::ops::Range<usize> = 0x002..0x006;
const PRODUCT_RANGE: std::ops::Range<usize> = 0x008..0x018;
const UNIT_OFFSET: usize = 0x048;
const NX_OFFSET: usize = 0x050;
const NY_OFFSET: usize = 0x051;
const X_REF_OFFSET: usize = 0x080;
const Y_REF_OFFSET: usize = 0x084;
const K_TABLE_BASE: usize = 0x100;
const CHECKSUM_OFFSET: usize = EEPROM_SIZE - 2;

/// Errors raised while decoding an image or a dump reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EepromError {
    /// Fewer than [`EEPROM_SIZE`] bytes were supplied.
    #[error("EEPROM image must be {expected} bytes, got {actual}")]
    TooShort {
        /// Required image size
        expected: usize,
        /// Supplied size
        actual: usize,
    },

    /// The checksum gate rejected the image.
    #[error("EEPROM checksum mismatch (expected {expected:#06X}, got {actual:#06X})")]
    Checksum {
        /// Required checksum value
        expected: u16,
        /// Computed checksum value
        actual: u16,
    },

    /// The coefficient table extends past the image.
    #[error("coefficient table of {entries} entries runs past the end of the image")]
    TableOverrun {
        /// Number of f32 entries the header declares
        entries: usize,
    },

    /// Decoded fields do not form a valid coefficient set.
    #[error(transparent)]
    Coefficients(#[from] CoefficientError),

    /// The device answered `ERR ...`.
    #[error("device reported error: {0}")]
    Device(String),

    /// The reply did not follow the dump grammar.
    #[error("malformed EEPROM dump: {0}")]
    MalformedDump(String),

    /// The payload length differs from the header's `LEN`.
    #[error("EEPROM dump length mismatch (expected {expected}, got {actual})")]
    LengthMismatch {
        /// Length announced in the header
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// A coefficient set cannot be represented in the image layout.
    #[error("cannot encode {0} into an EEPROM image")]
    Unencodable(String),
}

/// Compute the checksum value of an image (first [`EEPROM_SIZE`] bytes).
pub fn eeprom_checksum(image: &[u8]) -> u16 {
    let body_end = CHECKSUM_OFFSET.min(image.len());
    let sum = image[..body_end]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    let word = match image.get(CHECKSUM_OFFSET..EEPROM_SIZE) {
        Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
        _ => 0,
    };
    sum.wrapping_add(word)
}

/// Decode a calibration image into a coefficient set.
///
/// Only the first [`EEPROM_SIZE`] bytes are considered. The device address is
/// attached as supplied by the caller.
pub fn decode_eeprom(
    blob: &[u8],
    provenance: Provenance,
    device_address: Option<u16>,
) -> Result<CoefficientSet, EepromError> {
    if blob.len() < EEPROM_SIZE {
        return Err(EepromError::TooShort {
            expected: EEPROM_SIZE,
            actual: blob.len(),
        });
    }
    let image = &blob[..EEPROM_SIZE];

    let actual = eeprom_checksum(image);
    if actual != EEPROM_CHECKSUM {
        return Err(EepromError::Checksum {
            expected: EEPROM_CHECKSUM,
            actual,
        });
    }

    let serial: String = image[SERIAL_RANGE]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect();
    let product = decode_ascii(&image[PRODUCT_RANGE]);
    let unit = decode_unit(image[UNIT_OFFSET]);
    let nx = usize::from(image[NX_OFFSET]);
    let ny = usize::from(image[NY_OFFSET]);

    let entries = (nx + 1) * (ny + 1);
    if K_TABLE_BASE + entries * 4 > EEPROM_SIZE {
        return Err(EepromError::TableOverrun { entries });
    }

    let x_ref = read_f32(image, X_REF_OFFSET);
    let y_ref = read_f32(image, Y_REF_OFFSET);
    let coefficients = (0..entries)
        .map(|idx| read_f32(image, K_TABLE_BASE + idx * 4))
        .collect();

    let mut set = CoefficientSet::new(provenance, nx, ny, coefficients, x_ref, y_ref, unit)?
        .with_serial(Some(serial))
        .with_product(product);
    if let Some(address) = device_address {
        set = set.with_device_address(address);
    }
    Ok(set)
}

/// Build a valid image from a coefficient set, fixing the checksum word.
///
/// The unit must be a single printable character or a `0xNN` code; coefficients
/// are narrowed to f32.
pub fn encode_image(set: &CoefficientSet) -> Result<Vec<u8>, EepromError> {
    let mut image = vec![0u8; EEPROM_SIZE];

    if let Some(serial) = set.serial() {
        let bytes = decode_hex(serial)
            .filter(|bytes| bytes.len() == SERIAL_RANGE.len())
            .ok_or_else(|| EepromError::Unencodable(format!("serial '{}'", serial)))?;
        image[SERIAL_RANGE].copy_from_slice(&bytes);
    }

    if let Some(product) = set.product() {
        let raw = product.as_bytes();
        if !product.is_ascii() || raw.len() > PRODUCT_RANGE.len() {
            return Err(EepromError::Unencodable(format!("product '{}'", product)));
        }
        image[PRODUCT_RANGE.start..PRODUCT_RANGE.start + raw.len()].copy_from_slice(raw);
    }

    image[UNIT_OFFSET] = encode_unit(set.unit())
        .ok_or_else(|| EepromError::Unencodable(format!("unit '{}'", set.unit())))?;

    let (nx, ny) = (set.nx(), set.ny());
    image[NX_OFFSET] =
        u8::try_from(nx).map_err(|_| EepromError::Unencodable(format!("nx = {}", nx)))?;
    image[NY_OFFSET] =
        u8::try_from(ny).map_err(|_| EepromError::Unencodable(format!("ny = {}", ny)))?;

    let entries = set.coefficients().len();
    if K_TABLE_BASE + entries * 4 > CHECKSUM_OFFSET {
        return Err(EepromError::TableOverrun { entries });
    }

    image[X_REF_OFFSET..X_REF_OFFSET + 4].copy_from_slice(&(set.x_ref() as f32).to_be_bytes());
    image[Y_REF_OFFSET..Y_REF_OFFSET + 4].copy_from_slice(&(set.y_ref() as f32).to_be_bytes());
    for (idx, value) in set.coefficients().iter().enumerate() {
        let offset = K_TABLE_BASE + idx * 4;
        image[offset..offset + 4].copy_from_slice(&(*value as f32).to_be_bytes());
    }

    let partial = eeprom_checksum(&image[..CHECKSUM_OFFSET]);
    let word = EEPROM_CHECKSUM.wrapping_sub(partial);
    image[CHECKSUM_OFFSET..].copy_from_slice(&word.to_be_bytes());
    Ok(image)
}

/// Parsed `EEPROM.DUMP` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpReply {
    /// Raw image bytes
    pub data: Vec<u8>,
    /// Header tokens (`KEY=VALUE`), keys uppercased
    pub header: BTreeMap<String, String>,
}

impl DumpReply {
    /// Device address from the `DEV` header token, hex (`0x` prefix) or decimal.
    pub fn device_address(&self) -> Option<u16> {
        let raw = self.header.get("DEV")?;
        match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        }
    }
}

/// Parse the lines of an `EEPROM.DUMP` reply.
///
/// Lines before the first `OK`/`ERR` status line are ignored; hex payload lines are
/// concatenated until `END` (or the end of input).
pub fn parse_dump_reply<S: AsRef<str>>(lines: &[S]) -> Result<DumpReply, EepromError> {
    let mut iter = lines.iter().map(|l| l.as_ref().trim());
    let status = iter
        .by_ref()
        .find(|line| line.starts_with("OK") || line.starts_with("ERR"))
        .ok_or_else(|| EepromError::MalformedDump("no OK/ERR status line".into()))?;
    if status.starts_with("ERR") {
        return Err(EepromError::Device(status.to_string()));
    }

    let header: BTreeMap<String, String> = status
        .split_whitespace()
        .skip(1)
        .filter_map(|token| token.split_once('='))
        .map(|(key, value)| (key.to_ascii_uppercase(), value.to_string()))
        .collect();

    let mut payload = String::new();
    for line in iter {
        if line.is_empty() {
            continue;
        }
        if line == "END" {
            break;
        }
        if line.starts_with("ERR") {
            return Err(EepromError::Device(line.to_string()));
        }
        payload.push_str(line);
    }

    if payload.len() % 2 != 0 {
        return Err(EepromError::MalformedDump("hex payload has odd length".into()));
    }
    let data = decode_hex(&payload)
        .ok_or_else(|| EepromError::MalformedDump("invalid hex digit in payload".into()))?;

    if let Some(len) = header.get("LEN") {
        let expected: usize = len
            .parse()
            .map_err(|_| EepromError::MalformedDump(format!("invalid LEN field '{}'", len)))?;
        if expected != data.len() {
            return Err(EepromError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
    }

    Ok(DumpReply { data, header })
}

/// Render an image as dump payload lines (32 bytes per line).
pub fn dump_lines(image: &[u8]) -> Vec<String> {
    image
        .chunks(32)
        .map(|chunk| chunk.iter().map(|b| format!("{:02X}", b)).collect())
        .collect()
}

fn read_f32(image: &[u8], offset: usize) -> f64 {
    let bytes = [
        image[offset],
        image[offset + 1],
        image[offset + 2],
        image[offset + 3],
    ];
    f64::from(f32::from_be_bytes(bytes))
}

fn decode_ascii(raw: &[u8]) -> Option<String> {
    let text: String = raw
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect();
    let trimmed = text.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn decode_unit(code: u8) -> String {
    if (32..=126).contains(&code) {
        char::from(code).to_string()
    } else {
        format!("0x{:02X}", code)
    }
}

fn encode_unit(unit: &str) -> Option<u8> {
    if let Some(hex) = unit.strip_prefix("0x") {
        return u8::from_str_radix(hex, 16).ok();
    }
    match unit.as_bytes() {
        [code] if (32..=126).contains(code) => Some(*code),
        _ => None,
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(&text[idx..idx + 2], 16).ok())
        .collect()
}
