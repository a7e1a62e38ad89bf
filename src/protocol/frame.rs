//! Telemetry frame codec.
//!
//! Binary wire format (little-endian):
//!
//! ```text
//! 55 AA | len (1 byte, = 19) | payload (19 bytes) | crc16 (2 bytes, LE, over payload)
//!
//! payload: u32 ts_ms | i32 f_hz_x1e4 | u16 tau_ms | i32 v_uV | u8 adc_gain
//!          | u8 flags | i16 ppm_corr_x1e2 | u8 mode
//! ```
//!
//! Text wire format: a header line `ts_ms,f_hz,tau_ms,v_uV,adc_gain,flags,ppm_corr,mode`
//! followed by comma-separated records.
//!
//! Everything here is pure; buffering and resynchronisation live in
//! [`super::reassembler`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Two-byte magic preceding every binary frame.
pub const FRAME_MAGIC: [u8; 2] = [0x55, 0xAA];

/// Fixed payload size of the binary frame.
pub const PAYLOAD_LEN: usize = 19;

/// Magic + length byte.
pub const HEADER_LEN: usize = 3;

/// Trailing CRC-16.
pub const CRC_LEN: usize = 2;

/// Total size of one well-formed binary frame on the wire.
pub const FRAME_LEN: usize = HEADER_LEN + PAYLOAD_LEN + CRC_LEN;

/// CCITT polynomial.
pub const CRC16_POLY: u16 = 0x1021;

/// CCITT initial value.
pub const CRC16_INIT: u16 = 0xFFFF;

/// Canonical column order of the text record.
pub const TEXT_HEADER: [&str; 8] = [
    "ts_ms", "f_hz", "tau_ms", "v_uV", "adc_gain", "flags", "ppm_corr", "mode",
];

const F_HZ_SCALE: f64 = 1e4;
const PPM_SCALE: f64 = 1e2;

/// Which wire format the device streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// Comma-separated text records, one per line
    #[default]
    #[serde(alias = "text")]
    Csv,
    /// `55 AA` framed binary packets
    Binary,
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Csv => write!(f, "csv"),
            FrameFormat::Binary => write!(f, "binary"),
        }
    }
}

/// Errors raised while decoding a single record.
///
/// These never abort the stream: the offending record is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Binary payload had the wrong size.
    #[error("payload is {actual} bytes, expected {expected}")]
    PayloadLength {
        /// Required payload size
        expected: usize,
        /// Observed payload size
        actual: usize,
    },

    /// A text column required by the record is absent.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A text column could not be parsed as its semantic type.
    #[error("invalid value '{value}' for field '{field}'")]
    InvalidField {
        /// Column name
        field: &'static str,
        /// Raw text that failed to parse
        value: String,
    },

    /// The header line does not name every required column.
    #[error("header is missing column '{0}'")]
    IncompleteHeader(&'static str),
}

/// Device operating mode reported in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingMode {
    /// Fixed gate-time counting.
    Gated,
    /// Reciprocal (period) counting.
    Recip,
    /// Code not known to this host.
    Unknown(u8),
}

impl OperatingMode {
    /// Map the wire code to a mode.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OperatingMode::Gated,
            1 => OperatingMode::Recip,
            other => OperatingMode::Unknown(other),
        }
    }

    /// Wire code for this mode.
    pub fn code(self) -> u8 {
        match self {
            OperatingMode::Gated => 0,
            OperatingMode::Recip => 1,
            OperatingMode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Gated => write!(f, "GATED"),
            OperatingMode::Recip => write!(f, "RECIP"),
            OperatingMode::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

impl FromStr for OperatingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("GATED") {
            return Ok(OperatingMode::Gated);
        }
        if trimmed.eq_ignore_ascii_case("RECIP") {
            return Ok(OperatingMode::Recip);
        }
        if let Ok(code) = trimmed.parse::<u8>() {
            return Ok(OperatingMode::from_code(code));
        }
        let upper = trimmed.to_ascii_uppercase();
        upper
            .strip_prefix("UNKNOWN(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|code| code.parse::<u8>().ok())
            .map(OperatingMode::from_code)
            .ok_or(())
    }
}

impl Serialize for OperatingMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OperatingMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown operating mode '{}'", raw)))
    }
}

/// One decoded telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Device timestamp (ms)
    pub ts_ms: f64,
    /// Measured frequency (Hz)
    pub f_hz: f64,
    /// Gate / reciprocal time constant (ms)
    pub tau_ms: f64,
    /// Diode voltage (µV)
    pub v_uv: f64,
    /// ADC gain setting
    pub adc_gain: u8,
    /// Device status bitfield
    pub flags: u8,
    /// Timebase correction (ppm)
    pub ppm_corr: f64,
    /// Counting mode
    pub mode: OperatingMode,
}

/// CRC-16/CCITT with the default polynomial and initial value.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with(data, CRC16_POLY, CRC16_INIT)
}

/// Bitwise MSB-first CRC-16 with explicit polynomial and initial value.
pub fn crc16_with(data: &[u8], poly: u16, init: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ poly;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Decode a 19-byte binary payload.
pub fn decode_payload(payload: &[u8]) -> Result<Frame, DecodeError> {
    let body: &[u8; PAYLOAD_LEN] = payload
        .try_into()
        .map_err(|_| DecodeError::PayloadLength {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        })?;

    let ts_ms = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let f_hz_raw = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let tau_ms = u16::from_le_bytes([body[8], body[9]]);
    let v_uv = i32::from_le_bytes([body[10], body[11], body[12], body[13]]);
    let adc_gain = body[14];
    let flags = body[15];
    let ppm_raw = i16::from_le_bytes([body[16], body[17]]);
    let mode = OperatingMode::from_code(body[18]);

    Ok(Frame {
        ts_ms: f64::from(ts_ms),
        f_hz: f64::from(f_hz_raw) / F_HZ_SCALE,
        tau_ms: f64::from(tau_ms),
        v_uv: f64::from(v_uv),
        adc_gain,
        flags,
        ppm_corr: f64::from(ppm_raw) / PPM_SCALE,
        mode,
    })
}

/// Encode the payload of a frame, rounding fixed-point fields to the wire resolution.
///
/// Values outside the wire range saturate.
pub fn encode_payload(frame: &Frame) -> [u8; PAYLOAD_LEN] {
    let mut body = [0u8; PAYLOAD_LEN];
    let ts_ms = frame.ts_ms.round() as u32;
    let f_hz_raw = (frame.f_hz * F_HZ_SCALE).round() as i32;
    let tau_ms = frame.tau_ms.round() as u16;
    let v_uv = frame.v_uv.round() as i32;
    let ppm_raw = (frame.ppm_corr * PPM_SCALE).round() as i16;

    body[0..4].copy_from_slice(&ts_ms.to_le_bytes());
    body[4..8].copy_from_slice(&f_hz_raw.to_le_bytes());
    body[8..10].copy_from_slice(&tau_ms.to_le_bytes());
    body[10..14].copy_from_slice(&v_uv.to_le_bytes());
    body[14] = frame.adc_gain;
    body[15] = frame.flags;
    body[16..18].copy_from_slice(&ppm_raw.to_le_bytes());
    body[18] = frame.mode.code();
    body
}

/// Encode a complete binary frame: magic, length, payload and CRC.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let payload = encode_payload(frame);
    let mut packet = Vec::with_capacity(FRAME_LEN);
    packet.extend_from_slice(&FRAME_MAGIC);
    packet.push(PAYLOAD_LEN as u8);
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(&crc16(&payload).to_le_bytes());
    packet
}

/// Column positions for the text record, derived from a header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLayout {
    columns: [usize; 8],
}

impl Default for TextLayout {
    fn default() -> Self {
        Self {
            columns: [0, 1, 2, 3, 4, 5, 6, 7],
        }
    }
}

impl TextLayout {
    /// Whether a line looks like the header rather than a record.
    ///
    /// Every column a known field name, in any order, or a line naming `ts_ms`
    /// with no numeric column. The latter lets [`from_header`](Self::from_header)
    /// report what an incomplete header is missing.
    pub fn is_header(line: &str) -> bool {
        let names: Vec<&str> = line.split(',').map(str::trim).collect();
        if names
            .iter()
            .all(|name| TEXT_HEADER.iter().any(|known| known == name))
        {
            return true;
        }
        names.contains(&TEXT_HEADER[0]) && !names.iter().any(|name| name.parse::<f64>().is_ok())
    }

    /// Build the column mapping from a header line.
    pub fn from_header(line: &str) -> Result<Self, DecodeError> {
        let names: Vec<&str> = line.split(',').map(str::trim).collect();
        let mut columns = [0usize; 8];
        for (slot, wanted) in columns.iter_mut().zip(TEXT_HEADER.iter()) {
            *slot = names
                .iter()
                .position(|name| name == wanted)
                .ok_or(DecodeError::IncompleteHeader(*wanted))?;
        }
        Ok(Self { columns })
    }

    fn field<'a>(&self, fields: &[&'a str], idx: usize) -> Result<&'a str, DecodeError> {
        fields
            .get(self.columns[idx])
            .copied()
            .filter(|raw| !raw.is_empty())
            .ok_or(DecodeError::MissingField(TEXT_HEADER[idx]))
    }

    /// Decode one comma-separated record.
    pub fn decode(&self, line: &str) -> Result<Frame, DecodeError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let field = |idx: usize| self.field(&fields, idx);

        let ts_ms = parse_field(field(0)?, TEXT_HEADER[0])?;
        let f_hz = parse_field(field(1)?, TEXT_HEADER[1])?;
        let tau_ms = parse_field(field(2)?, TEXT_HEADER[2])?;
        let v_uv = parse_field(field(3)?, TEXT_HEADER[3])?;
        let adc_gain = parse_field(field(4)?, TEXT_HEADER[4])?;
        let flags = parse_field(field(5)?, TEXT_HEADER[5])?;
        let ppm_corr = parse_field(field(6)?, TEXT_HEADER[6])?;
        let mode_raw = field(7)?;
        let mode = mode_raw
            .parse::<OperatingMode>()
            .map_err(|_| DecodeError::InvalidField {
                field: TEXT_HEADER[7],
                value: mode_raw.to_string(),
            })?;

        Ok(Frame {
            ts_ms,
            f_hz,
            tau_ms,
            v_uv,
            adc_gain,
            flags,
            ppm_corr,
            mode,
        })
    }
}

/// Decode a text record using the canonical column order.
pub fn decode_text_record(line: &str) -> Result<Frame, DecodeError> {
    TextLayout::default().decode(line)
}

fn parse_field<T: FromStr>(raw: &str, field: &'static str) -> Result<T, DecodeError> {
    raw.parse::<T>().map_err(|_| DecodeError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            ts_ms: 123_456.0,
            f_hz: 30_012.3456,
            tau_ms: 100.0,
            v_uv: 501_234.0,
            adc_gain: 16,
            flags: 0b1010,
            ppm_corr: 0.15,
            mode: OperatingMode::Recip,
        }
    }

    #[test]
    fn crc16_known_vectors() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[0u8; PAYLOAD_LEN]), 0xB361);
        assert_eq!(crc16(&[0xFFu8; PAYLOAD_LEN]), 0x5FF0);
        assert_eq!(crc16(&[]), CRC16_INIT);
        assert_eq!(crc16(&[0xFF, 0xFF]), 0x0000);
        assert_eq!(crc16_with(b"123456789", CRC16_POLY, 0x0000), 0x31C3);
    }

    #[test]
    fn binary_round_trip_within_resolution() {
        let frame = sample_frame();
        let packet = encode_frame(&frame);
        assert_eq!(packet.len(), FRAME_LEN);
        assert_eq!(&packet[..2], &FRAME_MAGIC);
        assert_eq!(packet[2] as usize, PAYLOAD_LEN);

        let decoded = decode_payload(&packet[HEADER_LEN..HEADER_LEN + PAYLOAD_LEN]).unwrap();
        assert!((decoded.f_hz - frame.f_hz).abs() <= 1e-4);
        assert!((decoded.ppm_corr - frame.ppm_corr).abs() <= 1e-2);
        assert_eq!(decoded.ts_ms, frame.ts_ms);
        assert_eq!(decoded.tau_ms, frame.tau_ms);
        assert_eq!(decoded.v_uv, frame.v_uv);
        assert_eq!(decoded.adc_gain, 16);
        assert_eq!(decoded.flags, 0b1010);
        assert_eq!(decoded.mode, OperatingMode::Recip);
    }

    #[test]
    fn negative_fixed_point_fields() {
        let frame = Frame {
            v_uv: -42.0,
            ppm_corr: -1.25,
            mode: OperatingMode::Gated,
            ..sample_frame()
        };
        let payload = encode_payload(&frame);
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.v_uv, -42.0);
        assert!((decoded.ppm_corr + 1.25).abs() < 1e-9);
        assert_eq!(decoded.mode, OperatingMode::Gated);
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = decode_payload(&[0u8; 4]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PayloadLength {
                expected: PAYLOAD_LEN,
                actual: 4
            }
        );
    }

    #[test]
    fn unknown_mode_code_is_preserved() {
        let mut payload = encode_payload(&sample_frame());
        payload[18] = 7;
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.mode, OperatingMode::Unknown(7));
        assert_eq!(decoded.mode.to_string(), "UNKNOWN(7)");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("recip".parse::<OperatingMode>(), Ok(OperatingMode::Recip));
        assert_eq!("GATED".parse::<OperatingMode>(), Ok(OperatingMode::Gated));
        assert_eq!("1".parse::<OperatingMode>(), Ok(OperatingMode::Recip));
        assert_eq!(
            "UNKNOWN(9)".parse::<OperatingMode>(),
            Ok(OperatingMode::Unknown(9))
        );
        assert!("SWEEP".parse::<OperatingMode>().is_err());
    }

    #[test]
    fn text_record_canonical_order() {
        let frame = decode_text_record("123.0,30000.0,100.0,500000.0,16,1,0.2,RECIP").unwrap();
        assert_eq!(frame.f_hz, 30000.0);
        assert_eq!(frame.flags, 1);
        assert_eq!(frame.mode, OperatingMode::Recip);
    }

    #[test]
    fn text_record_reordered_header() {
        let layout =
            TextLayout::from_header("mode,ts_ms,f_hz,tau_ms,v_uV,adc_gain,flags,ppm_corr").unwrap();
        let frame = layout.decode("GATED,1,2.5,100,7,8,0,0.5").unwrap();
        assert_eq!(frame.mode, OperatingMode::Gated);
        assert_eq!(frame.f_hz, 2.5);
        assert_eq!(frame.v_uv, 7.0);
    }

    #[test]
    fn text_record_errors_name_the_field() {
        let err = decode_text_record("123.0,abc,100.0,500000.0,16,1,0.2,RECIP").unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidField {
                field: "f_hz",
                value: "abc".into()
            }
        );

        let err = decode_text_record("123.0,30000.0,100.0").unwrap_err();
        assert_eq!(err, DecodeError::MissingField("v_uV"));
    }

    #[test]
    fn header_detection() {
        assert!(TextLayout::is_header(&TEXT_HEADER.join(",")));
        assert!(!TextLayout::is_header("1,2,3"));
        assert!(TextLayout::is_header(
            "f_hz,ts_ms,tau_ms,v_uV,adc_gain,flags,ppm_corr,mode"
        ));
        assert!(TextLayout::is_header("mode , v_uV"));
        assert!(!TextLayout::is_header("garbage,line"));
        assert!(!TextLayout::is_header("ts_ms,1.5"));
        assert_eq!(
            TextLayout::from_header("ts_ms,f_hz"),
            Err(DecodeError::IncompleteHeader("tau_ms"))
        );
    }
}
