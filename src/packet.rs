//! Wire decoding: fixed-size binary records (UDP) and newline-delimited JSON (TCP).
//!
//! Binary record, little-endian, one per datagram:
//!
//! | Offset | Size  | Field |
//! |--------|-------|-------|
//! | 0      | 2×6   | gyro_ax gyro_ay gyro_az gyro_gx gyro_gy gyro_gz (i16) |
//! | 12     | 4×3   | mag_mx mag_my mag_mz (i32) |
//! | 24     | 4     | mag_heading (f32) |
//! | 28     | 4×4   | adc_v32 adc_v33 adc_v34 adc_v35 (f32) |
//! | 44     | 2×3   | slave_gx slave_gy slave_gz (i16) |
//! | 50     | 4     | timestamp (u32, device ms) |
//! | Total: 54 bytes |

use crate::types::Snapshot;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use serde_json::Value;
use std::io::{self, Cursor};
use thiserror::Error;

pub const PACKET_SIZE: usize = 54;

/// Longest JSON line we buffer before giving up on finding its newline.
const MAX_LINE_BYTES: usize = 64 * 1024;

const I16_MASTER: [&str; 6] = ["gyro_ax", "gyro_ay", "gyro_az", "gyro_gx", "gyro_gy", "gyro_gz"];
const I32_MAG: [&str; 3] = ["mag_mx", "mag_my", "mag_mz"];
const F32_FIELDS: [&str; 5] = ["mag_heading", "adc_v32", "adc_v33", "adc_v34", "adc_v35"];
const I16_SLAVE: [&str; 3] = ["slave_gx", "slave_gy", "slave_gz"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("wrong size: expected {expected} bytes, got {got}")]
    WrongSize { expected: usize, got: usize },
    #[error("truncated record: {0}")]
    Truncated(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON line is not an object")]
    NotAnObject,
    #[error("non-finite value {value} in {key}")]
    NonFinite { key: &'static str, value: f32 },
}

/// Decode one binary record. The snapshot is stamped with `captured_us`
/// (host clock); the device timestamp is kept as the `timestamp` key.
pub fn decode_binary(data: &[u8], captured_us: u64) -> Result<Snapshot, DecodeError> {
    if data.len() != PACKET_SIZE {
        return Err(DecodeError::WrongSize {
            expected: PACKET_SIZE,
            got: data.len(),
        });
    }

    let mut cursor = Cursor::new(data);
    let mut snap = Snapshot::new(captured_us);

    for key in I16_MASTER {
        let v = cursor.read_i16::<LittleEndian>()?;
        snap.values.insert(key.to_string(), v as f64);
    }
    for key in I32_MAG {
        let v = cursor.read_i32::<LittleEndian>()?;
        snap.values.insert(key.to_string(), v as f64);
    }
    for key in F32_FIELDS {
        let v = cursor.read_f32::<LittleEndian>()?;
        if !v.is_finite() {
            return Err(DecodeError::NonFinite { key, value: v });
        }
        snap.values.insert(key.to_string(), v as f64);
    }
    for key in I16_SLAVE {
        let v = cursor.read_i16::<LittleEndian>()?;
        snap.values.insert(key.to_string(), v as f64);
    }
    let ts = cursor.read_u32::<LittleEndian>()?;
    snap.values.insert("timestamp".to_string(), ts as f64);

    Ok(snap)
}

/// Decode one JSON line. Nested objects are flattened one level as
/// `{parent}_{child}`; leaves that are not numbers are skipped.
pub fn decode_json_line(line: &str, captured_us: u64) -> Result<Snapshot, DecodeError> {
    let value: Value = serde_json::from_str(line.trim())?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let mut snap = Snapshot::new(captured_us);
    for (key, value) in map {
        match value {
            Value::Object(children) => {
                for (child, v) in children {
                    if let Some(n) = v.as_f64() {
                        snap.values.insert(format!("{}_{}", key, child), n);
                    }
                }
            }
            other => {
                if let Some(n) = other.as_f64() {
                    snap.values.insert(key, n);
                }
            }
        }
    }
    Ok(snap)
}

/// Reassembles newline-delimited text from a byte stream.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete, non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        if self.buf.len() > MAX_LINE_BYTES {
            warn!(
                "Discarding {} buffered bytes without a newline",
                self.buf.len()
            );
            self.buf.clear();
        } else if !self.buf.is_empty() {
            debug!("{} bytes waiting for newline", self.buf.len());
        }
        lines
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Build a binary record. Used by the simulator and by tests.
pub struct PacketBuilder {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    pub mag: [i32; 3],
    pub heading: f32,
    pub flex: [f32; 4],
    pub slave_gyro: [i16; 3],
    pub timestamp: u32,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self {
            accel: [0; 3],
            gyro: [0; 3],
            mag: [0; 3],
            heading: 0.0,
            flex: [4095.0; 4],
            slave_gyro: [0; 3],
            timestamp: 0,
        }
    }
}

impl PacketBuilder {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_SIZE);
        for v in self.accel.iter().chain(self.gyro.iter()) {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.mag {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&self.heading.to_le_bytes());
        for v in &self.flex {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.slave_gyro {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built record, independent of PacketBuilder.
    fn hand_built() -> Vec<u8> {
        let mut buf = Vec::new();
        for v in [-100i16, 200, -300, 12000, -4000, 5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [70000i32, -70000, 1] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&123.5f32.to_le_bytes());
        for v in [4095.0f32, 2048.0, 500.25, 0.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        for v in [i16::MIN, 0, i16::MAX] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        buf
    }

    #[test]
    fn test_record_size() {
        assert_eq!(hand_built().len(), PACKET_SIZE);
        assert_eq!(PacketBuilder::default().encode().len(), PACKET_SIZE);
    }

    #[test]
    fn test_decode_field_by_field() {
        let snap = decode_binary(&hand_built(), 42).unwrap();
        assert_eq!(snap.captured_us, 42);
        let expect = [
            ("gyro_ax", -100.0),
            ("gyro_ay", 200.0),
            ("gyro_az", -300.0),
            ("gyro_gx", 12000.0),
            ("gyro_gy", -4000.0),
            ("gyro_gz", 5.0),
            ("mag_mx", 70000.0),
            ("mag_my", -70000.0),
            ("mag_mz", 1.0),
            ("mag_heading", 123.5),
            ("adc_v32", 4095.0),
            ("adc_v33", 2048.0),
            ("adc_v34", 500.25),
            ("adc_v35", 0.0),
            ("slave_gx", -32768.0),
            ("slave_gy", 0.0),
            ("slave_gz", 32767.0),
            ("timestamp", 3735928559.0),
        ];
        assert_eq!(snap.len(), expect.len(), "no extra keys");
        for (key, value) in expect {
            assert_eq!(snap.get(key), Some(value), "field {}", key);
        }
    }

    #[test]
    fn test_decode_wrong_size() {
        let mut data = hand_built();
        data.push(0);
        let err = decode_binary(&data, 0).unwrap_err();
        assert!(err.to_string().contains("wrong size"), "got: {}", err);
        assert!(decode_binary(&data[..34], 0).is_err());
        assert!(decode_binary(&[], 0).is_err());
    }

    #[test]
    fn test_decode_rejects_non_finite_float() {
        let p = PacketBuilder {
            flex: [4095.0, f32::NAN, 4095.0, 4095.0],
            ..Default::default()
        };
        let err = decode_binary(&p.encode(), 0).unwrap_err();
        assert!(
            matches!(err, DecodeError::NonFinite { key: "adc_v33", .. }),
            "got: {}",
            err
        );

        let p = PacketBuilder {
            heading: f32::INFINITY,
            ..Default::default()
        };
        assert!(decode_binary(&p.encode(), 0).is_err());
    }

    #[test]
    fn test_builder_matches_decoder() {
        let p = PacketBuilder {
            gyro: [1, 2, 3],
            flex: [10.0, 20.0, 30.0, 40.0],
            slave_gyro: [-1, -2, -3],
            timestamp: 99,
            ..Default::default()
        };
        let snap = decode_binary(&p.encode(), 0).unwrap();
        assert_eq!(snap.get("gyro_gy"), Some(2.0));
        assert_eq!(snap.get("adc_v35"), Some(40.0));
        assert_eq!(snap.get("slave_gz"), Some(-3.0));
        assert_eq!(snap.get("timestamp"), Some(99.0));
    }

    #[test]
    fn test_json_flattens_nested() {
        let line = r#"{"gyro":{"gx":1.5,"gy":-2,"gz":3},"adc":{"v32":4095},"timestamp":7}"#;
        let snap = decode_json_line(line, 5).unwrap();
        assert_eq!(snap.get("gyro_gx"), Some(1.5));
        assert_eq!(snap.get("gyro_gy"), Some(-2.0));
        assert_eq!(snap.get("adc_v32"), Some(4095.0));
        assert_eq!(snap.get("timestamp"), Some(7.0));
        assert_eq!(snap.captured_us, 5);
    }

    #[test]
    fn test_json_skips_non_numeric() {
        let line = r#"{"name":"glove","ok":true,"gyro":{"gx":1,"label":"x","deep":{"a":1}}}"#;
        let snap = decode_json_line(line, 0).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("gyro_gx"), Some(1.0));
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(
            decode_json_line("not json", 0),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_json_line("[1,2,3]", 0),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn test_line_buffer_reassembles() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"{\"a\":").is_empty());
        assert_eq!(lb.pending(), 5);
        let lines = lb.push(b"1}\n\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(lb.pending(), 4);
    }

    #[test]
    fn test_line_buffer_discards_runaway() {
        let mut lb = LineBuffer::new();
        let junk = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(lb.push(&junk).is_empty());
        assert_eq!(lb.pending(), 0);
        assert_eq!(lb.push(b"{}\n"), vec!["{}".to_string()]);
    }
}
