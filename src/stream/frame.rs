//! Datagram framing for the streaming endpoint.
//!
//! Every datagram starts with a 9-byte big-endian header:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 2    | stream id      |
//! | 2      | 1    | frame type     |
//! | 3      | 4    | sequence       |
//! | 7      | 2    | payload length |
//!
//! The declared payload length is authoritative. Bytes past it are ignored.

use std::fmt;

use thiserror::Error;

pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Meter,
    Audio,
    Iq,
    Panadapter,
    Waterfall,
    Opus,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => FrameKind::Meter,
            2 => FrameKind::Audio,
            3 => FrameKind::Iq,
            4 => FrameKind::Panadapter,
            5 => FrameKind::Waterfall,
            6 => FrameKind::Opus,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            FrameKind::Meter => 1,
            FrameKind::Audio => 2,
            FrameKind::Iq => 3,
            FrameKind::Panadapter => 4,
            FrameKind::Waterfall => 5,
            FrameKind::Opus => 6,
            FrameKind::Unknown(code) => code,
        }
    }

    /// Payload alignment in bytes; 1 for opaque kinds.
    fn unit(self) -> usize {
        match self {
            FrameKind::Meter => 4,
            FrameKind::Audio | FrameKind::Iq => 4,
            FrameKind::Panadapter | FrameKind::Waterfall => 2,
            FrameKind::Opus | FrameKind::Unknown(_) => 1,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Meter => f.write_str("meter"),
            FrameKind::Audio => f.write_str("audio"),
            FrameKind::Iq => f.write_str("iq"),
            FrameKind::Panadapter => f.write_str("panadapter"),
            FrameKind::Waterfall => f.write_str("waterfall"),
            FrameKind::Opus => f.write_str("opus"),
            FrameKind::Unknown(code) => write!(f, "type {code}"),
        }
    }
}

/// One meter value as sent by the radio, in raw fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterReading {
    pub meter_id: u16,
    pub raw: i16,
}

impl MeterReading {
    pub fn scaled(&self, units: MeterUnits) -> f32 {
        units.scale(self.raw)
    }
}

/// Unit tag from a meter definition; decides the fixed-point scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterUnits {
    Volts,
    Amps,
    Swr,
    Dbm,
    Dbfs,
    Db,
    DegreesC,
    Raw,
}

impl MeterUnits {
    /// Parses the unit names the radio uses in `meter list` replies.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "volts" | "v" => MeterUnits::Volts,
            "amps" | "a" => MeterUnits::Amps,
            "swr" => MeterUnits::Swr,
            "dbm" => MeterUnits::Dbm,
            "dbfs" => MeterUnits::Dbfs,
            "db" => MeterUnits::Db,
            "degc" => MeterUnits::DegreesC,
            _ => MeterUnits::Raw,
        }
    }

    pub fn scale(self, raw: i16) -> f32 {
        let divisor = match self {
            MeterUnits::Volts | MeterUnits::Amps => 1024.0,
            MeterUnits::Swr | MeterUnits::Dbm | MeterUnits::Dbfs | MeterUnits::Db => 128.0,
            MeterUnits::DegreesC => 64.0,
            MeterUnits::Raw => 1.0,
        };
        f32::from(raw) / divisor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Meters(Vec<MeterReading>),
    Samples(Vec<f32>),
    Bins(Vec<u16>),
    Opaque(Vec<u8>),
}

impl FramePayload {
    /// Number of decoded elements (readings, samples, bins or bytes).
    pub fn len(&self) -> usize {
        match self {
            FramePayload::Meters(m) => m.len(),
            FramePayload::Samples(s) => s.len(),
            FramePayload::Bins(b) => b.len(),
            FramePayload::Opaque(o) => o.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub stream_id: u16,
    pub kind: FrameKind,
    pub sequence: u32,
    pub payload: FramePayload,
}

/// Malformed datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("datagram of {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },
    #[error("stream {stream_id}: header declares {declared} payload bytes, {available} present")]
    ShortPayload {
        stream_id: u16,
        declared: usize,
        available: usize,
    },
    #[error("stream {stream_id}: {kind} payload of {len} bytes is not a multiple of {unit}")]
    Misaligned {
        stream_id: u16,
        kind: FrameKind,
        len: usize,
        unit: usize,
    },
    #[error("payload of {0} bytes does not fit a datagram")]
    Oversized(usize),
}

pub fn decode_datagram(bytes: &[u8]) -> Result<StreamFrame, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated { len: bytes.len() });
    }
    let stream_id = u16::from_be_bytes([bytes[0], bytes[1]]);
    let kind = FrameKind::from_code(bytes[2]);
    let sequence = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
    let declared = usize::from(u16::from_be_bytes([bytes[7], bytes[8]]));

    let body = &bytes[HEADER_LEN..];
    if body.len() < declared {
        return Err(FrameError::ShortPayload {
            stream_id,
            declared,
            available: body.len(),
        });
    }
    let body = &body[..declared];

    let unit = kind.unit();
    if body.len() % unit != 0 {
        return Err(FrameError::Misaligned {
            stream_id,
            kind,
            len: body.len(),
            unit,
        });
    }

    let payload = match kind {
        FrameKind::Meter => FramePayload::Meters(
            body.chunks_exact(4)
                .map(|c| MeterReading {
                    meter_id: u16::from_be_bytes([c[0], c[1]]),
                    raw: i16::from_be_bytes([c[2], c[3]]),
                })
                .collect(),
        ),
        FrameKind::Audio | FrameKind::Iq => FramePayload::Samples(
            body.chunks_exact(4)
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        FrameKind::Panadapter | FrameKind::Waterfall => FramePayload::Bins(
            body.chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ),
        FrameKind::Opus | FrameKind::Unknown(_) => FramePayload::Opaque(body.to_vec()),
    };

    Ok(StreamFrame {
        stream_id,
        kind,
        sequence,
        payload,
    })
}

/// Builds a datagram from raw payload bytes.
pub fn encode_datagram(
    stream_id: u16,
    kind: FrameKind,
    sequence: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::Oversized(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.push(kind.code());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Meter readings laid out as a type 1 payload.
pub fn encode_meters(readings: &[MeterReading]) -> Vec<u8> {
    readings
        .iter()
        .flat_map(|r| {
            let [a, b] = r.meter_id.to_be_bytes();
            let [c, d] = r.raw.to_be_bytes();
            [a, b, c, d]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_meter_frame() {
        let payload = encode_meters(&[
            MeterReading { meter_id: 7, raw: 1000 },
            MeterReading { meter_id: 8, raw: -200 },
        ]);
        let bytes = encode_datagram(0x0700, FrameKind::Meter, 12, &payload).unwrap();
        let frame = decode_datagram(&bytes).unwrap();
        assert_eq!(frame.stream_id, 0x0700);
        assert_eq!(frame.kind, FrameKind::Meter);
        assert_eq!(frame.sequence, 12);
        assert_eq!(
            frame.payload,
            FramePayload::Meters(vec![
                MeterReading { meter_id: 7, raw: 1000 },
                MeterReading { meter_id: 8, raw: -200 },
            ])
        );
    }

    #[test]
    fn short_payload_is_malformed() {
        let mut bytes = encode_datagram(3, FrameKind::Meter, 42, &[0; 8]).unwrap();
        bytes.truncate(HEADER_LEN + 5);
        assert_eq!(
            decode_datagram(&bytes),
            Err(FrameError::ShortPayload {
                stream_id: 3,
                declared: 8,
                available: 5,
            })
        );
    }

    #[test]
    fn truncated_header() {
        assert_eq!(
            decode_datagram(&[0, 1, 2]),
            Err(FrameError::Truncated { len: 3 })
        );
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = encode_datagram(9, FrameKind::Waterfall, 1, &[0, 5, 1, 0]).unwrap();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
        let frame = decode_datagram(&bytes).unwrap();
        assert_eq!(frame.payload, FramePayload::Bins(vec![5, 256]));
    }

    #[test]
    fn misaligned_samples_are_malformed() {
        let bytes = encode_datagram(4, FrameKind::Iq, 1, &[0; 6]).unwrap();
        assert!(matches!(
            decode_datagram(&bytes),
            Err(FrameError::Misaligned { unit: 4, len: 6, .. })
        ));
    }

    #[test]
    fn iq_samples_are_big_endian_floats() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0.5f32.to_be_bytes());
        payload.extend_from_slice(&(-1.25f32).to_be_bytes());
        let bytes = encode_datagram(5, FrameKind::Iq, 2, &payload).unwrap();
        assert_eq!(
            decode_datagram(&bytes).unwrap().payload,
            FramePayload::Samples(vec![0.5, -1.25])
        );
    }

    #[test]
    fn unknown_kinds_stay_opaque() {
        let bytes = encode_datagram(1, FrameKind::from_code(0x42), 0, &[1, 2, 3]).unwrap();
        let frame = decode_datagram(&bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown(0x42));
        assert_eq!(frame.payload, FramePayload::Opaque(vec![1, 2, 3]));
    }

    #[test]
    fn empty_payload_is_valid() {
        let bytes = encode_datagram(1, FrameKind::Meter, 0, &[]).unwrap();
        assert!(decode_datagram(&bytes).unwrap().payload.is_empty());
    }

    #[test]
    fn meter_units_scale_fixed_point() {
        assert_eq!(MeterUnits::parse("Volts").scale(13 * 1024), 13.0);
        assert_eq!(MeterUnits::parse("SWR").scale(192), 1.5);
        assert_eq!(MeterUnits::parse("dBm").scale(-1280), -10.0);
        assert_eq!(MeterUnits::parse("degC").scale(64 * 40), 40.0);
        assert_eq!(MeterUnits::parse("RPM").scale(1200), 1200.0);
    }

    #[test]
    fn oversized_payload_cannot_be_encoded() {
        let big = vec![0u8; usize::from(u16::MAX) + 1];
        assert_eq!(
            encode_datagram(1, FrameKind::Opus, 0, &big),
            Err(FrameError::Oversized(big.len()))
        );
    }
}
