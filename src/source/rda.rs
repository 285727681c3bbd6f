//! RDA-style binary wire format
//!
//! Every message starts with a 24-byte little-endian header: a 16-byte GUID,
//! the total message size (header included) and the message type.
//!
//! | type | payload |
//! |------|---------|
//! | 1 (start) | `u32` channels, `f64` sampling interval (µs), `f64` resolution per channel, NUL-terminated channel names |
//! | 4 (data) | `u32` block, `u32` points, `u32` markers, `f32` samples (sample-major), markers |
//! | 3 (stop) | empty |
//!
//! A marker is `u32` size, `u32` position, `u32` points, `i32` channel, then
//! `type\0description\0`.

use crate::error::SourceError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const HEADER_LEN: usize = 24;

pub const MSG_START: u32 = 1;
pub const MSG_STOP: u32 = 3;
pub const MSG_DATA: u32 = 4;

/// Largest message accepted from the wire
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// GUID written into outgoing headers (not checked on input)
pub const GUID: [u8; 16] = [
    0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05, 0x0C, 0x0B, 0x0A, 0x09, 0x00, 0x0F, 0x0E, 0x0D,
];

/// Fixed part of a marker record: size, position, points, channel
const MARKER_FIXED_LEN: usize = 16;

/// A raw message: type plus undecoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RdaFrame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

/// Start message: stream layout
#[derive(Debug, Clone, PartialEq)]
pub struct RdaStart {
    pub sampling_interval_us: f64,
    pub resolutions: Vec<f64>,
    pub channel_names: Vec<String>,
}

impl RdaStart {
    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }

    /// Sampling rate in Hz
    pub fn sample_rate(&self) -> f64 {
        1_000_000.0 / self.sampling_interval_us
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SourceError> {
        let mut cur = Cursor::new(payload);
        let channels = cur.read_u32::<LittleEndian>().map_err(truncated("start"))? as usize;
        let sampling_interval_us = cur.read_f64::<LittleEndian>().map_err(truncated("start"))?;
        if !(sampling_interval_us.is_finite() && sampling_interval_us > 0.0) {
            return Err(SourceError::Malformed(format!(
                "Invalid sampling interval {} us",
                sampling_interval_us
            )));
        }
        if channels == 0 || channels * 8 > payload.len() {
            return Err(SourceError::Malformed(format!(
                "Start message announces {} channels in {} bytes",
                channels,
                payload.len()
            )));
        }
        let mut resolutions = Vec::with_capacity(channels);
        for _ in 0..channels {
            resolutions.push(cur.read_f64::<LittleEndian>().map_err(truncated("start"))?);
        }

        let pos = cur.position() as usize;
        let channel_names: Vec<String> = payload[pos..]
            .split(|&b| b == 0)
            .take(channels)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        if channel_names.len() != channels {
            return Err(SourceError::Malformed(format!(
                "Expected {} channel names, found {}",
                channels,
                channel_names.len()
            )));
        }

        Ok(Self {
            sampling_interval_us,
            resolutions,
            channel_names,
        })
    }

    /// Full message including header
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let _ = payload.write_u32::<LittleEndian>(self.channel_names.len() as u32);
        let _ = payload.write_f64::<LittleEndian>(self.sampling_interval_us);
        for &r in &self.resolutions {
            let _ = payload.write_f64::<LittleEndian>(r);
        }
        for name in &self.channel_names {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
        encode_message(MSG_START, &payload)
    }
}

/// Marker carried inside a data message
#[derive(Debug, Clone, PartialEq)]
pub struct RdaMarker {
    /// Sample offset relative to the start of the block
    pub position: u32,
    pub points: u32,
    pub channel: i32,
    pub kind: String,
    pub description: String,
}

/// Data message
#[derive(Debug, Clone, PartialEq)]
pub struct RdaData {
    pub block: u32,
    pub points: u32,
    /// Raw values, sample-major: `samples[point * channels + channel]`
    pub samples: Vec<f32>,
    pub markers: Vec<RdaMarker>,
}

impl RdaData {
    pub fn decode(payload: &[u8], channels: usize) -> Result<Self, SourceError> {
        let mut cur = Cursor::new(payload);
        let block = cur.read_u32::<LittleEndian>().map_err(truncated("data"))?;
        let points = cur.read_u32::<LittleEndian>().map_err(truncated("data"))?;
        let marker_count = cur.read_u32::<LittleEndian>().map_err(truncated("data"))?;

        let values = points as usize * channels;
        if 12 + values * 4 > payload.len() {
            return Err(SourceError::Malformed(format!(
                "Data block {} announces {} points x {} channels in {} bytes",
                block,
                points,
                channels,
                payload.len()
            )));
        }
        let mut samples = Vec::with_capacity(values);
        for _ in 0..values {
            samples.push(cur.read_f32::<LittleEndian>().map_err(truncated("data"))?);
        }

        let mut markers = Vec::with_capacity(marker_count.min(1024) as usize);
        for _ in 0..marker_count {
            let start = cur.position() as usize;
            let size = cur.read_u32::<LittleEndian>().map_err(truncated("marker"))? as usize;
            if size < MARKER_FIXED_LEN || start + size > payload.len() {
                return Err(SourceError::Malformed(format!(
                    "Marker record of {} bytes at offset {} overruns block {}",
                    size, start, block
                )));
            }
            let position = cur.read_u32::<LittleEndian>().map_err(truncated("marker"))?;
            let marker_points = cur.read_u32::<LittleEndian>().map_err(truncated("marker"))?;
            let channel = cur.read_i32::<LittleEndian>().map_err(truncated("marker"))?;

            let mut text = vec![0u8; size - MARKER_FIXED_LEN];
            cur.read_exact(&mut text).map_err(truncated("marker"))?;
            let mut parts = text.split(|&b| b == 0);
            let kind = parts
                .next()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_default();
            let description = parts
                .next()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .unwrap_or_default();

            markers.push(RdaMarker {
                position,
                points: marker_points,
                channel,
                kind,
                description,
            });
        }

        Ok(Self {
            block,
            points,
            samples,
            markers,
        })
    }

    /// Full message including header
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(12 + self.samples.len() * 4);
        let _ = payload.write_u32::<LittleEndian>(self.block);
        let _ = payload.write_u32::<LittleEndian>(self.points);
        let _ = payload.write_u32::<LittleEndian>(self.markers.len() as u32);
        for &v in &self.samples {
            let _ = payload.write_f32::<LittleEndian>(v);
        }
        for m in &self.markers {
            let text_len = m.kind.len() + m.description.len() + 2;
            let _ = payload.write_u32::<LittleEndian>((MARKER_FIXED_LEN + text_len) as u32);
            let _ = payload.write_u32::<LittleEndian>(m.position);
            let _ = payload.write_u32::<LittleEndian>(m.points);
            let _ = payload.write_i32::<LittleEndian>(m.channel);
            payload.extend_from_slice(m.kind.as_bytes());
            payload.push(0);
            payload.extend_from_slice(m.description.as_bytes());
            payload.push(0);
        }
        encode_message(MSG_DATA, &payload)
    }
}

/// Stop message including header
pub fn encode_stop() -> Vec<u8> {
    encode_message(MSG_STOP, &[])
}

fn encode_message(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&GUID);
    let _ = out.write_u32::<LittleEndian>((HEADER_LEN + payload.len()) as u32);
    let _ = out.write_u32::<LittleEndian>(msg_type);
    out.extend_from_slice(payload);
    out
}

/// Try to cut one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumed bytes are removed
/// from `buf`.
pub fn take_frame(buf: &mut Vec<u8>) -> Result<Option<RdaFrame>, SourceError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut cur = Cursor::new(&buf[16..HEADER_LEN]);
    let size = cur.read_u32::<LittleEndian>().map_err(truncated("header"))? as usize;
    let msg_type = cur.read_u32::<LittleEndian>().map_err(truncated("header"))?;
    if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&size) {
        return Err(SourceError::Malformed(format!(
            "Message size {} out of range",
            size
        )));
    }
    if buf.len() < size {
        return Ok(None);
    }
    let payload = buf[HEADER_LEN..size].to_vec();
    buf.drain(..size);
    Ok(Some(RdaFrame { msg_type, payload }))
}

fn truncated(what: &'static str) -> impl Fn(std::io::Error) -> SourceError {
    move |e| SourceError::Malformed(format!("Truncated {} message: {}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> RdaStart {
        RdaStart {
            sampling_interval_us: 2000.0,
            resolutions: vec![0.1, 0.5],
            channel_names: vec!["C3".into(), "C4".into()],
        }
    }

    #[test]
    fn test_start_message() {
        let mut wire = start().encode();
        assert_eq!(wire.len(), HEADER_LEN + 4 + 8 + 16 + 6);
        let frame = take_frame(&mut wire).unwrap().unwrap();
        assert_eq!(frame.msg_type, MSG_START);
        assert!(wire.is_empty());

        let decoded = RdaStart::decode(&frame.payload).unwrap();
        assert_eq!(decoded, start());
        assert_eq!(decoded.sample_rate(), 500.0);
    }

    #[test]
    fn test_data_message_with_markers() {
        let data = RdaData {
            block: 7,
            points: 3,
            samples: vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0],
            markers: vec![RdaMarker {
                position: 2,
                points: 1,
                channel: -1,
                kind: "Stimulus".into(),
                description: "S  1".into(),
            }],
        };
        let mut wire = data.encode();
        let frame = take_frame(&mut wire).unwrap().unwrap();
        assert_eq!(frame.msg_type, MSG_DATA);
        assert_eq!(RdaData::decode(&frame.payload, 2).unwrap(), data);
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let full = [start().encode(), encode_stop()].concat();
        let mut buf = full[..10].to_vec();
        assert_eq!(take_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[10..30]);
        assert_eq!(take_frame(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[30..]);
        assert_eq!(take_frame(&mut buf).unwrap().unwrap().msg_type, MSG_START);
        assert_eq!(take_frame(&mut buf).unwrap().unwrap().msg_type, MSG_STOP);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let mut bad = encode_stop();
        bad[16] = 3; // size 3 < header
        assert!(take_frame(&mut bad).is_err());

        let data = RdaData {
            block: 0,
            points: 10,
            samples: vec![0.0; 4],
            markers: Vec::new(),
        };
        let mut wire = data.encode();
        let frame = take_frame(&mut wire).unwrap().unwrap();
        assert!(matches!(
            RdaData::decode(&frame.payload, 2),
            Err(SourceError::Malformed(_))
        ));
    }
}
