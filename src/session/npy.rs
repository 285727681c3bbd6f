//! NumPy `.npy` raw sample store
//!
//! Samples are stored as a `(channels, samples)` float64 array in Fortran
//! order, so each incoming sample row is a contiguous append. The header is
//! padded to a fixed 128 bytes and rewritten with the final shape when the
//! writer is finalized.

use crate::error::{ErdError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_LEN: usize = 128;
/// Magic, version and the u16 header length
const PREAMBLE_LEN: usize = 10;

fn header(channels: usize, samples: u64) -> Result<Vec<u8>> {
    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': True, 'shape': ({}, {}), }}",
        channels, samples
    );
    let body_len = HEADER_LEN - PREAMBLE_LEN;
    if dict.len() + 1 > body_len {
        return Err(ErdError::Persistence(format!(
            "npy header too long for shape ({}, {})",
            channels, samples
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.write_u16::<LittleEndian>(body_len as u16)?;
    out.extend_from_slice(dict.as_bytes());
    out.resize(HEADER_LEN - 1, b' ');
    out.push(b'\n');
    Ok(out)
}

/// Appends sample rows to a `.npy` file.
pub struct NpyWriter {
    file: BufWriter<File>,
    channels: usize,
    samples: u64,
}

impl NpyWriter {
    /// Create the file with a zero-length header.
    pub fn create(path: impl AsRef<Path>, channels: usize) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(&header(channels, 0)?)?;
        Ok(Self {
            file,
            channels,
            samples: 0,
        })
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Append channel-major data as interleaved rows.
    pub fn append(&mut self, data: &[Vec<f64>]) -> Result<()> {
        if data.len() != self.channels {
            return Err(ErdError::Persistence(format!(
                "expected {} channels, got {}",
                self.channels,
                data.len()
            )));
        }
        let points = data.first().map(Vec::len).unwrap_or(0);
        for i in 0..points {
            for channel in data {
                let v = channel.get(i).copied().unwrap_or(f64::NAN);
                self.file.write_f64::<LittleEndian>(v)?;
            }
        }
        self.samples += points as u64;
        Ok(())
    }

    /// Rewrite the header with the final shape and flush.
    pub fn finalize(mut self) -> Result<u64> {
        self.file.flush()?;
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| ErdError::Persistence(e.to_string()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(self.channels, self.samples)?)?;
        file.sync_all()?;
        Ok(self.samples)
    }
}

/// Pull `'key': value` out of the header dict.
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = dict.find(&pattern)? + pattern.len();
    let rest = dict[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')')? + 1
    } else {
        rest.find(',')?
    };
    Some(rest[..end].trim())
}

/// Read a 2-D float64 store back as `data[channel][sample]`.
pub fn read_npy(path: impl AsRef<Path>) -> Result<Vec<Vec<f64>>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ErdError::Persistence(format!("{} is not a .npy file", path.display())));
    }
    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        v => return Err(ErdError::Persistence(format!("unsupported .npy version {}", v))),
    };
    let mut dict = vec![0u8; header_len];
    reader.read_exact(&mut dict)?;
    let dict = String::from_utf8_lossy(&dict);

    let malformed = |what: &str| ErdError::Persistence(format!("{}: bad {} in header", path.display(), what));
    let descr = dict_value(&dict, "descr").ok_or_else(|| malformed("descr"))?;
    if descr.trim_matches('\'') != "<f8" {
        return Err(ErdError::Persistence(format!("unsupported dtype {}", descr)));
    }
    let fortran = dict_value(&dict, "fortran_order").ok_or_else(|| malformed("fortran_order"))? == "True";
    let shape: Vec<usize> = dict_value(&dict, "shape")
        .ok_or_else(|| malformed("shape"))?
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| malformed("shape")))
        .collect::<Result<_>>()?;
    let (channels, samples) = match shape.as_slice() {
        [c, n] => (*c, *n),
        _ => return Err(malformed("shape")),
    };

    let mut data = vec![vec![0.0; samples]; channels];
    if fortran {
        for i in 0..samples {
            for channel in data.iter_mut() {
                channel[i] = reader.read_f64::<LittleEndian>()?;
            }
        }
    } else {
        for channel in data.iter_mut() {
            reader.read_f64_into::<LittleEndian>(channel)?;
        }
    }
    Ok(data)
}
