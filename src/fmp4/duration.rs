//! In-place patching of the movie header duration.
//!
//! Segments are written with a zero duration in their mvhd because the
//! length is unknown until the last part is flushed. On finalization the
//! duration is written back into the header so players can seek without
//! scanning every fragment. Only the duration field changes; the file keeps
//! its size and layout.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use super::{FTYP, MOOV, MVHD};
use crate::error::{RecordError, Result};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Upper bound on the mvhd size we are willing to load.
const MAX_MVHD_SIZE: u32 = 4096;

/// Movie header as found on disk, kept as raw bytes with the duration
/// field located by version.
struct Mvhd {
    /// Entire box, header included.
    raw: Vec<u8>,
    version: u8,
}

impl Mvhd {
    // offsets from the start of the box
    const V0_TIMESCALE: usize = 20;
    const V0_DURATION: usize = 24;
    const V1_TIMESCALE: usize = 28;
    const V1_DURATION: usize = 32;

    fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let (size, tag) = read_box_header(r)?;
        if tag != MVHD || !(12..=MAX_MVHD_SIZE).contains(&size) {
            return Err(RecordError::BoxNotFound { expected: "mvhd" });
        }

        let mut raw = vec![0u8; size as usize];
        raw[..4].copy_from_slice(&size.to_be_bytes());
        raw[4..8].copy_from_slice(&tag);
        r.read_exact(&mut raw[8..])?;

        let version = raw[8];
        let needed = match version {
            0 => Self::V0_DURATION + 4,
            1 => Self::V1_DURATION + 8,
            v => return Err(RecordError::UnsupportedHeaderVersion(v)),
        };
        if raw.len() < needed {
            return Err(RecordError::BoxNotFound { expected: "mvhd" });
        }

        Ok(Self { raw, version })
    }

    fn timescale(&self) -> u32 {
        let at = if self.version == 0 { Self::V0_TIMESCALE } else { Self::V1_TIMESCALE };
        u32::from_be_bytes([self.raw[at], self.raw[at + 1], self.raw[at + 2], self.raw[at + 3]])
    }

    fn duration_ticks(&self) -> u64 {
        if self.version == 0 {
            let at = Self::V0_DURATION;
            u64::from(u32::from_be_bytes([
                self.raw[at],
                self.raw[at + 1],
                self.raw[at + 2],
                self.raw[at + 3],
            ]))
        } else {
            let mut b = [0u8; 8];
            b.copy_from_slice(&self.raw[Self::V1_DURATION..Self::V1_DURATION + 8]);
            u64::from_be_bytes(b)
        }
    }

    fn set_duration(&mut self, d: Duration) {
        let ticks = d.as_nanos() * u128::from(self.timescale()) / NANOS_PER_SECOND;
        if self.version == 0 {
            let v = u32::try_from(ticks).unwrap_or(u32::MAX);
            self.raw[Self::V0_DURATION..Self::V0_DURATION + 4].copy_from_slice(&v.to_be_bytes());
        } else {
            let v = u64::try_from(ticks).unwrap_or(u64::MAX);
            self.raw[Self::V1_DURATION..Self::V1_DURATION + 8].copy_from_slice(&v.to_be_bytes());
        }
    }
}

fn read_box_header<R: Read + ?Sized>(r: &mut R) -> Result<(u32, [u8; 4])> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok((size, [buf[4], buf[5], buf[6], buf[7]]))
}

/// Position `f` at the start of the moov payload and return that offset.
fn seek_moov_payload<F: Read + Seek + ?Sized>(f: &mut F) -> Result<u64> {
    f.seek(SeekFrom::Start(0))?;

    // check and skip ftyp header and content
    let (ftyp_size, tag) = read_box_header(f)?;
    if tag != FTYP || ftyp_size < 8 {
        return Err(RecordError::BoxNotFound { expected: "ftyp" });
    }
    f.seek(SeekFrom::Current(i64::from(ftyp_size) - 8))?;

    // check and skip moov header
    let (_, tag) = read_box_header(f)?;
    if tag != MOOV {
        return Err(RecordError::BoxNotFound { expected: "moov" });
    }

    Ok(f.stream_position()?)
}

/// Write `d` into the mvhd of a finished segment file.
///
/// The value is stored in the timescale the header already declares. A
/// version 0 header that cannot hold the value saturates at `u32::MAX`.
pub fn write_duration<F: Read + Write + Seek + ?Sized>(f: &mut F, d: Duration) -> Result<()> {
    let moov_pos = seek_moov_payload(f)?;

    let mut mvhd = Mvhd::read(f)?;
    mvhd.set_duration(d);

    f.seek(SeekFrom::Start(moov_pos))?;
    f.write_all(&mvhd.raw)?;
    Ok(())
}

/// Read the duration declared by the mvhd of a segment file.
pub fn read_duration<F: Read + Seek + ?Sized>(f: &mut F) -> Result<Duration> {
    seek_moov_payload(f)?;
    let mvhd = Mvhd::read(f)?;

    let timescale = mvhd.timescale();
    if timescale == 0 {
        return Ok(Duration::ZERO);
    }
    let nanos = u128::from(mvhd.duration_ticks()) * NANOS_PER_SECOND / u128::from(timescale);
    Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
}
