//! Fragmented MP4 serialization for recorded segments.
//!
//! A segment file is laid out as:
//! - Init segment: ftyp + moov (one trak per track, mvex for fragmented playback)
//! - One moof + mdat pair per part
//!
//! The moov carries an mvhd whose duration is zero until the segment is
//! finalized, see [`duration::write_duration`].

pub mod duration;

use std::io::{self, Cursor, Seek, SeekFrom, Write};

use crate::recording::{Track, TrackKind};

/// Timescale of the movie header. Durations patched into the mvhd are
/// expressed in this unit.
pub const MOVIE_TIMESCALE: u32 = 1000;

pub(crate) const FTYP: [u8; 4] = *b"ftyp";
pub(crate) const MOOV: [u8; 4] = *b"moov";
pub(crate) const MVHD: [u8; 4] = *b"mvhd";

const BOX_HEADER_SIZE: u32 = 8;
const FULL_BOX_HEADER_SIZE: u32 = 12;

/// trun flags: data-offset | sample-duration | sample-size | sample-flags | sample-cto
const TRUN_FLAGS: u32 = 0x000F01;
const TRUN_ENTRY_SIZE: u32 = 16;

/// Random access point.
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// Depends on other samples, not a sync sample.
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

const UNITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

/// One sample as stored inside a fragment.
#[derive(Debug, Clone)]
pub struct PartSample {
    /// Duration in track clock ticks.
    pub duration: u32,
    /// Presentation minus decode time, in track clock ticks.
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Vec<u8>,
}

/// Samples of one track inside a fragment.
#[derive(Debug, Clone)]
pub struct PartTrack {
    pub track_id: u32,
    /// Decode time of the first sample, in track clock ticks.
    pub base_time: u64,
    pub samples: Vec<PartSample>,
}

impl PartTrack {
    fn payload_size(&self) -> u64 {
        self.samples.iter().map(|s| s.payload.len() as u64).sum()
    }

    fn traf_size(&self) -> u32 {
        let trun_size = FULL_BOX_HEADER_SIZE + 4 + 4 + self.samples.len() as u32 * TRUN_ENTRY_SIZE;
        let tfdt_size = FULL_BOX_HEADER_SIZE + 8;
        let tfhd_size = FULL_BOX_HEADER_SIZE + 4;
        BOX_HEADER_SIZE + tfhd_size + tfdt_size + trun_size
    }
}

// ---------------------------------------------------------------------------
// Box writing helpers
// ---------------------------------------------------------------------------

fn write_box_header<W: Write>(w: &mut W, box_type: &[u8; 4], size: u32) -> io::Result<()> {
    w.write_all(&size.to_be_bytes())?;
    w.write_all(box_type)
}

fn write_full_box_header<W: Write>(
    w: &mut W,
    box_type: &[u8; 4],
    size: u32,
    version: u8,
    flags: u32,
) -> io::Result<()> {
    write_box_header(w, box_type, size)?;
    write_u32(w, (u32::from(version) << 24) | (flags & 0x00FF_FFFF))
}

fn write_u16<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_zeros<W: Write>(w: &mut W, count: usize) -> io::Result<()> {
    w.write_all(&vec![0u8; count])
}

fn write_matrix<W: Write>(w: &mut W) -> io::Result<()> {
    for v in UNITY_MATRIX {
        write_u32(w, v)?;
    }
    Ok(())
}

/// Write a box header with a zero size and return where it starts.
fn box_start_placeholder<W: Write + Seek>(w: &mut W, box_type: &[u8; 4]) -> io::Result<u64> {
    let pos = w.stream_position()?;
    write_box_header(w, box_type, 0)?;
    Ok(pos)
}

/// Fill in the size of the box started at `start` now that its content is written.
fn patch_box_size<W: Write + Seek>(w: &mut W, start: u64) -> io::Result<()> {
    let end = w.stream_position()?;
    let size = u32::try_from(end - start)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "box too large"))?;
    w.seek(SeekFrom::Start(start))?;
    write_u32(w, size)?;
    w.seek(SeekFrom::Start(end))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Init segment
// ---------------------------------------------------------------------------

/// Serialize the init segment (ftyp + moov) describing `tracks`.
pub fn marshal_init(tracks: &[Track]) -> io::Result<Vec<u8>> {
    let mut w = Cursor::new(Vec::new());
    write_ftyp(&mut w)?;

    let moov_start = box_start_placeholder(&mut w, &MOOV)?;
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    write_mvhd(&mut w, next_track_id)?;
    for track in tracks {
        write_trak(&mut w, track)?;
    }
    write_mvex(&mut w, tracks)?;
    patch_box_size(&mut w, moov_start)?;

    Ok(w.into_inner())
}

fn write_ftyp<W: Write>(w: &mut W) -> io::Result<()> {
    // major_brand(4) + minor_version(4) + compatible_brands(12)
    write_box_header(w, &FTYP, BOX_HEADER_SIZE + 4 + 4 + 12)?;
    w.write_all(b"iso5")?;
    write_u32(w, 0x200)?;
    w.write_all(b"iso5")?;
    w.write_all(b"iso6")?;
    w.write_all(b"mp41")
}

fn write_mvhd<W: Write>(w: &mut W, next_track_id: u32) -> io::Result<()> {
    write_full_box_header(w, &MVHD, 108, 0, 0)?;
    write_u32(w, 0)?; // creation_time
    write_u32(w, 0)?; // modification_time
    write_u32(w, MOVIE_TIMESCALE)?;
    write_u32(w, 0)?; // duration, patched on finalization
    write_u32(w, 0x00010000)?; // rate 1.0
    write_u16(w, 0x0100)?; // volume 1.0
    write_zeros(w, 10)?;
    write_matrix(w)?;
    write_zeros(w, 24)?; // pre_defined
    write_u32(w, next_track_id)
}

fn write_trak<W: Write + Seek>(w: &mut W, track: &Track) -> io::Result<()> {
    let trak_start = box_start_placeholder(w, b"trak")?;

    // tkhd: track_enabled | track_in_movie
    write_full_box_header(w, b"tkhd", 92, 0, 0x03)?;
    write_u32(w, 0)?; // creation_time
    write_u32(w, 0)?; // modification_time
    write_u32(w, track.id)?;
    write_u32(w, 0)?; // reserved
    write_u32(w, 0)?; // duration
    write_zeros(w, 8)?;
    write_u16(w, 0)?; // layer
    write_u16(w, 0)?; // alternate_group
    write_u16(w, if track.kind == TrackKind::Audio { 0x0100 } else { 0 })?;
    write_u16(w, 0)?;
    write_matrix(w)?;
    write_u32(w, 0)?; // width
    write_u32(w, 0)?; // height

    let mdia_start = box_start_placeholder(w, b"mdia")?;
    write_full_box_header(w, b"mdhd", 32, 0, 0)?;
    write_u32(w, 0)?;
    write_u32(w, 0)?;
    write_u32(w, track.clock_rate)?;
    write_u32(w, 0)?;
    write_u16(w, 0x55C4)?; // language: und
    write_u16(w, 0)?;
    write_hdlr(w, track.kind)?;

    let minf_start = box_start_placeholder(w, b"minf")?;
    match track.kind {
        TrackKind::Video => {
            write_full_box_header(w, b"vmhd", 20, 0, 0x01)?;
            write_zeros(w, 8)?; // graphicsmode + opcolor
        }
        TrackKind::Audio => {
            write_full_box_header(w, b"smhd", 16, 0, 0)?;
            write_zeros(w, 4)?; // balance + reserved
        }
    }
    write_dinf(w)?;
    write_stbl(w, &track.sample_entry)?;
    patch_box_size(w, minf_start)?;

    patch_box_size(w, mdia_start)?;
    patch_box_size(w, trak_start)
}

fn write_hdlr<W: Write>(w: &mut W, kind: TrackKind) -> io::Result<()> {
    let (handler, name): (&[u8; 4], &[u8]) = match kind {
        TrackKind::Video => (b"vide", b"VideoHandler\0"),
        TrackKind::Audio => (b"soun", b"SoundHandler\0"),
    };
    let size = FULL_BOX_HEADER_SIZE + 4 + 4 + 12 + name.len() as u32;
    write_full_box_header(w, b"hdlr", size, 0, 0)?;
    write_u32(w, 0)?; // pre_defined
    w.write_all(handler)?;
    write_zeros(w, 12)?;
    w.write_all(name)
}

fn write_dinf<W: Write>(w: &mut W) -> io::Result<()> {
    let url_size = FULL_BOX_HEADER_SIZE;
    let dref_size = FULL_BOX_HEADER_SIZE + 4 + url_size;
    write_box_header(w, b"dinf", BOX_HEADER_SIZE + dref_size)?;
    write_full_box_header(w, b"dref", dref_size, 0, 0)?;
    write_u32(w, 1)?;
    // self-contained
    write_full_box_header(w, b"url ", url_size, 0, 0x01)
}

fn write_stbl<W: Write + Seek>(w: &mut W, sample_entry: &[u8]) -> io::Result<()> {
    let stbl_start = box_start_placeholder(w, b"stbl")?;

    let stsd_size = u32::try_from(sample_entry.len())
        .ok()
        .and_then(|len| len.checked_add(FULL_BOX_HEADER_SIZE + 4))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "sample entry too large"))?;
    write_full_box_header(w, b"stsd", stsd_size, 0, 0)?;
    write_u32(w, 1)?;
    w.write_all(sample_entry)?;

    // sample tables are empty, samples live in fragments
    write_full_box_header(w, b"stts", 16, 0, 0)?;
    write_u32(w, 0)?;
    write_full_box_header(w, b"stsc", 16, 0, 0)?;
    write_u32(w, 0)?;
    write_full_box_header(w, b"stsz", 20, 0, 0)?;
    write_u32(w, 0)?;
    write_u32(w, 0)?;
    write_full_box_header(w, b"stco", 16, 0, 0)?;
    write_u32(w, 0)?;

    patch_box_size(w, stbl_start)
}

fn write_mvex<W: Write>(w: &mut W, tracks: &[Track]) -> io::Result<()> {
    let trex_size = FULL_BOX_HEADER_SIZE + 20;
    write_box_header(w, b"mvex", BOX_HEADER_SIZE + trex_size * tracks.len() as u32)?;
    for track in tracks {
        write_full_box_header(w, b"trex", trex_size, 0, 0)?;
        write_u32(w, track.id)?;
        write_u32(w, 1)?; // default_sample_description_index
        write_u32(w, 0)?; // default_sample_duration
        write_u32(w, 0)?; // default_sample_size
        write_u32(w, 0)?; // default_sample_flags
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// Serialize one part as a moof + mdat pair. Tracks without samples are left out.
pub fn marshal_part(sequence_number: u32, tracks: &[PartTrack]) -> io::Result<Vec<u8>> {
    let tracks: Vec<&PartTrack> = tracks.iter().filter(|t| !t.samples.is_empty()).collect();

    let mfhd_size = FULL_BOX_HEADER_SIZE + 4;
    let moof_size = BOX_HEADER_SIZE + mfhd_size + tracks.iter().map(|t| t.traf_size()).sum::<u32>();
    let mdat_payload_size: u64 = tracks.iter().map(|t| t.payload_size()).sum();
    let mdat_size = u32::try_from(u64::from(BOX_HEADER_SIZE) + mdat_payload_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "part too large"))?;

    let mut w = Vec::with_capacity(moof_size as usize + mdat_size as usize);

    write_box_header(&mut w, b"moof", moof_size)?;
    write_full_box_header(&mut w, b"mfhd", mfhd_size, 0, 0)?;
    write_u32(&mut w, sequence_number)?;

    // data_offset is relative to the start of the moof
    let mut data_offset = u64::from(moof_size) + u64::from(BOX_HEADER_SIZE);
    for track in &tracks {
        write_box_header(&mut w, b"traf", track.traf_size())?;

        // default-base-is-moof
        write_full_box_header(&mut w, b"tfhd", FULL_BOX_HEADER_SIZE + 4, 0, 0x020000)?;
        write_u32(&mut w, track.track_id)?;

        write_full_box_header(&mut w, b"tfdt", FULL_BOX_HEADER_SIZE + 8, 1, 0)?;
        write_u64(&mut w, track.base_time)?;

        // version 1: signed composition offsets
        let trun_size = FULL_BOX_HEADER_SIZE + 4 + 4 + track.samples.len() as u32 * TRUN_ENTRY_SIZE;
        write_full_box_header(&mut w, b"trun", trun_size, 1, TRUN_FLAGS)?;
        write_u32(&mut w, track.samples.len() as u32)?;
        write_i32(&mut w, data_offset as i32)?;
        for sample in &track.samples {
            write_u32(&mut w, sample.duration)?;
            write_u32(&mut w, sample.payload.len() as u32)?;
            write_u32(
                &mut w,
                if sample.is_non_sync { SAMPLE_FLAGS_NON_SYNC } else { SAMPLE_FLAGS_SYNC },
            )?;
            write_i32(&mut w, sample.pts_offset)?;
        }

        data_offset += track.payload_size();
    }

    write_box_header(&mut w, b"mdat", mdat_size)?;
    for track in &tracks {
        for sample in &track.samples {
            w.write_all(&sample.payload)?;
        }
    }

    Ok(w)
}
