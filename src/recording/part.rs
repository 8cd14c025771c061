use std::time::Duration;

use super::segment::SegmentOutput;
use super::{ticks_to_duration, Sample, Track};
use crate::error::Result;
use crate::fmp4::{self, PartSample, PartTrack};

/// Source of part sequence numbers. Shared by every segment of a recorder so
/// that numbers keep increasing across rotations.
#[derive(Debug, Clone)]
pub struct PartSequence {
    next: u32,
}

impl PartSequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    /// Take the next number. Called exactly once per created part.
    pub fn take(&mut self) -> u32 {
        let n = self.next;
        self.next = self.next.wrapping_add(1);
        n
    }

    pub fn peek(&self) -> u32 {
        self.next
    }
}

impl Default for PartSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded-duration chunk of a segment, flushed as one moof + mdat.
///
/// Samples are buffered in memory until [`close`](Part::close), which writes
/// the fragment to the segment file.
pub struct Part {
    sequence_number: u32,
    start_offset: Duration,
    end_offset: Duration,
    tracks: Vec<PartTrack>,
}

impl Part {
    pub fn new(sequence_number: u32, start_offset: Duration) -> Self {
        Self {
            sequence_number,
            start_offset,
            end_offset: start_offset,
            tracks: Vec::new(),
        }
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Time covered by the part, from its start to the end of the latest sample.
    pub fn duration(&self) -> Duration {
        self.end_offset.saturating_sub(self.start_offset)
    }

    pub fn write(&mut self, track: &Track, sample: Sample, offset: Duration) -> Result<()> {
        let part_track = match self.tracks.iter().position(|t| t.track_id == track.id) {
            Some(i) => &mut self.tracks[i],
            None => {
                self.tracks.push(PartTrack {
                    track_id: track.id,
                    base_time: sample.dts,
                    samples: Vec::new(),
                });
                let last = self.tracks.len() - 1;
                &mut self.tracks[last]
            }
        };

        let end = offset + ticks_to_duration(u64::from(sample.duration), track.clock_rate);
        part_track.samples.push(PartSample {
            duration: sample.duration,
            pts_offset: sample.pts_offset,
            is_non_sync: sample.is_non_sync,
            payload: sample.payload,
        });
        self.end_offset = self.end_offset.max(end);
        Ok(())
    }

    /// Serialize the buffered samples and append them to the segment file,
    /// creating the file first if this is the segment's first part.
    pub fn close(self, output: &mut SegmentOutput) -> Result<()> {
        let buf = fmp4::marshal_part(self.sequence_number, &self.tracks)?;
        let file = output.file()?;
        file.write_all(&buf)?;
        file.flush()?;
        log::debug!(
            "part {} closed: {} bytes, {:?}",
            self.sequence_number,
            buf.len(),
            self.duration()
        );
        Ok(())
    }
}
