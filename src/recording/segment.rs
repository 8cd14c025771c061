use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::part::{Part, PartSequence};
use super::{timestamp_log_path, RecordConfig, Sample, Track};
use crate::error::{RecordError, Result};
use crate::fmp4::{self, duration::write_duration};
use crate::storage::{Storage, StorageFile};

/// Line format of the timestamp log.
const TIMESTAMP_LOG_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ,\n";

/// A finalized segment, reported once its header carries the final duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSegment {
    pub path: PathBuf,
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

/// The segment file, created when the first part is flushed.
pub struct SegmentOutput {
    path: PathBuf,
    storage: Arc<dyn Storage>,
    tracks: Arc<[Track]>,
    file: Option<Box<dyn StorageFile>>,
}

impl SegmentOutput {
    /// The open segment file. Creates it and writes the init segment on first use.
    pub fn file(&mut self) -> Result<&mut dyn StorageFile> {
        let file = match self.file.take() {
            Some(file) => file,
            None => self.create()?,
        };
        Ok(&mut **self.file.insert(file))
    }

    fn create(&self) -> Result<Box<dyn StorageFile>> {
        log::info!("creating segment {}", self.path.display());

        let init = fmp4::marshal_init(&self.tracks)?;
        let mut file = self.storage.create(&self.path)?;
        if let Err(e) = file.write_all(&init) {
            let _ = file.close();
            return Err(e.into());
        }
        Ok(file)
    }
}

/// One recorded file: a sequence of parts plus an optional timestamp log.
///
/// Calls to [`write`](Segment::write) and [`close`](Segment::close) must be
/// serialized by the caller.
pub struct Segment {
    start_offset: Duration,
    start_ntp: DateTime<Utc>,
    last_offset: Duration,
    part: Option<Part>,
    output: SegmentOutput,
    timestamp_log: Option<Box<dyn StorageFile>>,
    timestamp_log_failed: bool,
}

impl Segment {
    pub fn new(
        config: &RecordConfig,
        storage: Arc<dyn Storage>,
        tracks: Arc<[Track]>,
        start_offset: Duration,
        start_ntp: DateTime<Utc>,
    ) -> Self {
        Self {
            start_offset,
            start_ntp,
            last_offset: start_offset,
            part: None,
            output: SegmentOutput {
                path: config.segment_path(start_ntp),
                storage,
                tracks,
                file: None,
            },
            timestamp_log: None,
            timestamp_log_failed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.output.path
    }

    pub fn start_offset(&self) -> Duration {
        self.start_offset
    }

    pub fn start_ntp(&self) -> DateTime<Utc> {
        self.start_ntp
    }

    pub fn last_offset(&self) -> Duration {
        self.last_offset
    }

    /// Sequence number of the open part, if any.
    pub fn current_part(&self) -> Option<u32> {
        self.part.as_ref().map(Part::sequence_number)
    }

    pub fn has_timestamp_log(&self) -> bool {
        self.timestamp_log.is_some()
    }

    /// Extend the segment's end to `offset` without writing a sample.
    /// Used when the segment is closed at the timestamp of the next sample.
    pub fn extend_to(&mut self, offset: Duration) {
        self.last_offset = offset;
    }

    pub fn write(
        &mut self,
        sequence: &mut PartSequence,
        config: &RecordConfig,
        track: &Track,
        sample: Sample,
        offset: Duration,
    ) -> Result<()> {
        // counted even if the sample ends up not being stored
        self.last_offset = offset;

        let part = match self.part.take() {
            None => Part::new(sequence.take(), offset),
            Some(part) if part.duration() >= config.part_duration() => {
                part.close(&mut self.output)?;
                let next = Part::new(sequence.take(), offset);
                log::debug!(
                    "segment {}: part {} opened",
                    self.output.path.display(),
                    next.sequence_number()
                );
                next
            }
            Some(part) => part,
        };
        self.part = Some(part);

        if track.is_video() && config.record_timestamp_log {
            self.log_timestamp(sample.ntp);
        }

        if !track.is_video() && !config.record_audio {
            return Ok(());
        }

        match &mut self.part {
            Some(part) => part.write(track, sample, offset),
            None => Ok(()),
        }
    }

    fn log_timestamp(&mut self, ntp: DateTime<Utc>) {
        if self.timestamp_log.is_none() && !self.timestamp_log_failed {
            let path = timestamp_log_path(&self.output.path);
            match self.output.storage.create(&path) {
                Ok(file) => self.timestamp_log = Some(file),
                Err(e) => {
                    log::warn!("unable to create timestamp log {}: {e}", path.display());
                    self.timestamp_log_failed = true;
                }
            }
        }

        if let Some(file) = &mut self.timestamp_log {
            let line = ntp.format(TIMESTAMP_LOG_FORMAT).to_string();
            if let Err(e) = file.write_all(line.as_bytes()) {
                log::debug!("timestamp log write failed: {e}");
            }
        }
    }

    /// Flush the open part, write the final duration into the header and
    /// release every file. All steps run even if an earlier one fails; the
    /// first error is returned. `on_complete` is called only when the header
    /// was patched and the file closed cleanly.
    pub fn close(mut self, on_complete: &mut dyn FnMut(&CompletedSegment)) -> Result<()> {
        let mut first_err: Option<RecordError> = None;

        if let Some(part) = self.part.take() {
            if let Err(e) = part.close(&mut self.output) {
                first_err.get_or_insert(e);
            }
        }

        if let Some(mut file) = self.output.file.take() {
            log::debug!("closing segment {}", self.output.path.display());

            let duration = self.last_offset.saturating_sub(self.start_offset);
            let patched = write_duration(&mut *file, duration);
            if let Err(e) = &patched {
                log::warn!("unable to write duration of {}: {e}", self.output.path.display());
            }
            let closed = file.close().map_err(RecordError::from);

            match (patched, closed) {
                (Ok(()), Ok(())) => {
                    let completed = CompletedSegment {
                        path: self.output.path.clone(),
                        start: self.start_ntp,
                        duration,
                    };
                    log::info!(
                        "segment {} complete: {:?}",
                        completed.path.display(),
                        completed.duration
                    );
                    on_complete(&completed);
                }
                (patched, closed) => {
                    for e in [patched.err(), closed.err()].into_iter().flatten() {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        if let Some(mut file) = self.timestamp_log.take() {
            let _ = file.close();
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
