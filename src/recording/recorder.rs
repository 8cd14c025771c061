use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::part::PartSequence;
use super::segment::Segment;
use super::{duration_to_ticks, ticks_to_duration, RecordConfig, Sample, Track, Unit};
use crate::clock::{Clock, ClockEstimator};
use crate::error::{RecordError, Result};
use crate::storage::Storage;

pub use super::segment::CompletedSegment;

type CompletionHandler = Box<dyn FnMut(&CompletedSegment) + Send>;

/// A unit waiting for its successor, which determines its duration.
struct PendingUnit {
    /// Position on the recorder timeline, in track ticks.
    dts: u64,
    pts_offset: i32,
    is_sync: bool,
    payload: Vec<u8>,
    ntp: DateTime<Utc>,
}

/// Last accepted tick of a track and where it sits on the recorder timeline.
#[derive(Clone, Copy)]
struct TickPosition {
    raw: i64,
    timeline: u64,
}

enum Advance {
    First,
    By(u64),
    Discontinuity,
}

struct TrackState {
    estimator: ClockEstimator,
    last: Option<TickPosition>,
    pending: Option<PendingUnit>,
}

impl TrackState {
    /// Classify the step from the last accepted tick. Small backward steps are
    /// rejected; larger jumps back (counter wrap, stream restart) re-anchor.
    fn advance(&self, track: &Track, dts: i64) -> Result<Advance> {
        let Some(last) = self.last else {
            return Ok(Advance::First);
        };
        match dts.checked_sub(last.raw) {
            Some(step) if step >= 0 => Ok(Advance::By(step as u64)),
            Some(step) if step.unsigned_abs() < u64::from(track.clock_rate) => {
                Err(RecordError::NonMonotonicDts(track.id))
            }
            _ => Ok(Advance::Discontinuity),
        }
    }
}

pub struct Recorder {
    config: RecordConfig,
    storage: Arc<dyn Storage>,
    tracks: Arc<[Track]>,
    states: Vec<TrackState>,
    has_video: bool,
    sequence: PartSequence,
    /// Wall-clock time of the first unit, origin of every track's timeline.
    start_ntp: Option<DateTime<Utc>>,
    segment: Option<Segment>,
    on_complete: CompletionHandler,
}

impl Recorder {
    pub fn new(
        config: RecordConfig,
        tracks: Vec<Track>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if tracks.is_empty() {
            return Err(RecordError::InvalidConfig("no tracks to record".into()));
        }

        let mut states = Vec::with_capacity(tracks.len());
        for (i, track) in tracks.iter().enumerate() {
            if track.id == 0 || tracks[..i].iter().any(|t| t.id == track.id) {
                return Err(RecordError::InvalidConfig(format!("invalid track id {}", track.id)));
            }
            let rate = NonZeroU32::new(track.clock_rate).ok_or_else(|| {
                RecordError::InvalidConfig(format!("track {} has a zero clock rate", track.id))
            })?;
            states.push(TrackState {
                estimator: ClockEstimator::with_max_drift(rate, clock.clone(), config.max_clock_drift()),
                last: None,
                pending: None,
            });
        }

        let has_video = tracks.iter().any(Track::is_video);
        log::info!(
            "recorder ready: {} track(s), part {:?}, segment {:?}",
            tracks.len(),
            config.part_duration(),
            config.segment_duration()
        );

        Ok(Self {
            config,
            storage,
            tracks: Arc::from(tracks),
            states,
            has_video,
            sequence: PartSequence::new(),
            start_ntp: None,
            segment: None,
            on_complete: Box::new(|_| {}),
        })
    }

    /// Called once for every segment that was finalized successfully.
    pub fn on_segment_complete(mut self, handler: impl FnMut(&CompletedSegment) + Send + 'static) -> Self {
        self.on_complete = Box::new(handler);
        self
    }

    pub fn config(&self) -> &RecordConfig {
        &self.config
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Turn the per-frame timestamp log on or off. Takes effect with the next
    /// video sample; an existing log is kept but no longer appended to.
    pub fn set_record_timestamp_log(&mut self, enabled: bool) {
        self.config.record_timestamp_log = enabled;
    }

    /// Path of the segment being written, if any.
    pub fn current_segment(&self) -> Option<&Path> {
        self.segment.as_ref().map(Segment::path)
    }

    pub fn write(&mut self, track_id: u32, unit: Unit) -> Result<()> {
        let index = self
            .tracks
            .iter()
            .position(|t| t.id == track_id)
            .ok_or(RecordError::UnknownTrack(track_id))?;
        let track = &self.tracks[index];
        let clock_rate = track.clock_rate;
        let state = &mut self.states[index];

        let advance = state.advance(track, unit.dts)?;
        let ntp = state.estimator.estimate(unit.dts);
        let start_ntp = *self.start_ntp.get_or_insert(ntp);
        let since_start = (ntp - start_ntp).to_std().unwrap_or(Duration::ZERO);

        let dts = match (advance, state.last) {
            (Advance::By(step), Some(last)) => last.timeline.saturating_add(step),
            (Advance::Discontinuity, Some(last)) => {
                let dts = duration_to_ticks(since_start, clock_rate).max(last.timeline.saturating_add(1));
                log::warn!("track {track_id}: tick discontinuity at {}, continuing at {dts}", unit.dts);
                dts
            }
            _ => duration_to_ticks(since_start, clock_rate),
        };
        state.last = Some(TickPosition { raw: unit.dts, timeline: dts });

        let next = PendingUnit {
            dts,
            pts_offset: unit.pts_offset,
            is_sync: unit.is_sync,
            payload: unit.payload,
            ntp,
        };
        let next_is_sync = next.is_sync;
        let Some(prev) = state.pending.replace(next) else {
            return Ok(());
        };

        let offset = ticks_to_duration(prev.dts, clock_rate);
        let next_offset = ticks_to_duration(dts, clock_rate);
        let sample = Sample {
            dts: prev.dts,
            duration: u32::try_from(dts.saturating_sub(prev.dts)).unwrap_or(u32::MAX),
            pts_offset: prev.pts_offset,
            is_non_sync: !prev.is_sync,
            payload: prev.payload,
            ntp: prev.ntp,
        };

        let segment = self.segment.get_or_insert_with(|| {
            Segment::new(&self.config, self.storage.clone(), self.tracks.clone(), offset, prev.ntp)
        });
        if let Err(e) = segment.write(&mut self.sequence, &self.config, track, sample, offset) {
            log::error!("track {track_id}: sample at {offset:?} dropped: {e}");
            return Err(e);
        }

        if (!self.has_video || track.is_video())
            && next_is_sync
            && next_offset.saturating_sub(segment.start_offset()) >= self.config.segment_duration()
        {
            segment.extend_to(next_offset);
            if let Some(segment) = self.segment.take() {
                segment.close(&mut *self.on_complete)?;
            }
        }

        Ok(())
    }

    /// Close the current segment. Units still waiting for a successor are dropped.
    pub fn close(&mut self) -> Result<()> {
        for state in &mut self.states {
            state.pending = None;
        }
        match self.segment.take() {
            Some(segment) => segment.close(&mut *self.on_complete),
            None => Ok(()),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.segment.is_some() {
            if let Err(e) = self.close() {
                log::error!("closing segment on drop failed: {e}");
            }
        }
    }
}
