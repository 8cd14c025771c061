pub mod part;
pub mod recorder;
pub mod segment;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::multiply_and_divide;
use crate::error::{RecordError, Result};

pub use recorder::{CompletedSegment, Recorder};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "mp4";
/// Extension of the per-frame timestamp log written next to a segment.
pub const TIMESTAMP_LOG_EXTENSION: &str = "csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// One elementary stream of the recording.
#[derive(Debug, Clone)]
pub struct Track {
    /// Track ID inside the container, starting at 1.
    pub id: u32,
    pub kind: TrackKind,
    /// Ticks per second of the track's timestamps.
    pub clock_rate: u32,
    /// Codec-specific sample entry box (avc1, hvc1, mp4a, Opus, ...),
    /// serialized by the codec layer and copied verbatim into stsd.
    pub sample_entry: Vec<u8>,
}

impl Track {
    pub fn new(id: u32, kind: TrackKind, clock_rate: u32, sample_entry: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            clock_rate,
            sample_entry,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }
}

/// An encoded access unit as delivered by the ingest pipeline.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Decode timestamp in track clock ticks.
    pub dts: i64,
    /// Presentation minus decode timestamp, in track clock ticks.
    pub pts_offset: i32,
    pub is_sync: bool,
    pub payload: Vec<u8>,
}

/// A unit ready to be stored in a part.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Decode timestamp in track clock ticks, relative to the first sample of the track.
    pub dts: u64,
    /// Duration in track clock ticks.
    pub duration: u32,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Vec<u8>,
    /// Estimated wall-clock time of the sample.
    pub ntp: DateTime<Utc>,
}

fn default_path_format() -> String {
    "recordings/%Y-%m-%d_%H-%M-%S-%6f".to_owned()
}

fn default_part_duration_ms() -> u64 {
    1_000
}

fn default_segment_duration_ms() -> u64 {
    3_600_000
}

fn default_true() -> bool {
    true
}

fn default_max_clock_drift_ms() -> u64 {
    1_000
}

/// Recording settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// strftime template of a segment path, without extension, rendered
    /// with the segment's start time.
    #[serde(default = "default_path_format")]
    pub path_format: String,
    #[serde(default = "default_part_duration_ms")]
    pub part_duration_ms: u64,
    #[serde(default = "default_segment_duration_ms")]
    pub segment_duration_ms: u64,
    /// Store non-video tracks in the container.
    #[serde(default = "default_true")]
    pub record_audio: bool,
    /// Write a CSV of video frame timestamps next to each segment.
    #[serde(default)]
    pub record_timestamp_log: bool,
    #[serde(default = "default_max_clock_drift_ms")]
    pub max_clock_drift_ms: u64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            path_format: default_path_format(),
            part_duration_ms: default_part_duration_ms(),
            segment_duration_ms: default_segment_duration_ms(),
            record_audio: true,
            record_timestamp_log: false,
            max_clock_drift_ms: default_max_clock_drift_ms(),
        }
    }
}

impl RecordConfig {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RecordError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_duration_ms == 0 {
            return Err(RecordError::InvalidConfig("part duration must be greater than zero".into()));
        }
        if self.segment_duration_ms == 0 {
            return Err(RecordError::InvalidConfig(
                "segment duration must be greater than zero".into(),
            ));
        }
        if self.path_format.is_empty() {
            return Err(RecordError::InvalidConfig("path format is empty".into()));
        }
        if StrftimeItems::new(&self.path_format).any(|item| matches!(item, Item::Error)) {
            return Err(RecordError::InvalidConfig(format!(
                "invalid path format '{}'",
                self.path_format
            )));
        }
        Ok(())
    }

    pub fn part_duration(&self) -> Duration {
        Duration::from_millis(self.part_duration_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn max_clock_drift(&self) -> Duration {
        Duration::from_millis(self.max_clock_drift_ms)
    }

    /// Path of the segment starting at `start`. `path_format` must have passed [`validate`](Self::validate).
    pub fn segment_path(&self, start: DateTime<Utc>) -> PathBuf {
        let mut path = start.format(&self.path_format).to_string();
        path.push('.');
        path.push_str(SEGMENT_EXTENSION);
        PathBuf::from(path)
    }
}

/// Path of the timestamp log belonging to a segment.
pub fn timestamp_log_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension(TIMESTAMP_LOG_EXTENSION)
}

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Time spanned by `ticks` at `clock_rate`, truncated to whole nanoseconds.
pub(crate) fn ticks_to_duration(ticks: u64, clock_rate: u32) -> Duration {
    let ticks = i64::try_from(ticks).unwrap_or(i64::MAX);
    let nanos = multiply_and_divide(ticks, NANOS_PER_SECOND, i64::from(clock_rate)).unwrap_or(i64::MAX);
    Duration::from_nanos(nanos.max(0) as u64)
}

/// Whole ticks at `clock_rate` contained in `d`.
pub(crate) fn duration_to_ticks(d: Duration, clock_rate: u32) -> u64 {
    let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
    multiply_and_divide(nanos, i64::from(clock_rate), NANOS_PER_SECOND).map_or(u64::MAX, |t| t.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ticks_convert_exactly() {
        assert_eq!(ticks_to_duration(90_000, 90_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(3_003, 90_000), Duration::from_nanos(33_366_666));
        assert_eq!(ticks_to_duration(1_024, 48_000), Duration::from_nanos(21_333_333));
        assert_eq!(duration_to_ticks(Duration::from_secs(1), 48_000), 48_000);
        assert_eq!(duration_to_ticks(Duration::from_millis(400), 90_000), 36_000);
        assert_eq!(duration_to_ticks(Duration::from_nanos(33_366_666), 90_000), 3_002);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: RecordConfig = serde_json::from_str(r#"{"part_duration_ms": 200}"#).unwrap();
        assert_eq!(config.part_duration(), Duration::from_millis(200));
        assert_eq!(config.segment_duration(), Duration::from_secs(3600));
        assert!(config.record_audio);
        assert!(!config.record_timestamp_log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = RecordConfig { part_duration_ms: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(RecordError::InvalidConfig(_))));

        config.part_duration_ms = 100;
        config.path_format = "rec/%Q".into();
        assert!(matches!(config.validate(), Err(RecordError::InvalidConfig(_))));
    }

    #[test]
    fn segment_and_log_paths() {
        let config = RecordConfig {
            path_format: "rec/cam1/%Y-%m-%d_%H-%M-%S-%6f".into(),
            ..Default::default()
        };
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::TimeDelta::microseconds(250);
        let path = config.segment_path(start);
        assert_eq!(path, PathBuf::from("rec/cam1/2024-03-09_07-05-01-000250.mp4"));
        assert_eq!(
            timestamp_log_path(&path),
            PathBuf::from("rec/cam1/2024-03-09_07-05-01-000250.csv")
        );
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, r#"{"record_audio": false, "segment_duration_ms": 60000}"#).unwrap();

        let config = RecordConfig::from_json_file(&path).unwrap();
        assert!(!config.record_audio);
        assert_eq!(config.segment_duration(), Duration::from_secs(60));

        fs::write(&path, r#"{"part_duration_ms": 0}"#).unwrap();
        assert!(RecordConfig::from_json_file(&path).is_err());
    }
}
