//! Recording of live media tracks into rotating fragmented MP4 segments.

pub mod clock;
pub mod error;
pub mod fmp4;
pub mod recording;
pub mod storage;

pub use clock::{Clock, ClockEstimator, ManualClock, SystemClock};
pub use error::{RecordError, Result};
pub use recording::{CompletedSegment, RecordConfig, Recorder, Track, TrackKind, Unit};
pub use storage::{DiskStorage, Storage, StorageFile};
