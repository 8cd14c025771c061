use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use segrec::{DiskStorage, RecordConfig, Recorder, SystemClock, Track, TrackKind, Unit};

const VIDEO_CLOCK_RATE: u32 = 90_000;
const VIDEO_FRAME_TICKS: i64 = 3_000; // 30 fps
const KEYFRAME_INTERVAL: i64 = 30;
const AUDIO_CLOCK_RATE: u32 = 48_000;
const AUDIO_FRAME_TICKS: i64 = 1_024;

/// Record a synthetic video + audio stream into fragmented MP4 segments.
#[derive(Parser, Debug)]
#[command(name = "segrec", version)]
struct Args {
    /// JSON recording configuration. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to record, in seconds.
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Also write a CSV of video frame timestamps next to each segment.
    #[arg(long)]
    timestamps: bool,
}

/// Minimal sample entry boxes; the synthetic payloads are not decodable.
fn sample_entry(fourcc: &[u8; 4]) -> Vec<u8> {
    let mut entry = 8u32.to_be_bytes().to_vec();
    entry.extend_from_slice(fourcc);
    entry
}

fn frame_time(ticks: i64, clock_rate: u32) -> Duration {
    Duration::from_micros((ticks * 1_000_000 / i64::from(clock_rate)) as u64)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RecordConfig::from_json_file(path)
            .with_context(|| format!("failed to load configuration '{}'", path.display()))?,
        None => RecordConfig::default(),
    };
    config.record_timestamp_log |= args.timestamps;

    let tracks = vec![
        Track::new(1, TrackKind::Video, VIDEO_CLOCK_RATE, sample_entry(b"avc1")),
        Track::new(2, TrackKind::Audio, AUDIO_CLOCK_RATE, sample_entry(b"mp4a")),
    ];

    let mut recorder = Recorder::new(config, tracks, Arc::new(DiskStorage), Arc::new(SystemClock))
        .context("failed to create recorder")?
        .on_segment_complete(|seg| {
            log::info!("completed {} ({:?})", seg.path.display(), seg.duration);
        });

    log::info!("recording for {}s", args.seconds);

    let total = Duration::from_secs(args.seconds);
    let started = Instant::now();
    let mut video_frame = 0i64;
    let mut audio_frame = 0i64;

    loop {
        let video_at = frame_time(video_frame * VIDEO_FRAME_TICKS, VIDEO_CLOCK_RATE);
        let audio_at = frame_time(audio_frame * AUDIO_FRAME_TICKS, AUDIO_CLOCK_RATE);
        let at = video_at.min(audio_at);
        if at >= total {
            break;
        }

        if let Some(wait) = at.checked_sub(started.elapsed()) {
            thread::sleep(wait);
        }

        let result = if video_at <= audio_at {
            let unit = Unit {
                dts: video_frame * VIDEO_FRAME_TICKS,
                pts_offset: 0,
                is_sync: video_frame % KEYFRAME_INTERVAL == 0,
                payload: vec![0u8; 2_048],
            };
            video_frame += 1;
            recorder.write(1, unit)
        } else {
            let unit = Unit {
                dts: audio_frame * AUDIO_FRAME_TICKS,
                pts_offset: 0,
                is_sync: true,
                payload: vec![0u8; 256],
            };
            audio_frame += 1;
            recorder.write(2, unit)
        };
        result.context("recording failed")?;
    }

    recorder.close().context("failed to finalize last segment")?;
    log::info!("done: {video_frame} video and {audio_frame} audio frames");
    Ok(())
}
