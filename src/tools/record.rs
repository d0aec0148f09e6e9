//! Audio recording from the voice capture tap
//!
//! `record_start` flips the recorder tap in the JACK callback and spawns a
//! writer thread that drains it into a WAV file. One recording at a time;
//! an optional duration limit stops the writer on its own.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;

use crate::voice::capture::RecorderTap;
use crate::{Error, Result};

/// Writer poll interval while the tap is empty
const DRAIN_WAIT: Duration = Duration::from_millis(2);

/// Summary of a finished recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub sample_rate: u32,
}

struct ActiveRecording {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    sample_rate: u32,
    writer: JoinHandle<Result<u64>>,
}

/// Records the voice capture port to WAV files
pub struct Recorder {
    tap: RecorderTap,
    output_dir: PathBuf,
    active: Mutex<Option<ActiveRecording>>,
}

impl Recorder {
    /// Create a recorder writing into `output_dir`
    #[must_use]
    pub fn new(tap: RecorderTap, output_dir: &Path) -> Self {
        Self {
            tap,
            output_dir: output_dir.to_path_buf(),
            active: Mutex::new(None),
        }
    }

    /// Whether a recording is in progress
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active.lock().expect("recorder lock").is_some()
    }

    /// Start recording.
    ///
    /// # Errors
    ///
    /// Returns an error if a recording is already running or the output
    /// file cannot be created.
    pub fn start(
        &self,
        sample_rate: u32,
        filename: Option<&str>,
        max_duration_secs: Option<u64>,
    ) -> Result<PathBuf> {
        let mut active = self.active.lock().expect("recorder lock");
        if active.is_some() {
            return Err(Error::Audio("recording already in progress".to_string()));
        }
        if sample_rate == 0 {
            return Err(Error::JackUnavailable(
                "cannot record without a running JACK server".to_string(),
            ));
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let name = filename.map_or_else(
            || {
                format!(
                    "recording-{}.wav",
                    chrono::Utc::now().format("%Y%m%d-%H%M%S")
                )
            },
            ToString::to_string,
        );
        let path = self.output_dir.join(name);

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| Error::Audio(format!("wav create failed: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let max_frames = max_duration_secs.map(|secs| secs * u64::from(sample_rate));

        let tap = self.tap.clone();
        tap.activate();

        let thread_stop = Arc::clone(&stop);
        let thread_frames = Arc::clone(&frames);
        let writer = std::thread::Builder::new()
            .name("skc-recorder".to_string())
            .spawn(move || drain_to_wav(&tap, writer, &thread_stop, &thread_frames, max_frames))
            .map_err(|e| Error::Audio(format!("recorder thread spawn failed: {e}")))?;

        tracing::info!(path = %path.display(), sample_rate, "recording started");

        *active = Some(ActiveRecording {
            path: path.clone(),
            stop,
            frames,
            sample_rate,
            writer,
        });
        Ok(path)
    }

    /// Stop the active recording and finalize the WAV file.
    ///
    /// # Errors
    ///
    /// Returns an error if no recording is active or the writer failed.
    pub fn stop(&self) -> Result<RecordingSummary> {
        let recording = self
            .active
            .lock()
            .expect("recorder lock")
            .take()
            .ok_or_else(|| Error::Audio("no active recording".to_string()))?;

        recording.stop.store(true, Ordering::Relaxed);
        let frames = recording
            .writer
            .join()
            .map_err(|_| Error::Audio("recorder thread panicked".to_string()))??;

        tracing::info!(
            path = %recording.path.display(),
            frames,
            "recording stopped"
        );

        Ok(RecordingSummary {
            path: recording.path,
            frames,
            sample_rate: recording.sample_rate,
        })
    }

    /// Frames written so far by the active recording
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.active
            .lock()
            .expect("recorder lock")
            .as_ref()
            .map_or(0, |r| r.frames.load(Ordering::Relaxed))
    }
}

fn drain_to_wav<W>(
    tap: &RecorderTap,
    mut writer: hound::WavWriter<W>,
    stop: &AtomicBool,
    frames: &AtomicU64,
    max_frames: Option<u64>,
) -> Result<u64>
where
    W: std::io::Write + std::io::Seek,
{
    let mut written: u64 = 0;
    loop {
        match tap.pop() {
            Some(chunk) => {
                for &sample in chunk.samples() {
                    #[allow(clippy::cast_possible_truncation)]
                    let v = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    writer
                        .write_sample(v)
                        .map_err(|e| Error::Audio(format!("wav write failed: {e}")))?;
                }
                written += chunk.samples().len() as u64;
                frames.store(written, Ordering::Relaxed);

                if max_frames.is_some_and(|max| written >= max) {
                    tap.deactivate();
                    break;
                }
            }
            None if stop.load(Ordering::Relaxed) => {
                tap.deactivate();
                break;
            }
            None => std::thread::park_timeout(DRAIN_WAIT),
        }
    }

    writer
        .finalize()
        .map_err(|e| Error::Audio(format!("wav finalize failed: {e}")))?;
    Ok(written)
}
