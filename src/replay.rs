//! Capture replay for desktop testing without a camera board.
//!
//! Feeds a recorded notification stream back through a [`FrameReassembler`],
//! honouring the recorded inter-arrival times, so the receiver can be
//! exercised offline.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use ble_snap_lib::replay::FragmentReplay;
//!
//! let mut replay = FragmentReplay::load(Path::new("capture_12345.bin"))?;
//! let receiver = replay.start()?;
//!
//! while let Ok(image) = receiver.recv() {
//!     println!("{}x{}, {} bytes", image.width, image.height, image.len());
//! }
//! ```

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{self, read_metadata, CaptureError, CaptureMetadata, CapturedFragment};
use crate::frame_assembler::{CompletedImage, FrameEvent, FrameReassembler};

/// Errors that can occur during replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Replay is already running.
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running.
    #[error("replay is not running")]
    NotRunning,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
        }
    }
}

/// Replays a captured notification stream.
pub struct FragmentReplay {
    fragments: Vec<CapturedFragment>,
    metadata: Option<CaptureMetadata>,
    config: ReplayConfig,
    thread_handle: Option<JoinHandle<()>>,
    stop_sender: Option<Sender<()>>,
}

impl FragmentReplay {
    /// Load a capture file and its companion metadata, if present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Capture` if the file cannot be read or holds an
    /// invalid record.
    pub fn load(path: &Path) -> Result<Self> {
        let fragments = capture::read_fragments(path)?;
        let metadata = try_load_metadata(path);

        log::info!("Loaded {} fragments from {}", fragments.len(), path.display());
        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {} ({}), {}x{} {}, MTU {}, {} images, {} ms",
                meta.device_name,
                meta.device_id,
                meta.width,
                meta.height,
                meta.format_type,
                meta.mtu,
                meta.total_images,
                meta.duration_ms
            );
        }

        Ok(Self {
            fragments,
            metadata,
            config: ReplayConfig::default(),
            thread_handle: None,
            stop_sender: None,
        })
    }

    /// Load a capture with a custom configuration.
    ///
    /// # Errors
    ///
    /// See [`FragmentReplay::load`].
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut replay = Self::load(path)?;
        replay.config = config;
        Ok(replay)
    }

    /// The loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Number of loaded fragments.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// The loaded fragments in arrival order.
    #[must_use]
    pub fn fragments(&self) -> &[CapturedFragment] {
        &self.fragments
    }

    /// Timestamp of the last fragment in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.fragments
            .last()
            .map(|f| f.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Check if replay is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Start replaying in a background thread.
    ///
    /// Returns a receiver that yields completed images. The channel closes
    /// when the replay ends.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::AlreadyRunning` if replay is already in progress.
    pub fn start(&mut self) -> Result<Receiver<CompletedImage>> {
        if self.is_running() {
            return Err(ReplayError::AlreadyRunning);
        }

        let (image_tx, image_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let fragments = self.fragments.clone();
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            replay_thread(&fragments, &config, &image_tx, &stop_rx);
        });

        self.thread_handle = Some(handle);
        self.stop_sender = Some(stop_tx);

        log::info!("Fragment replay started");
        Ok(image_rx)
    }

    /// Stop the replay thread and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if replay is not in progress.
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_sender.take().ok_or(ReplayError::NotRunning)?;
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;

        // The thread may already have finished and dropped its receiver
        let _ = stop_tx.send(());
        handle.join().map_err(|_| ReplayError::NotRunning)?;

        log::info!("Fragment replay stopped");
        Ok(())
    }
}

impl Drop for FragmentReplay {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn replay_thread(
    fragments: &[CapturedFragment],
    config: &ReplayConfig,
    image_tx: &Sender<CompletedImage>,
    stop_rx: &Receiver<()>,
) {
    let mut reassembler = FrameReassembler::new();

    loop {
        let replay_start = Instant::now();
        let first_timestamp_us = fragments.first().map(|f| f.timestamp_us).unwrap_or(0);

        for fragment in fragments {
            if stop_rx.try_recv().is_ok() {
                log::debug!("Replay thread received stop signal");
                return;
            }

            if config.speed > 0.0 {
                let offset_us = fragment.timestamp_us.saturating_sub(first_timestamp_us);
                let expected = Duration::from_micros((offset_us as f64 / config.speed) as u64);
                let mut remaining = expected.saturating_sub(replay_start.elapsed());

                // Sleep in small chunks so a stop request is noticed
                let chunk = Duration::from_millis(10);
                while remaining > Duration::ZERO {
                    if stop_rx.try_recv().is_ok() {
                        return;
                    }
                    let sleep = remaining.min(chunk);
                    thread::sleep(sleep);
                    remaining = remaining.saturating_sub(sleep);
                }
            }

            if let FrameEvent::ImageComplete(image) = reassembler.submit(&fragment.data) {
                if image_tx.send(image).is_err() {
                    log::debug!("Image receiver dropped, stopping replay");
                    return;
                }
            }
        }

        if config.loop_playback && !fragments.is_empty() {
            log::debug!("Replay loop completed, restarting");
            reassembler.reset();
        } else {
            log::debug!(
                "Replay completed: {} images, {} fragments discarded",
                reassembler.stats().images,
                reassembler.stats().discarded_fragments
            );
            break;
        }
    }
}

/// Looks for `<name>.json` next to the capture file.
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let json_path = path.with_extension("json");
    if !json_path.exists() {
        return None;
    }
    match read_metadata(&json_path) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::warn!("Ignoring metadata {}: {}", json_path.display(), e);
            None
        }
    }
}

/// Replay a whole capture without timing and collect every completed image.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded.
///
/// # Example
///
/// ```rust,ignore
/// let images = replay_all_images(Path::new("capture.bin"))?;
/// println!("Replayed {} images", images.len());
/// ```
pub fn replay_all_images(path: &Path) -> Result<Vec<CompletedImage>> {
    let fragments = capture::read_fragments(path)?;
    let mut reassembler = FrameReassembler::new();
    let images: Vec<_> = reassembler
        .images(fragments.iter().map(|f| f.data.as_slice()))
        .collect();
    Ok(images)
}

/// Lazy per-file image iterator.
pub struct ImageIterator {
    fragments: std::vec::IntoIter<CapturedFragment>,
    reassembler: FrameReassembler,
}

impl ImageIterator {
    /// Open a capture file for iteration.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn new(path: &Path) -> Result<Self> {
        let fragments = capture::read_fragments(path)?;
        Ok(Self {
            fragments: fragments.into_iter(),
            reassembler: FrameReassembler::new(),
        })
    }

    /// Reassembler state after the images yielded so far
    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }
}

impl Iterator for ImageIterator {
    type Item = CompletedImage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let fragment = self.fragments.next()?;
            if let FrameEvent::ImageComplete(image) = self.reassembler.submit(&fragment.data) {
                return Some(image);
            }
        }
    }
}
