//! Notification capture for testing and debugging.
//!
//! Records the raw notification stream of a camera session so that it can be
//! replayed offline through the reassembler, without the board or a BLE
//! adapter.
//!
//! # File Format
//!
//! - `capture_<ts>.bin`: sequence of `[u64 LE: timestamp_us][u32 LE: length][bytes: data]`
//! - `capture_<ts>.json`: device and image information
//!
//! # Example
//!
//! ```ignore
//! let capture = CaptureState::new();
//! capture.start_capture(CaptureMetadata {
//!     device_id: "24:0A:C4:00:00:01".into(),
//!     mtu: 512,
//!     ..Default::default()
//! })?;
//!
//! // For every notification:
//! capture.record_fragment(&value);
//!
//! // When done:
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Largest fragment accepted when reading a capture file
pub const MAX_FRAGMENT_LEN: usize = 64 * 1024;

/// Bytes preceding each fragment in the binary file
const RECORD_HEADER_LEN: u64 = 8 + 4;

/// Errors that can occur during capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// Capture file is truncated or holds an implausible record.
    #[error("invalid fragment record at byte {offset}: {message}")]
    InvalidFragment {
        /// File offset of the record header
        offset: u64,
        /// What was wrong with it
        message: String,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session and device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Peripheral identifier (MAC address or platform UUID).
    #[serde(default)]
    pub device_id: String,
    /// Advertised peripheral name.
    #[serde(default)]
    pub device_name: String,
    /// Negotiated ATT MTU.
    #[serde(default)]
    pub mtu: u16,
    /// Image format announced by the header (e.g. "jpeg").
    #[serde(default)]
    pub format_type: String,
    /// Image width in pixels.
    #[serde(default)]
    pub width: u32,
    /// Image height in pixels.
    #[serde(default)]
    pub height: u32,
    /// Total number of notifications captured.
    #[serde(default)]
    pub total_fragments: u64,
    /// Total number of complete images seen during the capture.
    #[serde(default)]
    pub total_images: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total payload bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

/// Result returned when a capture is written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved binary fragment file.
    pub fragments_path: String,
    /// Path to the saved metadata file.
    pub metadata_path: String,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// A single notification with its arrival time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFragment {
    /// Timestamp relative to capture start (microseconds).
    pub timestamp_us: u64,
    /// Notification payload.
    pub data: Vec<u8>,
}

/// Current status of the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    /// Whether capture is currently active.
    pub is_capturing: bool,
    /// Number of fragments captured so far.
    pub fragment_count: u64,
    /// Duration since capture started (milliseconds).
    pub duration_ms: u64,
    /// Total bytes captured.
    pub total_bytes: u64,
}

/// Thread-safe state for recording notifications.
///
/// The session records from whatever thread delivers notifications; the
/// counters are atomics so that status queries never contend with it.
pub struct CaptureState {
    is_capturing: AtomicBool,
    fragments: Mutex<Vec<CapturedFragment>>,
    start_time: Mutex<Option<Instant>>,
    metadata: Mutex<CaptureMetadata>,
    fragment_count: AtomicU64,
    byte_count: AtomicU64,
    image_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            fragments: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            fragment_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            image_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current fragment count.
    #[must_use]
    pub fn fragment_count(&self) -> u64 {
        self.fragment_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if an internal mutex is poisoned.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.fragments
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.fragment_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        self.image_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());

        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Fragment capture started");
        Ok(())
    }

    /// Records a notification with its arrival time.
    ///
    /// Ignored when no capture is active.
    pub fn record_fragment(&self, data: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        let timestamp_us = self
            .start_time
            .lock()
            .ok()
            .and_then(|start| start.map(|t| t.elapsed().as_micros() as u64))
            .unwrap_or(0);

        self.fragment_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        if let Ok(mut fragments) = self.fragments.lock() {
            fragments.push(CapturedFragment {
                timestamp_us,
                data: data.to_vec(),
            });
        } else {
            log::warn!("Failed to acquire lock for fragment recording");
        }
    }

    /// Counts a completed image. Call this when the reassembler finishes one.
    pub fn record_image(&self) {
        if self.is_capturing.load(Ordering::Acquire) {
            self.image_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Updates the stored image information (e.g. once a header arrives).
    pub fn update_metadata(&self, apply: impl FnOnce(&mut CaptureMetadata)) {
        if let Ok(mut meta) = self.metadata.lock() {
            apply(&mut meta);
        }
    }

    /// Stops the capture and saves it to `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let mut metadata = self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clone();
        metadata.duration_ms = duration_ms;
        metadata.total_images = self.image_count.load(Ordering::Acquire);

        let fragments = std::mem::take(
            &mut *self
                .fragments
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?,
        );

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = output_dir.join(format!("capture_{}.bin", timestamp));

        write_capture_file(&path, &fragments, metadata)
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut fragments) = self.fragments.lock() {
            fragments.clear();
        }
        log::info!("Capture cancelled");
    }

    /// Current recorder status.
    #[must_use]
    pub fn status(&self) -> CaptureStatus {
        let is_capturing = self.is_capturing();
        let duration_ms = if is_capturing {
            self.start_time
                .lock()
                .ok()
                .and_then(|start| start.map(|s| s.elapsed().as_millis() as u64))
                .unwrap_or(0)
        } else {
            0
        };

        CaptureStatus {
            is_capturing,
            fragment_count: self.fragment_count(),
            duration_ms,
            total_bytes: self.byte_count(),
        }
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// File Writing
// =============================================================================

/// Writes fragments to `path` and the metadata next to it (`.json`).
///
/// Fragment and byte totals in `metadata` are recomputed from `fragments`.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
pub fn write_capture_file(
    path: &Path,
    fragments: &[CapturedFragment],
    mut metadata: CaptureMetadata,
) -> Result<CaptureResult> {
    metadata.total_fragments = fragments.len() as u64;
    metadata.total_bytes = fragments.iter().map(|f| f.data.len() as u64).sum();

    let mut file = BufWriter::new(std::fs::File::create(path)?);
    for fragment in fragments {
        file.write_all(&fragment.timestamp_us.to_le_bytes())?;
        file.write_all(&(fragment.data.len() as u32).to_le_bytes())?;
        file.write_all(&fragment.data)?;
    }
    file.flush()?;

    let metadata_path = path.with_extension("json");
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    log::info!(
        "Capture saved: {} fragments, {} bytes, {} ms to {}",
        metadata.total_fragments,
        metadata.total_bytes,
        metadata.duration_ms,
        path.display()
    );

    Ok(CaptureResult {
        fragments_path: path.display().to_string(),
        metadata_path: metadata_path.display().to_string(),
        metadata,
    })
}

// =============================================================================
// File Reading
// =============================================================================

/// Reads fragments from a binary capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::InvalidFragment` for a truncated record or a
/// length above [`MAX_FRAGMENT_LEN`].
pub fn read_fragments(path: &Path) -> Result<Vec<CapturedFragment>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut fragments = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut ts_bytes = [0u8; 8];
        match read_up_to(&mut file, &mut ts_bytes)? {
            0 => break,
            n if n < ts_bytes.len() => {
                return Err(CaptureError::InvalidFragment {
                    offset,
                    message: "truncated record header".to_string(),
                });
            }
            _ => {}
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| CaptureError::InvalidFragment {
                offset,
                message: "truncated record header".to_string(),
            })?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAGMENT_LEN {
            return Err(CaptureError::InvalidFragment {
                offset,
                message: format!("length {} exceeds {}", len, MAX_FRAGMENT_LEN),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| CaptureError::InvalidFragment {
                offset,
                message: format!("truncated payload, expected {} bytes", len),
            })?;

        fragments.push(CapturedFragment {
            timestamp_us: u64::from_le_bytes(ts_bytes),
            data,
        });
        offset += RECORD_HEADER_LEN + len as u64;
    }

    log::debug!("Read {} fragments from {}", fragments.len(), path.display());
    Ok(fragments)
}

/// Fills `buf` until it is full or the reader is exhausted; returns the
/// number of bytes read.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CaptureError::Io(e)),
        }
    }
    Ok(filled)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
