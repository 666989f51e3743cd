//! `ble-snap` - Still-image receiver for BLE camera boards
//!
//! The camera answers a capture trigger with a 10-byte header notification
//! followed by raw payload notifications. This crate turns that stream back
//! into images: [`frame_assembler`] holds the reassembly state machine,
//! [`session`] wires it to a BLE transport behind the [`link::CameraLink`]
//! trait, and [`capture`] / [`replay`] record and replay streams offline.

pub mod capture;
pub mod cli;
pub mod config;
pub mod frame_assembler;
pub mod image_validation;
pub mod link;
pub mod peripherals;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod test_utils;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::frame_assembler::CompletedImage;

/// Latest valid image, shared between the session and its readers
#[derive(Debug, Clone, Default)]
pub struct ImageSlot {
    inner: Arc<Mutex<Option<CompletedImage>>>,
}

impl ImageSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored image
    pub fn store(&self, image: CompletedImage) {
        *self.lock() = Some(image);
    }

    /// Copy of the stored image
    pub fn latest(&self) -> Option<CompletedImage> {
        self.lock().clone()
    }

    /// Remove and return the stored image
    pub fn take(&self) -> Option<CompletedImage> {
        self.lock().take()
    }

    /// Whether no image has been stored
    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    // A panicking reader cannot leave the Option half-written
    fn lock(&self) -> MutexGuard<'_, Option<CompletedImage>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write an image to `dir` as `image_<unix secs>_<seq>_<w>x<h>.<ext>`
///
/// Creates `dir` if needed and returns the path written.
///
/// # Errors
///
/// Returns the I/O error if the directory or file cannot be written.
pub fn dump_image(dir: &Path, image: &CompletedImage, seq: u64) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let filename = format!(
        "image_{}_{}_{}x{}.{}",
        timestamp,
        seq,
        image.width,
        image.height,
        image.file_extension()
    );
    let path = dir.join(filename);
    std::fs::write(&path, &image.bytes)?;

    log::info!("Saved image to {}: {} bytes", path.display(), image.len());
    Ok(path)
}

/// Build information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Version from Cargo.toml
    pub version: String,
    /// Git commit hash (short)
    pub git_hash: String,
    /// Build timestamp
    pub build_time: String,
}

/// Get build information (version, git hash, build time)
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("BUILD_GIT_HASH").to_string(),
        build_time: env!("BUILD_TIMESTAMP").to_string(),
    }
}

/// Run the `ble-snap` command line tool
///
/// Initializes logging from `RUST_LOG` (default `info`), parses the command
/// line and runs the selected command.
///
/// # Errors
///
/// Returns the failure of the selected command.
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let info = build_info();
    log::debug!("ble-snap {} ({}, built {})", info.version, info.git_hash, info.build_time);

    cli::execute(cli::Cli::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ImageFormat;

    fn image(width: u16, height: u16) -> CompletedImage {
        CompletedImage {
            bytes: vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9],
            format: ImageFormat::Jpeg,
            width,
            height,
            advertised_size: 5,
        }
    }

    #[test]
    fn test_image_slot_shared_between_clones() {
        let slot = ImageSlot::new();
        let reader = slot.clone();
        assert!(reader.is_empty());

        slot.store(image(8, 8));
        assert_eq!(reader.latest().unwrap().width, 8);

        slot.store(image(16, 16));
        assert_eq!(reader.take().unwrap().width, 16);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_image_slot_survives_poisoning() {
        let slot = ImageSlot::new();
        slot.store(image(4, 4));

        let poisoner = slot.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.lock().unwrap();
            panic!("poison the slot");
        })
        .join();

        assert_eq!(slot.latest().unwrap().width, 4);
    }

    #[test]
    fn test_dump_image() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("images");

        let path = dump_image(&out, &image(320, 240), 7).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("image_"));
        assert!(name.ends_with("_7_320x240.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), image(320, 240).bytes);
    }

    #[test]
    fn test_build_info() {
        let info = build_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(!info.git_hash.is_empty());
    }
}
