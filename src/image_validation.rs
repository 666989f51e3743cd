//! Sanity checks for reassembled images
//!
//! The transport gives no integrity guarantee: a dropped notification only
//! shows up as a short or garbled buffer once the next header arrives. These
//! checks catch the obvious cases before an image is handed on.
//!
//! Configurable via the `BLESNAP_IMAGE_VALIDATION` environment variable.

use serde::{Deserialize, Serialize};

use crate::frame_assembler::CompletedImage;
use crate::protocol::ImageFormat;

/// JPEG start-of-image marker
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Image validation strictness levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Moderate checks plus JPEG marker checks
    #[default]
    Strict,
    /// Size, overshoot and dimension checks
    Moderate,
    /// Non-empty and at least the advertised size
    Minimal,
    /// No validation
    Off,
}

impl ValidationLevel {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "strict" => Self::Strict,
            "moderate" => Self::Moderate,
            "minimal" => Self::Minimal,
            "off" | "none" | "disabled" => Self::Off,
            _ => {
                log::warn!("Unknown validation level '{}', defaulting to 'strict'", s);
                Self::Strict
            }
        }
    }
}

/// Image validation result with diagnostic metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Whether the image passed validation
    pub valid: bool,
    /// Buffer length in bytes
    pub actual_size: usize,
    /// Size announced by the header
    pub advertised_size: u32,
    /// Bytes received beyond the advertised size
    pub overshoot: usize,
    /// Buffer starts with a JPEG SOI marker
    pub has_soi: bool,
    /// JPEG EOI marker found at the advertised end or in the overshoot tail
    pub has_eoi: bool,
    /// Reason for validation failure (if any)
    pub failure_reason: Option<String>,
}

/// Validate a completed image
///
/// `max_fragment_len` is the largest notification payload the link can carry
/// (see [`crate::protocol::notify_payload_len`]); when known, an overshoot of
/// a full fragment or more means the header advertised too little.
///
/// The image itself is never modified.
pub fn validate_image(
    image: &CompletedImage,
    level: ValidationLevel,
    max_fragment_len: Option<usize>,
) -> ValidationResult {
    let actual_size = image.len();
    let advertised = image.advertised_size as usize;
    let overshoot = image.overshoot();
    let has_soi = image.bytes.starts_with(&JPEG_SOI);
    let has_eoi = find_eoi(&image.bytes, advertised);

    let mut failure_reasons = Vec::new();

    if level != ValidationLevel::Off {
        if image.is_empty() {
            failure_reasons.push("Empty image".to_string());
        }
        if actual_size < advertised {
            failure_reasons.push(format!(
                "Short image: {} bytes (advertised {})",
                actual_size, advertised
            ));
        }
    }

    if matches!(level, ValidationLevel::Moderate | ValidationLevel::Strict) {
        if let Some(max) = max_fragment_len {
            if overshoot >= max.max(1) {
                failure_reasons.push(format!(
                    "Overshoot of {} bytes exceeds one fragment ({})",
                    overshoot, max
                ));
            }
        }
        if image.width == 0 || image.height == 0 {
            failure_reasons.push(format!(
                "Zero dimension: {}x{}",
                image.width, image.height
            ));
        }
    }

    if level == ValidationLevel::Strict && image.format == ImageFormat::Jpeg {
        if !has_soi {
            failure_reasons.push("Missing JPEG SOI marker".to_string());
        }
        if !has_eoi {
            failure_reasons.push("Missing JPEG EOI marker".to_string());
        }
    }

    let failure_reason = if failure_reasons.is_empty() {
        None
    } else {
        Some(failure_reasons.join("; "))
    };

    ValidationResult {
        valid: failure_reason.is_none(),
        actual_size,
        advertised_size: image.advertised_size,
        overshoot,
        has_soi,
        has_eoi,
        failure_reason,
    }
}

/// Look for EOI ending at the advertised size or inside the overshoot tail
fn find_eoi(data: &[u8], advertised: usize) -> bool {
    let start = advertised.saturating_sub(JPEG_EOI.len()).min(data.len());
    data[start..].windows(JPEG_EOI.len()).any(|w| w == JPEG_EOI)
}
