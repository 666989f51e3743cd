//! Wire format of the BLE camera image stream
//!
//! The camera board answers a capture trigger with one header notification
//! followed by raw payload notifications. There is no per-fragment type tag:
//! the header is recognised purely by its length.
//!
//! Header fragment layout (fixed 10 bytes, multi-byte fields big-endian):
//!
//! ```text
//! offset  size  field
//! 0       1     format code (4 = JPEG, other values reserved)
//! 1       2     width in pixels
//! 3       2     height in pixels
//! 5       4     total payload size in bytes
//! 9       1     reserved
//! ```

use serde::{Deserialize, Serialize};

/// Exact length of a header fragment
pub const HEADER_FRAME_SIZE: usize = 10;

/// Command written to the camera characteristic to take a picture
pub const CAPTURE_TRIGGER: [u8; 2] = [0x55, 0xAA];

/// MTU requested before triggering a capture
pub const PREFERRED_MTU: u16 = 512;

/// ATT overhead subtracted from the MTU to get the notification payload size
pub const ATT_NOTIFY_OVERHEAD: usize = 3;

/// The camera's notify/write characteristic UUID contains this tag
pub const CAMERA_CHARACTERISTIC_TAG: &str = "ff01";

/// Advertised name prefix of the camera boards
pub const CAMERA_NAME_PREFIX: &str = "ESP";

/// JPEG format code in the header
const FORMAT_CODE_JPEG: u8 = 4;

/// Encoding of the payload announced by a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Baseline JPEG (code 4)
    Jpeg,
    /// Reserved code, carried through unvalidated
    Other(u8),
}

impl ImageFormat {
    /// Map a header format byte to a format
    pub fn from_code(code: u8) -> Self {
        match code {
            FORMAT_CODE_JPEG => Self::Jpeg,
            other => Self::Other(other),
        }
    }

    /// Header format byte for this format
    pub fn code(self) -> u8 {
        match self {
            Self::Jpeg => FORMAT_CODE_JPEG,
            Self::Other(code) => code,
        }
    }

    /// MIME type used when the image is handed out as a data URI
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Other(_) => "application/octet-stream",
        }
    }

    /// File extension used when the image is written to disk
    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Other(_) => "bin",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jpeg => write!(f, "jpeg"),
            Self::Other(code) => write!(f, "format-{}", code),
        }
    }
}

/// Parsed header fragment, one per image cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Payload encoding
    pub format: ImageFormat,
    /// Advertised width in pixels
    pub width: u16,
    /// Advertised height in pixels
    pub height: u16,
    /// Number of payload bytes that will follow
    pub total_size: u32,
}

impl ImageHeader {
    /// Parse a header fragment.
    ///
    /// Returns `None` unless `data` is exactly [`HEADER_FRAME_SIZE`] bytes.
    /// The reserved byte is ignored.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if !is_header_sized(data.len()) {
            return None;
        }

        Some(Self {
            format: ImageFormat::from_code(data[0]),
            width: u16::from_be_bytes([data[1], data[2]]),
            height: u16::from_be_bytes([data[3], data[4]]),
            total_size: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        })
    }

    /// Encode the header in wire layout, reserved byte zero
    pub fn to_bytes(&self) -> [u8; HEADER_FRAME_SIZE] {
        let mut bytes = [0u8; HEADER_FRAME_SIZE];
        bytes[0] = self.format.code();
        bytes[1..3].copy_from_slice(&self.width.to_be_bytes());
        bytes[3..5].copy_from_slice(&self.height.to_be_bytes());
        bytes[5..9].copy_from_slice(&self.total_size.to_be_bytes());
        bytes
    }
}

/// Length-based header discriminator.
///
/// The stream has no frame-type tag, so a fragment of exactly
/// [`HEADER_FRAME_SIZE`] bytes is taken to be a header whenever a header is
/// expected. A stray 10-byte payload fragment arriving at that point is
/// indistinguishable from a real header.
#[inline]
pub fn is_header_sized(len: usize) -> bool {
    len == HEADER_FRAME_SIZE
}

/// Largest notification payload carried by a link with the given MTU
pub fn notify_payload_len(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(ATT_NOTIFY_OVERHEAD).max(1)
}
