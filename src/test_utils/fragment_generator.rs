//! Synthetic notification streams for testing
//!
//! Generates header + payload fragments shaped like the camera firmware's
//! output so the reassembly pipeline can be exercised without a BLE device.
//!
//! # Example
//!
//! ```rust,ignore
//! use ble_snap_lib::test_utils::FragmentGenerator;
//!
//! let gen = FragmentGenerator::for_mtu(512);
//!
//! // 320x240 JPEG-shaped payload of 8 KiB, split into notifications
//! let jpeg = FragmentGenerator::minimal_jpeg(320, 240, 8192);
//! let fragments = gen.image_fragments(320, 240, &jpeg);
//! ```

use crate::capture::CapturedFragment;
use crate::protocol::{notify_payload_len, ImageFormat, ImageHeader, HEADER_FRAME_SIZE};

/// Size of the SOI + APP0 + SOF0 + EOI skeleton written by `minimal_jpeg`
pub const MINIMAL_JPEG_LEN: usize = 35;

/// Splits images into notification-sized fragments
#[derive(Debug, Clone)]
pub struct FragmentGenerator {
    /// Maximum bytes per payload fragment
    pub max_payload_size: usize,
}

impl Default for FragmentGenerator {
    fn default() -> Self {
        Self::for_mtu(crate::protocol::PREFERRED_MTU)
    }
}

impl FragmentGenerator {
    /// Create a generator with the given payload bytes per fragment
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.max(1),
        }
    }

    /// Create a generator sized for a negotiated ATT MTU
    pub fn for_mtu(mtu: u16) -> Self {
        Self::new(notify_payload_len(mtu))
    }

    /// Header fragment for an image
    pub fn header(format: ImageFormat, width: u16, height: u16, total_size: u32) -> Vec<u8> {
        ImageHeader {
            format,
            width,
            height,
            total_size,
        }
        .to_bytes()
        .to_vec()
    }

    /// Split a payload into fragments of at most `max_payload_size` bytes
    pub fn split_payload(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        payload
            .chunks(self.max_payload_size)
            .map(<[u8]>::to_vec)
            .collect()
    }

    /// Full JPEG image stream: header advertising `payload.len()` then payload fragments
    pub fn image_fragments(&self, width: u16, height: u16, payload: &[u8]) -> Vec<Vec<u8>> {
        let header = ImageHeader {
            format: ImageFormat::Jpeg,
            width,
            height,
            total_size: payload.len() as u32,
        };
        self.image_fragments_with_header(header, payload)
    }

    /// Image stream with an explicit header (e.g. to advertise a wrong size)
    pub fn image_fragments_with_header(&self, header: ImageHeader, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut fragments = Vec::with_capacity(payload.len() / self.max_payload_size + 2);
        fragments.push(header.to_bytes().to_vec());
        fragments.extend(self.split_payload(payload));
        fragments
    }

    /// Stray notifications of the kind left over from a previous session
    ///
    /// Lengths cycle through 1..=20 and skip the header size, so none of them
    /// can be mistaken for a header.
    pub fn stray_fragments(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let mut len = i % 20 + 1;
                if len == HEADER_FRAME_SIZE {
                    len += 1;
                }
                vec![0xA5; len]
            })
            .collect()
    }

    /// Attach evenly spaced timestamps, as a capture file would store them
    pub fn timestamped(fragments: Vec<Vec<u8>>, interval_us: u64) -> Vec<CapturedFragment> {
        fragments
            .into_iter()
            .enumerate()
            .map(|(i, data)| CapturedFragment {
                timestamp_us: i as u64 * interval_us,
                data,
            })
            .collect()
    }

    /// JPEG-shaped payload of `total_len` bytes (at least [`MINIMAL_JPEG_LEN`])
    ///
    /// SOI, a JFIF APP0 segment and a SOF0 segment carrying the dimensions,
    /// then filler standing in for entropy-coded data, then EOI. The filler
    /// never contains 0xFF so no spurious markers appear. The result has
    /// valid framing markers; it is not meant to be decodable.
    pub fn minimal_jpeg(width: u16, height: u16, total_len: usize) -> Vec<u8> {
        let total_len = total_len.max(MINIMAL_JPEG_LEN);
        let mut jpeg = Vec::with_capacity(total_len);

        // SOI (Start of Image)
        jpeg.extend_from_slice(&[0xFF, 0xD8]);

        // APP0 (JFIF marker)
        jpeg.extend_from_slice(&[
            0xFF, 0xE0, // APP0 marker
            0x00, 0x10, // Length (16 bytes)
            0x4A, 0x46, 0x49, 0x46, 0x00, // "JFIF\0"
            0x01, 0x01, // Version 1.1
            0x00, // Aspect ratio units (0 = no units)
            0x00, 0x01, // X density
            0x00, 0x01, // Y density
            0x00, 0x00, // No thumbnail
        ]);

        // SOF0 (Start of Frame - Baseline DCT)
        jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        jpeg.extend_from_slice(&height.to_be_bytes());
        jpeg.extend_from_slice(&width.to_be_bytes());
        jpeg.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);

        // Filler in place of scan data
        let filler = total_len - jpeg.len() - 2;
        jpeg.extend((0..filler).map(|i| (i % 251) as u8));

        // EOI (End of Image)
        jpeg.extend_from_slice(&[0xFF, 0xD9]);

        jpeg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_jpeg_markers() {
        let jpeg = FragmentGenerator::minimal_jpeg(640, 480, 1000);
        assert_eq!(jpeg.len(), 1000);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[998..], &[0xFF, 0xD9]);
        // SOF0 dimensions: height then width
        assert_eq!(&jpeg[20..22], &[0xFF, 0xC0]);
        assert_eq!(&jpeg[25..27], &480u16.to_be_bytes());
        assert_eq!(&jpeg[27..29], &640u16.to_be_bytes());
    }

    #[test]
    fn test_minimal_jpeg_has_floor_size() {
        let jpeg = FragmentGenerator::minimal_jpeg(1, 1, 0);
        assert_eq!(jpeg.len(), MINIMAL_JPEG_LEN);
        assert_eq!(&jpeg[MINIMAL_JPEG_LEN - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_minimal_jpeg_filler_has_no_markers() {
        let jpeg = FragmentGenerator::minimal_jpeg(8, 8, 4096);
        let body = &jpeg[MINIMAL_JPEG_LEN - 2..jpeg.len() - 2];
        assert!(body.iter().all(|&b| b != 0xFF));
    }

    #[test]
    fn test_split_payload_sizes() {
        let gen = FragmentGenerator::new(100);
        let payload = vec![7u8; 250];
        let fragments = gen.split_payload(&payload);
        let sizes: Vec<_> = fragments.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn test_image_fragments_start_with_header() {
        let gen = FragmentGenerator::new(64);
        let payload = vec![1u8; 200];
        let fragments = gen.image_fragments(32, 24, &payload);

        assert_eq!(fragments.len(), 1 + 4);
        let header = ImageHeader::parse(&fragments[0]).unwrap();
        assert_eq!(header.width, 32);
        assert_eq!(header.height, 24);
        assert_eq!(header.total_size, 200);
        assert_eq!(fragments[1..].concat(), payload);
    }

    #[test]
    fn test_for_mtu() {
        assert_eq!(FragmentGenerator::for_mtu(23).max_payload_size, 20);
        assert_eq!(FragmentGenerator::default().max_payload_size, 509);
    }

    #[test]
    fn test_stray_fragments_never_header_sized() {
        let strays = FragmentGenerator::stray_fragments(45);
        assert_eq!(strays.len(), 45);
        assert!(strays.iter().all(|f| f.len() != HEADER_FRAME_SIZE));
    }

    #[test]
    fn test_timestamped() {
        let fragments = FragmentGenerator::timestamped(vec![vec![1], vec![2], vec![3]], 500);
        let stamps: Vec<_> = fragments.iter().map(|f| f.timestamp_us).collect();
        assert_eq!(stamps, vec![0, 500, 1000]);
    }
}
