//! Image reassembly from BLE notification fragments
//!
//! The camera streams one image as a 10-byte header fragment followed by an
//! arbitrary number of payload fragments. [`FrameReassembler`] consumes the
//! fragments one at a time, in arrival order, and reports what each one did
//! as a [`FrameEvent`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use ble_snap_lib::frame_assembler::{FrameEvent, FrameReassembler};
//!
//! let mut reassembler = FrameReassembler::new();
//!
//! for notification in notifications {
//!     if let FrameEvent::ImageComplete(image) = reassembler.submit(&notification) {
//!         // Complete image received
//!         show_image(image);
//!     }
//! }
//! ```
//!
//! # Header detection
//!
//! The wire format has no fragment type tag. While awaiting a header, a
//! fragment is a header if and only if it is exactly
//! [`HEADER_FRAME_SIZE`](crate::protocol::HEADER_FRAME_SIZE) bytes long;
//! anything else is discarded with [`FrameEvent::UnexpectedFragment`]. While
//! accumulating, every fragment is payload, whatever its length. A stray
//! 10-byte fragment arriving between images is therefore taken as a header.
//! That ambiguity belongs to the protocol and is deliberately left visible.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;

use crate::protocol::{ImageFormat, ImageHeader};

/// Upper bound on the buffer capacity reserved up front from an untrusted header
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Outcome of submitting a single fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A header fragment started a new image cycle
    HeaderReceived(ImageHeader),
    /// Payload appended, image not complete yet
    FragmentAccumulated {
        /// Bytes received so far in this cycle
        received: usize,
        /// Total size advertised by the header
        expected: u32,
    },
    /// The image reached (or passed) its advertised size
    ImageComplete(CompletedImage),
    /// A non-header-sized fragment arrived while awaiting a header and was dropped
    UnexpectedFragment {
        /// Length of the dropped fragment
        len: usize,
    },
}

/// A fully assembled image, owned by the consumer once emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedImage {
    /// Payload bytes in arrival order
    pub bytes: Vec<u8>,
    /// Encoding announced by the header
    pub format: ImageFormat,
    /// Advertised width in pixels
    pub width: u16,
    /// Advertised height in pixels
    pub height: u16,
    /// Total size announced by the header
    pub advertised_size: u32,
}

impl CompletedImage {
    /// Number of payload bytes received
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image carries no bytes (only possible for a zero-size header)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes received beyond the advertised size
    ///
    /// The final fragment may legitimately overshoot; the extra bytes are kept.
    pub fn overshoot(&self) -> usize {
        self.bytes.len().saturating_sub(self.advertised_size as usize)
    }

    /// Whether the payload starts with a JPEG SOI marker
    pub fn is_jpeg(&self) -> bool {
        is_jpeg_data(&self.bytes)
    }

    /// File extension for the announced format
    pub fn file_extension(&self) -> &'static str {
        self.format.file_extension()
    }

    /// Encode the image as a `data:` URI for inline display
    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            BASE64.encode(&self.bytes)
        )
    }

    /// Take the payload bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Externally visible reassembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssemblerState {
    /// No image in progress; the next header-sized fragment starts one
    AwaitingHeader,
    /// An image is being accumulated
    Accumulating {
        /// Bytes received so far
        received: usize,
        /// Total size advertised by the header
        expected: u32,
    },
}

/// Counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReassemblerStats {
    /// Header fragments recognised
    pub headers: u64,
    /// Images completed
    pub images: u64,
    /// Payload fragments appended
    pub payload_fragments: u64,
    /// Fragments dropped while awaiting a header
    pub discarded_fragments: u64,
    /// Bytes in dropped fragments
    pub discarded_bytes: u64,
    /// Partial images dropped by `reset`
    pub abandoned_images: u64,
}

/// In-progress image: exists only between header and completion
#[derive(Debug)]
struct Accumulation {
    header: ImageHeader,
    /// Received size is `buffer.len()`
    buffer: Vec<u8>,
}

impl Accumulation {
    fn new(header: ImageHeader) -> Self {
        let capacity = (header.total_size as usize).min(MAX_PREALLOCATION);
        Self {
            header,
            buffer: Vec::with_capacity(capacity),
        }
    }

    fn is_complete(&self) -> bool {
        self.buffer.len() as u64 >= u64::from(self.header.total_size)
    }

    fn finish(self) -> CompletedImage {
        CompletedImage {
            bytes: self.buffer,
            format: self.header.format,
            width: self.header.width,
            height: self.header.height,
            advertised_size: self.header.total_size,
        }
    }
}

/// Reassembles images from header + payload fragments
///
/// Single-threaded and clock-free: a stalled stream simply leaves the
/// reassembler accumulating until the caller invokes [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct FrameReassembler {
    accumulation: Option<Accumulation>,
    stats: ReassemblerStats,
}

impl FrameReassembler {
    /// Create a reassembler awaiting its first header
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> AssemblerState {
        match &self.accumulation {
            None => AssemblerState::AwaitingHeader,
            Some(acc) => AssemblerState::Accumulating {
                received: acc.buffer.len(),
                expected: acc.header.total_size,
            },
        }
    }

    /// Header of the image in progress, if any
    pub fn current_header(&self) -> Option<&ImageHeader> {
        self.accumulation.as_ref().map(|acc| &acc.header)
    }

    /// Bytes received for the image in progress (0 when awaiting a header)
    pub fn received_size(&self) -> usize {
        self.buffer_len()
    }

    /// Get current buffer size (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.accumulation
            .as_ref()
            .map_or(0, |acc| acc.buffer.len())
    }

    /// Counters since creation
    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Drop any partial image and await the next header
    ///
    /// Calling this repeatedly is the same as calling it once.
    pub fn reset(&mut self) {
        if let Some(acc) = self.accumulation.take() {
            self.stats.abandoned_images += 1;
            log::warn!(
                "Dropping partial {}x{} image: {} of {} bytes received",
                acc.header.width,
                acc.header.height,
                acc.buffer.len(),
                acc.header.total_size
            );
        }
    }

    /// Process one fragment exactly as delivered by the transport
    pub fn submit(&mut self, fragment: &[u8]) -> FrameEvent {
        let Some(mut acc) = self.accumulation.take() else {
            return self.accept_header(fragment);
        };

        acc.buffer.extend_from_slice(fragment);
        self.stats.payload_fragments += 1;

        if !acc.is_complete() {
            let received = acc.buffer.len();
            let expected = acc.header.total_size;
            log::debug!("Image fragment: {} of {} bytes", received, expected);
            self.accumulation = Some(acc);
            return FrameEvent::FragmentAccumulated { received, expected };
        }

        let image = acc.finish();
        self.stats.images += 1;
        log::info!(
            "Complete {} image: {}x{}, {} bytes ({} advertised)",
            image.format,
            image.width,
            image.height,
            image.len(),
            image.advertised_size
        );
        FrameEvent::ImageComplete(image)
    }

    /// Feed fragments and lazily yield the completed images
    ///
    /// The iterator ends when the fragments run out; a partial image stays in
    /// the reassembler and continues with the next call.
    pub fn images<I>(&mut self, fragments: I) -> CompletedImages<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        CompletedImages {
            reassembler: self,
            fragments: fragments.into_iter(),
        }
    }

    /// Handle a fragment while awaiting a header
    ///
    /// `ImageHeader::parse` accepts exactly the header-sized fragments, so
    /// length is the only thing deciding header versus stray fragment here.
    fn accept_header(&mut self, fragment: &[u8]) -> FrameEvent {
        let Some(header) = ImageHeader::parse(fragment) else {
            self.stats.discarded_fragments += 1;
            self.stats.discarded_bytes += fragment.len() as u64;
            log::warn!(
                "Discarding {} byte fragment while awaiting image header",
                fragment.len()
            );
            return FrameEvent::UnexpectedFragment {
                len: fragment.len(),
            };
        };

        log::info!(
            "Image header: {} {}x{}, {} bytes expected",
            header.format,
            header.width,
            header.height,
            header.total_size
        );
        self.stats.headers += 1;
        self.accumulation = Some(Accumulation::new(header));
        FrameEvent::HeaderReceived(header)
    }
}

/// Lazy sequence of completed images, see [`FrameReassembler::images`]
pub struct CompletedImages<'a, I> {
    reassembler: &'a mut FrameReassembler,
    fragments: I,
}

impl<I> Iterator for CompletedImages<'_, I>
where
    I: Iterator,
    I::Item: AsRef<[u8]>,
{
    type Item = CompletedImage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let fragment = self.fragments.next()?;
            if let FrameEvent::ImageComplete(image) = self.reassembler.submit(fragment.as_ref()) {
                return Some(image);
            }
        }
    }
}

/// Check if data starts with JPEG SOI marker (0xFFD8)
#[inline]
pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] == 0xD8
}
