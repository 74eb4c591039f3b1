//! # Image
//!
//! The in-memory copy of a binary image together with its load layout.
//! Everything outside the [`patcher`](crate::patcher) module only gets read access.

pub mod resolve;

use std::ops::Range;

use crate::address::VirtualAddress;

pub use self::resolve::{LayoutError, ResolveError, Segment, SegmentMap};

/// A binary image and the segments describing how it is loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Raw file contents
    bytes: Vec<u8>,
    /// Load layout of `bytes`
    segments: SegmentMap,
}

impl Image {
    /// Wraps file contents, checking every segment is backed by the buffer
    pub fn new(bytes: Vec<u8>, segments: SegmentMap) -> Result<Self, LayoutError> {
        check_backed(&segments, bytes.len())?;
        Ok(Self { bytes, segments })
    }

    /// Wraps a raw image (no container) loaded at `base`
    pub fn raw(bytes: Vec<u8>, base: impl Into<VirtualAddress>) -> Result<Self, LayoutError> {
        let segments = SegmentMap::flat(base, bytes.len() as u64)?;
        Ok(Self { bytes, segments })
    }

    /// The whole buffer
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Load layout
    pub fn segments(&self) -> &SegmentMap {
        &self.segments
    }

    /// Buffer length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads `range` out of the file
    pub fn read(&self, range: Range<u64>) -> Result<&[u8], ResolveError> {
        let out_of_image = || ResolveError::OutOfImage {
            start: range.start,
            end: range.end,
            len: self.bytes.len() as u64,
        };
        let start = usize::try_from(range.start).map_err(|_| out_of_image())?;
        let end = usize::try_from(range.end).map_err(|_| out_of_image())?;
        self.bytes.get(start..end).ok_or_else(out_of_image)
    }

    /// Resolves `[addr, addr + len)` and reads it
    pub fn read_virtual(&self, addr: VirtualAddress, len: u64) -> Result<&[u8], ResolveError> {
        let range = self.segments.resolve_range(addr, len)?;
        self.read(range)
    }

    /// Consumes the image, handing back the (possibly patched) file contents
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Mutable access for the applier
    pub(crate) fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    /// Replaces the layout after a size-changing edit
    pub(crate) fn set_segments(&mut self, segments: SegmentMap) -> Result<(), LayoutError> {
        check_backed(&segments, self.bytes.len())?;
        self.segments = segments;
        Ok(())
    }

    /// Swaps in a layout that is already known to be valid for the buffer, returning the old one
    pub(crate) fn replace_segments(&mut self, segments: SegmentMap) -> SegmentMap {
        std::mem::replace(&mut self.segments, segments)
    }
}

/// Checks every segment's file range lies inside a buffer of `len` bytes
fn check_backed(segments: &SegmentMap, len: usize) -> Result<(), LayoutError> {
    for segment in segments.segments() {
        let end = segment.file_range().end;
        if end > len as u64 {
            return Err(LayoutError::SegmentOutOfFile {
                base: segment.virtual_base,
                end,
                len: len as u64,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Image, LayoutError, ResolveError, Segment, SegmentMap};
    use crate::address::VirtualAddress;

    #[test]
    fn test_raw_image() {
        let image = Image::raw((0u8..=255).collect(), 0x8400_0000u64).unwrap();
        assert_eq!(
            image.read_virtual(VirtualAddress::new(0x8400_0010), 4),
            Ok(&[0x10, 0x11, 0x12, 0x13][..])
        );
        assert!(matches!(
            image.read_virtual(VirtualAddress::new(0x8400_00fe), 4),
            Err(ResolveError::CrossesSegmentBoundary { .. })
        ));
    }

    #[test]
    /// A segment claiming bytes past the end of the file is rejected
    fn test_unbacked_segment() {
        let segments = SegmentMap::new(vec![Segment::new(0x1000, 0x10, 0x20)]).unwrap();
        assert_eq!(
            Image::new(vec![0; 0x20], segments),
            Err(LayoutError::SegmentOutOfFile {
                base: VirtualAddress::new(0x1000),
                end: 0x30,
                len: 0x20,
            })
        );
    }

    #[test]
    fn test_read_out_of_image() {
        let image = Image::raw(vec![0; 8], 0u64).unwrap();
        assert!(image.read(4..8).is_ok());
        assert!(matches!(image.read(6..10), Err(ResolveError::OutOfImage { .. })));
    }
}
