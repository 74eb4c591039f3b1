//! Maps virtual addresses onto file offsets using the image's load layout

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::VirtualAddress;

/// Errors while resolving an address against a [`SegmentMap`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No segment contains the address
    #[error("address {0} is not mapped by any segment")]
    UnmappedAddress(VirtualAddress),
    /// The range starts inside a segment but does not end inside the same one
    #[error("range {address}+{length:#x} crosses the end of its segment at {segment_end}")]
    CrossesSegmentBoundary {
        /// Start of the range
        address: VirtualAddress,
        /// Length of the range in bytes
        length: u64,
        /// First virtual address past the containing segment
        segment_end: VirtualAddress,
    },
    /// A file range lies outside the image buffer
    #[error("file range {start:#x}..{end:#x} is outside the {len:#x} byte image")]
    OutOfImage {
        /// Start offset
        start: u64,
        /// End offset (exclusive)
        end: u64,
        /// Image length
        len: u64,
    },
}

/// Errors describing an invalid load layout
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// Segments must map at least one byte
    #[error("segment at {0} is empty")]
    EmptySegment(VirtualAddress),
    /// The segment's virtual or file range wraps around
    #[error("segment at {0} overflows the address space")]
    SegmentOverflow(VirtualAddress),
    /// Two segments claim the same virtual addresses
    #[error("segments at {0} and {1} overlap in virtual memory")]
    VirtualOverlap(VirtualAddress, VirtualAddress),
    /// Two segments claim the same bytes of the file
    #[error("segments at {0} and {1} overlap in the file")]
    FileOverlap(VirtualAddress, VirtualAddress),
    /// The segment's file range is not backed by the image buffer
    #[error("segment at {base} needs file bytes up to {end:#x}, but the image is {len:#x} bytes")]
    SegmentOutOfFile {
        /// Segment base
        base: VirtualAddress,
        /// End of the segment's file range
        end: u64,
        /// Image length
        len: u64,
    },
    /// Resizing an edit would shrink a segment below zero bytes
    #[error("resizing segment at {0} by {1} bytes leaves it empty or negative")]
    ResizeUnderflow(VirtualAddress, i64),
    /// A resized file offset does not belong to any segment
    #[error("file offset {0:#x} is not covered by any segment")]
    UnmappedFileOffset(u64),
}

/// One contiguous mapped region of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Virtual address the first byte is loaded at
    pub virtual_base: VirtualAddress,
    /// Position of the first byte in the file
    pub file_offset: u64,
    /// Number of bytes mapped
    pub size: u64,
}

impl Segment {
    /// Creates a segment
    pub fn new(virtual_base: impl Into<VirtualAddress>, file_offset: u64, size: u64) -> Self {
        Self {
            virtual_base: virtual_base.into(),
            file_offset,
            size,
        }
    }

    /// First virtual address past the segment
    pub fn end(&self) -> Result<VirtualAddress, LayoutError> {
        self.virtual_base
            .checked_add(self.size)
            .map_err(|_| LayoutError::SegmentOverflow(self.virtual_base))
    }

    /// Whether `addr` falls inside the segment
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.offset_from(self.virtual_base)
            .map(|delta| delta < self.size)
            .unwrap_or(false)
    }

    /// File range backing the segment
    pub fn file_range(&self) -> Range<u64> {
        self.file_offset..self.file_offset + self.size
    }
}

/// Ordered, non-overlapping set of segments describing an image's load layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Segment>", into = "Vec<Segment>")]
pub struct SegmentMap {
    /// Segments sorted by virtual base
    segments: Vec<Segment>,
}

impl SegmentMap {
    /// Builds a layout, rejecting empty, wrapping or overlapping segments
    pub fn new(mut segments: Vec<Segment>) -> Result<Self, LayoutError> {
        for segment in &segments {
            if segment.size == 0 {
                return Err(LayoutError::EmptySegment(segment.virtual_base));
            }
            segment.end()?;
            if segment.file_offset.checked_add(segment.size).is_none() {
                return Err(LayoutError::SegmentOverflow(segment.virtual_base));
            }
        }

        segments.sort_by_key(|s| s.virtual_base);
        for pair in segments.windows(2) {
            // sorted by base, so only neighbours can overlap
            if pair[0].end()? > pair[1].virtual_base {
                return Err(LayoutError::VirtualOverlap(
                    pair[0].virtual_base,
                    pair[1].virtual_base,
                ));
            }
        }

        let mut by_file: Vec<_> = segments.iter().collect();
        by_file.sort_by_key(|s| s.file_offset);
        for pair in by_file.windows(2) {
            if pair[0].file_range().end > pair[1].file_offset {
                return Err(LayoutError::FileOverlap(
                    pair[0].virtual_base,
                    pair[1].virtual_base,
                ));
            }
        }

        Ok(Self { segments })
    }

    /// Layout of a raw image loaded in one piece at `base`, like an iBSS or iBEC
    pub fn flat(base: impl Into<VirtualAddress>, len: u64) -> Result<Self, LayoutError> {
        Self::new(vec![Segment::new(base, 0, len)])
    }

    /// Segments sorted by virtual base
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The segment containing `addr`, if any
    pub fn segment_for(&self, addr: VirtualAddress) -> Option<&Segment> {
        // the last segment starting at or below `addr` is the only candidate
        let idx = self
            .segments
            .partition_point(|s| s.virtual_base <= addr)
            .checked_sub(1)?;
        let segment = &self.segments[idx];
        segment.contains(addr).then_some(segment)
    }

    /// Resolves a virtual address to its unique file offset
    pub fn resolve(&self, addr: VirtualAddress) -> Result<u64, ResolveError> {
        let segment = self
            .segment_for(addr)
            .ok_or(ResolveError::UnmappedAddress(addr))?;
        let delta = addr
            .offset_from(segment.virtual_base)
            .map_err(|_| ResolveError::UnmappedAddress(addr))?;
        Ok(segment.file_offset + delta)
    }

    /// Resolves `[addr, addr + length)` to a file range contained in a single segment
    pub fn resolve_range(
        &self,
        addr: VirtualAddress,
        length: u64,
    ) -> Result<Range<u64>, ResolveError> {
        let segment = self
            .segment_for(addr)
            .ok_or(ResolveError::UnmappedAddress(addr))?;
        let start = self.resolve(addr)?;
        let segment_end = segment
            .end()
            .map_err(|_| ResolveError::UnmappedAddress(addr))?;

        let fits = addr
            .checked_add(length)
            .map(|end| end <= segment_end)
            .unwrap_or(false);
        if !fits {
            return Err(ResolveError::CrossesSegmentBoundary {
                address: addr,
                length,
                segment_end,
            });
        }
        Ok(start..start + length)
    }

    /// Layout after `delta` bytes are inserted (or removed, when negative) at file offset `at`.
    ///
    /// The segment whose file range holds `at` grows or shrinks, every segment stored after it
    /// in the file moves by `delta`. Virtual bases are left alone.
    pub fn resized(&self, at: u64, delta: i64) -> Result<Self, LayoutError> {
        if delta == 0 {
            return Ok(self.clone());
        }
        let owner = self
            .segments
            .iter()
            .position(|s| s.file_range().contains(&at))
            .ok_or(LayoutError::UnmappedFileOffset(at))?;

        let segments = self
            .segments
            .iter()
            .enumerate()
            .map(|(idx, segment)| {
                let mut segment = *segment;
                if idx == owner {
                    segment.size = shift(segment.size, delta)
                        .filter(|&size| size > 0)
                        .ok_or(LayoutError::ResizeUnderflow(segment.virtual_base, delta))?;
                } else if segment.file_offset > at {
                    segment.file_offset = shift(segment.file_offset, delta)
                        .ok_or(LayoutError::ResizeUnderflow(segment.virtual_base, delta))?;
                }
                Ok(segment)
            })
            .collect::<Result<Vec<_>, LayoutError>>()?;
        Self::new(segments)
    }
}

/// Applies a signed delta to an unsigned quantity
fn shift(value: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        value.checked_add(delta.unsigned_abs())
    } else {
        value.checked_sub(delta.unsigned_abs())
    }
}

impl TryFrom<Vec<Segment>> for SegmentMap {
    type Error = LayoutError;

    fn try_from(segments: Vec<Segment>) -> Result<Self, Self::Error> {
        Self::new(segments)
    }
}

impl From<SegmentMap> for Vec<Segment> {
    fn from(map: SegmentMap) -> Self {
        map.segments
    }
}

#[cfg(test)]
mod tests {
    use super::{LayoutError, ResolveError, Segment, SegmentMap};
    use crate::address::VirtualAddress;

    /// Two segments with a gap between them, stored back to back in the file
    fn layout() -> SegmentMap {
        SegmentMap::new(vec![
            Segment::new(0x8400_0000, 0x0, 0x1000),
            Segment::new(0x8400_2000, 0x1000, 0x800),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve() {
        let map = layout();
        assert_eq!(map.resolve(VirtualAddress::new(0x8400_0000)), Ok(0));
        assert_eq!(map.resolve(VirtualAddress::new(0x8400_00fc)), Ok(0xfc));
        assert_eq!(map.resolve(VirtualAddress::new(0x8400_2010)), Ok(0x1010));
    }

    #[test]
    /// The last byte of a segment resolves, the byte after it does not
    fn test_segment_edges() {
        let map = layout();
        assert_eq!(map.resolve(VirtualAddress::new(0x8400_0fff)), Ok(0xfff));
        assert_eq!(
            map.resolve(VirtualAddress::new(0x8400_1000)),
            Err(ResolveError::UnmappedAddress(VirtualAddress::new(0x8400_1000)))
        );
        assert_eq!(map.resolve(VirtualAddress::new(0x8400_27ff)), Ok(0x17ff));
        assert!(map.resolve(VirtualAddress::new(0x8400_2800)).is_err());
        assert!(map.resolve(VirtualAddress::new(0x83ff_ffff)).is_err());
    }

    #[test]
    fn test_resolve_range() {
        let map = layout();
        assert_eq!(
            map.resolve_range(VirtualAddress::new(0x8400_0ffc), 4),
            Ok(0xffc..0x1000)
        );
        assert_eq!(
            map.resolve_range(VirtualAddress::new(0x8400_0ffe), 4),
            Err(ResolveError::CrossesSegmentBoundary {
                address: VirtualAddress::new(0x8400_0ffe),
                length: 4,
                segment_end: VirtualAddress::new(0x8400_1000),
            })
        );
        assert_eq!(
            map.resolve_range(VirtualAddress::new(0x8400_0010), 0),
            Ok(0x10..0x10)
        );
    }

    #[test]
    /// Adjacent segments in virtual memory still may not share a patch
    fn test_range_across_adjacent_segments() {
        let map = SegmentMap::new(vec![
            Segment::new(0x1000, 0x0, 0x100),
            Segment::new(0x1100, 0x200, 0x100),
        ])
        .unwrap();
        assert!(matches!(
            map.resolve_range(VirtualAddress::new(0x10fe), 4),
            Err(ResolveError::CrossesSegmentBoundary { .. })
        ));
    }

    #[test]
    fn test_invalid_layouts() {
        assert_eq!(
            SegmentMap::new(vec![Segment::new(0x1000, 0, 0)]),
            Err(LayoutError::EmptySegment(VirtualAddress::new(0x1000)))
        );
        assert!(matches!(
            SegmentMap::new(vec![
                Segment::new(0x1000, 0x0, 0x100),
                Segment::new(0x10ff, 0x100, 0x100),
            ]),
            Err(LayoutError::VirtualOverlap(..))
        ));
        assert!(matches!(
            SegmentMap::new(vec![
                Segment::new(0x1000, 0x0, 0x100),
                Segment::new(0x2000, 0x80, 0x100),
            ]),
            Err(LayoutError::FileOverlap(..))
        ));
    }

    #[test]
    /// Growing the first segment pushes the second one further into the file
    fn test_resized() {
        let grown = layout().resized(0x10, 4).unwrap();
        assert_eq!(grown.segments()[0].size, 0x1004);
        assert_eq!(grown.segments()[1].file_offset, 0x1004);
        assert_eq!(grown.segments()[1].virtual_base, VirtualAddress::new(0x8400_2000));

        let shrunk = layout().resized(0x1010, -2).unwrap();
        assert_eq!(shrunk.segments()[0], layout().segments()[0]);
        assert_eq!(shrunk.segments()[1].size, 0x7fe);
    }

    #[test]
    fn test_resized_into_neighbour() {
        let map = SegmentMap::new(vec![
            Segment::new(0x1000, 0x0, 0x100),
            Segment::new(0x1100, 0x100, 0x100),
        ])
        .unwrap();
        assert!(matches!(
            map.resized(0x10, 2),
            Err(LayoutError::VirtualOverlap(..))
        ));
    }
}
