//! Journaled writes into an [`Image`]

use log::trace;

use crate::image::{Image, LayoutError, SegmentMap};

/// One recorded write
#[derive(Debug)]
struct Entry {
    /// Where the write landed in the buffer at the time it was made
    offset: usize,
    /// Bytes the write replaced
    removed: Vec<u8>,
    /// Number of bytes the write inserted
    inserted: usize,
}

/// Writes into an image while remembering how to undo every write.
///
/// Dropping the journal without calling [`Journal::commit`] puts back every replaced byte, in
/// reverse order, along with the original segment layout. The image is left exactly as it was
/// before the first write, however far the writes got.
#[derive(Debug)]
pub struct Journal<'a> {
    /// Image being written
    image: &'a mut Image,
    /// Layout before the first write
    layout: Option<SegmentMap>,
    /// Writes made so far, oldest first
    entries: Vec<Entry>,
    /// Whether the writes are kept on drop
    committed: bool,
}
impl<'a> Journal<'a> {
    /// Starts a journal over `image`
    pub fn new(image: &'a mut Image) -> Self {
        Self {
            image,
            layout: None,
            entries: Vec::new(),
            committed: false,
        }
    }

    /// Replaces `len` bytes at `offset` with `bytes`.
    ///
    /// When the sizes differ the buffer is spliced and the segment map is rebuilt around the
    /// change. The caller must have checked `offset + len` is inside the buffer.
    pub fn write(&mut self, offset: usize, len: usize, bytes: &[u8]) -> Result<(), LayoutError> {
        let delta = bytes.len() as i64 - len as i64;
        let layout = match delta {
            0 => None,
            delta => Some(self.image.segments().resized(offset as u64, delta)?),
        };

        let removed = self
            .image
            .bytes_mut()
            .splice(offset..offset + len, bytes.iter().copied())
            .collect();
        self.entries.push(Entry {
            offset,
            removed,
            inserted: bytes.len(),
        });
        trace!("wrote {} byte(s) at {:#x}", bytes.len(), offset);

        if let Some(layout) = layout {
            let previous = self.image.segments().clone();
            self.image.set_segments(layout)?;
            self.layout.get_or_insert(previous);
        }
        Ok(())
    }

    /// Number of writes made so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps every write
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Journal<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        trace!("rolling back {} write(s)", self.entries.len());
        let bytes = self.image.bytes_mut();
        for entry in self.entries.drain(..).rev() {
            bytes.splice(entry.offset..entry.offset + entry.inserted, entry.removed);
        }
        if let Some(layout) = self.layout.take() {
            self.image.replace_segments(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Journal;
    use crate::image::{Image, Segment, SegmentMap};

    fn two_segments() -> Image {
        let segments = SegmentMap::new(vec![
            Segment::new(0x1000u64, 0, 4),
            Segment::new(0x2000u64, 4, 4),
        ])
        .unwrap();
        Image::new(vec![1, 2, 3, 4, 5, 6, 7, 8], segments).unwrap()
    }

    #[test]
    /// Test write and rollback functionality
    fn test_rollback() {
        let mut image = two_segments();
        {
            let mut journal = Journal::new(&mut image);
            journal.write(1, 2, &[9, 9]).unwrap();
            journal.write(5, 1, &[0, 0, 0]).unwrap();
            assert_eq!(journal.len(), 2);
        }
        assert_eq!(image.bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(image.segments(), two_segments().segments());
    }

    #[test]
    fn test_commit() {
        let mut image = two_segments();
        let mut journal = Journal::new(&mut image);
        journal.write(1, 2, &[9, 9]).unwrap();
        journal.commit();
        assert_eq!(image.bytes(), [1, 9, 9, 4, 5, 6, 7, 8]);
    }

    #[test]
    /// Growing the first segment moves the second one along in the file
    fn test_resizing_write() {
        let mut image = two_segments();
        let mut journal = Journal::new(&mut image);
        journal.write(2, 1, &[0xa, 0xb, 0xc]).unwrap();
        journal.commit();
        assert_eq!(image.bytes(), [1, 2, 0xa, 0xb, 0xc, 4, 5, 6, 7, 8]);
        let segments = image.segments().segments();
        assert_eq!(segments[0].size, 6);
        assert_eq!(segments[1].file_offset, 6);
    }
}
