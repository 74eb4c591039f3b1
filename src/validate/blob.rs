//! Validation of [`BlobPatch`]es

use crate::image::Image;
use crate::patch::BlobPatch;

use super::{Edit, ValidationErrorKind};

/// Resolves the blob's target range and records the bytes it overwrites. What was there before is
/// never checked.
pub(crate) fn validate(
    patch: &BlobPatch,
    index: usize,
    image: &Image,
) -> Result<Edit, ValidationErrorKind> {
    let content = patch.new_content();
    if content.is_empty() {
        return Err(ValidationErrorKind::EmptyBlob);
    }

    let range = image
        .segments()
        .resolve_range(patch.address(), content.len() as u64)?;
    let old_bytes = image.read(range.clone())?.to_vec();

    Ok(Edit::new(
        index,
        patch.address(),
        range.start,
        old_bytes,
        content.to_vec(),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::image::{Image, ResolveError, Segment, SegmentMap};
    use crate::patch::BlobPatch;
    use crate::validate::ValidationErrorKind;

    #[test]
    fn test_blob() {
        let image = Image::raw(vec![0xaa; 0x200], 0x8400_0000u64).unwrap();
        let patch = BlobPatch::new(0x8400_00fcu64, [0x55; 32], "Payload");
        let edit = validate(&patch, 7, &image).unwrap();
        assert_eq!(edit.patch_index(), 7);
        assert_eq!(edit.range(), 0xfc..0x11c);
        assert_eq!(edit.old_bytes(), [0xaa; 32]);
        assert_eq!(edit.new_bytes(), [0x55; 32]);
    }

    #[test]
    fn test_empty_blob() {
        let image = Image::raw(vec![0; 16], 0u64).unwrap();
        let patch = BlobPatch::new(0u64, Vec::new(), "Nothing");
        assert_eq!(
            validate(&patch, 0, &image).unwrap_err(),
            ValidationErrorKind::EmptyBlob
        );
    }

    #[test]
    /// Blobs may not spill from one segment into the next, even when the two are adjacent
    fn test_straddling_blob() {
        let segments = SegmentMap::new(vec![
            Segment::new(0x1000u64, 0, 0x10),
            Segment::new(0x1010u64, 0x10, 0x10),
        ])
        .unwrap();
        let image = Image::new(vec![0; 0x20], segments).unwrap();
        let patch = BlobPatch::new(0x100cu64, [1u8; 8], "Straddles");
        assert!(matches!(
            validate(&patch, 0, &image).unwrap_err(),
            ValidationErrorKind::Resolve(ResolveError::CrossesSegmentBoundary { .. })
        ));
    }
}
