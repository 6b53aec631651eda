//! Uncompressed block path: copy raw device bytes straight into pages.

use crate::{CodecError, PageActor};
use bsq_block::RawBlockSet;

/// Copy the payload of `raw` into `output` with two independent cursors,
/// one over the device buffers and one over the output pages.
///
/// Returns the number of bytes copied. Fails without a partial success if
/// the payload does not fit the actor's capacity.
pub fn copy_uncompressed(raw: &RawBlockSet, output: &mut PageActor) -> Result<usize, CodecError> {
    if raw.len() > output.remaining() {
        return Err(CodecError::Overflow {
            codec: "uncompressed",
            capacity: output.capacity(),
        });
    }

    let mut copied = 0;
    for mut segment in raw.segments() {
        while !segment.is_empty() {
            let Some(page) = output.current_page()? else {
                return Err(CodecError::Overflow {
                    codec: "uncompressed",
                    capacity: output.capacity(),
                });
            };
            let n = page.len().min(segment.len());
            page[..n].copy_from_slice(&segment[..n]);
            output.advance(n);
            segment = &segment[n..];
            copied += n;
        }
    }
    output.finish();
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Codec, Decompressor};
    use bsq_types::PAGE_CACHE_SIZE;
    use proptest::prelude::*;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn copies_across_buffer_and_page_boundaries() {
        let payload = patterned(3 * PAGE_CACHE_SIZE + 517);
        // 1000-byte device buffers never line up with 4096-byte pages.
        let raw = RawBlockSet::from_contiguous(&payload, 1000, 333).expect("raw");
        let mut actor = PageActor::new(4 * PAGE_CACHE_SIZE);

        let n = copy_uncompressed(&raw, &mut actor).expect("copy");
        assert_eq!(n, payload.len());
        assert_eq!(actor.to_vec().expect("vec"), payload);
        assert_eq!(actor.last_page_len(), 517);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = patterned(PAGE_CACHE_SIZE + 1);
        let raw = RawBlockSet::from_contiguous(&payload, 512, 0).expect("raw");
        let mut actor = PageActor::new(PAGE_CACHE_SIZE);

        let err = copy_uncompressed(&raw, &mut actor).unwrap_err();
        assert!(matches!(err, CodecError::Overflow { .. }));
        assert_eq!(actor.written(), 0);
    }

    #[test]
    fn empty_payload_copies_nothing() {
        let raw = RawBlockSet::from_contiguous(&[], 512, 0).expect("raw");
        let mut actor = PageActor::new(PAGE_CACHE_SIZE);
        assert_eq!(copy_uncompressed(&raw, &mut actor).expect("copy"), 0);
        assert!(actor.pages().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_segmentation_copies_verbatim(
            payload in proptest::collection::vec(any::<u8>(), 0..5 * PAGE_CACHE_SIZE),
            block_size in 1_usize..3000,
            offset_seed in any::<usize>(),
        ) {
            let offset = offset_seed % block_size;
            let raw = RawBlockSet::from_contiguous(&payload, block_size, offset).expect("raw");
            let mut copied = PageActor::new(5 * PAGE_CACHE_SIZE);
            let mut via_codec = PageActor::new(5 * PAGE_CACHE_SIZE);

            let n = copy_uncompressed(&raw, &mut copied).expect("copy");
            prop_assert_eq!(n, payload.len());
            let out = copied.to_vec().expect("vec");
            prop_assert_eq!(&out, &payload);
            prop_assert_eq!(copied.pages().len(), payload.len().div_ceil(PAGE_CACHE_SIZE));

            Codec::Identity.decompress(&raw, &mut via_codec).expect("identity");
            prop_assert_eq!(via_codec.to_vec().expect("vec"), out);
        }
    }
}
