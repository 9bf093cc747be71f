use std::borrow::Cow;
use std::mem::size_of;

use byteorder::{BigEndian, ByteOrder};
use heed::BoxedError;

use crate::PhashId;

pub const METADATA_KEY: &str = "metadata";

/// Index bookkeeping, stored under a fixed key of the `main` database so it
/// can be read without scanning anything.
///
/// `next_phash_id` is persisted rather than derived from the highest live id:
/// ids must never be reused, even after the highest one is forgotten. `root`
/// replaces the relational "the node whose parent is null" lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub next_phash_id: PhashId,
    pub root: Option<PhashId>,
}

impl Default for Metadata {
    fn default() -> Metadata {
        Metadata { next_phash_id: 1, root: None }
    }
}

pub enum MetadataCodec {}

impl<'a> heed::BytesEncode<'a> for MetadataCodec {
    type EItem = Metadata;

    fn bytes_encode(metadata: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let mut output = Vec::with_capacity(2 * size_of::<u32>() + 1);
        output.extend_from_slice(&metadata.next_phash_id.to_be_bytes());
        match metadata.root {
            Some(root) => {
                output.push(1);
                output.extend_from_slice(&root.to_be_bytes());
            }
            None => output.push(0),
        }

        Ok(Cow::Owned(output))
    }
}

impl heed::BytesDecode<'_> for MetadataCodec {
    type DItem = Metadata;

    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem, BoxedError> {
        let next_phash_id = BigEndian::read_u32(bytes);
        let bytes = &bytes[size_of::<u32>()..];
        let root = match bytes[0] {
            0 => None,
            _ => Some(BigEndian::read_u32(&bytes[1..])),
        };

        Ok(Metadata { next_phash_id, root })
    }
}

/// The value of a search-cache row: up to which Hamming radius the file has
/// already been compared against everything, or `None` for never searched
/// since its phashes last changed.
pub enum SearchedDistanceCodec {}

impl<'a> heed::BytesEncode<'a> for SearchedDistanceCodec {
    type EItem = Option<u32>;

    fn bytes_encode(distance: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        match distance {
            // A Hamming distance over 64 bits fits in one byte.
            Some(distance) => Ok(Cow::Owned(vec![*distance as u8])),
            None => Ok(Cow::Owned(Vec::new())),
        }
    }
}

impl heed::BytesDecode<'_> for SearchedDistanceCodec {
    type DItem = Option<u32>;

    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem, BoxedError> {
        Ok(bytes.first().map(|&distance| distance as u32))
    }
}
