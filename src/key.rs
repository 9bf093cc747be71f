use std::borrow::Cow;
use std::mem::size_of;

use byteorder::{BigEndian, ByteOrder};
use heed::BoxedError;

/// A two-column key. Both halves are encoded big endian so that every row
/// sharing a `group` forms one contiguous LMDB range, reachable with
/// [`PairPrefixCodec`].
///
/// The association table uses `(phash_id, file_id)`, its reverse index
/// `(file_id, phash_id)`, and the per-service file tables
/// `(service_id, file_id)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PairKey {
    pub group: u32,
    pub item: u32,
}

impl PairKey {
    pub const fn new(group: u32, item: u32) -> PairKey {
        PairKey { group, item }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut output = [0; 8];
        output[..size_of::<u32>()].copy_from_slice(&self.group.to_be_bytes());
        output[size_of::<u32>()..].copy_from_slice(&self.item.to_be_bytes());
        output
    }
}

pub enum PairKeyCodec {}

impl<'a> heed::BytesEncode<'a> for PairKeyCodec {
    type EItem = PairKey;

    fn bytes_encode(key: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        Ok(Cow::Owned(key.to_bytes().to_vec()))
    }
}

impl heed::BytesDecode<'_> for PairKeyCodec {
    type DItem = PairKey;

    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem, BoxedError> {
        let group = BigEndian::read_u32(bytes);
        let item = BigEndian::read_u32(&bytes[size_of::<u32>()..]);

        Ok(PairKey::new(group, item))
    }
}

/// Encodes only the group half of a [`PairKey`], to query every row of one
/// group with a prefix iterator.
pub enum PairPrefixCodec {}

impl<'a> heed::BytesEncode<'a> for PairPrefixCodec {
    type EItem = u32;

    fn bytes_encode(group: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        Ok(Cow::Owned(group.to_be_bytes().to_vec()))
    }
}
