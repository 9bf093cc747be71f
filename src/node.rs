use std::borrow::Cow;
use std::mem::size_of;

use byteorder::{BigEndian, ByteOrder};
use heed::BoxedError;

use crate::PhashId;

/// A vantage-point tree node, keyed by the phash id of its vantage point.
///
/// `radius` is set iff the node has an inner child: every phash reachable
/// through `inner` is within `radius` of the vantage point, every phash
/// reachable through `outer` is strictly further away. The populations count
/// the nodes of each child subtree, child root included, the node itself not.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Node {
    pub parent: Option<PhashId>,
    pub radius: Option<u32>,
    pub inner: Option<PhashId>,
    pub inner_population: u32,
    pub outer: Option<PhashId>,
    pub outer_population: u32,
}

impl Node {
    /// A fresh leaf under the given parent.
    pub fn leaf(parent: Option<PhashId>) -> Node {
        Node {
            parent,
            radius: None,
            inner: None,
            inner_population: 0,
            outer: None,
            outer_population: 0,
        }
    }

    /// The number of descendants of this node.
    pub fn population(&self) -> u64 {
        self.inner_population as u64 + self.outer_population as u64
    }
}

const PARENT_FLAG: u8 = 1 << 0;
const RADIUS_FLAG: u8 = 1 << 1;
const INNER_FLAG: u8 = 1 << 2;
const OUTER_FLAG: u8 = 1 << 3;

pub enum NodeCodec {}

impl<'a> heed::BytesEncode<'a> for NodeCodec {
    type EItem = Node;

    fn bytes_encode(node: &'a Self::EItem) -> Result<Cow<'a, [u8]>, BoxedError> {
        let mut output = Vec::with_capacity(2 + 5 * size_of::<u32>());

        let mut flags = 0;
        flags |= if node.parent.is_some() { PARENT_FLAG } else { 0 };
        flags |= if node.radius.is_some() { RADIUS_FLAG } else { 0 };
        flags |= if node.inner.is_some() { INNER_FLAG } else { 0 };
        flags |= if node.outer.is_some() { OUTER_FLAG } else { 0 };
        output.push(flags);

        if let Some(radius) = node.radius {
            // A Hamming distance over 64 bits fits in one byte.
            output.push(radius as u8);
        }
        if let Some(parent) = node.parent {
            output.extend_from_slice(&parent.to_be_bytes());
        }
        if let Some(inner) = node.inner {
            output.extend_from_slice(&inner.to_be_bytes());
        }
        if let Some(outer) = node.outer {
            output.extend_from_slice(&outer.to_be_bytes());
        }
        output.extend_from_slice(&node.inner_population.to_be_bytes());
        output.extend_from_slice(&node.outer_population.to_be_bytes());

        Ok(Cow::Owned(output))
    }
}

impl heed::BytesDecode<'_> for NodeCodec {
    type DItem = Node;

    fn bytes_decode(bytes: &[u8]) -> Result<Self::DItem, BoxedError> {
        let flags = bytes[0];
        let mut bytes = &bytes[1..];

        let radius = if flags & RADIUS_FLAG != 0 {
            let radius = bytes[0] as u32;
            bytes = &bytes[1..];
            Some(radius)
        } else {
            None
        };

        let mut read_id = |present: bool| {
            if present {
                let id = BigEndian::read_u32(bytes);
                bytes = &bytes[size_of::<u32>()..];
                Some(id)
            } else {
                None
            }
        };

        let parent = read_id(flags & PARENT_FLAG != 0);
        let inner = read_id(flags & INNER_FLAG != 0);
        let outer = read_id(flags & OUTER_FLAG != 0);

        let inner_population = BigEndian::read_u32(bytes);
        let outer_population = BigEndian::read_u32(&bytes[size_of::<u32>()..]);

        Ok(Node { parent, radius, inner, inner_population, outer, outer_population })
    }
}
