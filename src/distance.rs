/// The Hamming distance between two 64-bit perceptual hashes: the number of
/// positions at which the corresponding bits differ.
///
/// `d(u,v) = popcount(u ^ v)`, an integer in `[0, 64]`.
#[inline]
pub fn hamming(u: u64, v: u64) -> u32 {
    (u ^ v).count_ones()
}
