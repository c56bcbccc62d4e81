//! Upload checksum expected by the HAT bootloader.
//!
//! A 32-bit LFSR: the register starts at 1, and for every byte it is
//! shifted left by one (folding in the feedback polynomial when the top bit
//! falls out) and then XORed with the byte. The bootloader recomputes the
//! same value over the received image and rejects the upload on mismatch,
//! so the result must match bit for bit.

use hatlink_core::constants::{CHECKSUM_POLYNOMIAL, CHECKSUM_SEED};

/// Compute the bootloader checksum of `data`.
///
/// # Examples
///
/// ```
/// use hatlink_protocol::checksum;
///
/// assert_eq!(checksum(&[]), 1);
/// assert_eq!(checksum(&[1, 2]), 4);
/// ```
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(CHECKSUM_SEED, |u, &b| {
        let shifted = if u & 0x8000_0000 != 0 {
            (u << 1) ^ CHECKSUM_POLYNOMIAL
        } else {
            u << 1
        };
        shifted ^ u32::from(b)
    })
}
