//! Internet checksum helpers.
//!
//! NAT rewrites touch only a handful of 16-bit words, so checksums are
//! patched in place with the RFC 1624 update rather than recomputed.

use std::net::Ipv4Addr;

/// Compute the ones' complement sum of 16-bit words in a byte slice.
#[inline]
pub fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    // Odd trailing byte is padded with zero
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    sum
}

/// Fold a 32-bit sum into a 16-bit ones' complement value.
#[inline]
pub fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Compute the final ones' complement checksum.
#[inline]
pub fn compute_checksum(data: &[u8]) -> u16 {
    !fold_checksum(ones_complement_sum(data))
}

/// IPv4 pseudo-header contribution to a TCP/UDP checksum.
pub fn ipv4_pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let src = src.octets();
    let dst = dst.octets();

    let mut sum: u32 = 0;
    sum += u16::from_be_bytes([src[0], src[1]]) as u32;
    sum += u16::from_be_bytes([src[2], src[3]]) as u32;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u32;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u32;
    sum += protocol as u32;
    sum += length as u32;
    sum
}

/// Compute a TCP/UDP checksum from scratch over `segment`.
///
/// The checksum field inside `segment` must be zero. Used to build test
/// packets and to verify incremental updates.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = ipv4_pseudo_header_sum(src, dst, protocol, segment.len() as u16)
        + ones_complement_sum(segment);
    !fold_checksum(sum)
}

/// Update a checksum incrementally when a 16-bit value changes.
///
/// `HC' = ~(~HC + ~m + m')` from RFC 1624.
#[inline]
pub fn update_checksum_16(old_checksum: u16, old_value: u16, new_value: u16) -> u16 {
    let hc = !old_checksum as u32;
    let m = !old_value as u32;
    let m_prime = new_value as u32;

    !fold_checksum(hc + m + m_prime)
}

/// Update a checksum incrementally when a 32-bit value (an address) changes.
#[inline]
pub fn update_checksum_32(old_checksum: u16, old_value: u32, new_value: u32) -> u16 {
    let old_hi = (old_value >> 16) as u16;
    let old_lo = old_value as u16;
    let new_hi = (new_value >> 16) as u16;
    let new_lo = new_value as u16;

    let checksum = update_checksum_16(old_checksum, old_hi, new_hi);
    update_checksum_16(checksum, old_lo, new_lo)
}
