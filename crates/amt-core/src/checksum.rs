//! RFC 1071 internet checksum.
//!
//! Relays validate the checksum of the synthesized IP header and of the
//! IGMPv3 report, so this must match the IP/IGMP algorithm bit for bit.

/// Compute the one's-complement internet checksum of `data`.
///
/// Words are read in network byte order. A trailing odd byte is padded with
/// a zero low byte. Writing the result big-endian into a zeroed checksum
/// field makes the checksum of the whole buffer zero.
#[must_use]
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum > 0xFFFF {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !(sum as u16)
}

/// Compute the checksum of `buf` and store it big-endian at `offset`.
///
/// The two bytes at `offset` are zeroed before summing.
pub(crate) fn fill_checksum(buf: &mut [u8], offset: usize) {
    buf[offset] = 0;
    buf[offset + 1] = 0;
    let checksum = internet_checksum(buf);
    buf[offset..offset + 2].copy_from_slice(&checksum.to_be_bytes());
}
