//! Conversation addresses, node ids, and the MAC⇔node scrambling function
//! (spec.md §3, §4.2).
//!
//! Grounded on the teacher's small newtype-with-accessors style (see
//! `flux::shared::UserId` and the `ChannelId` handles in
//! `neutronium/src/net/endpoint.rs`), generalized to a packed bitfield since
//! `addr` here is `(node_id << 24) | port` rather than an opaque integer.

use std::fmt;

/// 64-bit overlay network identifier.
pub type Nwid = u64;

/// Lowest ephemeral port (high bit of the 24-bit port space set).
pub const EPHEMERAL_PORT_MIN: u32 = 0x800000;
/// Highest valid port.
pub const EPHEMERAL_PORT_MAX: u32 = 0xFFFFFF;

/// A 64-bit conversation address: 40-bit overlay node id in the upper bits,
/// 24-bit port in the lower bits.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Addr(u64);

impl Addr {
    /// Builds an address from a 40-bit node id and a 24-bit port. Panics in
    /// debug builds if either overflows its field; callers are expected to
    /// validate inputs that come from the wire before constructing one.
    pub fn new(node: u64, port: u32) -> Addr {
        debug_assert!(node < (1u64 << 40), "node id does not fit in 40 bits");
        debug_assert!(port <= EPHEMERAL_PORT_MAX, "port does not fit in 24 bits");
        Addr((node << 24) | (port as u64 & 0x00FF_FFFF))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Addr {
        Addr(raw)
    }

    #[inline]
    pub fn node(self) -> u64 {
        self.0 >> 24
    }

    #[inline]
    pub fn port(self) -> u32 {
        (self.0 & 0x00FF_FFFF) as u32
    }

    #[inline]
    pub fn is_ephemeral_port(self) -> bool {
        let p = self.port();
        p >= EPHEMERAL_PORT_MIN && p <= EPHEMERAL_PORT_MAX
    }

    #[inline]
    pub fn is_wildcard_node(self) -> bool {
        self.node() == 0
    }

    #[inline]
    pub fn with_port(self, port: u32) -> Addr {
        Addr::new(self.node(), port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}:{:06x}", self.node(), self.port())
    }
}

/// Derives the overlay MAC address for `node` on network `nwid`
/// (spec.md §4.2).
///
/// The high octet is derived from the network id's low byte, with the
/// well-known virtualization OUI byte `0x52` remapped to `0x32`. The node id
/// occupies the low 40 bits (MAC bytes 1–5); bytes 1–5 of `nwid` are then
/// XORed into those same MAC bytes, position for position.
pub fn node_to_mac(node: u64, nwid: Nwid) -> [u8; 6] {
    let nwid_bytes = nwid.to_le_bytes();
    let node_bytes = node.to_be_bytes(); // [_, _, _, b35..b0] in the top 3 + low 5 bytes

    let mut high = (nwid_bytes[0] & 0xfe) | 0x02;
    if high == 0x52 {
        high = 0x32;
    }

    let mut mac = [0u8; 6];
    mac[0] = high;
    // node's low 40 bits, big-endian, into mac[1..6].
    mac[1..6].copy_from_slice(&node_bytes[3..8]);

    // XOR nwid bytes 1..=5 into mac bytes 1..=5, position for position.
    for i in 0..5 {
        mac[1 + i] ^= nwid_bytes[1 + i];
    }

    mac
}

/// Recovers the 40-bit node id from a MAC address derived via
/// [`node_to_mac`] for the same `nwid`. The inversion is the same symmetric
/// XOR applied a second time.
pub fn mac_to_node(mac: [u8; 6], nwid: Nwid) -> u64 {
    let nwid_bytes = nwid.to_le_bytes();

    let mut node_bytes = mac;
    for i in 0..5 {
        node_bytes[1 + i] ^= nwid_bytes[1 + i];
    }

    let mut be = [0u8; 8];
    be[3..8].copy_from_slice(&node_bytes[1..6]);
    u64::from_be_bytes(be)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_packs_and_unpacks() {
        let a = Addr::new(0x00_1122_3344, 0x800001);
        assert_eq!(a.node(), 0x00_1122_3344);
        assert_eq!(a.port(), 0x800001);
        assert!(a.is_ephemeral_port());
    }

    #[test]
    fn addr_wildcard_node_is_zero() {
        let a = Addr::new(0, 7);
        assert!(a.is_wildcard_node());
        assert!(!a.is_ephemeral_port());
    }

    #[test]
    fn mac_roundtrip_sample_values() {
        let samples: &[(u64, u64)] = &[
            (0x0, 0x0),
            (0x1, 0x1),
            (0x0102030405, 0xaabbccddeeff),
            (0xffffffffff, 0xffffffffffffffff),
            (0x123456789a, 0x8056_0000_0000_0001),
        ];
        for &(node, nwid) in samples {
            let mac = node_to_mac(node, nwid);
            assert_eq!(mac_to_node(mac, nwid), node, "roundtrip failed for {:#x}/{:#x}", node, nwid);
        }
    }

    #[test]
    fn mac_roundtrip_exhaustive_low_bits() {
        for node in 0u64..256 {
            for nwid in [0u64, 0x52, 0x01, 0xfe, 0xabcdef0123456789].iter().copied() {
                let mac = node_to_mac(node, nwid);
                assert_eq!(mac_to_node(mac, nwid), node);
            }
        }
    }

    #[test]
    fn mac_high_octet_avoids_vmware_oui() {
        // Any nwid whose low byte naturally produces 0x52 must remap to 0x32.
        let mac = node_to_mac(0, 0x53);
        assert_eq!(mac[0], 0x32);
    }

    #[test]
    fn mac_high_octet_has_locally_administered_bit() {
        for nwid in 0u64..=255 {
            let mac = node_to_mac(0, nwid);
            assert_eq!(mac[0] & 0x02, 0x02);
            assert_eq!(mac[0] & 0x01, 0x00);
        }
    }
}
