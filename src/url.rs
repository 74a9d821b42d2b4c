//! `zt://` URL parsing (spec.md §6). Trivial glue, kept as its own small
//! module the way the teacher keeps `util/src/bin/*` argument parsing
//! separate from the engine it configures.

use crate::error::{Result, TransportError};

/// A parsed `zt://<nwid>[/<node>]:<port>` URL.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ZtUrl {
    pub nwid: u64,
    /// `None` when the node segment was omitted entirely. A present `*` or
    /// literal `0` both parse to `Some(0)` (wildcard node), matching
    /// spec.md §6's "zero, wildcard `*`, or own node id" for listen URLs.
    pub node: Option<u64>,
    pub port: u32,
}

impl ZtUrl {
    /// Validates and resolves this URL for a `connect` (dial) operation:
    /// the node segment is mandatory and must fit in 40 bits, and the port
    /// must be nonzero.
    pub fn resolve_for_dial(self) -> Result<(u64, u64, u32)> {
        let node = self.node.ok_or(TransportError::AddressInvalid)?;
        if node >= 1u64 << 40 {
            return Err(TransportError::AddressInvalid);
        }
        if self.port == 0 {
            return Err(TransportError::AddressInvalid);
        }
        Ok((self.nwid, node, self.port))
    }

    /// Validates this URL for a `bind`/`listen` operation: the node segment
    /// is optional (wildcard), and port 0 means "allocate ephemerally."
    pub fn resolve_for_listen(self) -> Result<(u64, u64, u32)> {
        let node = self.node.unwrap_or(0);
        if node >= 1u64 << 40 {
            return Err(TransportError::AddressInvalid);
        }
        Ok((self.nwid, node, self.port))
    }
}

/// Parses a `zt://<nwid>[/<node>]:<port>` URL. `nwid` and `node` are
/// hexadecimal, `port` is decimal.
pub fn parse(url: &str) -> Result<ZtUrl> {
    let rest = url
        .strip_prefix("zt://")
        .ok_or(TransportError::AddressInvalid)?;

    let (addr_part, port_part) = rest
        .rsplit_once(':')
        .ok_or(TransportError::AddressInvalid)?;

    let port: u32 = port_part
        .parse()
        .map_err(|_| TransportError::AddressInvalid)?;
    if port > crate::addr::EPHEMERAL_PORT_MAX {
        return Err(TransportError::AddressInvalid);
    }

    let (nwid_str, node_str) = match addr_part.split_once('/') {
        Some((n, node)) => (n, Some(node)),
        None => (addr_part, None),
    };

    if nwid_str.is_empty() {
        return Err(TransportError::AddressInvalid);
    }
    let nwid = u64::from_str_radix(nwid_str, 16).map_err(|_| TransportError::AddressInvalid)?;

    let node = match node_str {
        None => None,
        Some("*") => Some(0),
        Some(s) => {
            let n = u64::from_str_radix(s, 16).map_err(|_| TransportError::AddressInvalid)?;
            Some(n)
        }
    };

    Ok(ZtUrl { nwid, node, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_url_without_node() {
        let url = parse("zt://8056c2e21c000001:0").unwrap();
        assert_eq!(url.nwid, 0x8056c2e21c000001);
        assert_eq!(url.node, None);
        assert_eq!(url.port, 0);
        let (nwid, node, port) = url.resolve_for_listen().unwrap();
        assert_eq!((nwid, node, port), (0x8056c2e21c000001, 0, 0));
    }

    #[test]
    fn parses_dial_url_with_node() {
        let url = parse("zt://8056c2e21c000001/1122334455:7").unwrap();
        assert_eq!(url.node, Some(0x1122334455));
        let (nwid, node, port) = url.resolve_for_dial().unwrap();
        assert_eq!((nwid, node, port), (0x8056c2e21c000001, 0x1122334455, 7));
    }

    #[test]
    fn wildcard_node_parses_as_zero() {
        let url = parse("zt://1/*:100").unwrap();
        assert_eq!(url.node, Some(0));
    }

    #[test]
    fn dial_requires_port_and_node() {
        let url = parse("zt://1:0").unwrap();
        assert!(matches!(
            url.resolve_for_dial(),
            Err(TransportError::AddressInvalid)
        ));

        let url = parse("zt://1/5:0").unwrap();
        assert!(matches!(
            url.resolve_for_dial(),
            Err(TransportError::AddressInvalid)
        ));
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse("http://1:0").is_err());
        assert!(parse("zt://1").is_err());
        assert!(parse("zt://zz:0").is_err());
    }
}
