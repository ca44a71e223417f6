//! IPv4 address arithmetic for node allocation

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use super::TopologyError;

/// Parse a CIDR block into its network.
///
/// Host bits are allowed and masked off, so `192.168.42.2/24` yields
/// `192.168.42.0/24`.
pub fn parse_network(cidr: &str) -> Result<Ipv4Net, TopologyError> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|_| TopologyError::InvalidNetwork(cidr.to_string()))?;
    Ok(net.trunc())
}

/// Increment an address by one, failing at the top of the address space.
pub fn increment(addr: Ipv4Addr, network: &Ipv4Net) -> Result<Ipv4Addr, TopologyError> {
    u32::from(addr)
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or(TopologyError::AddressSpaceExhausted {
            network: *network,
        })
}

/// Check that a candidate lies strictly between the network and broadcast addresses.
pub fn ensure_usable(candidate: Ipv4Addr, network: &Ipv4Net) -> Result<Ipv4Addr, TopologyError> {
    if !network.contains(&candidate) || candidate == network.broadcast() {
        return Err(TopologyError::AddressSpaceExhausted { network: *network });
    }
    Ok(candidate)
}

/// Next node address.
///
/// The first allocation skips the gateway (network + 1) and lands on
/// network + 2; later allocations follow the previous node directly.
pub fn next_node_address(
    network: &Ipv4Net,
    previous: Option<Ipv4Addr>,
) -> Result<Ipv4Addr, TopologyError> {
    let base = match previous {
        Some(prev) => prev,
        None => increment(network.network(), network)?,
    };
    ensure_usable(increment(base, network)?, network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_masks_host_bits() {
        let net = parse_network("192.168.42.2/24").unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(192, 168, 42, 0));
        assert_eq!(net.broadcast(), Ipv4Addr::new(192, 168, 42, 255));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_network("not-a-cidr"),
            Err(TopologyError::InvalidNetwork(_))
        ));
        assert!(matches!(
            parse_network("10.0.0.0/33"),
            Err(TopologyError::InvalidNetwork(_))
        ));
        assert!(matches!(
            parse_network("fd00::/64"),
            Err(TopologyError::InvalidNetwork(_))
        ));
    }

    #[test]
    fn test_first_address_skips_gateway() {
        let net = parse_network("10.1.0.0/16").unwrap();
        let first = next_node_address(&net, None).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 1, 0, 2));
        let second = next_node_address(&net, Some(first)).unwrap();
        assert_eq!(second, Ipv4Addr::new(10, 1, 0, 3));
    }

    #[test]
    fn test_broadcast_is_never_allocated() {
        let net = parse_network("10.0.0.0/30").unwrap();
        let first = next_node_address(&net, None).unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            next_node_address(&net, Some(first)),
            Err(TopologyError::AddressSpaceExhausted { .. })
        ));
    }

    #[test]
    fn test_top_of_address_space() {
        let net = parse_network("255.255.255.252/30").unwrap();
        let err = increment(Ipv4Addr::new(255, 255, 255, 255), &net).unwrap_err();
        assert!(matches!(err, TopologyError::AddressSpaceExhausted { .. }));
    }
}
