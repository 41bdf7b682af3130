//! Deterministic overlay address allocation
//!
//! Every node derives its overlay address from its name alone, so a node that
//! restarts comes back with the same address without any coordination. The
//! host part of the overlay prefix is filled with the trailing bytes of a
//! 128-bit FNV-1a digest of the name.
//!
//! Collisions are possible (birthday bound on the host window) and are not
//! corrected; larger windows make them less likely.

use crate::error::{OverlayError, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const FNV128_OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
const FNV128_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// 128-bit FNV-1a digest, big-endian
fn fnv1a_128(data: &[u8]) -> [u8; 16] {
    let mut hash = FNV128_OFFSET_BASIS;
    for byte in data {
        hash ^= u128::from(*byte);
        hash = hash.wrapping_mul(FNV128_PRIME);
    }
    hash.to_be_bytes()
}

/// Check that a prefix can be used as an overlay network
///
/// The host window must be a whole number of bytes and leave room for at
/// least one byte of host id.
///
/// # Example
/// ```
/// use meshweave_overlay::allocator::validate_overlay_net;
///
/// assert!(validate_overlay_net(&"10.0.0.0/8".parse().unwrap()).is_ok());
/// assert!(validate_overlay_net(&"10.0.0.0/12".parse().unwrap()).is_err());
/// ```
pub fn validate_overlay_net(prefix: &IpNet) -> Result<()> {
    if prefix.prefix_len() % 8 != 0 {
        return Err(OverlayError::InvalidCidr(format!(
            "{prefix}: prefix length must be a multiple of 8, got {}",
            prefix.prefix_len()
        )));
    }
    if prefix.prefix_len() == prefix.max_prefix_len() {
        return Err(OverlayError::InvalidCidr(format!(
            "{prefix}: prefix leaves no room for host addresses"
        )));
    }
    Ok(())
}

/// Derive the overlay address for `name` inside `prefix`
///
/// Pure and deterministic: the same `(prefix, name)` always yields the same
/// address. Bits outside the host window are taken from the prefix's network
/// address. Only whole host bytes are overwritten, so a prefix that fails
/// [`validate_overlay_net`] gets a smaller window rather than an error.
///
/// # Example
/// ```
/// use meshweave_overlay::allocator::allocate;
///
/// let addr = allocate(&"10.0.0.0/8".parse().unwrap(), "test");
/// assert_eq!(addr.to_string(), "10.221.153.165");
/// ```
pub fn allocate(prefix: &IpNet, name: &str) -> IpAddr {
    let digest = fnv1a_128(name.as_bytes());
    let host_bytes = usize::from(prefix.max_prefix_len() - prefix.prefix_len()) / 8;

    match prefix.network() {
        IpAddr::V4(net) => {
            let mut octets = net.octets();
            overwrite_tail(&mut octets, &digest, host_bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(net) => {
            let mut octets = net.octets();
            overwrite_tail(&mut octets, &digest, host_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn overwrite_tail(addr: &mut [u8], digest: &[u8; 16], count: usize) {
    let count = count.min(addr.len());
    let addr_len = addr.len();
    addr[addr_len - count..].copy_from_slice(&digest[digest.len() - count..]);
}

/// Host-length prefix (`/32` or `/128`) for a single address
pub fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    // Changing either of these values breaks address stability for every
    // deployed node.
    #[test]
    fn test_allocate_ipv4_reference() {
        assert_eq!(
            allocate(&net("10.0.0.0/8"), "test").to_string(),
            "10.221.153.165"
        );
    }

    #[test]
    fn test_allocate_ipv6_reference() {
        assert_eq!(
            allocate(&net("2001:db8::/32"), "test").to_string(),
            "2001:db8:c575:7277:b806:e994:13dd:99a5"
        );
    }

    #[test]
    fn test_allocate_is_deterministic() {
        let prefix = net("10.0.0.0/8");
        assert_eq!(allocate(&prefix, "node-a"), allocate(&prefix, "node-a"));
    }

    #[test]
    fn test_allocate_no_obvious_collisions() {
        let prefix = net("10.0.0.0/24");
        let mut seen = HashMap::new();
        for name in ["test", "test1", "test2", "1test", "2test"] {
            let addr = allocate(&prefix, name);
            if let Some(other) = seen.insert(addr, name) {
                panic!("collision: {name} and {other} both map to {addr}");
            }
        }
    }

    #[test]
    fn test_allocate_preserves_network_bits() {
        let prefix = net("10.42.7.0/24");
        let addr = allocate(&prefix, "anything");
        assert!(prefix.contains(&addr));
        match addr {
            IpAddr::V4(v4) => assert_eq!(&v4.octets()[..3], &[10, 42, 7]),
            IpAddr::V6(_) => panic!("expected ipv4"),
        }
    }

    #[test]
    fn test_allocate_uses_network_address_of_prefix() {
        // host bits in the configured prefix are ignored
        let a = allocate(&net("10.1.2.3/16"), "node");
        let b = allocate(&net("10.1.0.0/16"), "node");
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_overlay_net() {
        assert!(validate_overlay_net(&net("10.0.0.0/8")).is_ok());
        assert!(validate_overlay_net(&net("fd00::/64")).is_ok());
        assert!(validate_overlay_net(&net("10.0.0.0/20")).is_err());
        assert!(validate_overlay_net(&net("10.0.0.1/32")).is_err());
    }

    #[test]
    fn test_fnv1a_128_empty_is_offset_basis() {
        assert_eq!(fnv1a_128(b""), FNV128_OFFSET_BASIS.to_be_bytes());
    }

    #[test]
    fn test_host_net() {
        assert_eq!(host_net("10.0.0.1".parse().unwrap()).to_string(), "10.0.0.1/32");
        assert_eq!(host_net("fd00::1".parse().unwrap()).to_string(), "fd00::1/128");
    }
}
