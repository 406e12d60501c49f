//! Proptest strategies for the network value types, shared with downstream
//! crates' property tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Range;

use proptest::prelude::*;

use crate::{IpPrefix, NextHopSet};

/// Any IPv4 or IPv6 address.
pub fn ip_addr() -> impl Strategy<Value = IpAddr> {
    prop_oneof![
        any::<u32>().prop_map(|bits| IpAddr::V4(Ipv4Addr::from(bits))),
        any::<u128>().prop_map(|bits| IpAddr::V6(Ipv6Addr::from(bits))),
    ]
}

/// Any IPv4 address.
pub fn ipv4_addr() -> impl Strategy<Value = IpAddr> {
    any::<u32>().prop_map(|bits| IpAddr::V4(Ipv4Addr::from(bits)))
}

/// Any prefix of either family, with a valid length for that family.
pub fn ip_prefix() -> impl Strategy<Value = IpPrefix> {
    prop_oneof![
        (any::<u32>(), 0..=32u8).prop_map(|(bits, len)| {
            IpPrefix::new(IpAddr::V4(Ipv4Addr::from(bits)), len).unwrap()
        }),
        (any::<u128>(), 0..=128u8).prop_map(|(bits, len)| {
            IpPrefix::new(IpAddr::V6(Ipv6Addr::from(bits)), len).unwrap()
        }),
    ]
}

/// A next-hop set with a member count drawn from `size`.
pub fn next_hop_set(size: Range<usize>) -> impl Strategy<Value = NextHopSet> {
    proptest::collection::btree_set(ip_addr(), size)
        .prop_map(|set| set.into_iter().collect())
}
