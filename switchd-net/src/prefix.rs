use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::NetParseError;

/// An IP network prefix: an address family, a network address, and a prefix
/// length.
///
/// The derived order compares family first (IPv4 sorts before IPv6), then the
/// network address, then the length. Among the prefixes that contain a given
/// destination address this order ranks longer prefixes higher, so the
/// maximum element of an ordered route table is the longest-prefix match.
///
/// Host bits are masked off on construction, so two spellings of the same
/// network compare equal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    /// Builds a prefix from an address and length, masking off host bits.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, NetParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(NetParseError::PrefixLengthOutOfRange {
                len,
                family: if max == 32 { "IPv4" } else { "IPv6" },
            });
        }
        Ok(IpPrefix {
            addr: mask_addr(addr, len),
            len,
        })
    }

    /// The IPv4 default route, `0.0.0.0/0`.
    pub const fn default_v4() -> Self {
        IpPrefix {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            len: 0,
        }
    }

    /// The IPv6 default route, `::/0`.
    pub const fn default_v6() -> Self {
        IpPrefix {
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            len: 0,
        }
    }

    /// The network address, with host bits zeroed.
    pub const fn addr(&self) -> IpAddr {
        self.addr
    }

    /// The prefix length in bits.
    pub const fn len(&self) -> u8 {
        self.len
    }

    /// Whether this is a zero-length prefix.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn is_ipv4(&self) -> bool {
        matches!(self.addr, IpAddr::V4(_))
    }

    /// Whether this prefix is one of the two default routes.
    pub const fn is_default(&self) -> bool {
        self.len == 0
    }

    /// Whether `ip` falls inside this prefix. Always false across address
    /// families.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_addr(ip, self.len) == self.addr
            }
            _ => false,
        }
    }
}

fn mask_addr(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

impl FromStr for IpPrefix {
    type Err = NetParseError;

    /// Parses `"10.0.0.0/24"` or a bare address, which gets the full prefix
    /// length of its family.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, len_part) = match s.split_once('/') {
            Some((a, l)) => (a, Some(l)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| NetParseError::InvalidAddress(addr_part.to_owned()))?;
        let len = match len_part {
            Some(l) => l
                .parse()
                .map_err(|_| NetParseError::InvalidPrefixLength(l.to_owned()))?,
            None => match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            },
        };
        IpPrefix::new(addr, len)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}
