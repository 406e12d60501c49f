//! Network value types shared among the switchd crates: IP prefixes with the
//! total order used for longest-prefix matching, unordered next-hop sets, and
//! MAC addresses.

pub mod arbitrary;
mod mac;
mod nexthop;
mod prefix;

pub use mac::MacAddr;
pub use nexthop::NextHopSet;
pub use prefix::IpPrefix;

use thiserror::Error;

/// Errors produced when parsing network value types from their datastore
/// string representations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetParseError {
    /// The address part of a prefix or next-hop list was not a valid IP
    /// address.
    #[error("invalid IP address {0:?}")]
    InvalidAddress(String),

    /// The prefix length part was not a number.
    #[error("invalid prefix length {0:?}")]
    InvalidPrefixLength(String),

    /// The prefix length does not fit the address family.
    #[error("prefix length {len} out of range for {family} address")]
    PrefixLengthOutOfRange {
        /// The offending length.
        len: u8,
        /// Either `"IPv4"` or `"IPv6"`.
        family: &'static str,
    },

    /// A MAC address was not six colon-separated hex octets.
    #[error("invalid MAC address {0:?}")]
    InvalidMacAddress(String),
}
