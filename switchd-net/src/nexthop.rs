use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::NetParseError;

/// An unordered set of next-hop IP addresses.
///
/// Equality is set equality: `"1.1.1.1,2.2.2.2"` and `"2.2.2.2,1.1.1.1"`
/// parse to equal values. An empty set means "drop", a single address is a
/// plain next hop, and two or more addresses form an ECMP group.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NextHopSet(BTreeSet<IpAddr>);

impl NextHopSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(ip: IpAddr) -> Self {
        NextHopSet(BTreeSet::from([ip]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.contains(&ip)
    }

    /// The sole member, if this set has exactly one.
    pub fn single(&self) -> Option<IpAddr> {
        if self.0.len() == 1 {
            self.0.iter().next().copied()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.0.iter().copied()
    }

    pub fn insert(&mut self, ip: IpAddr) -> bool {
        self.0.insert(ip)
    }
}

impl FromIterator<IpAddr> for NextHopSet {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        NextHopSet(iter.into_iter().collect())
    }
}

impl FromStr for NextHopSet {
    type Err = NetParseError;

    /// Parses a comma-separated address list; the empty string parses to the
    /// empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ip: IpAddr = part
                .parse()
                .map_err(|_| NetParseError::InvalidAddress(part.to_owned()))?;
            set.insert(ip);
        }
        Ok(NextHopSet(set))
    }
}

impl fmt::Display for NextHopSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ip in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{ip}")?;
            first = false;
        }
        Ok(())
    }
}
