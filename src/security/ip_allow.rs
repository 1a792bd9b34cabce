//! Connector registration IP allow-list.
//!
//! An empty list admits every address. `localhost` stands for both
//! loopback addresses, and IPv4-mapped IPv6 peers match their IPv4 form.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid allow-list entry '{0}': expected an IP address or 'localhost'")]
pub struct InvalidEntry(pub String);

#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    ips: HashSet<IpAddr>,
}

impl IpAllowList {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, InvalidEntry> {
        let mut ips = HashSet::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.eq_ignore_ascii_case("localhost") {
                ips.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
                ips.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
                continue;
            }
            let ip: IpAddr = entry
                .parse()
                .map_err(|_| InvalidEntry(entry.to_string()))?;
            ips.insert(ip.to_canonical());
        }
        Ok(Self { ips })
    }

    pub fn is_open(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.is_open() || self.ips.contains(&ip.to_canonical())
    }
}
