//! Client IP allow-list
//!
//! Entries are single addresses or CIDR blocks; the single entry `*` allows
//! every caller. An invalid list is a startup error: the server refuses to
//! come up half-protected.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhitelistError {
    #[error("invalid whitelist entry '{0}': not an address or CIDR block")]
    InvalidEntry(String),
}

#[derive(Debug, Clone)]
pub struct IpWhitelist {
    allow_all: bool,
    nets: Vec<IpNet>,
}

impl IpWhitelist {
    /// Parse a list of addresses/CIDR entries. `*` anywhere in the list
    /// means allow-all.
    pub fn parse(entries: &[String]) -> Result<Self, WhitelistError> {
        let mut nets = Vec::new();
        let mut allow_all = false;
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                allow_all = true;
                continue;
            }
            if let Ok(net) = entry.parse::<IpNet>() {
                nets.push(net);
                continue;
            }
            if let Ok(addr) = entry.parse::<IpAddr>() {
                nets.push(IpNet::from(addr));
                continue;
            }
            return Err(WhitelistError::InvalidEntry(entry.to_string()));
        }
        Ok(Self { allow_all, nets })
    }

    pub fn allows(&self, addr: IpAddr) -> bool {
        self.allow_all || self.nets.iter().any(|net| net.contains(&addr))
    }
}
