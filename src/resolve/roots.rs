//! root server hints

use std::sync::Arc;
use std::time::Duration;

use super::nameserver::Nameserver;

/// IPv4 addresses of the thirteen root servers, a through m.
pub const ROOT_SERVER_ADDRS: [&str; 13] = [
    "198.41.0.4",
    "199.9.14.201",
    "192.33.4.12",
    "199.7.91.13",
    "192.203.230.10",
    "192.5.5.241",
    "192.112.36.4",
    "198.97.190.53",
    "192.36.148.17",
    "192.58.128.30",
    "193.0.14.129",
    "199.7.83.42",
    "202.12.27.33",
];

/// Construct a nameserver for every root hint.
pub fn root_nameservers(timeout: Duration) -> Vec<Arc<Nameserver>> {
    ROOT_SERVER_ADDRS
        .iter()
        .filter_map(|addr| Nameserver::new(addr, timeout).ok())
        .collect()
}
