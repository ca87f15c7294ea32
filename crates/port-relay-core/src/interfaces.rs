//! IPv4 addresses of the host's network interfaces, for picking listen addresses.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::Result;

/// Name used for the loopback entry that is always listed last.
pub const LOOPBACK_NAME: &str = "loopback";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddress {
    /// Interface name.
    pub name: String,
    pub ip: IpAddr,
}

/// Non-loopback IPv4 interface addresses, followed by `127.0.0.1`.
pub fn local_ipv4_addresses() -> Result<Vec<LocalAddress>> {
    let interfaces = if_addrs::get_if_addrs()?;
    Ok(listable(
        interfaces
            .into_iter()
            .map(|iface| (iface.ip(), iface.name)),
    ))
}

fn listable(addrs: impl IntoIterator<Item = (IpAddr, String)>) -> Vec<LocalAddress> {
    let mut listed: Vec<LocalAddress> = addrs
        .into_iter()
        .filter(|(ip, _)| ip.is_ipv4() && !ip.is_loopback())
        .map(|(ip, name)| LocalAddress { name, ip })
        .collect();

    listed.push(LocalAddress {
        name: LOOPBACK_NAME.to_string(),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
    });
    listed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn keeps_external_ipv4_and_appends_loopback() {
        let listed = listable([
            (IpAddr::V4(Ipv4Addr::LOCALHOST), "lo".to_string()),
            (IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), "eth0".to_string()),
            (IpAddr::V6(Ipv6Addr::LOCALHOST), "lo".to_string()),
            (
                IpAddr::V6("fe80::1".parse().unwrap()),
                "eth0".to_string(),
            ),
            (IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)), "tun0".to_string()),
        ]);

        let ips: Vec<String> = listed.iter().map(|a| format!("{}={}", a.name, a.ip)).collect();
        assert_eq!(
            ips,
            vec!["eth0=192.168.1.20", "tun0=10.8.0.2", "loopback=127.0.0.1"]
        );
    }

    #[test]
    fn host_listing_ends_with_loopback() {
        let listed = local_ipv4_addresses().unwrap();
        let last = listed.last().unwrap();
        assert_eq!(last.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(listed.iter().filter(|a| a.ip.is_loopback()).count(), 1);
    }
}
