//! Endpoint address resolution.
//!
//! The connect loop walks an ordered address list: system resolver order by
//! default, optionally filtered or re-ordered by an address-family
//! preference.

use std::net::{SocketAddr, ToSocketAddrs};

use xrd_core::{Code, Status, Url, XrdResult};

/// Which address families to use, and in what order.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FamilyPreference {
    /// Keep the order the system resolver returned.
    #[default]
    SystemOrder,
    /// IPv4 addresses first, IPv6 after.
    Ipv4First,
    /// IPv6 addresses first, IPv4 after.
    Ipv6First,
    /// IPv4 only.
    Ipv4Only,
    /// IPv6 only.
    Ipv6Only,
}

/// Resolves the URL's `host:port` into an ordered address list.
pub fn resolve(url: &Url, preference: FamilyPreference) -> XrdResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (url.host(), url.port())
        .to_socket_addrs()
        .map_err(Status::from)?
        .collect();

    let ordered = apply_preference(addrs, preference);
    if ordered.is_empty() {
        return Err(Status::error(Code::NotFound));
    }
    Ok(ordered)
}

fn apply_preference(addrs: Vec<SocketAddr>, preference: FamilyPreference) -> Vec<SocketAddr> {
    match preference {
        FamilyPreference::SystemOrder => addrs,
        FamilyPreference::Ipv4Only => addrs.into_iter().filter(SocketAddr::is_ipv4).collect(),
        FamilyPreference::Ipv6Only => addrs.into_iter().filter(SocketAddr::is_ipv6).collect(),
        FamilyPreference::Ipv4First => stable_partition(addrs, SocketAddr::is_ipv4),
        FamilyPreference::Ipv6First => stable_partition(addrs, SocketAddr::is_ipv6),
    }
}

fn stable_partition(addrs: Vec<SocketAddr>, first: impl Fn(&SocketAddr) -> bool) -> Vec<SocketAddr> {
    let (mut preferred, rest): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| first(a));
    preferred.extend(rest);
    preferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn v6(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv6Addr::LOCALHOST, port))
    }

    #[test]
    fn system_order_is_preserved() {
        let addrs = vec![v6(1), v4(2), v6(3)];
        assert_eq!(
            apply_preference(addrs.clone(), FamilyPreference::SystemOrder),
            addrs
        );
    }

    #[test]
    fn family_first_is_a_stable_partition() {
        let addrs = vec![v6(1), v4(2), v6(3), v4(4)];
        assert_eq!(
            apply_preference(addrs.clone(), FamilyPreference::Ipv4First),
            vec![v4(2), v4(4), v6(1), v6(3)]
        );
        assert_eq!(
            apply_preference(addrs, FamilyPreference::Ipv6First),
            vec![v6(1), v6(3), v4(2), v4(4)]
        );
    }

    #[test]
    fn family_only_filters() {
        let addrs = vec![v6(1), v4(2)];
        assert_eq!(
            apply_preference(addrs.clone(), FamilyPreference::Ipv4Only),
            vec![v4(2)]
        );
        assert_eq!(
            apply_preference(addrs, FamilyPreference::Ipv6Only),
            vec![v6(1)]
        );
    }

    #[test]
    fn numeric_hosts_resolve_without_dns() {
        let url = Url::parse("root://127.0.0.1:1094//f").unwrap();
        let addrs = resolve(&url, FamilyPreference::SystemOrder).unwrap();
        assert_eq!(addrs, vec![v4(1094)]);
    }

    #[test]
    fn empty_result_after_filter_is_not_found() {
        let url = Url::parse("root://127.0.0.1:1094//f").unwrap();
        let err = resolve(&url, FamilyPreference::Ipv6Only).unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }
}
